//! Durable event history.
//!
//! Every state-changing occurrence is appended to `events.jsonl` as one JSON
//! object per line. The active file is rotated by size into numbered backups
//! (`events.jsonl.1` is the newest backup). After each append the record is
//! handed to an optional [`EventSink`] (the webhook dispatcher).

mod log;
pub mod record;

pub use self::log::{EventLog, LogStats};
pub use record::{AccessoryChange, EventKind, EventPayload, EventRecord};

/// Receives every record right after it was written.
///
/// Implementations must not block: the call happens on the appending thread.
pub trait EventSink: Send + Sync {
    fn on_event(&self, record: &EventRecord);
}
