//! Webhook notifications for logged events.

pub mod circuit;
mod dispatcher;
mod transport;
pub mod triggers;

pub use circuit::{CircuitBreaker, CircuitState, CircuitStatus};
pub use dispatcher::{DELIVERY_TIMEOUT, Delivery, DispatchStats, NotificationDispatcher};
pub use transport::{HttpTransport, WebhookPayload, WebhookTransport};
