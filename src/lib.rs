//! Home bridge daemon library.
//!
//! Supervises the platform worker process, caches accessory state, keeps a
//! rotating event history and forwards events to webhooks.

pub mod cache;
pub mod clock;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod events;
pub mod notify;
pub mod supervisor;
pub mod warm;
pub mod worker;

#[cfg(test)]
mod testing;
