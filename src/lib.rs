//! The Small POS - cash acceptor
//!
//! Drives an NV200 banknote acceptor over plain SSP: one session per serial
//! port polls the device, credits accepted notes to an in-memory ledger,
//! recovers from device self-resets and relays every event to a notifier.
//! Stopping a session returns the ledger.

pub mod acceptor;
pub mod config;
pub mod error;
pub mod logging;
pub mod notifier;
pub mod serial;

pub use acceptor::{Session, SessionManager, SessionStatus, SessionSummary};
pub use config::AcceptorConfig;
pub use error::{AcceptorError, Result};
pub use notifier::{ChannelNotifier, EventNotifier, NoopNotifier, Notification, WebhookNotifier};
