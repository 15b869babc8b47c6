//! Error taxonomy for the note acceptor stack.
//!
//! Device-level failures (`DeviceTimeout`, `DeviceProtocol`, `DeviceNotReady`)
//! come out of individual commands. `DeviceStartFailed` is what a caller sees
//! once start-up or a recovery episode has exhausted its retries. Notifier
//! failures are only ever logged by the session, never propagated.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AcceptorError {
    #[error("{command} timed out after {timeout_ms}ms")]
    DeviceTimeout {
        command: &'static str,
        timeout_ms: u64,
    },

    #[error("protocol error on {command}: {detail}")]
    DeviceProtocol {
        command: &'static str,
        detail: String,
    },

    #[error("device not ready for {command} (open and enable first)")]
    DeviceNotReady { command: &'static str },

    #[error("device unreachable on {port}: {reason}")]
    DeviceUnreachable { port: String, reason: String },

    #[error("device failed to start after {attempts} attempts: {last_error}")]
    DeviceStartFailed { attempts: u32, last_error: String },

    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("notifier delivery failed: {0}")]
    NotifierDelivery(String),

    #[error("a session is already running on {port}")]
    SessionAlreadyRunning { port: String },

    #[error("no session running on {port}")]
    SessionNotRunning { port: String },

    #[error("session closed")]
    SessionClosed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl AcceptorError {
    pub(crate) fn protocol(command: &'static str, detail: impl Into<String>) -> Self {
        Self::DeviceProtocol {
            command,
            detail: detail.into(),
        }
    }

    /// True when the failure means the hardware could not be reached at all,
    /// as opposed to a busy device or a caller-side misuse.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnreachable { .. } | Self::DeviceStartFailed { .. } | Self::DeviceTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AcceptorError>;
