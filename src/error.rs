//! Error types for the relay.
//!
//! Two layers:
//!
//! - [`WindowError`] - a protocol invariant was violated by a window
//!   operation (bad ack, bad reset). Returned by the unsynchronized windows.
//! - [`Error`] - everything a task or a caller can observe. It is `Clone`
//!   because a failed waiter hands the same error to every blocked task.
//!
//! Rust guideline compliant 2026-02

use thiserror::Error;

/// Protocol invariant violations detected by the send/receive windows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    /// Peer acknowledged bytes that were never handed to a transport.
    #[error("impossible ack: {value} is past emptied {emptied}")]
    ImpossibleAck {
        /// Resolved absolute ack.
        value: u64,
        /// Bytes emptied so far.
        emptied: u64,
    },
    /// Peer tried to take back an acknowledgment.
    #[error("political ack: {value} is before acknowledged {acknowledged}")]
    PoliticalAck {
        /// Resolved absolute ack.
        value: u64,
        /// Bytes acknowledged so far.
        acknowledged: u64,
    },
    /// Send window reset target is before data already released.
    #[error("reset to {value} is before acknowledged {acknowledged}")]
    ResetBeforeAcknowledged {
        /// Resolved absolute reset target.
        value: u64,
        /// Bytes acknowledged so far.
        acknowledged: u64,
    },
    /// Send window reset target is past data ever sent.
    #[error("reset to {value} is past emptied {emptied}")]
    ResetPastEmptied {
        /// Resolved absolute reset target.
        value: u64,
        /// Bytes emptied so far.
        emptied: u64,
    },
    /// Receive window reset target is past data ever received.
    #[error("reset to {value} is past filled {filled}")]
    ResetPastFilled {
        /// Resolved absolute reset target.
        value: u64,
        /// Bytes filled so far.
        filled: u64,
    },
}

/// Errors observable by relay tasks and callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A window operation violated the protocol.
    #[error("window: {0}")]
    Window(#[from] WindowError),
    /// Read, write or upgrade failure on one transport. Recoverable.
    #[error("transport: {0}")]
    Transport(String),
    /// Peer set the reserved top byte of the ack field.
    #[error("peer requested a reset (ack {0:08x})")]
    ResetRequested(u32),
    /// A timed wait elapsed.
    #[error("expired")]
    Expired,
    /// The tunnel or session was closed for good.
    #[error("closed: {0}")]
    Closed(String),
    /// The proxy refused the handshake.
    #[error("rejected with status {status}: {message}")]
    Rejected {
        /// HTTP status returned by the proxy.
        status: u16,
        /// Human readable explanation.
        message: String,
    },
    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for a transport error from anything printable.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// True when retrying cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Closed(_) | Self::Rejected { .. } | Self::Config(_)
        )
    }
}

/// Result alias used across the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;
