//! Error types for scp transfers.
//!
//! Every failure is local to the single in-flight transfer. Nothing here is
//! retried internally; a caller that wants to retry opens a new channel and
//! restarts the transfer from the beginning.

use thiserror::Error;

/// Errors produced while driving an scp transfer.
#[derive(Debug, Error)]
pub enum ScpError {
    /// Malformed or unexpected record, or a broken size contract.
    #[error("protocol error: {message}{}", fmt_raw(.raw))]
    Protocol {
        message: String,
        /// Offending bytes, when there were any.
        raw: Option<Vec<u8>>,
    },

    /// The remote scp explicitly reported a failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// A channel receive exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A received path would escape the destination root.
    #[error("security error: {0}")]
    Security(String),

    /// Local filesystem or channel I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation inside this crate or its caller.
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

fn fmt_raw(raw: &Option<Vec<u8>>) -> String {
    match raw {
        Some(bytes) => format!(" ({:?})", String::from_utf8_lossy(bytes)),
        None => String::new(),
    }
}

impl ScpError {
    pub fn protocol(message: impl Into<String>) -> Self {
        ScpError::Protocol {
            message: message.into(),
            raw: None,
        }
    }

    pub fn protocol_raw(message: impl Into<String>, raw: &[u8]) -> Self {
        ScpError::Protocol {
            message: message.into(),
            raw: Some(raw.to_vec()),
        }
    }

    /// Whether restarting the whole transfer on a fresh channel may succeed.
    ///
    /// A channel is never reusable after an error since the protocol has no
    /// resume point.
    pub fn is_retryable_with_new_channel(&self) -> bool {
        matches!(
            self,
            ScpError::Timeout(_) | ScpError::Remote(_) | ScpError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ScpError>;
