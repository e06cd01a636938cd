//! Error taxonomy for the sync layer.

use thiserror::Error;

use scribe_core::OperationError;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or unknown credential at connection time. Terminal for the connection.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Envelope could not be decoded. The connection stays open.
    #[error(transparent)]
    Validation(#[from] ProtocolError),

    /// Operation does not fit the authoritative content.
    #[error("operation rejected: {0}")]
    OperationApply(#[from] OperationError),

    /// Stale `baseVersion` under the reject-stale policy.
    #[error("version mismatch: operation based on {base}, document is at {current}")]
    Conflict { base: u64, current: u64 },

    #[error("network error: {0}")]
    Network(String),

    #[error("hub is not running")]
    HubClosed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl SyncError {
    /// Whether an ERROR message from the hub reports a stale `baseVersion`.
    ///
    /// The client answers such a rejection with REQUEST_SNAPSHOT.
    pub fn is_version_mismatch(message: &str) -> bool {
        message.starts_with("version mismatch:")
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
