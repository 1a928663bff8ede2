use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy of the synchronization client.
///
/// Transport-level trouble (a dropped or absent connection) never reaches
/// callers as an error value by itself; it is reported through the
/// connectivity flag and surfaces here only as [`ClientError::NotConnected`]
/// when an operation is attempted without a live channel.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no live connection to the realtime server")]
    NotConnected,
    #[error("realtime call timed out after {0:?}")]
    Timeout(Duration),
    #[error("server rejected the call: {0}")]
    ServerRejected(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid payload from server: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
