/// Error types for the sync engine
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Transport or REST call failed in a way that is worth retrying
    #[error("Network error: {0}")]
    Network(String),

    /// Credential was refused; needs a refresh rather than a blind retry
    #[error("Auth error: {0}")]
    Auth(String),

    /// Malformed push event or response body
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Sustained reconnect failure
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Server understood the request and refused it
    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No session credential available
    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the failure should be retried with backoff
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SyncError::Network(_) | SyncError::Timeout(_) | SyncError::Io(_)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
