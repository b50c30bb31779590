//! HerdLead Error Types

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for HerdLead operations
pub type Result<T> = std::result::Result<T, Error>;

/// HerdLead error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to render configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Coordination errors
    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Coordination store unavailable: {0}")]
    TransientStore(StoreError),

    #[error("Coordination session lost: {0}")]
    SessionLost(String),

    // Replication errors
    #[error("Replication to {target} failed: {reason}")]
    ReplicationSend { target: String, reason: String },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Classify a store failure seen outside of startup
    pub fn from_store(err: StoreError) -> Self {
        if err.is_session_loss() {
            Error::SessionLost(err.to_string())
        } else {
            Error::TransientStore(err)
        }
    }

    /// Check if this error requires a fresh session, re-registration and re-election
    pub fn requires_rejoin(&self) -> bool {
        matches!(self, Error::SessionLost(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        let lost = Error::from_store(StoreError::SessionExpired);
        assert!(lost.requires_rejoin());

        let transient = Error::from_store(StoreError::ConnectionLoss);
        assert!(matches!(transient, Error::TransientStore(StoreError::ConnectionLoss)));
        assert!(!transient.requires_rejoin());
    }
}
