//! Error types for the PQ tablet
//!
//! Only failures that stop the tablet surface as [`TabletError`]. Rejected
//! proposals and overload are ordinary protocol answers and never reach this
//! type.

use thiserror::Error;

/// Result type alias for tablet operations
pub type Result<T> = std::result::Result<T, TabletError>;

/// Main error type for the tablet
#[derive(Error, Debug)]
pub enum TabletError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Corrupted record {key}: {reason}")]
    CorruptedRecord { key: String, reason: String },

    #[error("Tablet {0} is not running")]
    TabletStopped(u64),
}

impl TabletError {
    /// Create a storage error from a message
    pub fn storage_msg(msg: impl Into<String>) -> Self {
        TabletError::Storage(msg.into())
    }

    /// Create a storage error with operation context
    ///
    /// # Example
    ///
    /// ```ignore
    /// TabletError::storage_op("append", "disk full")
    /// // "Storage error: append: disk full"
    /// ```
    pub fn storage_op(operation: &str, detail: impl std::fmt::Display) -> Self {
        TabletError::Storage(format!("{}: {}", operation, detail))
    }

    /// Create a protocol error from a message
    pub fn protocol_msg(msg: impl Into<String>) -> Self {
        TabletError::Protocol(msg.into())
    }

    /// Create a configuration error from a message
    pub fn config_msg(msg: impl Into<String>) -> Self {
        TabletError::Config(msg.into())
    }

    /// Whether restarting the tablet through recovery may clear this error
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TabletError::Io(_) | TabletError::Storage(_) | TabletError::TabletStopped(_)
        )
    }
}
