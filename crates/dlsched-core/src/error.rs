//! Error types for dlsched

use thiserror::Error;

/// Main error type for dlsched
#[derive(Error, Debug)]
pub enum DlschedError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Orchestrator (cluster API) error
    #[error("Orchestration error: {0}")]
    Orchestration(String),

    /// Learning task not found
    #[error("Learning task not found: {0}")]
    TaskNotFound(String),

    /// Learning task already registered
    #[error("Learning task already exists: {0}")]
    TaskExists(String),

    /// Learning task is in a phase that does not allow the operation
    #[error("Invalid task state: {0}")]
    InvalidTaskState(String),

    /// Node not tracked by the registry
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// GPU accounting would leave a node in an impossible state.
    ///
    /// This is never recoverable: the scheduling loop stops on it.
    #[error("GPU accounting violation: {0}")]
    AccountingViolation(String),

    /// Binding submission stopped at a failure; the first `committed`
    /// bindings of the batch are in effect
    #[error("Binding failed after {committed} committed: {message}")]
    Binding { committed: usize, message: String },

    /// A scheduler channel was closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Task state store error
    #[error("Store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DlschedError {
    /// Whether the error means scheduling state can no longer be trusted
    pub fn is_fatal(&self) -> bool {
        matches!(self, DlschedError::AccountingViolation(_))
    }
}

/// Result type for dlsched operations
pub type DlschedResult<T> = Result<T, DlschedError>;

impl From<serde_json::Error> for DlschedError {
    fn from(err: serde_json::Error) -> Self {
        DlschedError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for DlschedError {
    fn from(err: toml::de::Error) -> Self {
        DlschedError::Config(err.to_string())
    }
}
