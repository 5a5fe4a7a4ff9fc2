//! Error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No option '{key}' in section '{section}'")]
    MissingOption { section: String, key: String },

    #[error("No section '{0}'")]
    NoSection(String),

    #[error("Invalid value for '{key}' in section '{section}': '{value}'")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    #[error("Unknown output format '{0}' (valid formats: wlcg brief)")]
    UnknownOutputFormat(String),

    #[error("Unknown execution mode '{0}' (valid modes: local remote-globus)")]
    UnknownExecutionMode(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Whether this is a lookup miss rather than a malformed value
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::MissingOption { .. } | Error::NoSection(_))
    }
}

// Convert anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
