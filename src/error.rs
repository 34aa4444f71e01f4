//! Error types shared across the delivery engine

use crate::config::ConfigError;
use crate::session::SessionError;

/// Crate-level error
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Switching the active file type did not come back OK
    #[error("Failed to switch to file type '{file_type}': {reason}")]
    TypeSwitch { file_type: String, reason: String },

    #[error("Invocation failed for {file}: {reason}")]
    Invocation { file: String, reason: String },

    /// A wait was cut short by the shutdown signal
    #[error("Interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FeedError {
    /// Configuration problems are terminal and never retried
    pub fn is_configuration(&self) -> bool {
        matches!(self, FeedError::Config(_) | FeedError::TypeSwitch { .. })
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;
