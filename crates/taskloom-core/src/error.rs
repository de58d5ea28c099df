//! Infrastructure error types for Taskloom
//!
//! These cover unrecoverable initialisation and I/O states. Domain failures
//! travel between components as FAILED TaskResults, not as this type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    ConfigError(String),

    #[error("invalid template '{}': {}", .name, .problems.join("; "))]
    InvalidTemplate { name: String, problems: Vec<String> },

    #[error("provider error: {provider} - {message}")]
    ProviderError { provider: String, message: String },

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }

    pub fn invalid_template(name: impl Into<String>, problems: Vec<String>) -> Self {
        Self::InvalidTemplate {
            name: name.into(),
            problems,
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderError {
            provider: provider.into(),
            message: message.into(),
        }
    }
}
