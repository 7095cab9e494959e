//! Error Types for Utilities

use agent_core::AgentError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UtilityError>;

#[derive(Error, Debug)]
pub enum UtilityError {
    #[error("Division by zero")]
    DivisionByZero,

    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    #[error("Result is not a finite number")]
    NonFinite,

    #[error("Invalid service path '{0}': must be a relative path starting with '/'")]
    InvalidPath(String),

    #[error("Service returned {status}: {body}")]
    Service { status: u16, body: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// The dispatcher wraps these into `ExecutionFailed` with the utility id
impl From<UtilityError> for AgentError {
    fn from(e: UtilityError) -> Self {
        Self::Other(e.to_string())
    }
}
