//! Error Types
//!
//! Two layers: [`DispatchError`] covers tool-level failures that are folded
//! back into the conversation as observations, [`AgentError`] covers
//! run-level and infrastructure failures that terminate a run.

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Tool-level errors produced by the dispatcher.
///
/// These never abort a run; the run controller renders them as a tool-role
/// message so the model can retry or change course.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// No utility registered under this id
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Arguments do not satisfy the utility's parameter schema
    #[error("Invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// Executor raised an error or a downstream service failed
    #[error("Execution of '{tool}' failed: {reason}")]
    ExecutionFailed { tool: String, reason: String },
}

impl DispatchError {
    /// Stable machine-readable code
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ToolNotFound(_) => "tool_not_found",
            Self::InvalidArguments { .. } => "invalid_arguments",
            Self::ExecutionFailed { .. } => "execution_failed",
        }
    }

    pub fn execution_failed(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// Language model call failed (transport error, timeout, malformed response)
    #[error("Model call failed: {0}")]
    ModelCallFailed(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Maximum iterations reached in the run loop
    #[error("Maximum iterations ({0}) exceeded")]
    MaxIterationsExceeded(usize),

    /// Conversation thread does not exist
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    /// Tool-level failure surfaced outside of a run
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// A utility id was registered twice
    #[error("Utility already registered: {0}")]
    DuplicateUtility(String),

    /// Node lineage violation
    #[error("Provenance error: {0}")]
    Provenance(String),

    /// Identifier rejected by the storage allow-list
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Execution log store failure
    #[error("Execution log error: {0}")]
    LogStore(String),

    /// Thread store failure
    #[error("Thread store error: {0}")]
    ThreadStore(String),

    /// Stream consumer went away before the run finished
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other/unknown error
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Check if error is retryable
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable(_) | Self::ModelCallFailed(_) | Self::LogStore(_)
        )
    }

    /// Stable machine-readable code, used in stream error events and HTTP bodies
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ModelCallFailed(_) => "model_call_failed",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::MaxIterationsExceeded(_) => "max_iterations_exceeded",
            Self::ThreadNotFound(_) => "thread_not_found",
            Self::Dispatch(e) => e.kind(),
            Self::DuplicateUtility(_) => "duplicate_utility",
            Self::Provenance(_) => "provenance",
            Self::InvalidIdentifier(_) => "invalid_identifier",
            Self::LogStore(_) => "log_store",
            Self::ThreadStore(_) => "thread_store",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::ModelCallFailed(msg) => format!("The AI service encountered an error: {msg}"),
            Self::ProviderUnavailable(_) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            Self::MaxIterationsExceeded(_) => {
                "The request took too many steps to process. Please try a simpler query.".into()
            }
            Self::ThreadNotFound(id) => format!("Conversation '{id}' does not exist."),
            Self::Dispatch(e) => format!("Tool error: {e}"),
            Self::Cancelled(_) => "The request was cancelled.".into(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}

impl From<anyhow::Error> for AgentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_errors_keep_their_kind_when_wrapped() {
        let err: AgentError = DispatchError::ToolNotFound("frobnicate".into()).into();
        assert_eq!(err.kind(), "tool_not_found");
        assert_eq!(err.to_string(), "Tool not found: frobnicate");
    }

    #[test]
    fn run_level_errors_have_user_messages() {
        let err = AgentError::MaxIterationsExceeded(3);
        assert_eq!(err.kind(), "max_iterations_exceeded");
        assert!(err.user_message().contains("too many steps"));
        assert!(!err.is_retryable());
        assert!(AgentError::ModelCallFailed("timeout".into()).is_retryable());
    }
}
