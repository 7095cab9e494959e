//! # agent-runtime
//!
//! Concrete collaborators for the agent run loop.
//!
//! ## Components
//!
//! - **Ollama** (default): local LLM inference via Ollama, with tool calls
//!   expressed through the fenced-block protocol in [`tool_protocol`]
//! - **SQLite** (default): durable per-utility execution logs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{OllamaProvider, SqliteExecutionLog, SqliteLogConfig};
//!
//! let log = Arc::new(SqliteExecutionLog::open(&SqliteLogConfig::from_env())?);
//! let registry = UtilityRegistry::new().with_log_store(log);
//! let agent = AgentBuilder::new()
//!     .provider(Arc::new(OllamaProvider::from_env()))
//!     .utilities(Arc::new(registry))
//!     .build()?;
//! ```

pub mod tool_protocol;

#[cfg(feature = "ollama")]
pub mod ollama;

#[cfg(feature = "sqlite")]
pub mod sqlite_log;

#[cfg(feature = "ollama")]
pub use ollama::{OllamaConfig, OllamaProvider};

#[cfg(feature = "sqlite")]
pub use sqlite_log::{SqliteExecutionLog, SqliteLogConfig};

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentBuilder, AgentError, LlmProvider, Message, Result, Role, UtilityRegistry,
};
