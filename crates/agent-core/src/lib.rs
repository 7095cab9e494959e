//! # agent-core
//!
//! Provider-agnostic agent run loop with a schema-validated utility registry,
//! per-run provenance and a durable execution log.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              Agent                               │
//! │  ┌─────────────┐   ┌─────────────────┐   ┌───────────────────┐   │
//! │  │  Run Loop   │───│ UtilityRegistry │───│   ExecutionLog    │   │
//! │  │ (reasoning) │   │   (dispatch)    │   │   (per utility)   │   │
//! │  └─────────────┘   └─────────────────┘   └───────────────────┘   │
//! │        │                    │                                    │
//! │  ┌─────────────┐   ┌─────────────────┐   ┌───────────────────┐   │
//! │  │ LlmProvider │   │  NodeGraph      │   │   ThreadStore     │   │
//! │  │ (strategy)  │   │  (provenance)   │   │   (history)       │   │
//! │  └─────────────┘   └─────────────────┘   └───────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait keeps the run loop independent of the model
//! backend; storage sits behind `ThreadStore` and `ExecutionLog`.

pub mod context;
pub mod error;
pub mod execlog;
pub mod identity;
pub mod message;
pub mod provenance;
pub mod provider;
pub mod reasoning;
pub mod state;
pub mod thread;
pub mod tool;

#[cfg(test)]
pub(crate) mod test_support;

pub use context::{ExecutionContext, RunId};
pub use error::{AgentError, DispatchError, Result};
pub use execlog::{ExecutionLog, ExecutionLogEntry, LogSchema, MemoryExecutionLog};
pub use identity::IdentityContext;
pub use message::{Message, Role, ToolCall};
pub use provenance::{ExecutionNode, NodeId, NodeType};
pub use provider::{Completion, LlmProvider, ModelRequest};
pub use reasoning::{
    Agent, AgentBuilder, AgentConfig, RunEvent, RunHandle, RunMode, RunOutcome, RunRequest,
    RunState, RunStream,
};
pub use thread::{ConversationId, MemoryThreadStore, ThreadOwner, ThreadStore};
pub use tool::{ExecuteResult, FnUtility, Utility, UtilityDescriptor, UtilityRegistry};
