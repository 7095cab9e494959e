//! Application State

use std::sync::Arc;

use agent_core::{Agent, LlmProvider};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Run controller with its utility registry and thread store
    pub agent: Agent,

    /// LLM provider, kept separately for health and model listing
    pub provider: Arc<dyn LlmProvider>,
}
