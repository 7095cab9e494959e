//! Fixtures shared by unit tests

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::context::{ExecutionContext, RunId};
use crate::error::{AgentError, Result};
use crate::execlog::{ExecutionLog, ExecutionLogEntry, LogSchema, MemoryExecutionLog};
use crate::identity::IdentityContext;
use crate::provenance::{NodeGraph, NodeType, ProvenanceHandle};
use crate::provider::{Completion, LlmProvider, ModelRequest};
use crate::thread::ConversationId;

/// A tool-node context under a fresh root
pub fn test_context() -> ExecutionContext {
    let graph = ProvenanceHandle::new(NodeGraph::root(
        IdentityContext::new("tester").with_organization("org"),
    ));
    let root = graph.root_node();
    let node = graph
        .mint_child(&root.id, NodeType::Tool)
        .expect("root accepts tool children");
    ExecutionContext::new(RunId::new(), ConversationId::new(), node, graph)
}

/// Poll until the background writer has appended `count` entries
pub async fn wait_for_entries(
    log: &MemoryExecutionLog,
    tool_id: &str,
    count: usize,
) -> Vec<ExecutionLogEntry> {
    let poll = async {
        loop {
            let entries = log.entries(tool_id).await;
            if entries.len() >= count {
                return entries;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(2), poll)
        .await
        .expect("log entries were not written in time")
}

/// Log store that is always down
pub struct FailingLog;

#[async_trait]
impl ExecutionLog for FailingLog {
    async fn ensure_log(&self, _tool_id: &str, _parameters: &serde_json::Value) -> Result<LogSchema> {
        Err(AgentError::LogStore("database unavailable".into()))
    }

    async fn append(&self, _entry: ExecutionLogEntry) -> Result<()> {
        Err(AgentError::LogStore("database unavailable".into()))
    }
}

/// Provider that replays a fixed script of completions and records every
/// request it receives
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Completion>>,
    fallback: Option<Completion>,
    failure: Mutex<Option<AgentError>>,
    delay: Option<Duration>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Completion>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            failure: Mutex::new(None),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call with the same completion
    pub fn repeating(completion: Completion) -> Self {
        Self {
            fallback: Some(completion),
            ..Self::new(Vec::new())
        }
    }

    /// Fails the first call with `error`
    pub fn failing(error: AgentError) -> Self {
        Self {
            failure: Mutex::new(Some(error)),
            ..Self::new(Vec::new())
        }
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn complete(&self, request: &ModelRequest) -> Result<Completion> {
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.failure.lock().take() {
            return Err(error);
        }
        let next = self.script.lock().pop_front();
        next.or_else(|| self.fallback.clone())
            .ok_or_else(|| AgentError::ModelCallFailed("script exhausted".into()))
    }
}
