//! Run Loop
//!
//! Drives one conversation turn through think / act / observe:
//!
//! ```text
//! Idle ─▶ ModelThinking ─▶ ToolDispatch ─┐
//!              ▲                         │
//!              └─────────────────────────┘
//!              │
//!              ▼
//!          Responding ─▶ Done          (Error reachable from any non-terminal state)
//! ```
//!
//! A single driver serves both invocation modes. In stream mode it pushes
//! [`RunEvent`]s into a channel whose receiving half is handed to the caller;
//! in invoke mode the events go nowhere and only the [`RunOutcome`] is
//! returned.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::context::{ExecutionContext, RunId};
use crate::error::{AgentError, DispatchError, Result};
use crate::identity::IdentityContext;
use crate::message::{Message, ToolCall};
use crate::provenance::{ExecutionNode, NodeGraph, NodeId, NodeType, ProvenanceHandle};
use crate::provider::{Completion, FinishReason, GenerationOptions, LlmProvider, ModelRequest};
use crate::state;
use crate::thread::{ConversationId, MemoryThreadStore, ThreadStore};
use crate::tool::{ExecuteResult, UtilityRegistry};

/// Buffered events between the driver and a stream consumer
const EVENT_BUFFER: usize = 64;

const DEFAULT_SYSTEM_PROMPT: &str = r"You are a helpful AI assistant.

Use the available tools when they help answer the question. After receiving
tool results, synthesize them into a helpful response. If a tool reports an
error, either correct the call or answer without it.
If you can answer directly without tools, do so.
Be concise and accurate.";

/// Agent configuration
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Default system prompt (a run may override it)
    pub system_prompt: String,

    /// Maximum model turns per run before giving up
    pub max_iterations: usize,

    /// Generation options
    pub generation: GenerationOptions,

    /// Dispatch a turn's tool calls concurrently. Results are still appended
    /// in emission order.
    pub parallel_tool_calls: bool,

    /// Upper bound on a single model call
    pub model_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
            max_iterations: 10,
            generation: GenerationOptions::default(),
            parallel_tool_calls: false,
            model_timeout: Duration::from_secs(120),
        }
    }
}

impl AgentConfig {
    /// Read overrides from `AGENT_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(model) = lookup("AGENT_MODEL") {
            config.generation.model = model;
        }
        if let Some(prompt) = lookup("AGENT_SYSTEM_PROMPT") {
            config.system_prompt = prompt;
        }
        if let Some(raw) = lookup("AGENT_MAX_ITERATIONS") {
            config.max_iterations = raw
                .trim()
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    AgentError::Config(format!(
                        "AGENT_MAX_ITERATIONS must be a positive integer, got '{raw}'"
                    ))
                })?;
        }
        if let Some(raw) = lookup("AGENT_PARALLEL_TOOL_CALLS") {
            config.parallel_tool_calls = raw.trim().parse().map_err(|_| {
                AgentError::Config(format!(
                    "AGENT_PARALLEL_TOOL_CALLS must be true or false, got '{raw}'"
                ))
            })?;
        }
        if let Some(raw) = lookup("AGENT_MODEL_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                AgentError::Config(format!(
                    "AGENT_MODEL_TIMEOUT_SECS must be a number of seconds, got '{raw}'"
                ))
            })?;
            config.model_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

/// Position of a run in the state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    ModelThinking,
    ToolDispatch,
    Responding,
    Done,
    Error,
}

/// How the caller wants the run delivered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Stream,
    Invoke,
}

/// One new message for a conversation
#[derive(Clone, Debug)]
pub struct RunRequest {
    /// Existing conversation, or `None` to start a new one
    pub conversation_id: Option<ConversationId>,

    /// The new user message
    pub message: Message,

    /// Caller-supplied history merged into the persisted thread
    pub history: Vec<Message>,

    pub identity: IdentityContext,

    /// Overrides the configured system prompt for this run
    pub system_prompt: Option<String>,
}

impl RunRequest {
    pub fn new(message: impl Into<String>, identity: IdentityContext) -> Self {
        Self {
            conversation_id: None,
            message: Message::user(message),
            history: Vec::new(),
            identity,
            system_prompt: None,
        }
    }

    #[must_use]
    pub fn in_conversation(mut self, id: ConversationId) -> Self {
        self.conversation_id = Some(id);
        self
    }

    #[must_use]
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Token emitted while a run progresses
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Started {
        run_id: RunId,
        conversation_id: ConversationId,
        root_node_id: NodeId,
    },
    State {
        state: RunState,
    },
    TextDelta {
        delta: String,
    },
    ToolCallStarted {
        call_id: String,
        tool: String,
        node_id: NodeId,
        parent_node_id: NodeId,
    },
    ToolCallFinished {
        call_id: String,
        tool: String,
        success: bool,
        output: String,
    },
    Final {
        answer: String,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Result of a run that reached `Done`
#[derive(Clone, Debug, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub conversation_id: ConversationId,
    pub answer: String,
    /// Full message state after the run
    pub messages: Vec<Message>,
    /// Provenance tree of the run, root first
    pub nodes: Vec<ExecutionNode>,
}

/// Ordered, single-pass sequence of run events
pub struct RunStream {
    inner: ReceiverStream<RunEvent>,
}

impl Stream for RunStream {
    type Item = RunEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// What `run_agent` hands back for each mode
pub enum RunHandle {
    Stream(RunStream),
    Invoke(Result<RunOutcome>),
}

/// Where the driver pushes events. A closed consumer marks the run cancelled.
struct EventSink {
    tx: Option<mpsc::Sender<RunEvent>>,
    cancelled: bool,
}

impl EventSink {
    const fn discard() -> Self {
        Self {
            tx: None,
            cancelled: false,
        }
    }

    const fn channel(tx: mpsc::Sender<RunEvent>) -> Self {
        Self {
            tx: Some(tx),
            cancelled: false,
        }
    }

    async fn emit(&mut self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).await.is_err() {
                tracing::debug!("Stream consumer gone");
                self.tx = None;
                self.cancelled = true;
            }
        }
    }

    async fn state(&mut self, state: RunState) {
        tracing::trace!(?state, "Run state");
        self.emit(RunEvent::State { state }).await;
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled || self.tx.as_ref().is_some_and(mpsc::Sender::is_closed) {
            Err(AgentError::Cancelled("stream consumer closed".into()))
        } else {
            Ok(())
        }
    }
}

/// Identity of one run, shared by every dispatch in it
struct RunScope {
    run_id: RunId,
    conversation_id: ConversationId,
    graph: ProvenanceHandle,
    root: ExecutionNode,
}

impl RunScope {
    fn tool_context(&self) -> Result<ExecutionContext> {
        let node = self.graph.mint_child(&self.root.id, NodeType::Tool)?;
        Ok(ExecutionContext::new(
            self.run_id.clone(),
            self.conversation_id.clone(),
            node,
            self.graph.clone(),
        ))
    }
}

/// The main Agent struct
#[derive(Clone)]
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    utilities: Arc<UtilityRegistry>,
    threads: Arc<dyn ThreadStore>,
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        utilities: Arc<UtilityRegistry>,
        threads: Arc<dyn ThreadStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            utilities,
            threads,
            config,
        }
    }

    /// Run in the requested mode
    pub async fn run_agent(&self, request: RunRequest, mode: RunMode) -> RunHandle {
        match mode {
            RunMode::Stream => RunHandle::Stream(self.stream(request)),
            RunMode::Invoke => RunHandle::Invoke(self.invoke(request).await),
        }
    }

    /// Buffer the whole run and return the final answer and message state
    pub async fn invoke(&self, request: RunRequest) -> Result<RunOutcome> {
        self.execute(request, &mut EventSink::discard()).await
    }

    /// Start the run on a background task and return its event stream.
    ///
    /// The stream ends with a `Final` or `Error` event. Dropping it cancels
    /// the run once the in-flight dispatch completes.
    pub fn stream(&self, request: RunRequest) -> RunStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let agent = self.clone();
        tokio::spawn(async move {
            let mut sink = EventSink::channel(tx);
            // the outcome has already been delivered as events
            let _ = agent.execute(request, &mut sink).await;
        });
        RunStream {
            inner: ReceiverStream::new(rx),
        }
    }

    async fn execute(&self, request: RunRequest, sink: &mut EventSink) -> Result<RunOutcome> {
        let run_id = RunId::new();
        let span = tracing::info_span!(
            "agent_run",
            run_id = %run_id,
            conversation_id = tracing::field::Empty
        );

        let result = self.drive(run_id, request, sink).instrument(span).await;

        if let Err(e) = &result {
            tracing::warn!(error = %e, code = e.kind(), "Run failed");
            sink.state(RunState::Error).await;
            sink.emit(RunEvent::Error {
                code: e.kind().to_string(),
                message: e.to_string(),
            })
            .await;
        }
        result
    }

    async fn drive(
        &self,
        run_id: RunId,
        request: RunRequest,
        sink: &mut EventSink,
    ) -> Result<RunOutcome> {
        // Idle
        let (conversation_id, persisted) = self
            .open_thread(request.conversation_id, &request.identity)
            .await?;
        tracing::Span::current().record("conversation_id", tracing::field::display(&conversation_id));

        let graph = ProvenanceHandle::new(NodeGraph::root(request.identity));
        let scope = RunScope {
            run_id: run_id.clone(),
            conversation_id: conversation_id.clone(),
            root: graph.root_node(),
            graph,
        };

        sink.emit(RunEvent::Started {
            run_id: run_id.clone(),
            conversation_id: conversation_id.clone(),
            root_node_id: scope.root.id.clone(),
        })
        .await;
        sink.state(RunState::Idle).await;

        // sanitize replaces the tail in place, so the persisted prefix keeps its length
        let persisted_len = persisted.len();
        let mut messages = state::sanitize(state::merge(&persisted, &request.history));
        messages.push(request.message);

        let dangling = state::dangling_tool_call_ids(&messages);
        if !dangling.is_empty() {
            tracing::warn!(?dangling, "Thread has tool calls without results");
        }

        let system_prompt = request
            .system_prompt
            .unwrap_or_else(|| self.config.system_prompt.clone());

        let mut iteration = 0;
        loop {
            sink.check_cancelled()?;
            iteration += 1;
            if iteration > self.config.max_iterations {
                return Err(AgentError::MaxIterationsExceeded(self.config.max_iterations));
            }

            sink.state(RunState::ModelThinking).await;
            tracing::debug!(iteration, messages = messages.len(), "Calling model");
            let completion = self.think(&messages, &system_prompt, sink).await?;

            messages.push(Message::assistant_with_tool_calls(
                completion.content,
                completion.tool_calls,
            ));
            messages = state::sanitize(messages);

            let calls = messages
                .last()
                .map(|m| m.tool_calls.clone())
                .unwrap_or_default();

            if calls.is_empty() {
                sink.state(RunState::Responding).await;
                let answer = messages
                    .last()
                    .map(|m| m.text().to_string())
                    .unwrap_or_default();
                sink.check_cancelled()?;

                self.threads
                    .append_messages(&conversation_id, messages[persisted_len..].to_vec())
                    .await?;

                tracing::info!(iteration, "Run complete");
                sink.state(RunState::Done).await;
                sink.emit(RunEvent::Final {
                    answer: answer.clone(),
                })
                .await;

                return Ok(RunOutcome {
                    run_id,
                    conversation_id,
                    answer,
                    messages,
                    nodes: scope.graph.snapshot(),
                });
            }

            sink.state(RunState::ToolDispatch).await;
            let results = self.dispatch_calls(&calls, &scope, sink).await?;
            messages.extend(results);
        }
    }

    async fn open_thread(
        &self,
        requested: Option<ConversationId>,
        identity: &IdentityContext,
    ) -> Result<(ConversationId, Vec<Message>)> {
        if let Some(id) = requested {
            let messages = self.threads.load_thread(&id, identity).await?;
            Ok((id, messages))
        } else {
            let id = ConversationId::new();
            self.threads.create_thread(&id, identity).await?;
            tracing::debug!(conversation_id = %id, "Created thread");
            Ok((id, Vec::new()))
        }
    }

    /// One model turn, accumulated from the provider's stream
    async fn think(
        &self,
        messages: &[Message],
        system_prompt: &str,
        sink: &mut EventSink,
    ) -> Result<Completion> {
        let request = ModelRequest {
            messages: messages.to_vec(),
            available_tools: self.utilities.descriptors(),
            system_prompt: system_prompt.to_string(),
            disable_parallel_tool_calls: !self.config.parallel_tool_calls,
            options: self.config.generation.clone(),
        };

        let call = async {
            let mut stream = self.provider.complete_stream(&request).await?;
            let mut completion = Completion {
                model: request.options.model.clone(),
                ..Default::default()
            };
            let mut content = String::new();

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                if !chunk.delta.is_empty() {
                    content.push_str(&chunk.delta);
                    sink.emit(RunEvent::TextDelta { delta: chunk.delta }).await;
                }
                completion.tool_calls.extend(chunk.tool_calls);
                if chunk.usage.is_some() {
                    completion.usage = chunk.usage;
                }
                if chunk.done {
                    break;
                }
            }

            completion.finish_reason = Some(if completion.tool_calls.is_empty() {
                FinishReason::Stop
            } else {
                FinishReason::ToolUse
            });
            completion.content = (!content.is_empty()).then_some(content);
            Ok::<_, AgentError>(completion)
        };

        match tokio::time::timeout(self.config.model_timeout, call).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(AgentError::ModelCallFailed(msg))) => Err(AgentError::ModelCallFailed(msg)),
            Ok(Err(e)) => Err(AgentError::ModelCallFailed(e.to_string())),
            Err(_) => Err(AgentError::ModelCallFailed(format!(
                "timed out after {:?}",
                self.config.model_timeout
            ))),
        }
    }

    /// Dispatch every call of a turn and return the tool-result messages in
    /// emission order
    async fn dispatch_calls(
        &self,
        calls: &[ToolCall],
        scope: &RunScope,
        sink: &mut EventSink,
    ) -> Result<Vec<Message>> {
        let mut results = Vec::with_capacity(calls.len());

        if self.config.parallel_tool_calls {
            let mut contexts = Vec::with_capacity(calls.len());
            for call in calls {
                sink.check_cancelled()?;
                let ctx = scope.tool_context()?;
                Self::announce(call, &ctx, sink).await;
                contexts.push(ctx);
            }
            let outcomes = futures::future::join_all(
                calls
                    .iter()
                    .zip(&contexts)
                    .map(|(call, ctx)| self.utilities.dispatch(&call.name, &call.arguments, ctx)),
            )
            .await;
            sink.check_cancelled()?;
            for (call, outcome) in calls.iter().zip(outcomes) {
                results.push(Self::observe(call, outcome, sink).await);
            }
        } else {
            for call in calls {
                sink.check_cancelled()?;
                let ctx = scope.tool_context()?;
                Self::announce(call, &ctx, sink).await;
                let outcome = self
                    .utilities
                    .dispatch(&call.name, &call.arguments, &ctx)
                    .await;
                sink.check_cancelled()?;
                results.push(Self::observe(call, outcome, sink).await);
            }
        }

        Ok(results)
    }

    async fn announce(call: &ToolCall, ctx: &ExecutionContext, sink: &mut EventSink) {
        tracing::debug!(tool = %call.name, call_id = %call.id, node_id = %ctx.node_id(), "Dispatching tool call");
        sink.emit(RunEvent::ToolCallStarted {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            node_id: ctx.node_id().clone(),
            parent_node_id: ctx.node.parent_id.clone().unwrap_or_default(),
        })
        .await;
    }

    /// Fold a dispatch outcome into a tool-role message
    async fn observe(
        call: &ToolCall,
        outcome: std::result::Result<ExecuteResult, DispatchError>,
        sink: &mut EventSink,
    ) -> Message {
        let (success, output) = match outcome {
            Ok(result) => (true, result.output),
            Err(e) => (false, format!("Error: {e}")),
        };
        sink.emit(RunEvent::ToolCallFinished {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            success,
            output: output.clone(),
        })
        .await;
        Message::tool_result(&call.id, &call.name, output)
    }

    /// Get the utility registry
    pub fn utilities(&self) -> &UtilityRegistry {
        &self.utilities
    }

    /// Get the thread store
    pub fn threads(&self) -> &Arc<dyn ThreadStore> {
        &self.threads
    }

    /// Get configuration
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Builder for Agent configuration
#[derive(Default)]
pub struct AgentBuilder {
    provider: Option<Arc<dyn LlmProvider>>,
    utilities: Option<Arc<UtilityRegistry>>,
    threads: Option<Arc<dyn ThreadStore>>,
    config: AgentConfig,
}

impl AgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    #[must_use]
    pub fn utilities(mut self, utilities: Arc<UtilityRegistry>) -> Self {
        self.utilities = Some(utilities);
        self
    }

    #[must_use]
    pub fn threads(mut self, threads: Arc<dyn ThreadStore>) -> Self {
        self.threads = Some(threads);
        self
    }

    #[must_use]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.generation.model = model.into();
        self
    }

    #[must_use]
    pub const fn temperature(mut self, temp: f32) -> Self {
        self.config.generation.temperature = temp;
        self
    }

    #[must_use]
    pub const fn max_iterations(mut self, max: usize) -> Self {
        self.config.max_iterations = max;
        self
    }

    #[must_use]
    pub const fn parallel_tool_calls(mut self, enabled: bool) -> Self {
        self.config.parallel_tool_calls = enabled;
        self
    }

    #[must_use]
    pub const fn model_timeout(mut self, timeout: Duration) -> Self {
        self.config.model_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<Agent> {
        let provider = self
            .provider
            .ok_or_else(|| AgentError::Config("Provider is required".into()))?;
        if self.config.max_iterations == 0 {
            return Err(AgentError::Config("max_iterations must be at least 1".into()));
        }

        Ok(Agent::new(
            provider,
            self.utilities.unwrap_or_default(),
            self.threads
                .unwrap_or_else(|| Arc::new(MemoryThreadStore::new())),
            self.config,
        ))
    }
}
