//! Ollama LLM Provider
//!
//! Implementation of `LlmProvider` for local Ollama inference. Tool calls go
//! through the fenced-block text protocol in [`crate::tool_protocol`].

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, CompletionStream, FinishReason, GenerationOptions, LlmProvider, ModelInfo,
        ModelRequest, StreamChunk, TokenUsage,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use ollama_rs::{
    Ollama,
    generation::chat::{ChatMessage, MessageRole, request::ChatMessageRequest},
    models::ModelOptions,
};

use crate::tool_protocol::{self, ToolBlockFilter};

/// Ollama provider configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
        }
    }
}

impl OllamaConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `OLLAMA_HOST` and `OLLAMA_PORT`; an unparsable port falls back to the default
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let host = lookup("OLLAMA_HOST").unwrap_or(defaults.host);
        let port = lookup("OLLAMA_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(defaults.port);

        Self { host, port }
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: Ollama,
    config: OllamaConfig,
}

impl OllamaProvider {
    /// Create a new Ollama provider with custom host/port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::from_config(OllamaConfig {
            host: host.into(),
            port,
        })
    }

    /// Create from configuration
    pub fn from_config(config: OllamaConfig) -> Self {
        Self {
            client: Ollama::new(&config.host, config.port),
            config,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::from_config(OllamaConfig::from_env())
    }

    /// Create with default localhost settings
    pub fn localhost() -> Self {
        Self::from_config(OllamaConfig::default())
    }

    pub const fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Flatten the request into plain chat messages, system prompt first
    fn convert_messages(request: &ModelRequest) -> Vec<ChatMessage> {
        let mut system = request.system_prompt.clone();
        if !request.available_tools.is_empty() {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str(&tool_protocol::render_tools_section(
                &request.available_tools,
                request.disable_parallel_tool_calls,
            ));
        }

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !system.is_empty() {
            messages.push(ChatMessage::new(MessageRole::System, system));
        }
        messages.extend(request.messages.iter().map(Self::convert_message));
        messages
    }

    fn convert_message(message: &Message) -> ChatMessage {
        match message.role {
            Role::System => ChatMessage::new(MessageRole::System, message.text().to_string()),
            Role::User => ChatMessage::new(MessageRole::User, message.text().to_string()),
            Role::Assistant => ChatMessage::new(
                MessageRole::Assistant,
                tool_protocol::render_assistant(message),
            ),
            // Tool results appear as user context
            Role::Tool => ChatMessage::new(
                MessageRole::User,
                tool_protocol::render_tool_result(message),
            ),
        }
    }

    /// Split a buffered reply into prose and calls
    fn convert_reply(reply: &str, model: &str, single_call: bool) -> Completion {
        let mut turn = tool_protocol::parse_turn(reply);
        if single_call && turn.tool_calls.len() > 1 {
            tracing::debug!(dropped = turn.tool_calls.len() - 1, "Keeping only the first tool call");
            turn.tool_calls.truncate(1);
        }
        let finish_reason = if turn.tool_calls.is_empty() {
            FinishReason::Stop
        } else {
            FinishReason::ToolUse
        };
        Completion {
            content: turn.content,
            tool_calls: turn.tool_calls,
            model: model.to_string(),
            usage: None,
            finish_reason: Some(finish_reason),
        }
    }

    /// Build Ollama generation options
    fn build_options(opts: &GenerationOptions) -> ModelOptions {
        let num_predict = i32::try_from(opts.max_tokens).unwrap_or(i32::MAX);
        let options = ModelOptions::default()
            .temperature(opts.temperature)
            .top_p(opts.top_p)
            .num_predict(num_predict);
        if opts.stop_sequences.is_empty() {
            options
        } else {
            options.stop(opts.stop_sequences.clone())
        }
    }

    fn build_request(request: &ModelRequest) -> ChatMessageRequest {
        ChatMessageRequest::new(
            request.options.model.clone(),
            Self::convert_messages(request),
        )
        .options(Self::build_options(&request.options))
    }
}

fn token_usage<N: TryInto<u32>>(prompt: N, completion: N) -> TokenUsage {
    let prompt_tokens = prompt.try_into().unwrap_or(u32::MAX);
    let completion_tokens = completion.try_into().unwrap_or(u32::MAX);
    TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens.saturating_add(completion_tokens),
    }
}

/// One streamed response, reduced to what the filter needs
struct StreamPart {
    content: String,
    done: bool,
    usage: Option<TokenUsage>,
}

struct FilterState<S> {
    parts: S,
    filter: Option<ToolBlockFilter>,
    single_call: bool,
}

impl<S> FilterState<S> {
    fn flush(
        &self,
        filter: ToolBlockFilter,
        mut delta: String,
        usage: Option<TokenUsage>,
    ) -> StreamChunk {
        let (rest, mut tool_calls) = filter.finish();
        delta.push_str(&rest);
        if self.single_call {
            tool_calls.truncate(1);
        }
        StreamChunk {
            delta,
            tool_calls,
            done: true,
            usage,
        }
    }
}

/// Run streamed text through a [`ToolBlockFilter`].
///
/// The filter is flushed on the `done` response, or when the stream ends
/// without one, so held text and tool calls always reach the caller. An
/// error ends the stream.
fn filter_stream<S>(parts: S, single_call: bool) -> impl Stream<Item = Result<StreamChunk>> + Send
where
    S: Stream<Item = Result<StreamPart>> + Unpin + Send,
{
    let state = FilterState {
        parts,
        filter: Some(ToolBlockFilter::new()),
        single_call,
    };
    futures::stream::unfold(state, |mut state| async move {
        let mut filter = state.filter.take()?;
        match state.parts.next().await {
            Some(Ok(part)) => {
                let delta = filter.push(&part.content);
                if part.done {
                    let chunk = state.flush(filter, delta, part.usage);
                    return Some((Ok(chunk), state));
                }
                state.filter = Some(filter);
                Some((
                    Ok(StreamChunk {
                        delta,
                        ..Default::default()
                    }),
                    state,
                ))
            }
            Some(Err(e)) => Some((Err(e), state)),
            None => {
                tracing::debug!("Ollama stream ended without a final response");
                let chunk = state.flush(filter, String::new(), None);
                Some((Ok(chunk), state))
            }
        }
    })
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    async fn health_check(&self) -> Result<bool> {
        match self.client.list_local_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Ollama health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn complete(&self, request: &ModelRequest) -> Result<Completion> {
        let response = self
            .client
            .send_chat_messages(Self::build_request(request))
            .await
            .map_err(|e| AgentError::ModelCallFailed(e.to_string()))?;

        let mut completion = Self::convert_reply(
            &response.message.content,
            &request.options.model,
            request.disable_parallel_tool_calls,
        );
        completion.usage = response
            .final_data
            .as_ref()
            .map(|d| token_usage(d.prompt_eval_count, d.eval_count));
        Ok(completion)
    }

    async fn complete_stream(&self, request: &ModelRequest) -> Result<CompletionStream> {
        let single_call = request.disable_parallel_tool_calls;
        let stream = self
            .client
            .send_chat_messages_stream(Self::build_request(request))
            .await
            .map_err(|e| AgentError::ModelCallFailed(e.to_string()))?;

        let parts = stream.map(|result| match result {
            Ok(response) => Ok(StreamPart {
                content: response.message.content,
                done: response.done,
                usage: response
                    .final_data
                    .as_ref()
                    .map(|d| token_usage(d.prompt_eval_count, d.eval_count)),
            }),
            Err(_) => Err(AgentError::ModelCallFailed(
                "Ollama stream interrupted".into(),
            )),
        });
        let mapped = filter_stream(parts, single_call);

        Ok(Box::pin(mapped))
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let models = self
            .client
            .list_local_models()
            .await
            .map_err(|e| AgentError::ProviderUnavailable(e.to_string()))?;

        Ok(models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.name.clone(),
                name: m.name,
                context_length: None,   // Not exposed by Ollama API
                supports_vision: false, // Would need to check model details
            })
            .collect())
    }
}
