//! HTTP/WebSocket Handlers

use axum::{
    Json,
    extract::{
        FromRequestParts, Path, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use agent_core::{
    AgentError, ConversationId, IdentityContext, Message, RunEvent, RunRequest,
    provider::ModelInfo, tool::UtilitySummary,
};

use crate::state::AppState;

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub ollama_connected: bool,
    pub utilities: usize,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl ChatRequest {
    fn into_run_request(self, identity: IdentityContext) -> Result<RunRequest, ApiError> {
        if self.message.trim().is_empty() {
            return Err(ApiError::bad_request("Message must not be empty", "empty_message"));
        }
        let mut request = RunRequest::new(self.message, identity).with_history(self.history);
        if let Some(id) = self.conversation_id {
            request = request.in_conversation(ConversationId::from_string(id));
        }
        if let Some(prompt) = self.system_prompt {
            request = request.with_system_prompt(prompt);
        }
        Ok(request)
    }
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub message: String,
    pub conversation_id: String,
    pub run_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error rendered as `{ error, code }` with a matching status
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.into(),
                code: code.into(),
            },
        }
    }

    fn bad_request(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error, code)
    }
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        let status = match &e {
            AgentError::ThreadNotFound(_) => StatusCode::NOT_FOUND,
            AgentError::ModelCallFailed(_) | AgentError::ProviderUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
            AgentError::MaxIterationsExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AgentError::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %e, "Agent error");
        } else {
            tracing::info!(error = %e, "Request rejected");
        }
        Self::new(status, e.user_message(), e.kind())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Caller identity, as asserted by the authenticating proxy in front of us
pub struct Identity(pub IdentityContext);

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Read `x-user-id` (required), `x-organization-id`, `x-platform-user-id`
/// and a bearer `authorization` credential
pub fn identity_from_headers(headers: &HeaderMap) -> Result<IdentityContext, ApiError> {
    let user_id = header(headers, "x-user-id").ok_or_else(|| {
        ApiError::new(
            StatusCode::UNAUTHORIZED,
            "Missing x-user-id header",
            "missing_identity",
        )
    })?;

    let mut identity = IdentityContext::new(user_id);
    if let Some(org) = header(headers, "x-organization-id") {
        identity = identity.with_organization(org);
    }
    if let Some(platform_user) = header(headers, "x-platform-user-id") {
        identity = identity.with_platform_user(platform_user);
    }
    if let Some(token) = header(headers, "authorization").and_then(|v| v.strip_prefix("Bearer ")) {
        identity = identity.with_credential(token.trim());
    }
    Ok(identity)
}

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity_from_headers(&parts.headers).map(Self)
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let ollama_connected = state.provider.health_check().await.unwrap_or(false);

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        ollama_connected,
        utilities: state.agent.utilities().len(),
    })
}

/// Models known to the provider
pub async fn list_models(State(state): State<AppState>) -> Result<Json<Vec<ModelInfo>>, ApiError> {
    Ok(Json(state.provider.list_models().await?))
}

/// Registered utilities, in registration order
pub async fn list_utilities(State(state): State<AppState>) -> Json<Vec<UtilitySummary>> {
    Json(state.agent.utilities().list())
}

/// Main chat endpoint (invoke mode)
pub async fn chat_handler(
    State(state): State<AppState>,
    Identity(identity): Identity,
    Json(payload): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let request = payload.into_run_request(identity)?;
    let outcome = state.agent.invoke(request).await?;

    Ok(Json(ChatResponse {
        message: outcome.answer,
        conversation_id: outcome.conversation_id.to_string(),
        run_id: outcome.run_id.to_string(),
    }))
}

/// Drop a conversation thread
pub async fn delete_thread(
    State(state): State<AppState>,
    Identity(identity): Identity,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    tracing::info!(conversation_id = %id, user_id = %identity.user_id, "Deleting thread");
    state
        .agent
        .threads()
        .delete_thread(&ConversationId::from_string(id), &identity)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// WebSocket streaming chat
pub async fn chat_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Identity(identity): Identity,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state, identity))
}

fn error_frame(error: &ApiError) -> WsMessage {
    let frame = serde_json::json!({
        "type": "error",
        "code": error.body.code,
        "message": error.body.error,
    });
    WsMessage::Text(frame.to_string().into())
}

async fn handle_stream(socket: WebSocket, state: AppState, identity: IdentityContext) {
    let (mut sender, mut receiver) = socket.split();

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => continue,
        };

        // Parse request
        let request = serde_json::from_str::<ChatRequest>(msg.as_str())
            .map_err(|e| ApiError::bad_request(e.to_string(), "invalid_request"))
            .and_then(|r| r.into_run_request(identity.clone()));
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                if sender.send(error_frame(&e)).await.is_err() {
                    break;
                }
                continue;
            }
        };

        // Forward every run event; dropping the stream cancels the run
        let mut events = state.agent.stream(request);
        while let Some(event) = events.next().await {
            let frame = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to encode run event: {}", e);
                    continue;
                }
            };
            if sender.send(WsMessage::Text(frame.into())).await.is_err() {
                tracing::info!("WebSocket closed mid-run");
                return;
            }
            if matches!(event, RunEvent::Final { .. } | RunEvent::Error { .. }) {
                break;
            }
        }
    }
}
