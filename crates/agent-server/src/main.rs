//! Agent orchestrator HTTP server
//!
//! Axum-based server providing REST API and WebSocket endpoints over the
//! run controller. Callers are identified by headers set by an upstream
//! authenticating proxy.

mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{AgentBuilder, AgentConfig, LlmProvider, UtilityRegistry};
use agent_runtime::{OllamaProvider, SqliteExecutionLog, SqliteLogConfig};
use agent_utilities::{ServiceCallConfig, register_defaults};

use crate::handlers::{
    chat_handler, chat_stream_handler, delete_thread, health_check, list_models, list_utilities,
};
use crate::state::AppState;

fn build_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & info
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        .route("/api/utilities", get(list_utilities))
        // Agent API
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/stream", get(chat_stream_handler))
        .route("/api/threads/{id}", delete(delete_thread))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment before the filter reads RUST_LOG
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Initialize LLM provider
    let provider = Arc::new(OllamaProvider::from_env());

    // Verify Ollama connection
    match provider.health_check().await {
        Ok(true) => {
            tracing::info!("Connected to Ollama");
            if let Ok(models) = provider.list_models().await {
                for model in models {
                    tracing::info!("  Model: {}", model.id);
                }
            }
        }
        Ok(false) | Err(_) => {
            tracing::warn!("Ollama not available, runs will fail until it is reachable");
            tracing::warn!("  Make sure Ollama is running: ollama serve");
        }
    }

    // Execution log
    let log_config = SqliteLogConfig::from_env();
    let log = Arc::new(SqliteExecutionLog::open(&log_config)?);
    tracing::info!(path = %log_config.path.display(), "Execution log opened");

    // Utilities
    let service = match std::env::var("SERVICE_BASE_URL") {
        Ok(_) => Some(ServiceCallConfig::from_env()?),
        Err(_) => {
            tracing::warn!("SERVICE_BASE_URL not set, service_call disabled");
            None
        }
    };
    let mut utilities = UtilityRegistry::new().with_log_store(log);
    register_defaults(&mut utilities, service)?;

    // Run controller
    let config = AgentConfig::from_env()?;
    tracing::info!(
        model = %config.generation.model,
        max_iterations = config.max_iterations,
        parallel_tool_calls = config.parallel_tool_calls,
        "Agent configured"
    );
    let agent = AgentBuilder::new()
        .provider(provider.clone())
        .utilities(Arc::new(utilities))
        .config(config)
        .build()?;

    let app = build_router(AppState { agent, provider });

    // Start server
    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Agent server running on http://{}", addr);
    tracing::info!("Endpoints:");
    tracing::info!("  GET    /health            - Health check");
    tracing::info!("  GET    /api/models        - List available models");
    tracing::info!("  GET    /api/utilities     - List registered utilities");
    tracing::info!("  POST   /api/chat          - Run to completion");
    tracing::info!("  GET    /api/chat/stream   - WebSocket streaming");
    tracing::info!("  DELETE /api/threads/{{id}} - Drop a conversation");

    axum::serve(listener, app).await?;

    Ok(())
}
