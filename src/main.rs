//! mural - a page-painting chat agent
//!
//! A Rust backend that streams a model's text and `run_js` tool calls to a
//! browser page, round-trips execution results, and replays history to
//! rebuild the page when a conversation is reopened.

mod api;
mod db;
mod llm;
mod runtime;
mod state_machine;
mod system_prompt;

use api::{create_router, AppState};
use db::Database;
use llm::{AnthropicClient, ModelClient};
use runtime::{SessionManager, DEFAULT_TOOL_TIMEOUT};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_MODEL: &str = "claude-opus-4-6";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mural=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("MURAL_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.mural/mural.db")
    });

    let port: u16 = std::env::var("MURAL_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);

    let tool_timeout = std::env::var("MURAL_TOOL_TIMEOUT_SECS")
        .ok()
        .and_then(|t| t.parse().ok())
        .map_or(DEFAULT_TOOL_TIMEOUT, Duration::from_secs);

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Initialize database
    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    // Initialize model client
    let model_name =
        std::env::var("MURAL_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
    let model: Option<Arc<dyn ModelClient>> = match std::env::var("ANTHROPIC_API_KEY") {
        Ok(key) if !key.is_empty() => {
            let base_url = std::env::var("ANTHROPIC_BASE_URL").ok();
            let client = AnthropicClient::new(key, model_name, base_url);
            tracing::info!(model = %client.model_id(), "Model client initialized");
            Some(Arc::new(client))
        }
        _ => {
            tracing::warn!("ANTHROPIC_API_KEY not set; chat requests will be rejected");
            None
        }
    };

    // Create application state
    let sessions = SessionManager::new(db, model, tool_timeout);
    let state = AppState::new(sessions);

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state).layer(cors).layer(compression);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("mural server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
