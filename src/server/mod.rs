//! HTTP server: the WebSocket accept loop and the health endpoint.

pub mod protocol;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::PipelineError;
use crate::llm::{BackendState, LlamaChat, LlamaClient, Supervisor};
use crate::session::store::SessionStore;
use crate::session::SessionServices;
use crate::stt::WhisperSubprocess;
use crate::tts::PiperTts;

/// Shared server state.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub services: Arc<SessionServices>,
    pub supervisor: Arc<Supervisor>,
}

/// Start the server. Returns after graceful shutdown.
///
/// Fails with [`PipelineError::BackendUnavailable`] when the backend never
/// becomes healthy at startup (exit code 3 at the CLI).
pub async fn start(config: Config) -> Result<(), PipelineError> {
    let config = Arc::new(config);

    let supervisor = Supervisor::new(config.backend.clone());
    supervisor.start().await?;
    let monitor = supervisor.spawn_monitor();

    let chat = LlamaChat::new(
        LlamaClient::new(config.backend.base_url()),
        Arc::clone(&supervisor),
    );

    let services = Arc::new(SessionServices {
        stt: Arc::new(WhisperSubprocess::new(config.stt.clone())),
        tts: Arc::new(PiperTts::new(config.tts.clone())),
        chat: Arc::new(chat),
        store: Arc::new(SessionStore::new(config.session.sessions_dir.clone())),
        system_prompt: config.session.system_prompt.clone(),
        max_history_turns: config.session.max_history_turns,
        prefetch_depth: config.session.prefetch_depth,
    });

    let state = ServerState {
        config: Arc::clone(&config),
        services,
        supervisor: Arc::clone(&supervisor),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws/audio", get(ws::ws_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| PipelineError::Protocol(format!("invalid bind address: {e}")))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped, shutting down backend");
    supervisor.shutdown().await;
    let _ = monitor.await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// `GET /health`
async fn health_handler(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let backend = match state.supervisor.state() {
        BackendState::Healthy => "healthy",
        _ => "unhealthy",
    };
    Json(serde_json::json!({ "status": "ok", "backend": backend }))
}
