use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use parley_engine::{CharacterRegistry, CharacterSummary};

use crate::connection::{self, ConnectionConfig, ConnectionRegistry, HEARTBEAT_INTERVAL};
use crate::session::SessionDeps;
use crate::settings::ServerSettings;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
            max_send_queue: 256,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_send_queue: settings.max_send_queue,
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs.max(1)),
        }
    }

    fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_send_queue: self.max_send_queue,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub deps: SessionDeps,
    pub connections: Arc<ConnectionRegistry>,
    pub connection_config: ConnectionConfig,
    /// Server-owned registry behind `/v1/voices`. Never handed to a session.
    pub voices: Arc<Mutex<CharacterRegistry>>,
}

impl AppState {
    pub fn new(deps: SessionDeps, connection_config: ConnectionConfig) -> Self {
        let voices = CharacterRegistry::new("server", Arc::clone(&deps.catalog));
        Self {
            deps,
            connections: Arc::new(ConnectionRegistry::new()),
            connection_config,
            voices: Arc::new(Mutex::new(voices)),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/realtime", get(realtime_handler))
        .route("/v1/health", get(health_handler))
        .route("/v1/voices", get(voices_handler))
        .route("/v1/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until [`ServerHandle::shutdown`].
pub async fn start(config: ServerConfig, deps: SessionDeps) -> Result<ServerHandle, std::io::Error> {
    let state = AppState::new(deps, config.connection());
    let connections = Arc::clone(&state.connections);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    info!(host = %config.host, port = local_addr.port(), "parley server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let join = tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = served {
            error!(error = %e, "server stopped with an error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        connections,
        shutdown,
        join,
    })
}

pub struct ServerHandle {
    pub port: u16,
    connections: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

impl ServerHandle {
    pub fn active_sessions(&self) -> usize {
        self.connections.count()
    }

    /// Stop accepting connections and wait for the server task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "server task ended abnormally");
        }
    }
}

async fn realtime_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        connection::serve_socket(socket, state.deps, state.connections, state.connection_config)
    })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "active_sessions": state.connections.count(),
    }))
}

/// Characters in the default directory marked good, freshly loaded.
async fn voices_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let mut registry = state.voices.lock().await;
    if let Err(e) = registry.load(&state.deps.options.default_directory).await {
        warn!(error = %e, "voice listing failed");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": e.to_string(), "kind": e.error_kind() })),
        );
    }
    let voices: Vec<CharacterSummary> = registry
        .list()
        .into_iter()
        .filter(|c| c.good == Some(true))
        .collect();
    (StatusCode::OK, Json(json!(voices)))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.deps.metrics.snapshot())
}
