//! HTTP front end: WebSocket upgrades, hub statistics and static client files

use crate::connection::Connection;
use crate::hub::{HubHandle, HubStats};
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use log::{debug, info, warn};
use serde::Serialize;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;

pub use axum::extract::ws::Message;

/// Handle to a hub relaying WebSocket frames
pub type RelayHandle = HubHandle<Message>;

/// Settings for the HTTP front end
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory served at `/`
    pub asset_dir: PathBuf,
    /// Path at which WebSocket upgrades are accepted
    pub ws_path: String,
    /// Outbound queue size for each connection
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            asset_dir: PathBuf::from(shared::DEFAULT_ASSET_DIR),
            ws_path: shared::WS_PATH.to_string(),
            queue_capacity: shared::OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

#[derive(Clone)]
struct AppState {
    hub: RelayHandle,
    queue_capacity: usize,
    ws_path: String,
}

/// Settings the browser client reads before connecting
#[derive(Debug, Clone, Serialize)]
struct ClientConfig {
    ws_path: String,
}

/// Builds the router for a running hub
pub fn router(config: &ServerConfig, hub: RelayHandle) -> Router {
    let state = AppState {
        hub,
        queue_capacity: config.queue_capacity,
        ws_path: normalize_path(&config.ws_path),
    };

    Router::new()
        .route(&state.ws_path, get(ws_handler))
        .route(shared::STATS_PATH, get(stats_handler))
        .route(shared::CLIENT_CONFIG_PATH, get(client_config_handler))
        .fallback_service(ServeDir::new(&config.asset_dir))
        .with_state(state)
}

/// Serves the relay on an already bound listener until the process exits
pub async fn serve(
    listener: TcpListener,
    config: ServerConfig,
    hub: RelayHandle,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(
            "Relay listening on {} (socket path {}, assets from {})",
            addr,
            normalize_path(&config.ws_path),
            config.asset_dir.display()
        );
    }
    axum::serve(listener, router(&config, hub)).await
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Registers a freshly upgraded socket with the hub and runs it to completion
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection, member) = Connection::new(state.queue_capacity);
    let id = connection.id();

    if state.hub.register(member).await.is_err() {
        warn!("Hub stopped, refusing connection {}", id);
        return;
    }
    debug!("Connection {} upgraded", id);

    let (sink, stream) = socket.split();
    connection.serve(stream, sink, state.hub).await;
}

async fn stats_handler(State(state): State<AppState>) -> Result<Json<HubStats>, StatusCode> {
    state
        .hub
        .stats()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn client_config_handler(State(state): State<AppState>) -> Json<ClientConfig> {
    Json(ClientConfig {
        ws_path: state.ws_path,
    })
}
