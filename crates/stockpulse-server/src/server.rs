use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use stockpulse_notify::{ListenerHandle, NotificationSource, ReconnectPolicy, UpstreamListener};
use stockpulse_store::InventoryRepo;

use crate::broadcast::Broadcaster;
use crate::client;
use crate::error::ServerError;
use crate::event_bridge::EventBridge;
use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// `0` picks a free port.
    pub port: u16,
    /// Messages buffered per subscriber before sends start waiting.
    pub max_send_queue: usize,
    /// A subscriber send slower than this counts as failed.
    pub send_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,
    /// Upstream channel carrying inventory change messages.
    pub channel: String,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            max_send_queue: 256,
            send_timeout_ms: 5_000,
            heartbeat_interval_secs: 30,
            channel: "inventory_channel".into(),
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            shutdown_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_base_delay_ms)),
            ..ReconnectPolicy::default()
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<InventoryRepo>,
    pub broadcaster: Arc<Broadcaster>,
    pub listener: Arc<UpstreamListener>,
    pub config: Arc<ServerConfig>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(handlers::health))
        .route("/inventory", get(handlers::list_items).post(handlers::create_item))
        .route(
            "/inventory/{id}",
            get(handlers::get_item)
                .put(handlers::update_item)
                .delete(handlers::delete_item),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Start the bridge and the HTTP server.
///
/// Connects to `source` and subscribes to the configured channel before
/// binding; a source that can't be reached fails startup. Afterwards upstream
/// loss is retried in the background.
pub async fn start(
    config: ServerConfig,
    repo: Arc<InventoryRepo>,
    source: Arc<dyn NotificationSource>,
) -> Result<ServerHandle, ServerError> {
    let broadcaster = Arc::new(Broadcaster::new(config.send_timeout()));
    let listener = Arc::new(UpstreamListener::new(source));

    let listener_handle = EventBridge::new(Arc::clone(&listener), Arc::clone(&broadcaster))
        .start(&config.channel, config.reconnect_policy())
        .await?;

    let addr = format!("{}:{}", config.host, config.port);
    let tcp = match tokio::net::TcpListener::bind(&addr).await {
        Ok(tcp) => tcp,
        Err(e) => {
            listener_handle.stop(config.shutdown_timeout()).await;
            return Err(e.into());
        }
    };
    let local_addr = tcp.local_addr()?;

    let config = Arc::new(config);
    let app_state = AppState {
        repo,
        broadcaster: Arc::clone(&broadcaster),
        listener,
        config: Arc::clone(&config),
    };
    let router = build_router(app_state);

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(tcp, router)
            .with_graceful_shutdown(server_shutdown.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "http server failed");
        }
    });

    tracing::info!(
        addr = %local_addr,
        channel = %config.channel,
        "stockpulse server started"
    );

    Ok(ServerHandle {
        port: local_addr.port(),
        broadcaster,
        listener: listener_handle,
        shutdown,
        server,
        shutdown_timeout: config.shutdown_timeout(),
    })
}

/// Handle returned by `start()`. Owns the listener lifecycle and the server task.
pub struct ServerHandle {
    pub port: u16,
    broadcaster: Arc<Broadcaster>,
    listener: ListenerHandle,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    pub fn listener(&self) -> &Arc<UpstreamListener> {
        self.listener.listener()
    }

    /// Stop the upstream listener first so no new events arrive, then close
    /// subscribers and the HTTP server. Each step is bounded by the configured
    /// shutdown timeout.
    pub async fn shutdown(self) {
        let Self {
            broadcaster,
            listener,
            shutdown,
            mut server,
            shutdown_timeout,
            ..
        } = self;

        listener.stop(shutdown_timeout).await;
        broadcaster.disconnect_all();
        shutdown.cancel();

        if tokio::time::timeout(shutdown_timeout, &mut server).await.is_err() {
            tracing::warn!("http server did not drain in time, aborting");
            server.abort();
        }
        tracing::info!("stockpulse server stopped");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// The handshake is done: join the live set and pump events until the socket closes.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (subscriber_id, rx) = state.broadcaster.register(state.config.max_send_queue);

    client::handle_ws_connection(
        socket,
        subscriber_id,
        rx,
        state.broadcaster,
        state.config.heartbeat_interval(),
    )
    .await;
}
