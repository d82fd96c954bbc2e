//! `DuelServer`: axum HTTP + WebSocket surface over the core.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use duel_core::{EngineFactory, ParticipantId};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::broker::{BrokerStats, MatchBroker};
use crate::config::{BrokerConfig, ServerConfig};
use crate::health::{self, HealthResponse};
use crate::play::{self, PlayerDirectory};
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::axum_ws;
use crate::websocket::registry::ConnectionRegistry;

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Live connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Matchmaking broker.
    pub broker: Arc<MatchBroker>,
    /// Connected players by participant ID.
    pub players: Arc<PlayerDirectory>,
    /// Shutdown coordinator; its token is the root of every connection.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Prometheus handle for `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The duel server.
pub struct DuelServer {
    config: Arc<ServerConfig>,
    registry: Arc<ConnectionRegistry>,
    broker: Arc<MatchBroker>,
    players: Arc<PlayerDirectory>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl DuelServer {
    /// Create a server. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: ServerConfig,
        broker_config: BrokerConfig,
        factory: Arc<dyn EngineFactory>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let broker = MatchBroker::new(broker_config, factory, &shutdown.token());
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            broker,
            players: Arc::new(PlayerDirectory::new()),
            shutdown,
            start_time: Instant::now(),
            metrics,
        }
    }

    /// Handler state.
    pub fn state(&self) -> AppState {
        AppState {
            registry: self.registry.clone(),
            broker: self.broker.clone(),
            players: self.players.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_handler))
            .with_state(self.state())
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Spawn the registry loop and start the broker.
    ///
    /// Returns the registry loop's handle; it exits on shutdown.
    pub fn start(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move { registry.run(token).await });
        let _ = self.broker.start();
        handle
    }

    /// Bind and serve until shutdown. Returns the bound address and the
    /// serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener =
            tokio::net::TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%addr, "duel server listening");
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "server error");
            }
        });
        Ok((addr, handle))
    }

    /// Cancel everything, stop the broker, and wait for `handles`.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        self.shutdown
            .graceful_shutdown(&self.broker, handles, timeout)
            .await;
    }

    /// The matchmaking broker.
    pub fn broker(&self) -> &Arc<MatchBroker> {
        &self.broker
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.registry.connection_count().await;
    let sessions = state.broker.stats().active_sessions;
    Json(health::health_check(state.start_time, connections, sessions))
}

/// GET /stats
async fn stats_handler(State(state): State<AppState>) -> Json<BrokerStats> {
    Json(state.broker.stats())
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    player: Option<String>,
}

/// GET /ws?player=<id>
///
/// Without `player` the connection joins under a generated ID, reported
/// back in `matched`.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<JoinParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let player = match params.player {
        Some(p) if p.trim().is_empty() => {
            return (StatusCode::BAD_REQUEST, "blank player").into_response();
        }
        Some(p) => ParticipantId::from(p),
        None => ParticipantId::new(),
    };
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let (sink, source) = axum_ws::split(socket);
            play::serve_player(state, player, sink, source).await;
        })
}
