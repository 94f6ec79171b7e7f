//! Connection handlers for the Rendezvous server.
//!
//! This module handles the connection lifecycle and hands inbound frames to
//! the relay router.

use crate::auth::{IdentityVerifier, TokenIdentityVerifier};
use crate::config::{Config, DispatchMode};
use crate::metrics::{self, ConnectionMetricsGuard, MeteredTransport};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use rendezvous_core::{
    ConnectionStore, Dispatcher, Fanout, FanoutWorker, InlineDispatcher, MatchCoordinator,
    MemoryConnectionStore, MemoryMatchResultStore, PresenceManager, QueueDispatcher,
    Router as RelayRouter,
};
use rendezvous_transport::{ConnectionHandle, LocalHub, Outbound};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub store: Arc<MemoryConnectionStore>,
    /// Live sessions on this process.
    pub hub: Arc<LocalHub>,
    pub presence: PresenceManager,
    pub router: RelayRouter,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub config: Config,
}

impl AppState {
    /// Wire up the relay components.
    ///
    /// Returns the fan-out worker to spawn when dispatch is queued.
    #[must_use]
    pub fn new(config: Config) -> (Self, Option<FanoutWorker>) {
        let store = Arc::new(MemoryConnectionStore::new());
        let hub = Arc::new(LocalHub::new());
        let transport = Arc::new(MeteredTransport::new(hub.clone()));
        let fanout = Arc::new(Fanout::new(store.clone(), transport.clone()));

        let mut worker = None;
        let dispatcher: Arc<dyn Dispatcher> = match config.dispatch.mode {
            DispatchMode::Inline => Arc::new(InlineDispatcher::new(fanout.clone())),
            DispatchMode::Queued => {
                let (dispatcher, queue_worker) = QueueDispatcher::new(fanout.clone());
                worker = Some(queue_worker);
                Arc::new(dispatcher)
            }
        };

        let relay = config.relay_config();
        let presence = PresenceManager::new(
            store.clone(),
            transport,
            dispatcher.clone(),
            relay.clone(),
        );
        let router = RelayRouter::new(
            fanout,
            dispatcher,
            MatchCoordinator::new(Arc::new(MemoryMatchResultStore::new())),
            relay,
        );

        let state = Self {
            store,
            hub,
            presence,
            router,
            verifier: Arc::new(TokenIdentityVerifier),
            config,
        };
        (state, worker)
    }
}

/// Query parameters of the WebSocket upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub channel: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelSummary {
    channel_name: String,
    user_count: usize,
}

/// Build the HTTP routes.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/channels", get(channels_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let (state, worker) = AppState::new(config.clone());
    let state = Arc::new(state);

    if let Some(worker) = worker {
        worker.spawn();
    }

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let listener = TcpListener::bind(addr).await?;

    info!("Rendezvous server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.count().await {
        Ok(connections) => Json(serde_json::json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "connections": connections,
        }))
        .into_response(),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// Channel listing handler.
async fn channels_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ChannelSummary>> {
    Json(
        state
            .store
            .channel_counts()
            .into_iter()
            .map(|(channel_name, user_count)| ChannelSummary {
                channel_name,
                user_count,
            })
            .collect(),
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(token) = params.token else {
        metrics::record_error("auth");
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    let identity = match state.verifier.verify(&token).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(error = %e, "Rejected connection");
            metrics::record_error("auth");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    let channel = params.channel.filter(|c| !c.is_empty());
    ws.max_frame_size(state.config.transport.max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, identity, channel))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: String,
    channel: Option<String>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let handle = ConnectionHandle::generate();
    let mut outbound = state.hub.register(handle.as_str());

    if let Err(e) = state
        .presence
        .connect(&identity, handle.as_str(), channel.as_deref())
        .await
    {
        error!(identity = %identity, connection = %handle, error = %e, "Connect failed");
        metrics::record_error("presence");
        state.hub.unregister(handle.as_str());
        return;
    }

    debug!(identity = %identity, connection = %handle, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            biased;

            // Payloads pushed to this session by the fan-out
            out = outbound.recv() => {
                match out {
                    Some(Outbound::Payload(bytes)) => {
                        metrics::record_frame(bytes.len(), "outbound");
                        let message = match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => Message::Text(text),
                            Err(e) => Message::Binary(e.into_bytes()),
                        };
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) => {
                        debug!(connection = %handle, "Session closed by server");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&state, &handle, &text).await;
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => handle_text(&state, &handle, &text).await,
                        Err(_) => {
                            warn!(connection = %handle, "Dropped non-UTF-8 binary frame");
                            metrics::record_error("malformed");
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %handle, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %handle, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %handle, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = state.presence.disconnect(handle.as_str()).await {
        error!(connection = %handle, error = %e, "Disconnect failed");
        metrics::record_error("presence");
    }
    state.hub.unregister(handle.as_str());

    debug!(identity = %identity, connection = %handle, "WebSocket disconnected");
}

/// Route one inbound text frame. Failures are logged and the session
/// stays open.
async fn handle_text(state: &AppState, handle: &ConnectionHandle, text: &str) {
    metrics::record_frame(text.len(), "inbound");
    let start = Instant::now();

    match state.router.handle_frame(handle.as_str(), text).await {
        Ok(outcome) => metrics::record_outcome(&outcome),
        Err(e) => {
            error!(connection = %handle, error = %e, "Frame handling error");
            metrics::record_error("routing");
        }
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(mode: DispatchMode) -> (Arc<AppState>, Option<FanoutWorker>) {
        let mut config = Config::default();
        config.dispatch.mode = mode;
        let (state, worker) = AppState::new(config);
        (Arc::new(state), worker)
    }

    #[tokio::test]
    async fn test_worker_only_when_queued() {
        assert!(state(DispatchMode::Inline).1.is_none());
        assert!(state(DispatchMode::Queued).1.is_some());
    }

    #[tokio::test]
    async fn test_channels_lists_counts() {
        let (state, _) = state(DispatchMode::Inline);
        state.store.put("alice", "c1", Some("red")).await.unwrap();
        state.store.put("bob", "c2", Some("red")).await.unwrap();
        state.store.put("carol", "c3", None).await.unwrap();

        let Json(channels) = channels_handler(State(state)).await;
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].channel_name, "red");
        assert_eq!(channels[0].user_count, 2);
    }

    #[tokio::test]
    async fn test_health_reports_ok() {
        let (state, _) = state(DispatchMode::Inline);
        let response = health_handler(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_session_lifecycle_through_hub() {
        let (state, _) = state(DispatchMode::Inline);
        let mut alice_rx = state.hub.register("c1");
        state.presence.connect("alice", "c1", None).await.unwrap();
        let _bob_rx = state.hub.register("c2");
        state.presence.connect("bob", "c2", None).await.unwrap();
        let _ = alice_rx.try_recv();

        handle_text(&state, &ConnectionHandle::new("c2"), r#"{"eventType":"chat"}"#).await;

        let Some(Outbound::Payload(bytes)) = alice_rx.recv().await else {
            panic!("expected payload");
        };
        let seen: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(seen["source"], "bob");
    }
}
