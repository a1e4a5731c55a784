//! Connection handlers for the Courier server.
//!
//! This module owns the HTTP router and the per-connection WebSocket loop.

use crate::api;
use crate::auth::{self, IdentityVerifier};
use crate::config::{AuthMode, Config};
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use courier_core::{ConnectionHandle, DeliveryRouter, PresenceRegistry, Session};
use courier_fanout::{connect_bridge, FanoutMode, FanoutSettings};
use courier_protocol::{
    codec, codes, AckStatus, ClientFrame, ConnectionId, Encoding, ServerFrame, UserId,
    PROTOCOL_VERSION,
};
use courier_store::MessageStore;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The delivery router.
    pub router: Arc<DeliveryRouter>,
    /// Bearer credential verifier.
    pub verifier: Arc<dyn IdentityVerifier>,
    /// How the fanout bridge came up.
    pub fanout_mode: FanoutMode,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        router: Arc<DeliveryRouter>,
        verifier: Arc<dyn IdentityVerifier>,
        fanout_mode: FanoutMode,
    ) -> Self {
        Self {
            router,
            verifier,
            fanout_mode,
            config,
        }
    }

    /// Whether a WebSocket upgrade must carry a valid credential.
    fn credential_required(&self) -> bool {
        self.config.auth.mode == AuthMode::Jwt
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, store: Arc<dyn MessageStore>) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let verifier = auth::build_verifier(&config.auth)?;

    let (bridge, fanout_mode) = connect_bridge(&FanoutSettings {
        redis_url: config.fanout.redis_url.clone(),
        channel_prefix: config.fanout.channel_prefix.clone(),
        capacity: config.fanout.capacity,
    })
    .await;
    metrics::set_fanout_degraded(fanout_mode.is_degraded());

    // Alone in the deployment, nobody can still be connected after a restart.
    if fanout_mode == FanoutMode::SingleInstance {
        let cleared = store
            .reset_presence()
            .await
            .context("Failed to reset presence")?;
        info!(cleared, "Reset stale online state");
    }

    let router = Arc::new(DeliveryRouter::new(
        Arc::new(PresenceRegistry::new()),
        store,
        bridge,
    ));
    router.spawn_bridge_listener();

    let state = Arc::new(AppState::new(config.clone(), router, verifier, fanout_mode));
    let app = build_app(state);

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    let addr = listener.local_addr()?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the HTTP router.
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/chat/messages", get(api::conversation))
        .route("/users", get(api::users))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bridge = state.router.bridge();
    let stats = state.router.registry().stats();

    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "node": state.router.node_id().to_string(),
        "fanout": {
            "bridge": bridge.name(),
            "healthy": bridge.is_healthy(),
            "degraded": state.fanout_mode.is_degraded(),
        },
        "connections": stats.connection_count,
        "online": stats.online_count,
    }))
}

/// Query parameters accepted on upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct UpgradeParams {
    pub token: Option<String>,
    /// Protocol major version the client speaks.
    pub version: Option<u8>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<UpgradeParams>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Some(major) = params.version {
        if !PROTOCOL_VERSION.accepts_major(major) {
            metrics::record_error("version");
            return (
                StatusCode::BAD_REQUEST,
                format!("Unsupported protocol version {major}, server speaks {PROTOCOL_VERSION}"),
            )
                .into_response();
        }
    }

    if state.router.registry().connection_count() >= state.config.limits.max_connections {
        metrics::record_error("capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    }

    let identity = match auth::authenticate(
        state.verifier.as_ref(),
        &headers,
        params.token.as_deref(),
    ) {
        Ok(user) => Some(user),
        Err(e) if state.credential_required() => {
            debug!(error = %e, "Refusing unauthenticated upgrade");
            metrics::record_error("unauthorized");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
        Err(_) => None,
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, identity))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, identity: Option<UserId>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::generate();
    let (handle, mut outbound) = ConnectionHandle::channel(connection_id.clone());
    let mut session = Session::new(Arc::clone(&state.router), handle, identity);

    debug!(connection = %connection_id, identity = ?identity, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Replies follow the encoding of the latest inbound frame.
    let mut encoding = Encoding::Json;

    let heartbeat = &state.config.heartbeat;
    let connected = ServerFrame::connected(
        connection_id.clone(),
        PROTOCOL_VERSION.major,
        u32::try_from(heartbeat.interval_ms).unwrap_or(u32::MAX),
    );
    if send_frame(&mut sender, &connected, encoding).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        session.close().await;
        return;
    }

    let interval = Duration::from_millis(heartbeat.interval_ms);
    let timeout = Duration::from_millis(heartbeat.timeout_ms);
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut last_heard = Instant::now();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            // Frames queued by the router, the session or other connections
            Some(frame) = outbound.recv() => {
                if send_frame(&mut sender, &frame, encoding).await.is_err() {
                    break;
                }
            }

            _ = ticker.tick() => {
                if last_heard.elapsed() >= timeout {
                    info!(connection = %connection_id, "Heartbeat timed out");
                    break;
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                last_heard = Instant::now();

                match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Json;
                        metrics::record_frame(text.len(), "inbound");

                        match codec::decode_text::<ClientFrame>(&text) {
                            Ok(frame) => process_frame(&state, &mut session, frame).await,
                            Err(e) => reject_frame(&session, &e.to_string()),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::MessagePack;
                        metrics::record_frame(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from::<ClientFrame>(&mut read_buffer) {
                                Ok(Some(frame)) => process_frame(&state, &mut session, frame).await,
                                Ok(None) => break,
                                Err(e) => {
                                    reject_frame(&session, &e.to_string());
                                    read_buffer.clear();
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    if session.close().await {
        metrics::record_presence_broadcast();
    }
    metrics::set_users_online(state.router.registry().online_count());

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Run one decoded frame through the session and queue its reply.
async fn process_frame(state: &AppState, session: &mut Session, frame: ClientFrame) {
    let start = Instant::now();
    let event = frame.event_name();
    let persists = matches!(frame, ClientFrame::SendMessage { .. });
    let was_registered = session.user().is_some();

    let reply = session.handle_frame(frame).await;

    if let Some(outcome) = reply.delivery {
        metrics::record_delivery(outcome, persists);
    }

    if let Some(frame) = reply.frame {
        if let ServerFrame::Ack(ack) = &frame {
            if ack.is_error() {
                debug!(connection = %session.connection_id(), event, code = ?ack.code, "Request failed");
                metrics::record_error(ack.code.map_or("other", error_label));
            } else if ack.status == AckStatus::Registered && !was_registered {
                metrics::record_presence_broadcast();
                metrics::set_users_online(state.router.registry().online_count());
            }
        }
        session.handle().send(Arc::new(frame));
    }

    metrics::record_latency(start.elapsed().as_secs_f64());
}

/// Answer a frame that could not be decoded. The connection stays open.
fn reject_frame(session: &Session, reason: &str) {
    debug!(connection = %session.connection_id(), reason, "Malformed frame");
    metrics::record_error("malformed");
    session.handle().send(Arc::new(ServerFrame::error(
        None,
        codes::MALFORMED_FRAME,
        format!("Malformed frame: {reason}"),
    )));
}

fn error_label(code: u16) -> &'static str {
    match code {
        codes::MALFORMED_FRAME => "malformed",
        codes::VALIDATION => "validation",
        codes::NOT_FOUND => "not_found",
        codes::UNAUTHORIZED => "unauthorized",
        codes::INVALID_STATE => "invalid_state",
        codes::STORE_UNAVAILABLE => "store_unavailable",
        _ => "other",
    }
}

/// Send a frame to the WebSocket in the connection's current encoding.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
    encoding: Encoding,
) -> Result<()> {
    let message = match encoding {
        Encoding::Json => Message::Text(codec::encode_text(frame)?),
        Encoding::MessagePack => Message::Binary(codec::encode(frame)?.to_vec()),
    };

    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_frame(len, "outbound");

    sender.send(message).await?;
    Ok(())
}
