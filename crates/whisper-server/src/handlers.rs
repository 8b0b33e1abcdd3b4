//! Connection handlers for Whisper server.
//!
//! This module handles the connection lifecycle and event processing.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use whisper_core::{Delivery, Identity, Session, SessionError, SessionManager};
use whisper_protocol::codec::{self, Encoded, ProtocolError, WireFormat};
use whisper_protocol::events::{MALFORMED_EVENT, SESSION_SUPERSEDED};
use whisper_protocol::{ClientEvent, ServerEvent};

/// Liveness response body.
pub const LIVENESS_BODY: &str = "Server is running!";

/// Close code sent to a connection replaced by a newer session.
pub const CLOSE_SUPERSEDED: u16 = 4000;

/// Shared server state.
pub struct AppState {
    /// Session lifecycle and registry.
    pub sessions: SessionManager,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let verifier = Arc::new(config.auth.verifier());
        Self {
            sessions: SessionManager::new(verifier, config.session.to_session_config()),
            config,
        }
    }
}

/// Query parameters accepted on the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    /// Wire format for this connection.
    #[serde(default)]
    pub format: WireFormat,
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();

    Router::new()
        .route("/", get(liveness_handler))
        .route("/health", get(health_handler))
        .route(&ws_path, get(ws_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let ws_path = config.transport.websocket_path.clone();
    let app = router(Arc::new(AppState::new(config)));

    let listener = TcpListener::bind(addr).await?;

    info!("Whisper server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Liveness handler.
async fn liveness_handler() -> &'static str {
    LIVENESS_BODY
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sessions.registry().stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": stats.active_sessions,
        "connections": stats.live_connections,
    }))
}

/// WebSocket upgrade handler.
///
/// The credential is verified here, before the upgrade, so a rejected client
/// never gets a session.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let credential = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let mut session = state.sessions.begin();
    if let Err(e) = session.authenticate(credential) {
        metrics::record_auth_failure(rejection_reason(&e));
        return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
    }

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, session, params.format, state))
}

fn rejection_reason(error: &SessionError) -> &'static str {
    match error {
        SessionError::Auth(auth) => auth.reason(),
        _ => "invalid_state",
    }
}

/// Handle an authenticated WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    mut session: Session,
    format: WireFormat,
    state: Arc<AppState>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let mut deliveries = match session.activate() {
        Ok(rx) => rx,
        Err(e) => {
            error!(session = %session.id(), error = %e, "Failed to activate session");
            return;
        }
    };
    metrics::set_active_sessions(state.sessions.registry().len());

    debug!(session = %session.id(), ?format, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            // Deliveries queued for this session (relay, presence, replies)
            Some(delivery) = deliveries.recv() => {
                match delivery {
                    Delivery::Event(event) => {
                        if let Err(e) = send_event(&mut sender, format, &event).await {
                            debug!(session = %session.id(), error = %e, "Failed to write event");
                            break;
                        }
                    }
                    Delivery::Evict => {
                        info!(session = %session.id(), "Closing superseded connection");
                        metrics::record_eviction();
                        let _ = send_event(&mut sender, format, &ServerEvent::error(SESSION_SUPERSEDED)).await;
                        let _ = sender
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_SUPERSEDED,
                                reason: Cow::from("superseded"),
                            })))
                            .await;
                        break;
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        metrics::record_message(text.len(), "inbound");

                        match codec::decode_json::<ClientEvent>(&text) {
                            Ok(event) => handle_event(event, &session),
                            Err(e) => reject_malformed(&session, &e),
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => handle_event(event, &session),
                                Ok(None) => break,
                                Err(e @ ProtocolError::FrameTooLarge(_)) => {
                                    reject_malformed(&session, &e);
                                    read_buffer.clear();
                                    break;
                                }
                                Err(e) => reject_malformed(&session, &e),
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(session = %session.id(), "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(session = %session.id(), error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(session = %session.id(), "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    if session.close() {
        metrics::record_departure();
    }
    metrics::set_active_sessions(state.sessions.registry().len());

    debug!(session = %session.id(), "WebSocket disconnected");
}

/// Handle a decoded client event.
fn handle_event(event: ClientEvent, session: &Session) {
    match event {
        ClientEvent::PrivateMessage {
            recipient_id,
            message,
        } => {
            let recipient = Identity::from(recipient_id);
            match session.send_private(&recipient, message) {
                Ok(outcome) => metrics::record_relay(outcome.as_str()),
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "Private message refused");
                    metrics::record_error("session");
                }
            }
        }

        ClientEvent::Ping(heartbeat) => {
            let timestamp = heartbeat.and_then(|h| h.timestamp);
            if let Err(e) = session.reply(ServerEvent::pong(timestamp)) {
                warn!(session = %session.id(), error = %e, "Ping refused");
            }
        }
    }
}

/// Answer an undecodable event without dropping the connection.
fn reject_malformed(session: &Session, error: &ProtocolError) {
    debug!(session = %session.id(), error = %error, "Malformed event");
    metrics::record_error("protocol");
    let _ = session.reply(ServerEvent::error(MALFORMED_EVENT));
}

/// Send an event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    format: WireFormat,
    event: &ServerEvent,
) -> Result<()> {
    let encoded = format.encode(event)?;
    metrics::record_message(encoded.len(), "outbound");

    let message = match encoded {
        Encoded::Text(text) => Message::Text(text),
        Encoded::Binary(data) => Message::Binary(data.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}
