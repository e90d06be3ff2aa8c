use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::{AgentHandle, AgentStreamRequest};
use crate::auth::TokenValidator;
use crate::normalizer::TextNormalizer;
use crate::processor::{MessageProcessor, StreamSettings, REASON_CLIENT_REQUESTED};
use crate::protocol::{
    decode_client_message, encode_server_event, ClientMessage, ServerEvent, CODE_BAD_REQUEST,
    CODE_INTERNAL, CODE_NOT_FOUND,
};

// ---------------------------------------------------------------------------
// AssetCatalog trait — abstracts background/avatar configuration assets so
// the gateway crate doesn't depend on the application's filesystem layout.
// ---------------------------------------------------------------------------

/// Result of activating an avatar configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvatarSwitch {
    pub file: String,
    pub model: String,
    pub conf_name: String,
}

/// Read-only catalog of client-selectable assets.
#[async_trait]
pub trait AssetCatalog: Send + Sync {
    /// List available background image files.
    async fn background_files(&self) -> anyhow::Result<Vec<String>>;

    /// List available avatar configuration files.
    async fn avatar_config_files(&self) -> anyhow::Result<Vec<String>>;

    /// Activate an avatar configuration and report the resulting model/conf.
    async fn switch_avatar_config(&self, file: &str) -> anyhow::Result<AvatarSwitch>;
}

// ---------------------------------------------------------------------------
// ConnectionSettings
// ---------------------------------------------------------------------------

/// Per-connection timing and tolerance knobs.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Deadline for the first (authorize) message after accept.
    pub auth_deadline: Duration,
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// Extra grace beyond the ping interval before a silent peer is dropped.
    pub pong_timeout: Duration,
    /// Overall inbound inactivity timeout.
    pub inactivity_timeout: Duration,
    /// Consecutive decode/validation errors tolerated before closing.
    pub max_error_tolerance: u32,
    /// Backoff applied after each tolerated error.
    pub error_backoff: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            auth_deadline: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            inactivity_timeout: Duration::from_secs(300),
            max_error_tolerance: 5,
            error_backoff: Duration::from_millis(500),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state passed to axum handlers
// ---------------------------------------------------------------------------

/// Live-connection record kept in the process-wide registry.
struct ConnectionEntry {
    user_id: String,
    connected_at: Instant,
}

#[derive(Clone)]
struct GatewayState {
    validator: Arc<TokenValidator>,
    agent: Arc<dyn AgentHandle>,
    assets: Arc<dyn AssetCatalog>,
    normalizer: Arc<TextNormalizer>,
    settings: ConnectionSettings,
    stream_settings: StreamSettings,
    connections: Arc<RwLock<HashMap<Uuid, ConnectionEntry>>>,
}

// ---------------------------------------------------------------------------
// ConnectionManager
// ---------------------------------------------------------------------------

/// Accepts bidirectional connections, performs the authorization handshake,
/// runs the heartbeat, and routes inbound messages to each connection's
/// [`MessageProcessor`].
pub struct ConnectionManager {
    state: GatewayState,
}

impl ConnectionManager {
    pub fn new(
        validator: Arc<TokenValidator>,
        agent: Arc<dyn AgentHandle>,
        assets: Arc<dyn AssetCatalog>,
        normalizer: Arc<TextNormalizer>,
        settings: ConnectionSettings,
        stream_settings: StreamSettings,
    ) -> Self {
        Self {
            state: GatewayState {
                validator,
                agent,
                assets,
                normalizer,
                settings,
                stream_settings,
                connections: Arc::new(RwLock::new(HashMap::new())),
            },
        }
    }

    /// Router exposing the streaming endpoint; merge with any REST surface.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1/chat/stream", get(ws_upgrade_handler))
            .with_state(self.state.clone())
    }

    /// Bind and serve the streaming endpoint until shutdown.
    pub async fn start(self, host: &str, port: u16) -> anyhow::Result<()> {
        let addr = format!("{}:{}", host, port);
        info!("Gateway listening on {}", addr);
        let listener = TcpListener::bind(&addr).await?;
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Number of live, authorized connections.
    pub async fn connection_count(&self) -> usize {
        self.state.connections.read().await.len()
    }
}

/// WebSocket upgrade handler for `/v1/chat/stream`.
async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

// ---------------------------------------------------------------------------
// Per-connection lifecycle
// ---------------------------------------------------------------------------

async fn handle_ws(mut ws: WebSocket, state: GatewayState) {
    let connection_id = Uuid::new_v4();

    let Some(user_id) = authorize(&mut ws, &state, connection_id).await else {
        return;
    };

    state.connections.write().await.insert(
        connection_id,
        ConnectionEntry {
            user_id: user_id.clone(),
            connected_at: Instant::now(),
        },
    );
    info!(
        connection_id = %connection_id,
        user_id = %user_id,
        "WebSocket connection authorized"
    );

    let processor = Arc::new(MessageProcessor::new(
        connection_id,
        user_id,
        state.stream_settings.clone(),
        state.normalizer.clone(),
    ));

    // Turn forwarders feed this channel; the loop below is the only writer
    // on the socket, so outbound frames never interleave mid-message.
    let (turn_tx, mut turn_rx) = mpsc::channel::<ServerEvent>(256);

    let mut ping = tokio::time::interval(state.settings.ping_interval);
    let mut last_pong = Instant::now();
    let mut last_inbound = Instant::now();
    let mut consecutive_errors: u32 = 0;

    'conn: loop {
        tokio::select! {
            inbound = ws.recv() => {
                let Some(Ok(message)) = inbound else { break 'conn };
                match message {
                    Message::Text(text) => {
                        last_inbound = Instant::now();
                        match decode_client_message(&text.to_string()) {
                            Ok(ClientMessage::Pong) => {
                                last_pong = Instant::now();
                                consecutive_errors = 0;
                            }
                            Ok(ClientMessage::Authorize { .. }) => {
                                consecutive_errors = 0;
                                let event = ServerEvent::Error {
                                    code: CODE_BAD_REQUEST,
                                    error: "connection already authorized".to_string(),
                                };
                                if send_event(&mut ws, &event).await.is_err() {
                                    break 'conn;
                                }
                            }
                            Ok(message) => {
                                consecutive_errors = 0;
                                let responses =
                                    dispatch_message(message, &state, &processor, &turn_tx).await;
                                for event in responses {
                                    if send_event(&mut ws, &event).await.is_err() {
                                        break 'conn;
                                    }
                                }
                            }
                            Err(error) => {
                                consecutive_errors += 1;
                                debug!(
                                    connection_id = %connection_id,
                                    error = %error,
                                    consecutive = consecutive_errors,
                                    "Rejecting invalid inbound message"
                                );
                                let event = ServerEvent::Error {
                                    code: CODE_BAD_REQUEST,
                                    error,
                                };
                                if send_event(&mut ws, &event).await.is_err() {
                                    break 'conn;
                                }
                                if consecutive_errors >= state.settings.max_error_tolerance {
                                    warn!(
                                        connection_id = %connection_id,
                                        "Error budget exhausted; closing connection"
                                    );
                                    break 'conn;
                                }
                                tokio::time::sleep(state.settings.error_backoff).await;
                            }
                        }
                    }
                    Message::Close(_) => break 'conn,
                    // axum answers protocol pings itself; other frame types
                    // are not part of this protocol.
                    _ => {}
                }
            }

            Some(event) = turn_rx.recv() => {
                if send_event(&mut ws, &event).await.is_err() {
                    break 'conn;
                }
            }

            _ = ping.tick() => {
                if last_pong.elapsed() > state.settings.ping_interval + state.settings.pong_timeout {
                    warn!(
                        connection_id = %connection_id,
                        "Heartbeat pong overdue; closing connection"
                    );
                    break 'conn;
                }
                if last_inbound.elapsed() > state.settings.inactivity_timeout {
                    warn!(
                        connection_id = %connection_id,
                        "Connection inactive; closing"
                    );
                    break 'conn;
                }
                if send_event(&mut ws, &ServerEvent::Ping).await.is_err() {
                    break 'conn;
                }
            }
        }
    }

    processor.shutdown().await;
    if let Some(entry) = state.connections.write().await.remove(&connection_id) {
        info!(
            connection_id = %connection_id,
            user_id = %entry.user_id,
            uptime_ms = entry.connected_at.elapsed().as_millis() as u64,
            "WebSocket connection closed"
        );
    }
}

/// Run the authorization handshake. Returns the derived user id, or `None`
/// after sending `authorize_error` and closing the socket.
async fn authorize(ws: &mut WebSocket, state: &GatewayState, connection_id: Uuid) -> Option<String> {
    let raw = match tokio::time::timeout(state.settings.auth_deadline, recv_text(ws)).await {
        Ok(Some(Ok(text))) => text,
        Ok(_) => return None,
        Err(_) => {
            reject(ws, "authorization deadline exceeded").await;
            return None;
        }
    };

    let token = match decode_client_message(&raw) {
        Ok(ClientMessage::Authorize { token }) => token,
        Ok(_) => {
            reject(ws, "first message must be authorize").await;
            return None;
        }
        Err(error) => {
            reject(ws, &error).await;
            return None;
        }
    };

    match state.validator.validate(&token) {
        Some(user_id) => {
            let event = ServerEvent::AuthorizeSuccess { connection_id };
            if send_event(ws, &event).await.is_err() {
                return None;
            }
            Some(user_id)
        }
        None => {
            warn!(connection_id = %connection_id, "Authorization failed");
            reject(ws, "invalid authentication token").await;
            None
        }
    }
}

async fn reject(ws: &mut WebSocket, error: &str) {
    let event = ServerEvent::AuthorizeError {
        error: error.to_string(),
    };
    let _ = send_event(ws, &event).await;
    let _ = ws.send(Message::Close(None)).await;
}

// ---------------------------------------------------------------------------
// Message routing
// ---------------------------------------------------------------------------

/// Route one authorized inbound message. Returns events to send directly;
/// turn events flow through `turn_tx` via a spawned forwarder instead.
async fn dispatch_message(
    message: ClientMessage,
    state: &GatewayState,
    processor: &Arc<MessageProcessor>,
    turn_tx: &mpsc::Sender<ServerEvent>,
) -> Vec<ServerEvent> {
    match message {
        ClientMessage::ChatMessage {
            content,
            user_id,
            agent_id,
            session_id,
            persona,
            images,
            metadata,
        } => {
            let session_id =
                session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
            let request = AgentStreamRequest {
                content: content.clone(),
                user_id,
                agent_id,
                session_id: session_id.clone(),
                persona,
                images,
                metadata,
            };

            let stream = match state.agent.stream(request).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Failed to obtain agent stream");
                    return vec![ServerEvent::Error {
                        code: CODE_INTERNAL,
                        error: format!("failed to start agent stream: {}", e),
                    }];
                }
            };

            let turn_id = processor
                .start_turn(Some(session_id), &content, stream)
                .await;
            match processor.stream_events(&turn_id).await {
                Ok(mut events) => {
                    let turn_tx = turn_tx.clone();
                    tokio::spawn(async move {
                        while let Some(event) = events.recv().await {
                            let terminal = event.is_terminal();
                            if turn_tx.send(event).await.is_err() {
                                break;
                            }
                            if terminal {
                                break;
                            }
                        }
                    });
                    Vec::new()
                }
                Err(e) => vec![ServerEvent::Error {
                    code: CODE_INTERNAL,
                    error: e.to_string(),
                }],
            }
        }

        ClientMessage::InterruptStream { turn_id } => match turn_id {
            Some(turn_id) => {
                if processor.interrupt(&turn_id, REASON_CLIENT_REQUESTED).await {
                    Vec::new()
                } else {
                    vec![ServerEvent::Error {
                        code: CODE_NOT_FOUND,
                        error: format!("turn {} not found or already finished", turn_id),
                    }]
                }
            }
            None => {
                if processor.interrupt_all(REASON_CLIENT_REQUESTED).await > 0 {
                    Vec::new()
                } else {
                    vec![ServerEvent::Error {
                        code: CODE_NOT_FOUND,
                        error: "no active turns to interrupt".to_string(),
                    }]
                }
            }
        },

        ClientMessage::FetchBackgrounds => match state.assets.background_files().await {
            Ok(files) => vec![ServerEvent::BackgroundFiles { files }],
            Err(e) => vec![ServerEvent::Error {
                code: CODE_INTERNAL,
                error: format!("failed to list backgrounds: {}", e),
            }],
        },

        ClientMessage::FetchAvatarConfigs => match state.assets.avatar_config_files().await {
            Ok(configs) => vec![ServerEvent::AvatarConfigFiles { configs }],
            Err(e) => vec![ServerEvent::Error {
                code: CODE_INTERNAL,
                error: format!("failed to list avatar configs: {}", e),
            }],
        },

        ClientMessage::SwitchAvatarConfig { file } => {
            match state.assets.switch_avatar_config(&file).await {
                Ok(switch) => vec![
                    ServerEvent::AvatarConfigSwitched {
                        file: switch.file.clone(),
                    },
                    ServerEvent::SetModelAndConf {
                        model: switch.model,
                        conf_name: switch.conf_name,
                    },
                ],
                Err(e) => vec![ServerEvent::Error {
                    code: CODE_BAD_REQUEST,
                    error: format!("failed to switch avatar config: {}", e),
                }],
            }
        }

        // Handled inline by the connection loop.
        ClientMessage::Authorize { .. } | ClientMessage::Pong => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// WebSocket helpers
// ---------------------------------------------------------------------------

/// Receive the next text message from the WebSocket.
///
/// Returns `Some(Ok(text))` for a text frame, `Some(Err(()))` for close or
/// error, and `None` when the stream ends.
async fn recv_text(ws: &mut WebSocket) -> Option<Result<String, ()>> {
    loop {
        match ws.recv().await {
            Some(Ok(Message::Text(text))) => return Some(Ok(text.to_string())),
            Some(Ok(Message::Close(_))) => return Some(Err(())),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!("WebSocket receive error: {}", e);
                return Some(Err(()));
            }
            None => return None,
        }
    }
}

/// Send a [`ServerEvent`] as a JSON text frame.
async fn send_event(ws: &mut WebSocket, event: &ServerEvent) -> Result<(), ()> {
    let json = encode_server_event(event);
    ws.send(Message::Text(json.into())).await.map_err(|e| {
        warn!("WebSocket send error: {}", e);
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
