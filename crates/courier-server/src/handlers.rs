//! Connection handlers for the Courier server.
//!
//! This module handles the WebSocket connection lifecycle and inbound event
//! processing. Every inbound frame becomes a typed [`ClientEvent`] dispatched
//! to the owning core component; replies travel back through the
//! connection's outbound event channel, never through nested callbacks.

use crate::api;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use courier_core::{
    ChatError, ConnectionRegistry, ConversationAggregator, DeliveryPipeline, MemoryStore,
    MessageStore, PresenceTracker, ReadStateSync, RoomManager, RoomManagerConfig,
};
use courier_protocol::events::code;
use courier_protocol::{codec, ClientEvent, ServerEvent, PROTOCOL_VERSION};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Live connections and their user bindings.
    pub registry: Arc<ConnectionRegistry>,
    /// Pairwise rooms.
    pub rooms: Arc<RoomManager>,
    /// Presence and typing fan-out.
    pub presence: PresenceTracker,
    /// Message validation, persistence, and delivery.
    pub pipeline: DeliveryPipeline,
    /// Read flags and unread counts.
    pub read_state: ReadStateSync,
    /// Inbox projection.
    pub conversations: ConversationAggregator,
    /// Message persistence, shared with the pipeline.
    pub store: Arc<dyn MessageStore>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state backed by the in-memory store.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create app state over a specific message store.
    #[must_use]
    pub fn with_store(config: Config, store: Arc<dyn MessageStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::with_config(
            registry.clone(),
            RoomManagerConfig {
                max_rooms_per_connection: config.limits.max_rooms_per_connection,
            },
        ));
        let presence = PresenceTracker::new(registry.clone(), rooms.clone());
        let pipeline = DeliveryPipeline::new(registry.clone(), rooms.clone(), store.clone());
        let read_state = ReadStateSync::new(store.clone());
        let conversations = ConversationAggregator::new(store.clone());

        Self {
            registry,
            rooms,
            presence,
            pipeline,
            read_state,
            conversations,
            store,
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr();
    let listener = TcpListener::bind(addr).await?;

    info!("Courier server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    // Generate connection ID
    let connection_id = format!(
        "conn_{:x}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    );

    debug!(connection = %connection_id, "WebSocket connected");

    // Split the WebSocket
    let (mut sender, mut receiver) = socket.split();

    // Typed outbound event channel for this connection. Everything the
    // server says to this client goes through here, including fan-out from
    // other connections' activity.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();

    // Handshake
    let _ = outbound_tx.send(ServerEvent::connected(
        &connection_id,
        state.config.heartbeat.interval_ms as u32,
    ));

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Event processing loop
    loop {
        tokio::select! {
            biased;

            // Deliver outbound events to the client
            Some(event) = outbound_rx.recv() => {
                match codec::encode(&event) {
                    Ok(data) => {
                        if sender.send(Message::Binary(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(connection = %connection_id, error = %e, "Failed to encode event");
                        metrics::record_error("encode");
                    }
                }
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        // Drain complete frames; a malformed frame is
                        // reported and the decoder resumes on the next one.
                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => {
                                    handle_event(event, &connection_id, &state, &outbound_tx).await;
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(connection = %connection_id, error = %e, "Malformed frame");
                                    metrics::record_error("decode");
                                    // An oversized frame never leaves the
                                    // buffer on its own; drop everything and
                                    // resync on the next message.
                                    if matches!(e, codec::ProtocolError::FrameTooLarge(_)) {
                                        read_buffer.clear();
                                    }
                                    let _ = outbound_tx.send(ServerEvent::error(
                                        code::MALFORMED,
                                        e.to_string(),
                                    ));
                                    break;
                                }
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
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

    cleanup_connection(&connection_id, &state);
    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Tear down everything a connection held.
///
/// Runs exactly once per connection task; the registry absorbs any
/// duplicate disconnect events. Order matters: the connection leaves its
/// rooms before the offline broadcast, so it never hears about itself.
fn cleanup_connection(connection_id: &str, state: &Arc<AppState>) {
    state.rooms.remove_connection(connection_id);

    if let Some(unregistered) = state.registry.unregister(connection_id) {
        if unregistered.went_offline {
            state.presence.clear_user_typing(&unregistered.user_id);
            state.presence.user_offline(&unregistered.user_id);
        }
    }

    metrics::set_active_rooms(state.rooms.room_count());
}

/// Handle a decoded client event.
async fn handle_event(
    event: ClientEvent,
    connection_id: &str,
    state: &Arc<AppState>,
    outbound: &mpsc::UnboundedSender<ServerEvent>,
) {
    match event {
        ClientEvent::RegisterUser { user_id, version } => {
            debug!(connection = %connection_id, user = %user_id, "Register request");

            if let Some(client_version) = version {
                if !client_version.is_compatible_with(&PROTOCOL_VERSION) {
                    warn!(
                        connection = %connection_id,
                        client = %client_version,
                        "Incompatible protocol version"
                    );
                    metrics::record_error("version");
                    let _ = outbound.send(ServerEvent::error(
                        code::VALIDATION,
                        format!(
                            "protocol version {client_version} is not compatible with {PROTOCOL_VERSION}"
                        ),
                    ));
                    return;
                }
            }

            let registration = state
                .registry
                .register(connection_id, &user_id, outbound.clone());

            if let Some(displaced) = registration.displaced {
                if displaced.went_offline {
                    state.presence.clear_user_typing(&displaced.user_id);
                    state.presence.user_offline(&displaced.user_id);
                }
            }
            if registration.came_online {
                state.presence.user_online(&user_id);
            }
        }

        ClientEvent::JoinRoom {
            current_user_id,
            other_user_id,
        } => {
            debug!(
                connection = %connection_id,
                user = %current_user_id,
                other = %other_user_id,
                "Join room request"
            );

            if !require_registered(connection_id, state, outbound) {
                return;
            }

            match state
                .rooms
                .join(&current_user_id, &other_user_id, connection_id)
            {
                Ok(other_user_online) => {
                    let _ = outbound.send(ServerEvent::room_joined(other_user_online));
                    metrics::set_active_rooms(state.rooms.room_count());
                }
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Join failed");
                    metrics::record_error("join");
                    let _ = outbound.send(ServerEvent::error(e.code(), e.to_string()));
                }
            }
        }

        ClientEvent::SendMessage {
            from,
            to,
            content,
            attachment,
        } => {
            if !require_registered(connection_id, state, outbound) {
                return;
            }

            // The pipeline stores trimmed content, so the limit applies to
            // the trimmed length too.
            let content_length = content.as_deref().map(|c| c.trim().len()).unwrap_or(0);
            if content_length > state.config.limits.max_content_length {
                let _ = outbound.send(ServerEvent::error(
                    code::VALIDATION,
                    "message content too long",
                ));
                return;
            }

            match state.pipeline.send(&from, &to, content, attachment).await {
                Ok(message) => {
                    debug!(connection = %connection_id, id = message.id, "Message sent");
                    metrics::record_message();
                }
                Err(e) => {
                    warn!(connection = %connection_id, error = %e, "Send failed");
                    metrics::record_error("send");
                    let _ = outbound.send(ServerEvent::error(e.code(), e.to_string()));
                }
            }
        }

        ClientEvent::Typing { from, to } => {
            if !require_registered(connection_id, state, outbound) {
                return;
            }
            if let Err(e) = state.presence.set_typing(&from, &to) {
                let _ = outbound.send(ServerEvent::error(e.code(), e.to_string()));
                return;
            }
            metrics::record_typing_event();
        }

        ClientEvent::StopTyping { from, to } => {
            if !require_registered(connection_id, state, outbound) {
                return;
            }
            if let Err(e) = state.presence.clear_typing(&from, &to) {
                let _ = outbound.send(ServerEvent::error(e.code(), e.to_string()));
                return;
            }
            metrics::record_typing_event();
        }

        ClientEvent::Ping { timestamp } => {
            let _ = outbound.send(ServerEvent::pong(timestamp));
        }
    }
}

/// Reject events from connections that never sent `register_user`.
fn require_registered(
    connection_id: &str,
    state: &Arc<AppState>,
    outbound: &mpsc::UnboundedSender<ServerEvent>,
) -> bool {
    if state.registry.owner_of(connection_id).is_some() {
        return true;
    }
    let err = ChatError::NotFound("connection is not registered".into());
    let _ = outbound.send(ServerEvent::error(err.code(), err.to_string()));
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_then_join_reports_presence() {
        let state = Arc::new(AppState::new(Config::default()));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, _rx_b) = mpsc::unbounded_channel();

        handle_event(
            ClientEvent::RegisterUser {
                user_id: "user-a".into(),
                version: None,
            },
            "conn-a",
            &state,
            &tx_a,
        )
        .await;
        handle_event(
            ClientEvent::RegisterUser {
                user_id: "user-b".into(),
                version: None,
            },
            "conn-b",
            &state,
            &tx_b,
        )
        .await;

        handle_event(
            ClientEvent::JoinRoom {
                current_user_id: "user-a".into(),
                other_user_id: "user-b".into(),
            },
            "conn-a",
            &state,
            &tx_a,
        )
        .await;

        assert_eq!(rx_a.try_recv().unwrap(), ServerEvent::room_joined(true));
    }

    #[tokio::test]
    async fn test_unregistered_connection_is_rejected() {
        let state = Arc::new(AppState::new(Config::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_event(
            ClientEvent::SendMessage {
                from: "user-a".into(),
                to: "user-b".into(),
                content: Some("hello".into()),
                attachment: None,
            },
            "conn-a",
            &state,
            &tx,
        )
        .await;

        match rx.try_recv().unwrap() {
            ServerEvent::Error { code: c, .. } => assert_eq!(c, code::NOT_FOUND),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_send_reports_validation_error() {
        let state = Arc::new(AppState::new(Config::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_event(
            ClientEvent::RegisterUser {
                user_id: "user-a".into(),
                version: None,
            },
            "conn-a",
            &state,
            &tx,
        )
        .await;
        handle_event(
            ClientEvent::SendMessage {
                from: "user-a".into(),
                to: "user-b".into(),
                content: None,
                attachment: None,
            },
            "conn-a",
            &state,
            &tx,
        )
        .await;

        match rx.try_recv().unwrap() {
            ServerEvent::Error { code: c, .. } => assert_eq!(c, code::VALIDATION),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_incompatible_protocol_version_rejected() {
        let state = Arc::new(AppState::new(Config::default()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let incompatible = courier_protocol::Version::new(PROTOCOL_VERSION.major + 1, 0);
        handle_event(
            ClientEvent::RegisterUser {
                user_id: "user-a".into(),
                version: Some(incompatible),
            },
            "conn-a",
            &state,
            &tx,
        )
        .await;

        match rx.try_recv().unwrap() {
            ServerEvent::Error { code: c, .. } => assert_eq!(c, code::VALIDATION),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(state.registry.owner_of("conn-a").is_none());

        // A matching version registers normally.
        handle_event(
            ClientEvent::RegisterUser {
                user_id: "user-a".into(),
                version: Some(PROTOCOL_VERSION),
            },
            "conn-a",
            &state,
            &tx,
        )
        .await;
        assert_eq!(state.registry.owner_of("conn-a").unwrap(), "user-a");
    }

    #[tokio::test]
    async fn test_content_limit_applies_to_trimmed_length() {
        let mut config = Config::default();
        config.limits.max_content_length = 5;
        let state = Arc::new(AppState::new(config));
        let (tx, mut rx) = mpsc::unbounded_channel();

        handle_event(
            ClientEvent::RegisterUser {
                user_id: "user-a".into(),
                version: None,
            },
            "conn-a",
            &state,
            &tx,
        )
        .await;

        // Surrounding whitespace does not count against the limit.
        handle_event(
            ClientEvent::SendMessage {
                from: "user-a".into(),
                to: "user-b".into(),
                content: Some("   hi    ".into()),
                attachment: None,
            },
            "conn-a",
            &state,
            &tx,
        )
        .await;
        assert!(rx.try_recv().is_err());

        handle_event(
            ClientEvent::SendMessage {
                from: "user-a".into(),
                to: "user-b".into(),
                content: Some("too long".into()),
                attachment: None,
            },
            "conn-a",
            &state,
            &tx,
        )
        .await;
        match rx.try_recv().unwrap() {
            ServerEvent::Error { code: c, .. } => assert_eq!(c, code::VALIDATION),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cleanup_emits_offline_and_stop_typing() {
        let state = Arc::new(AppState::new(Config::default()));
        let (tx_a, _rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        handle_event(
            ClientEvent::RegisterUser {
                user_id: "user-a".into(),
                version: None,
            },
            "conn-a",
            &state,
            &tx_a,
        )
        .await;
        handle_event(
            ClientEvent::RegisterUser {
                user_id: "user-b".into(),
                version: None,
            },
            "conn-b",
            &state,
            &tx_b,
        )
        .await;
        handle_event(
            ClientEvent::JoinRoom {
                current_user_id: "user-b".into(),
                other_user_id: "user-a".into(),
            },
            "conn-b",
            &state,
            &tx_b,
        )
        .await;
        let _ = rx_b.try_recv(); // room_joined

        handle_event(
            ClientEvent::Typing {
                from: "user-a".into(),
                to: "user-b".into(),
            },
            "conn-a",
            &state,
            &tx_a,
        )
        .await;
        assert_eq!(rx_b.try_recv().unwrap(), ServerEvent::UserTyping {});

        cleanup_connection("conn-a", &state);

        assert_eq!(rx_b.try_recv().unwrap(), ServerEvent::UserStopTyping {});
        assert_eq!(
            rx_b.try_recv().unwrap(),
            ServerEvent::UserOffline {
                user_id: "user-a".into()
            }
        );

        // Duplicate disconnect is absorbed.
        cleanup_connection("conn-a", &state);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_conversation_scenario() {
        let state = Arc::new(AppState::new(Config::default()));
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        for (conn, user, tx) in [("conn-a", "user-a", &tx_a), ("conn-b", "user-b", &tx_b)] {
            handle_event(
                ClientEvent::RegisterUser {
                    user_id: user.into(),
                    version: None,
                },
                conn,
                &state,
                tx,
            )
            .await;
        }
        for (conn, user, other, tx) in [
            ("conn-a", "user-a", "user-b", &tx_a),
            ("conn-b", "user-b", "user-a", &tx_b),
        ] {
            handle_event(
                ClientEvent::JoinRoom {
                    current_user_id: user.into(),
                    other_user_id: other.into(),
                },
                conn,
                &state,
                tx,
            )
            .await;
        }
        assert_eq!(rx_a.try_recv().unwrap(), ServerEvent::room_joined(true));
        assert_eq!(rx_b.try_recv().unwrap(), ServerEvent::room_joined(true));

        handle_event(
            ClientEvent::SendMessage {
                from: "user-a".into(),
                to: "user-b".into(),
                content: Some("Hello".into()),
                attachment: None,
            },
            "conn-a",
            &state,
            &tx_a,
        )
        .await;

        let delivered = match rx_b.try_recv().unwrap() {
            ServerEvent::NewMessage { message } => message,
            other => panic!("expected new_message, got {other:?}"),
        };
        assert_eq!(delivered.content.as_deref(), Some("Hello"));
        assert!(!delivered.read);
        // The sender's device sees its own send too.
        assert!(matches!(
            rx_a.try_recv().unwrap(),
            ServerEvent::NewMessage { .. }
        ));

        assert_eq!(state.read_state.mark_read("user-b", "user-a").await.unwrap(), 1);
        let summaries = state.conversations.list("user-b").await.unwrap();
        assert_eq!(summaries[0].counterpart, "user-a");
        assert_eq!(summaries[0].unread_count, 0);
    }
}
