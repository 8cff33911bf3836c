//! HTTP surface: router assembly, WebSocket and SSE handlers.

use crate::api;
use crate::client::{ClientId, ClientRegistry, ClientState, SubscribeOutcome, Transport};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::keyspace::KeyspaceTranslator;
use crate::protocol::{ClientMessage, Outbound, ServerMessage};
use crate::ranker::FreshnessRanker;
use crate::subscription::validate_channel;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::{
        sse::{Event, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Router,
};
use chrono::Utc;
use futures::{stream, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge};
use record_store::{RecordStore, StatusHandle};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub translator: Arc<KeyspaceTranslator>,
    pub ranker: FreshnessRanker,
    pub store: Arc<dyn RecordStore>,
    pub status: StatusHandle,
    pub config: GatewayConfig,
}

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/redis/stream", get(sse_handler))
        .route("/health", get(api::health_handler))
        .route("/status", get(api::status_handler))
        .route("/api/redis/status", get(api::store_status_handler))
        .route("/get-latest-30", get(api::latest_default_handler))
        .route("/api/feed/{class}/latest", get(api::latest_for_class_handler))
        .route("/api/redis/tokens/{*key}", get(api::get_record_handler))
        .route("/test-token", get(api::test_record_handler))
        .route("/api/publish/{channel}", post(api::publish_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

fn connection_opened(registry: &ClientRegistry, transport: Transport) {
    counter!("gateway_connections_total", "transport" => transport_label(transport)).increment(1);
    gauge!("gateway_active_connections").set(registry.client_count() as f64);
}

fn connection_closed(registry: &ClientRegistry) {
    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(registry.client_count() as f64);
}

fn transport_label(transport: Transport) -> &'static str {
    match transport {
        Transport::WebSocket => "ws",
        Transport::Sse => "sse",
    }
}

// =============================================================================
// WebSocket
// =============================================================================

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn ws_frame(item: Outbound) -> Option<Message> {
    match item {
        Outbound::Event(event) => Some(Message::Text(event.encoded().to_string().into())),
        Outbound::Control(msg) => match serde_json::to_string(&msg) {
            Ok(text) => Some(Message::Text(text.into())),
            Err(e) => {
                warn!("Failed to encode control message: {}", e);
                None
            }
        },
        Outbound::Ping => Some(Message::Ping(vec![].into())),
    }
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (client, mut rx) = ClientState::new(Transport::WebSocket);
    let client = Arc::new(client);
    let client_id = state.registry.register(client.clone());
    let mut closed = client.closed_signal();
    connection_opened(&state.registry, Transport::WebSocket);

    // Drains the outbound queue; ends when the socket write fails.
    let mut send_task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            let Some(frame) = ws_frame(item) else {
                continue;
            };
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &client, msg).await {
                            warn!("Error handling message from {}: {}", client_id, e);
                            let _ = client.send(ServerMessage::Error {
                                channel: None,
                                message: e.to_string(),
                                code: e.code().to_string(),
                            });
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", client_id, e);
                        break;
                    }
                }
            }

            _ = &mut send_task => {
                debug!("Write side of {} closed", client_id);
                break;
            }

            _ = async { let _ = closed.wait_for(|c| *c).await; } => {
                debug!("Client {} closed by registry", client_id);
                break;
            }
        }
    }

    state.registry.remove_connection(&client_id).await;
    send_task.abort();
    connection_closed(&state.registry);
}

/// Handle a single WebSocket frame.
async fn handle_message(state: &AppState, client: &Arc<ClientState>, msg: Message) -> Result<()> {
    let parsed: ClientMessage = match msg {
        Message::Text(text) => serde_json::from_str(&text)
            .map_err(|e| GatewayError::MalformedPayload(e.to_string()))?,
        Message::Binary(data) => serde_json::from_slice(&data)
            .map_err(|e| GatewayError::MalformedPayload(e.to_string()))?,
        Message::Ping(_) | Message::Pong(_) => {
            client.update_ping();
            return Ok(());
        }
        Message::Close(_) => return Ok(()),
    };
    handle_client_message(state, client, parsed).await
}

/// Handle a parsed client message.
async fn handle_client_message(
    state: &AppState,
    client: &Arc<ClientState>,
    msg: ClientMessage,
) -> Result<()> {
    match msg {
        ClientMessage::Subscribe { channel } => {
            debug!("Client {} subscribing to {}", client.id, channel);

            if let Some(reason) = validate_channel(&channel) {
                return Err(GatewayError::InvalidChannel(reason));
            }

            match state.registry.subscribe(&client.id, &channel).await {
                Ok(outcome) => {
                    if outcome == SubscribeOutcome::Subscribed {
                        counter!("gateway_subscriptions_total").increment(1);
                    }
                    client.send(ServerMessage::Subscribed { channel })
                }
                Err(e) => client.send(ServerMessage::Error {
                    channel: Some(channel),
                    message: e.to_string(),
                    code: e.code().to_string(),
                }),
            }
        }
        ClientMessage::Unsubscribe { channel } => {
            debug!("Client {} unsubscribing from {}", client.id, channel);
            state.registry.unsubscribe(&client.id, &channel).await?;
            client.send(ServerMessage::Unsubscribed { channel })
        }
        ClientMessage::Ping => {
            client.update_ping();
            client.send(ServerMessage::Pong)
        }
    }
}

// =============================================================================
// Server-Sent Events
// =============================================================================

/// Detaches an SSE connection when its response stream is dropped.
struct ConnectionGuard {
    registry: Arc<ClientRegistry>,
    client_id: ClientId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(client) = self.registry.detach(&self.client_id) else {
            return;
        };
        connection_closed(&self.registry);

        // Channel counts need the async registry lock.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let registry = self.registry.clone();
                handle.spawn(async move {
                    registry.release(&client).await;
                });
            }
            Err(_) => warn!("Client {} dropped outside the runtime; channels not released", client.id),
        }
    }
}

fn sse_event(item: Outbound) -> Event {
    match item {
        Outbound::Event(event) => Event::default().event(&event.channel).data(&event.payload),
        Outbound::Control(msg) => {
            let name = match &msg {
                ServerMessage::Error { .. } => "error",
                _ => "control",
            };
            let data = serde_json::to_string(&msg).unwrap_or_default();
            Event::default().event(name).data(data)
        }
        Outbound::Ping => Event::default()
            .event("ping")
            .data(Utc::now().timestamp_millis().to_string()),
    }
}

/// SSE stream subscribed to every record class channel.
///
/// A channel whose upstream subscription fails is reported with an `error`
/// event; the stream stays open for the remaining channels.
async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (client, rx) = ClientState::new(Transport::Sse);
    let client = Arc::new(client);
    let client_id = state.registry.register(client.clone());
    let guard = ConnectionGuard {
        registry: state.registry.clone(),
        client_id,
    };
    connection_opened(&state.registry, Transport::Sse);
    info!("SSE client {} connected", client_id);

    // Subscribing runs apart from the request future so an early disconnect
    // cannot cut a registry call short.
    tokio::spawn(subscribe_classes(state.clone(), client.clone()));

    Sse::new(event_stream(rx, client.closed_signal(), guard))
}

async fn subscribe_classes(state: Arc<AppState>, client: Arc<ClientState>) {
    for class in state.translator.classes() {
        if !client.is_open() {
            return;
        }
        if let Err(e) = state.registry.subscribe(&client.id, &class.name).await {
            warn!("SSE client {} not subscribed to {}: {}", client.id, class.name, e);
            let _ = client.send(ServerMessage::Error {
                channel: Some(class.name.clone()),
                message: e.to_string(),
                code: e.code().to_string(),
            });
        }
    }
}

/// Ends when the queue closes or the registry closes the connection.
fn event_stream(
    rx: mpsc::Receiver<Outbound>,
    closed: watch::Receiver<bool>,
    guard: ConnectionGuard,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold((rx, closed, guard), |(mut rx, mut closed, guard)| async move {
        let next = tokio::select! {
            item = rx.recv() => item,
            _ = closed.wait_for(|c| *c) => None,
        };
        let item = next?;
        Some((Ok(sse_event(item)), (rx, closed, guard)))
    })
}
