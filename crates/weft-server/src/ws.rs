//! WebSocket bridge: one socket per client, binary frames mapped 1:1 to
//! protocol frames.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use weft_hub::{Client, MessageSink, Registry, SinkError};
use weft_proto::{Context, context_keys};

/// Query parameters for the WebSocket endpoint
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Client id; generated when absent
    pub client_id: Option<String>,
    /// Authenticated user id, when the deployment fronts its own auth
    pub user_id: Option<String>,
    /// Room used to namespace document ids
    pub room: Option<String>,
}

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// The hub this front end feeds
    pub registry: Arc<Registry>,
}

/// Build the router with the sync and stats endpoints
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync", get(ws_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(state.registry.stats().await)
}

async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

/// Writer half behind the hub's FIFO send queue
struct WsSink {
    writer: Mutex<SplitSink<WebSocket, WsMessage>>,
}

#[async_trait]
impl MessageSink for WsSink {
    async fn write(&self, frame: Vec<u8>) -> Result<(), SinkError> {
        let mut writer = self.writer.lock().await;
        writer
            .send(WsMessage::Binary(frame))
            .await
            .map_err(|err| SinkError::fatal(err.to_string()))
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.close().await;
    }
}

fn random_client_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("client-{}", hex::encode(bytes))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: WsQuery) {
    let client_id = query.client_id.unwrap_or_else(random_client_id);
    let mut context = Context::new().with(context_keys::CLIENT_ID, client_id.clone());
    if let Some(user_id) = &query.user_id {
        context.insert(context_keys::USER_ID, user_id.clone());
    }
    if let Some(room) = &query.room {
        context.insert(context_keys::ROOM, room.clone());
    }

    let (writer, reader) = socket.split();
    let sink = Arc::new(WsSink {
        writer: Mutex::new(writer),
    });
    let client = Client::new(client_id.clone(), context, sink);

    info!(client_id = %client_id, room = ?query.room, "websocket connected");
    read_loop(reader, &state, &client).await;

    client.destroy().await;
    info!(client_id = %client_id, "websocket disconnected");
}

async fn read_loop(
    mut reader: SplitStream<WebSocket>,
    state: &AppState,
    client: &Arc<Client>,
) {
    while let Some(received) = reader.next().await {
        let message = match received {
            Ok(message) => message,
            Err(err) => {
                debug!(client_id = %client.id(), error = %err, "websocket read failed");
                break;
            }
        };
        match message {
            WsMessage::Binary(frame) => {
                if let Err(err) = state.registry.handle_frame(client, &frame).await {
                    // A bad frame must not tear down the connection
                    warn!(
                        client_id = %client.id(),
                        error = %err,
                        "inbound frame rejected"
                    );
                }
            }
            WsMessage::Close(_) => break,
            // Transport-level ping/pong is answered by the websocket layer
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            WsMessage::Text(_) => {
                debug!(client_id = %client.id(), "text frame ignored");
            }
        }
    }
}
