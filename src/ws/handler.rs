//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app::AppState;
use crate::game::objects::ObjectId;
use crate::game::{SessionCommand, SessionHandle};
use crate::util::PlayerRateLimiter;

/// Packets buffered per connection before the session starts dropping them
const OUTBOUND_QUEUE: usize = 256;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Display name; the client may rename itself later with a Join message
    #[serde(default)]
    pub name: Option<String>,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let name = query.name.unwrap_or_default();
    debug!(name = %name, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, name, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, name: String, state: AppState) {
    // Register with a session to get an id; packets arrive on the outbound channel
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (session, player) = match state
        .sessions
        .join(&state.catalog, &state.game, &name, &outbound_tx)
        .await
    {
        Ok(joined) => joined,
        Err(e) => {
            error!(error = %e, "Failed to join a session");
            return;
        }
    };
    drop(outbound_tx);

    info!(session_id = %session.id, player_id = player, "New WebSocket connection");

    let (ws_sink, ws_stream) = socket.split();
    run_connection(&session, player, ws_sink, ws_stream, outbound_rx).await;

    info!(session_id = %session.id, player_id = player, "WebSocket connection closed");
}

/// Pump frames in both directions until either side goes away
async fn run_connection(
    session: &SessionHandle,
    player: ObjectId,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    mut outbound_rx: mpsc::Receiver<Bytes>,
) {
    let rate_limiter = PlayerRateLimiter::new();

    // Spawn writer task: session packets -> WebSocket
    let writer_handle = tokio::spawn(async move {
        while let Some(packet) = outbound_rx.recv().await {
            if let Err(e) = ws_sink.send(Message::Binary(packet.to_vec())).await {
                debug!(player_id = player, error = %e, "WebSocket send failed");
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    // Reader loop: WebSocket -> session
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Binary(data)) => {
                if !rate_limiter.check_input() {
                    warn!(player_id = player, "Rate limited input message");
                    continue;
                }

                let command = SessionCommand::Message {
                    player,
                    data: Bytes::from(data),
                };
                if session.command_tx.send(command).await.is_err() {
                    debug!(player_id = player, "Session channel closed");
                    break;
                }
            }
            Ok(Message::Text(_)) => {
                debug!(player_id = player, "Received text message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(player_id = player, "Client initiated close");
                break;
            }
            Err(e) => {
                debug!(player_id = player, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // Signal disconnect to the session
    let _ = session
        .command_tx
        .send(SessionCommand::Disconnect { player })
        .await;

    writer_handle.abort();
}
