//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::util::rate_limit::ConnectionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::dispatch::{Outbound, Subscriber};
use crate::ws::protocol::{ClientMsg, Envelope, PlayerId, ServerMsg, PROTOCOL_VERSION};

type WsSink = futures::stream::SplitSink<WebSocket, Message>;
type WsStream = futures::stream::SplitStream<WebSocket>;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let player_id: PlayerId = Uuid::new_v4();
    info!(player_id = %player_id, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    let welcome = Envelope::direct(ServerMsg::Welcome {
        player_id,
        server_time: unix_millis(),
        protocol_version: PROTOCOL_VERSION,
    });
    if let Err(e) = send_envelope(&mut ws_sink, &welcome).await {
        error!(player_id = %player_id, error = %e, "Failed to send welcome");
        return;
    }

    let (subscriber, outbound_rx) = Subscriber::channel(player_id);
    run_session(&state, subscriber, ws_sink, ws_stream, outbound_rx).await;

    // Cleanup on disconnect
    state.router.disconnect(player_id).await;

    info!(player_id = %player_id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    state: &AppState,
    subscriber: Subscriber,
    mut ws_sink: WsSink,
    mut ws_stream: WsStream,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    let player_id = subscriber.player_id;
    let rate_limiter = ConnectionRateLimiter::new(state.config.input_rate_limit);

    // Writer task: outbound queue -> WebSocket
    let writer_handle = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = send_envelope(&mut ws_sink, &frame).await {
                debug!(player_id = %player_id, error = %e, "WebSocket send failed");
                break;
            }
        }
    });

    // Reader loop: WebSocket -> router
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(player_id = %player_id, "Rate limited input message");
                    continue;
                }

                match decode(&text) {
                    Ok(msg) => state.router.handle(&subscriber, msg).await,
                    Err(reply) => {
                        warn!(player_id = %player_id, "Failed to parse client message");
                        if subscriber.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(player_id = %player_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(player_id = %player_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(player_id = %player_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer_handle.abort();
}

/// Decode a text frame, or build the error reply for a malformed one
fn decode(text: &str) -> Result<ClientMsg, Envelope> {
    serde_json::from_str::<ClientMsg>(text)
        .map_err(|e| Envelope::error("invalid_message", e.to_string()))
}

/// Send a message over WebSocket
async fn send_envelope(sink: &mut WsSink, msg: &Envelope) -> anyhow::Result<()> {
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json)).await?;
    Ok(())
}
