use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};

use super::LogBroadcaster;
use crate::server::AppState;

/// GET /ws/logs/:session_id - live log stream for one session
pub async fn session_logs_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    let logs = state.logs.clone();
    ws.on_upgrade(move |socket| stream_session_logs(socket, session_id, logs))
}

async fn stream_session_logs(socket: WebSocket, session_id: String, logs: LogBroadcaster) {
    let mut events = logs.subscribe(&session_id);
    let (mut sender, mut receiver) = socket.split();
    info!(
        session_id = %session_id,
        subscribers = logs.subscriber_count(&session_id),
        "Log subscriber connected"
    );

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(session_id = %session_id, "Failed to encode log event: {}", e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text)).await.is_err() {
                        debug!(session_id = %session_id, "Log subscriber went away mid-send");
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(session_id = %session_id, "Log subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(data))) => {
                    trace!(session_id = %session_id, "Ping from log subscriber");
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session_id = %session_id, "Log subscriber socket error: {}", e);
                    break;
                }
            },
        }
    }

    drop(events);
    logs.release(&session_id);
    info!(session_id = %session_id, "Log subscriber disconnected");
}
