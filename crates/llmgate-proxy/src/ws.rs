//! Bidirectional observability channel.
//!
//! Each WebSocket client gets its own broadcast subscription: the server
//! pushes `monitoring-update`, `request-event`, and `alert` messages as
//! they are published, and answers the client commands `request-update`
//! (immediate snapshot), `get-logs`, and `get-stats`. A client that lags
//! behind the broadcast buffer skips the dropped events and keeps going.

use crate::events::{assemble_snapshot, GateEvent};
use crate::pipeline::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use llmgate_core::AuditAction;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Commands a client may send on the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientCommand {
    #[serde(rename = "request-update")]
    RequestUpdate,
    #[serde(rename = "get-logs")]
    GetLogs {
        limit: Option<u32>,
        action: Option<String>,
    },
    #[serde(rename = "get-stats")]
    GetStats,
}

/// `GET /ws` — upgrade to the event channel.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let mut events = state.events.subscribe();
    debug!("WebSocket subscriber connected");

    // Greet the client with a snapshot so dashboards render immediately.
    if let Some(snapshot) = assemble_snapshot(&state).await {
        let greeting = GateEvent::Monitoring(snapshot);
        if send_json(&mut sink, &greeting).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_json(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "WebSocket subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if handle_command(&text, &state, &mut sink).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ignore pings/binary
                Some(Err(e)) => {
                    debug!("WebSocket receive error: {e}");
                    break;
                }
            },
        }
    }

    debug!("WebSocket subscriber disconnected");
}

async fn handle_command(
    text: &str,
    state: &Arc<AppState>,
    sink: &mut (impl SinkExt<Message> + Unpin),
) -> Result<(), ()> {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            debug!("Ignoring malformed client command: {e}");
            return Ok(());
        }
    };

    match command {
        ClientCommand::RequestUpdate => {
            if let Some(snapshot) = assemble_snapshot(state).await {
                send_json(sink, &GateEvent::Monitoring(snapshot)).await?;
            }
        }
        ClientCommand::GetLogs { limit, action } => {
            let limit = limit.unwrap_or(50).min(1000);
            let result = match action.as_deref().map(AuditAction::from_str) {
                Some(Ok(action)) => state.store.by_action(action, limit).await,
                Some(Err(_)) => {
                    send_json(sink, &json!({ "type": "error", "message": "unknown action" }))
                        .await?;
                    return Ok(());
                }
                None => state.store.recent(limit).await,
            };
            match result {
                Ok(records) => {
                    send_json(sink, &json!({ "type": "logs", "data": records })).await?;
                }
                Err(e) => {
                    warn!("WebSocket log query failed: {e}");
                    send_json(sink, &json!({ "type": "error", "message": "query failed" }))
                        .await?;
                }
            }
        }
        ClientCommand::GetStats => match state.store.stats().await {
            Ok(stats) => {
                send_json(sink, &json!({ "type": "stats", "data": stats })).await?;
            }
            Err(e) => {
                warn!("WebSocket stats query failed: {e}");
                send_json(sink, &json!({ "type": "error", "message": "query failed" })).await?;
            }
        },
    }

    Ok(())
}

async fn send_json(
    sink: &mut (impl SinkExt<Message> + Unpin),
    payload: &impl serde::Serialize,
) -> Result<(), ()> {
    let text = serde_json::to_string(payload).map_err(|_| ())?;
    sink.send(Message::Text(text)).await.map_err(|_| ())
}
