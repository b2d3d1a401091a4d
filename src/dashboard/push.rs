// Dashboard Push Channel - incremental updates over WebSocket
// Clients authenticate with a first-frame token handshake, then receive
// stats_update / order_flow_update / new_signal events.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dashboard::state::DashboardState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn push_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<DashboardState>>,
) -> Response {
    ws.on_upgrade(|socket| push_connection(socket, state))
}

async fn push_connection(mut socket: WebSocket, state: Arc<DashboardState>) {
    // Token-gated handshake: the first frame must carry the bearer token
    if state.auth_required() {
        let authorized = match tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv()).await {
            Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("token").and_then(|t| t.as_str()).map(String::from))
                .map(|token| state.token_matches(&token))
                .unwrap_or(false),
            _ => false,
        };

        if !authorized {
            warn!("Push channel handshake rejected");
            let _ = socket
                .send(Message::Text(r#"{"type":"error","reason":"unauthorized"}"#.into()))
                .await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }

    let _ = socket
        .send(Message::Text(r#"{"type":"hello"}"#.into()))
        .await;
    info!("Push channel client connected");

    let mut events = state.events.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if socket.send(Message::Text(event.to_frame())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped = skipped, "Push client lagged; events skipped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    info!("Push channel client disconnected");
}
