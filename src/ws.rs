use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::api::AppState;

/// Size of the per-process UI fan-out channel.
const UI_BUFFER_SIZE: usize = 256;

/// Fire-and-forget push channel to the front-end. Every message is a named
/// event with a JSON payload; nobody ever waits on delivery.
#[derive(Clone)]
pub struct UiNotifier {
    tx: broadcast::Sender<String>,
}

impl UiNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(UI_BUFFER_SIZE);
        Self { tx }
    }

    pub fn push(&self, event: &str, payload: Value) {
        let frame = json!({ "event": event, "payload": payload }).to_string();
        // Ignore the error: it means no front-end is connected.
        let _ = self.tx.send(frame);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for UiNotifier {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Send a snapshot of live agents immediately on connect.
    let agents = state.registry.get_active_agents().await;
    if let Ok(frame) = serde_json::to_string(&json!({
        "event": "agents:snapshot",
        "payload": agents,
    })) {
        if sender.send(Message::Text(frame)).await.is_err() {
            return;
        }
    }

    let mut rx = state.notifier.subscribe();

    // Forward pushed events to the WebSocket client.
    let send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if sender.send(Message::Text(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("WS client lagged by {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Drain incoming frames (ping/pong/close) until the client disconnects.
    while let Some(Ok(_)) = receiver.next().await {}

    send_task.abort();
    info!("WebSocket client disconnected");
}
