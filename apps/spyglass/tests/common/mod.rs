//! In-process coordination server stub for integration tests: a single
//! websocket endpoint that records every client message and forwards
//! injected server messages to the connected client.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

pub struct Relay {
    pub url: String,
    /// Every JSON message the client sent, in order.
    pub from_client: mpsc::UnboundedReceiver<Value>,
    /// Raw text to push to the connected client.
    pub to_client: mpsc::UnboundedSender<String>,
}

struct RelayState {
    client_tx: mpsc::UnboundedSender<Value>,
    server_rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<String>>>,
}

pub async fn spawn_relay() -> Relay {
    let (client_tx, from_client) = mpsc::unbounded_channel();
    let (to_client, server_rx) = mpsc::unbounded_channel();
    let state = Arc::new(RelayState {
        client_tx,
        server_rx: Arc::new(AsyncMutex::new(server_rx)),
    });

    let app = Router::new().route("/ws", get(ws_handler)).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Relay {
        url: format!("ws://{addr}/ws"),
        from_client,
        to_client,
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<RelayState>) {
    let mut server_rx = state.server_rx.lock().await;
    loop {
        tokio::select! {
            message = socket.recv() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        let _ = state.client_tx.send(value);
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
            outbound = server_rx.recv() => match outbound {
                Some(text) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}
