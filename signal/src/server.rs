use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use roulette_model::{ClientId, ClientMessage, ServerMessage};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::config::{setup_cors, Keepalive};
use crate::switchboard::Switchboard;

#[derive(Clone)]
struct AppState {
    switchboard: Switchboard,
    keepalive: Keepalive,
}

pub fn router(switchboard: Switchboard, keepalive: Keepalive) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(AppState {
            switchboard,
            keepalive,
        })
        .layer(setup_cors())
}

pub async fn serve(
    listener: TcpListener,
    switchboard: Switchboard,
    keepalive: Keepalive,
) -> std::io::Result<()> {
    axum::serve(listener, router(switchboard, keepalive).into_make_service()).await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let id = ClientId::new();
    tracing::info!("New client connecting: {id}");
    ws.on_upgrade(move |socket| handle_socket(socket, state, id))
}

async fn handle_socket(socket: WebSocket, state: AppState, id: ClientId) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let keepalive = state.keepalive;

    state.switchboard.connect(id, tx).await;

    // Writes notifications and keep-alive pings to the socket
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(keepalive.ping_interval);
        ping.tick().await;
        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(err) => {
                            tracing::error!("Could not serialize message for {id}: {err}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let switchboard = state.switchboard.clone();

    // Any inbound frame, pongs included, counts as liveness
    let mut recv_task = tokio::spawn(async move {
        loop {
            let frame = match tokio::time::timeout(keepalive.ping_timeout, receiver.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(err))) => {
                    tracing::warn!("WebSocket error from {id}: {err}");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        "No traffic from {id} for {:?}, dropping connection",
                        keepalive.ping_timeout
                    );
                    break;
                }
            };

            match frame {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(message) => switchboard.handle(id, message).await,
                    Err(err) => tracing::warn!("Failed to parse message from {id}: {err}"),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };

    state.switchboard.disconnect(id).await;
}
