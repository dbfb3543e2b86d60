use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::{
    ws::{ProbeCommand, WsEvent},
    AppState,
};

/// GET /ws: upgrade to WebSocket
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut event_rx = state.event_tx.subscribe();

    // Frames meant for this client only: pongs, rejections, the close frame
    let (direct_tx, mut direct_rx) = mpsc::channel::<Message>(8);

    // Task: forward broadcast events and direct frames → WebSocket client
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(text) = serde_json::to_string(&event) {
                                if sender.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!("WebSocket client lagged by {} events", n);
                            continue;
                        }
                    }
                }
                direct = direct_rx.recv() => {
                    match direct {
                        Some(msg) => {
                            let closing = matches!(msg, Message::Close(_));
                            if sender.send(msg).await.is_err() || closing {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    // Task: receive commands from the client and handle Ping → Pong
    let recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(data)) => {
                    if direct_tx.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Text(text)) => match handle_command_text(&state, &text).await {
                    ControlFlow::Continue(reply) => {
                        if let Some(reply) = reply {
                            if direct_tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    ControlFlow::Break(close) => {
                        let _ = direct_tx.send(close).await;
                        break;
                    }
                },
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("WebSocket receive error: {}", e);
                    break;
                }
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    tracing::debug!("WebSocket client disconnected");
}

/// Handles one text frame. `Break` carries the close frame for anything that
/// is not a known command; `Continue` carries an optional reply for this client.
async fn handle_command_text(
    state: &AppState,
    text: &str,
) -> ControlFlow<Message, Option<Message>> {
    let command = match serde_json::from_str::<ProbeCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            tracing::warn!("Closing WebSocket after unrecognized command: {}", e);
            return ControlFlow::Break(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: "unrecognized command".into(),
            })));
        }
    };

    match command {
        ProbeCommand::Start { max_attempt_size } => {
            match state.controller.start(Some(max_attempt_size)).await {
                Ok(started) => {
                    tracing::info!("Probe run {} started over WebSocket", started.run_id);
                    ControlFlow::Continue(None)
                }
                Err(e) => {
                    let event = WsEvent::Error {
                        message: e.to_string(),
                    };
                    ControlFlow::Continue(serde_json::to_string(&event).ok().map(Message::Text))
                }
            }
        }
        ProbeCommand::Cancel => {
            state.controller.cancel().await;
            ControlFlow::Continue(None)
        }
    }
}
