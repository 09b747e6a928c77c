//! Manages the WebSocket connection lifecycle for an attached session.

use super::protocol::{ClientMessage, ServerMessage};
use crate::{models::MessageRole, state::AppState};
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use cadence_core::{SessionEvent, SessionView};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{Instrument, error, info, instrument, warn};
use uuid::Uuid;

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Entry point of a new connection: waits for `attach`, then runs the
/// session loop in its own instrumented task.
#[instrument(name = "ws_session", skip_all, fields(connection_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id: u32 = rand::random();
    tracing::Span::current().record("connection_id", connection_id);
    info!("New WebSocket connection. Awaiting attach...");

    let (mut socket_tx, mut socket_rx) = socket.split();

    // Subscribe before reading the session so no event slips between the two.
    let events = state.orchestrator.subscribe();

    let attached = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => attach(&text, &state).await,
        Some(Ok(_)) => Err(anyhow!("First message was not a text `attach` message.")),
        _ => {
            info!("Client disconnected before sending attach message.");
            return;
        }
    };

    let (session_id, session) = match attached {
        Ok(attached) => attached,
        Err(e) => {
            error!("Session attach failed: {:?}", e);
            let _ = send_msg(
                &mut socket_tx,
                ServerMessage::Error {
                    message: e.to_string(),
                },
            )
            .await;
            return;
        }
    };

    if send_msg(
        &mut socket_tx,
        ServerMessage::Attached {
            session_id,
            session,
        },
    )
    .await
    .is_err()
    {
        error!("Failed to send Attached message to client.");
        return;
    }

    let session_span = tracing::info_span!("ws_runtime", %session_id);
    tokio::spawn(
        async move {
            if let Err(e) = run_session(state, socket_tx, socket_rx, events, session_id).await {
                error!(error = ?e, "WebSocket session terminated with error.");
            }
            info!("WebSocket session finished.");
        }
        .instrument(session_span),
    );
}

async fn attach(text: &str, state: &Arc<AppState>) -> Result<(Uuid, SessionView)> {
    let ClientMessage::Attach { session_id } = serde_json::from_str::<ClientMessage>(text)? else {
        return Err(anyhow!("First message must be `attach`"));
    };
    let session = state.orchestrator.status(session_id).await?;
    info!(%session_id, phase = %session.current_phase_id, "Client attached");
    Ok((session_id, session))
}

/// Relays client messages to the orchestrator and forwards the session's
/// events until either side goes away.
async fn run_session(
    state: Arc<AppState>,
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut socket_rx: SplitStream<WebSocket>,
    mut events: broadcast::Receiver<SessionEvent>,
    session_id: Uuid,
) -> Result<()> {
    loop {
        tokio::select! {
            incoming = socket_rx.next() => {
                let Some(incoming) = incoming else { break };
                match incoming {
                    Ok(Message::Text(text)) => {
                        let reply = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => handle_client_message(&state, session_id, msg).await,
                            Err(e) => ServerMessage::Error { message: format!("invalid message: {e}") },
                        };
                        send_msg(&mut socket_tx, reply).await?;
                    }
                    Ok(Message::Close(_)) => {
                        info!("Client sent close frame. Detaching.");
                        break;
                    }
                    Ok(Message::Binary(_)) => warn!("Ignoring binary frame."),
                    Ok(Message::Ping(_) | Message::Pong(_)) => {}
                    Err(e) => {
                        error!("Error receiving from client WebSocket: {:?}", e);
                        break;
                    }
                }
            },
            event = events.recv() => match event {
                Ok(event) if event.session_id() == session_id => {
                    let concluded = matches!(event, SessionEvent::SessionConcluded { .. });
                    send_msg(&mut socket_tx, ServerMessage::Event { event }).await?;
                    if concluded {
                        info!("Session concluded. Closing connection.");
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event stream lagged."),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let _ = socket_tx.send(Message::Close(None)).await;
    Ok(())
}

async fn handle_client_message(
    state: &AppState,
    session_id: Uuid,
    msg: ClientMessage,
) -> ServerMessage {
    let result = match msg {
        ClientMessage::UserMessage { text } => state
            .record_message(session_id, MessageRole::User, &text)
            .await
            .map(|outcome| ServerMessage::Turn { outcome }),
        ClientMessage::ExpertMessage { text } => state
            .record_message(session_id, MessageRole::Expert, &text)
            .await
            .map(|outcome| ServerMessage::Turn { outcome }),
        ClientMessage::Pause => state
            .orchestrator
            .pause(session_id)
            .await
            .map(|changed| ServerMessage::Paused { changed }),
        ClientMessage::Resume => state
            .orchestrator
            .resume(session_id)
            .await
            .map(|changed| ServerMessage::Resumed { changed }),
        ClientMessage::Attach { .. } => {
            return ServerMessage::Error {
                message: "connection is already attached".to_string(),
            };
        }
    };
    result.unwrap_or_else(|e| ServerMessage::Error {
        message: e.to_string(),
    })
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(&msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
