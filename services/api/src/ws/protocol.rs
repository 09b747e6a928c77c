//! Defines the WebSocket message protocol between the presentation client and the API server.

use cadence_core::{SessionEvent, SessionView, TurnOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Messages sent from the client to the server.
#[derive(Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Binds the connection to a running session. This must be the first message.
    Attach { session_id: Uuid },
    UserMessage { text: String },
    /// A reply produced by the expert side, checked before it is recorded.
    ExpertMessage { text: String },
    Pause,
    Resume,
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Attached {
        session_id: Uuid,
        session: SessionView,
    },
    /// Outcome of a message recorded over this connection.
    Turn { outcome: TurnOutcome },
    /// A background event of the attached session (transition, checkpoint, conclusion).
    Event { event: SessionEvent },
    Paused { changed: bool },
    Resumed { changed: bool },
    /// Reports an error to the client. Fatal only before `attached`.
    Error { message: String },
}
