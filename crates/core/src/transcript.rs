use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who emitted a message in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Expert,
    System,
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::User => write!(f, "user"),
            Sender::Expert => write!(f, "expert"),
            Sender::System => write!(f, "system"),
        }
    }
}

/// One entry of the running conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub sender: Sender,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptMessage {
    pub fn new(sender: Sender, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            sender,
            content: content.into(),
            timestamp,
        }
    }

    pub fn user(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(Sender::User, content, timestamp)
    }

    pub fn expert(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self::new(Sender::Expert, content, timestamp)
    }

    /// A message counts as a question when it contains a question mark.
    pub fn is_question(&self) -> bool {
        self.content.contains('?')
    }

    pub fn is_expert_question(&self) -> bool {
        self.sender == Sender::Expert && self.is_question()
    }

    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}

/// Returns the messages emitted at or after `phase_start`, in order.
pub fn phase_slice(
    messages: &[TranscriptMessage],
    phase_start: DateTime<Utc>,
) -> Vec<&TranscriptMessage> {
    messages
        .iter()
        .filter(|m| m.timestamp >= phase_start)
        .collect()
}
