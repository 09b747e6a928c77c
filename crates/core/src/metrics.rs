//! Transition Metrics Tracker
//!
//! Per-phase counters derived from the transcript slice of the active phase.
//! The counters are always recomputed from the slice rather than patched
//! incrementally, so they cannot drift from the messages they describe.

use crate::transcript::{Sender, TranscriptMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionMetrics {
    /// Expert messages containing a question in this phase.
    pub question_count: u32,
    /// Expert questions since the last user reply.
    pub consecutive_expert_questions: u32,
    pub user_response_count: u32,
    pub last_user_response_at: Option<DateTime<Utc>>,
    pub phase_started_at: DateTime<Utc>,
}

impl TransitionMetrics {
    pub fn empty(phase_started_at: DateTime<Utc>) -> Self {
        Self {
            question_count: 0,
            consecutive_expert_questions: 0,
            user_response_count: 0,
            last_user_response_at: None,
            phase_started_at,
        }
    }

    /// Counts the messages emitted at or after `phase_started_at`. Blank
    /// messages and anything older than the phase start are ignored.
    pub fn from_transcript<'a, I>(messages: I, phase_started_at: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = &'a TranscriptMessage>,
    {
        let mut metrics = Self::empty(phase_started_at);
        for message in messages {
            if message.timestamp < phase_started_at || message.is_blank() {
                continue;
            }
            match message.sender {
                Sender::Expert if message.is_question() => {
                    metrics.question_count += 1;
                    metrics.consecutive_expert_questions += 1;
                }
                Sender::User => {
                    metrics.user_response_count += 1;
                    metrics.consecutive_expert_questions = 0;
                    metrics.last_user_response_at = Some(
                        metrics
                            .last_user_response_at
                            .map_or(message.timestamp, |t| t.max(message.timestamp)),
                    );
                }
                Sender::Expert | Sender::System => {}
            }
        }
        metrics
    }
}

/// Holds the transcript slice of the current phase and its metrics.
#[derive(Debug, Clone)]
pub struct TransitionMetricsTracker {
    phase_started_at: DateTime<Utc>,
    messages: Vec<TranscriptMessage>,
    metrics: TransitionMetrics,
}

impl TransitionMetricsTracker {
    pub fn new(phase_started_at: DateTime<Utc>) -> Self {
        Self {
            phase_started_at,
            messages: Vec::new(),
            metrics: TransitionMetrics::empty(phase_started_at),
        }
    }

    /// Rebuilds a tracker from a stored phase slice.
    pub fn restore(phase_started_at: DateTime<Utc>, messages: Vec<TranscriptMessage>) -> Self {
        let mut tracker = Self::new(phase_started_at);
        tracker.messages = messages
            .into_iter()
            .filter(|m| m.timestamp >= phase_started_at)
            .collect();
        tracker.recompute();
        tracker
    }

    /// Appends a message to the phase slice. Returns false when the message
    /// predates the phase and was dropped.
    pub fn record(&mut self, message: TranscriptMessage) -> bool {
        if message.timestamp < self.phase_started_at {
            return false;
        }
        self.messages.push(message);
        self.recompute();
        true
    }

    /// Empties the slice for a new phase.
    pub fn reset(&mut self, phase_started_at: DateTime<Utc>) {
        self.phase_started_at = phase_started_at;
        self.messages.clear();
        self.metrics = TransitionMetrics::empty(phase_started_at);
    }

    pub fn metrics(&self) -> &TransitionMetrics {
        &self.metrics
    }

    pub fn messages(&self) -> &[TranscriptMessage] {
        &self.messages
    }

    pub fn phase_started_at(&self) -> DateTime<Utc> {
        self.phase_started_at
    }

    fn recompute(&mut self) {
        self.metrics = TransitionMetrics::from_transcript(&self.messages, self.phase_started_at);
    }
}
