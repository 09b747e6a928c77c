//! Checkpoints and crash recovery.
//!
//! A checkpoint is the full resumable state of one session. Only the latest
//! one is kept per session (`checkpoint/{id}`); each save replaces the
//! previous record. A rolling hash over the serialized record guards against
//! partial or garbled writes. It is not a cryptographic seal.

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::narrative::{EmotionalState, ExpertStyle, NarrativeState};
use crate::phase::SessionType;
use crate::session::CrisisLevel;
use crate::store::{DurableStore, archive_key, checkpoint_key};
use crate::timer::TimerSnapshot;
use crate::transcript::TranscriptMessage;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub current_phase_id: String,
    pub current_phase_name: String,
    pub phase_index: usize,
    pub elapsed_in_phase_ms: i64,
    pub session_elapsed_ms: i64,
    pub message_exchange_count: u32,
    pub last_user_message: Option<String>,
    pub last_expert_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub completed_phases: Vec<String>,
    pub objectives_completed: Vec<String>,
    pub objectives_in_progress: Vec<String>,
    pub objectives_pending: Vec<String>,
    pub techniques_introduced: Vec<String>,
    pub insights_gained: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionSummary {
    pub expert_style: ExpertStyle,
    pub emotional_state: EmotionalState,
    pub crisis_level: CrisisLevel,
    pub style_adaptations: Vec<String>,
    pub user_message_count: u32,
    pub expert_message_count: u32,
    pub user_word_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeApproach {
    ResumeImmediately,
    BriefRecap,
    FullRecap,
    /// The stored state could not be trusted.
    StartFresh,
}

impl ResumeApproach {
    /// Under 5 minutes resume as is, under 30 minutes recap briefly,
    /// otherwise recap fully.
    pub fn after(gap: Duration) -> Self {
        if gap < Duration::minutes(5) {
            Self::ResumeImmediately
        } else if gap < Duration::minutes(30) {
            Self::BriefRecap
        } else {
            Self::FullRecap
        }
    }

    pub fn needs_recap(self) -> bool {
        matches!(self, Self::BriefRecap | Self::FullRecap)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryHints {
    pub interruption_point: String,
    pub recommended_approach: ResumeApproach,
    pub paused_at_save: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub session_id: Uuid,
    pub saved_at: DateTime<Utc>,
    /// Increments with every save of the same session.
    pub sequence: u64,
    pub session_type: SessionType,
    pub theme_id: String,
    pub active: bool,
    pub conversation: ConversationState,
    pub progress: PhaseProgress,
    pub interaction: InteractionSummary,
    pub recovery: RecoveryHints,
    pub timer: TimerSnapshot,
    pub narrative: NarrativeState,
    /// Whole conversation so far.
    pub transcript: Vec<TranscriptMessage>,
    /// Index in `transcript` of the first message of the current phase.
    pub phase_transcript_start: usize,
    #[serde(default)]
    pub checksum: String,
}

impl Checkpoint {
    pub fn compute_checksum(&self) -> std::result::Result<String, serde_json::Error> {
        let mut unsealed = self.clone();
        unsealed.checksum.clear();
        let body = serde_json::to_string(&unsealed)?;
        Ok(format!("{:08x}", rolling_hash(body.as_bytes())))
    }

    pub fn seal(&mut self) -> std::result::Result<(), serde_json::Error> {
        self.checksum = self.compute_checksum()?;
        Ok(())
    }

    pub fn verify(&self) -> bool {
        !self.checksum.is_empty()
            && self
                .compute_checksum()
                .is_ok_and(|expected| expected == self.checksum)
    }
}

/// 32-bit polynomial rolling hash (`h = 31 * h + byte`, wrapping).
pub fn rolling_hash(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .fold(0u32, |h, &b| h.wrapping_mul(31).wrapping_add(u32::from(b)))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveResult {
    pub session_id: Uuid,
    pub saved_at: DateTime<Utc>,
    pub sequence: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverResult {
    pub session_id: Uuid,
    pub data_integrity_verified: bool,
    /// Present only when the checksum matched.
    pub recovered: Option<Checkpoint>,
    pub recommendation: ResumeApproach,
    pub time_since_checkpoint_ms: Option<i64>,
}

/// Summary written under `archive/{id}` when a session ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionArchive {
    pub session_id: Uuid,
    pub session_type: SessionType,
    pub theme_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub final_duration_ms: i64,
    pub planned_duration_ms: i64,
    pub efficiency_score: f64,
    pub completed_phases: Vec<String>,
    pub end_reason: String,
    pub crisis_level: CrisisLevel,
    pub style_adaptations: Vec<String>,
    pub insights_gained: Vec<String>,
}

pub struct CheckpointService {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl CheckpointService {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Seals and stores `checkpoint`, replacing the previous one.
    pub async fn save(&self, mut checkpoint: Checkpoint) -> Result<SaveResult> {
        checkpoint
            .seal()
            .map_err(|e| EngineError::Persistence(e.into()))?;
        let record = serde_json::to_string(&checkpoint).map_err(|e| EngineError::Persistence(e.into()))?;
        self.store
            .put(&checkpoint_key(checkpoint.session_id), record)
            .await?;

        debug!(
            session_id = %checkpoint.session_id,
            sequence = checkpoint.sequence,
            phase = %checkpoint.conversation.current_phase_id,
            "Checkpoint saved"
        );
        Ok(SaveResult {
            session_id: checkpoint.session_id,
            saved_at: checkpoint.saved_at,
            sequence: checkpoint.sequence,
            checksum: checkpoint.checksum,
        })
    }

    /// Loads and verifies the latest checkpoint. A record that fails to parse
    /// or to verify is reported as unverified and never returned.
    pub async fn recover(&self, session_id: Uuid) -> Result<RecoverResult> {
        let record = self
            .store
            .get(&checkpoint_key(session_id))
            .await?
            .ok_or(EngineError::NoCheckpoint(session_id))?;

        let checkpoint = match serde_json::from_str::<Checkpoint>(&record) {
            Ok(checkpoint) if checkpoint.verify() && checkpoint.session_id == session_id => checkpoint,
            Ok(_) => {
                warn!(%session_id, "Checkpoint checksum mismatch, discarding");
                return Ok(Self::untrusted(session_id));
            }
            Err(e) => {
                warn!(%session_id, error = %e, "Checkpoint unreadable, discarding");
                return Ok(Self::untrusted(session_id));
            }
        };

        let gap = self.clock.now() - checkpoint.saved_at;
        let recommendation = ResumeApproach::after(gap);
        info!(
            %session_id,
            sequence = checkpoint.sequence,
            gap_ms = gap.num_milliseconds(),
            ?recommendation,
            "Checkpoint recovered"
        );
        Ok(RecoverResult {
            session_id,
            data_integrity_verified: true,
            recovered: Some(checkpoint),
            recommendation,
            time_since_checkpoint_ms: Some(gap.num_milliseconds()),
        })
    }

    pub async fn archive(&self, archive: &SessionArchive) -> Result<()> {
        let record = serde_json::to_string(archive).map_err(|e| EngineError::Persistence(e.into()))?;
        self.store.put(&archive_key(archive.session_id), record).await?;
        info!(session_id = %archive.session_id, reason = %archive.end_reason, "Session archived");
        Ok(())
    }

    fn untrusted(session_id: Uuid) -> RecoverResult {
        RecoverResult {
            session_id,
            data_integrity_verified: false,
            recovered: None,
            recommendation: ResumeApproach::StartFresh,
            time_since_checkpoint_ms: None,
        }
    }
}
