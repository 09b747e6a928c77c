//! Session entity.
//!
//! Owns everything that belongs to one conversation: the resolved phase
//! sequence, the phase timer, the metrics tracker of the current phase and
//! the narrative memory. Callers serialize access (one owner at a time),
//! so nothing here is synchronized.

use crate::checkpoint::{
    Checkpoint, ConversationState, InteractionSummary, PhaseProgress, RecoveryHints, ResumeApproach,
    SessionArchive,
};
use crate::error::{EngineError, Result};
use crate::metrics::{TransitionMetrics, TransitionMetricsTracker};
use crate::narrative::{EmotionalState, ExpertStyle, NarrativeState};
use crate::phase::{PhaseDefinition, SessionType};
use crate::theme::ThemeConfig;
use crate::timer::{AdjustmentDecision, PhaseTimer, PhaseTimerStart, efficiency_score};
use crate::transcript::{Sender, TranscriptMessage};
use crate::transition::{EvaluationRequest, PhaseClock};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const INSIGHT_MARKERS: [&str; 4] = ["je réalise", "je comprends", "je me rends compte", "j'ai remarqué"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrisisLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl CrisisLevel {
    /// One distress trigger raises the level to high, several to critical.
    /// The level never goes down.
    pub fn escalated(self, trigger_count: usize) -> Self {
        let floor = match trigger_count {
            0 => return self,
            1 => CrisisLevel::High,
            _ => CrisisLevel::Critical,
        };
        self.max(floor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    /// Left the final phase or hit the absolute ceiling.
    Concluded,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SessionParams {
    pub id: Uuid,
    pub session_type: SessionType,
    pub theme_id: String,
    pub expert_style: ExpertStyle,
}

/// Read-only view of a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub session_type: SessionType,
    pub theme_id: String,
    pub status: SessionStatus,
    pub expert_style: ExpertStyle,
    pub current_phase_id: String,
    pub current_phase_name: String,
    pub phase_index: usize,
    pub phase_count: usize,
    pub phase_elapsed_ms: i64,
    pub session_elapsed_ms: i64,
    pub planned_duration_ms: i64,
    pub max_extension_ms: i64,
    pub remaining_ceiling_ms: i64,
    pub phase_progress_percent: f64,
    pub paused: bool,
    pub crisis_level: CrisisLevel,
    pub emotional_state: EmotionalState,
    pub style_adaptations: Vec<String>,
    pub completed_phases: Vec<String>,
    pub metrics: TransitionMetrics,
    pub pending_adjustment: Option<AdjustmentDecision>,
}

#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    session_type: SessionType,
    theme_id: String,
    expert_style: ExpertStyle,
    /// Never empty.
    phases: Vec<PhaseDefinition>,
    phase_index: usize,
    timer: PhaseTimer,
    tracker: TransitionMetricsTracker,
    transcript: Vec<TranscriptMessage>,
    /// Where the current phase begins in `transcript`.
    phase_transcript_start: usize,
    status: SessionStatus,
    final_elapsed: Option<Duration>,
    crisis_level: CrisisLevel,
    emotional_state: EmotionalState,
    style_adaptations: Vec<String>,
    narrative: NarrativeState,
    completed_phases: Vec<String>,
    techniques_introduced: Vec<String>,
    insights_gained: Vec<String>,
    user_message_count: u32,
    expert_message_count: u32,
    user_word_count: u32,
    last_user_message: Option<String>,
    last_expert_message: Option<String>,
    checkpoint_sequence: u64,
}

impl Session {
    /// Creates the session and starts the clock of its first phase.
    pub fn start(
        params: SessionParams,
        phases: Vec<PhaseDefinition>,
        ceiling: Duration,
        auto_save_enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<(Self, PhaseTimerStart)> {
        let Some(first) = phases.first() else {
            return Err(EngineError::UnknownPhase(format!(
                "empty {:?} phase sequence",
                params.session_type
            )));
        };
        let mut timer = PhaseTimer::new(ceiling, now, auto_save_enabled);
        let started = timer.start_phase(first, now);

        let session = Self {
            id: params.id,
            session_type: params.session_type,
            theme_id: params.theme_id,
            expert_style: params.expert_style,
            phases,
            phase_index: 0,
            tracker: TransitionMetricsTracker::new(timer.phase_started_at()),
            timer,
            transcript: Vec::new(),
            phase_transcript_start: 0,
            status: SessionStatus::Active,
            final_elapsed: None,
            crisis_level: CrisisLevel::None,
            emotional_state: EmotionalState::default(),
            style_adaptations: Vec::new(),
            narrative: NarrativeState::default(),
            completed_phases: Vec::new(),
            techniques_introduced: Vec::new(),
            insights_gained: Vec::new(),
            user_message_count: 0,
            expert_message_count: 0,
            user_word_count: 0,
            last_user_message: None,
            last_expert_message: None,
            checkpoint_sequence: 0,
        };
        Ok((session, started))
    }

    /// Rebuilds a session from a verified checkpoint. Every stored timestamp
    /// moves forward by the interruption so downtime is not charged.
    pub fn restore(
        checkpoint: &Checkpoint,
        phases: Vec<PhaseDefinition>,
        ceiling: Duration,
        auto_save_enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let phase_id = &checkpoint.conversation.current_phase_id;
        let phase_index = phases
            .iter()
            .position(|p| &p.id == phase_id)
            .ok_or_else(|| EngineError::UnknownPhase(phase_id.clone()))?;

        let shift = (now - checkpoint.saved_at).max(Duration::zero());
        let timer = PhaseTimer::restore(ceiling, auto_save_enabled, &checkpoint.timer, shift);
        let transcript: Vec<TranscriptMessage> = checkpoint
            .transcript
            .iter()
            .cloned()
            .map(|mut m| {
                m.timestamp += shift;
                m
            })
            .collect();
        let phase_transcript_start = checkpoint.phase_transcript_start.min(transcript.len());
        let tracker = TransitionMetricsTracker::restore(
            timer.phase_started_at(),
            transcript[phase_transcript_start..].to_vec(),
        );
        let interaction = &checkpoint.interaction;

        Ok(Self {
            id: checkpoint.session_id,
            session_type: checkpoint.session_type,
            theme_id: checkpoint.theme_id.clone(),
            expert_style: interaction.expert_style,
            phases,
            phase_index,
            timer,
            tracker,
            transcript,
            phase_transcript_start,
            status: SessionStatus::Active,
            final_elapsed: None,
            crisis_level: interaction.crisis_level,
            emotional_state: interaction.emotional_state,
            style_adaptations: interaction.style_adaptations.clone(),
            narrative: checkpoint.narrative.clone(),
            completed_phases: checkpoint.progress.completed_phases.clone(),
            techniques_introduced: checkpoint.progress.techniques_introduced.clone(),
            insights_gained: checkpoint.progress.insights_gained.clone(),
            user_message_count: interaction.user_message_count,
            expert_message_count: interaction.expert_message_count,
            user_word_count: interaction.user_word_count,
            last_user_message: checkpoint.conversation.last_user_message.clone(),
            last_expert_message: checkpoint.conversation.last_expert_message.clone(),
            checkpoint_sequence: checkpoint.sequence,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session_type(&self) -> SessionType {
        self.session_type
    }

    pub fn theme_id(&self) -> &str {
        &self.theme_id
    }

    pub fn expert_style(&self) -> ExpertStyle {
        self.expert_style
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn current_phase(&self) -> &PhaseDefinition {
        &self.phases[self.phase_index]
    }

    pub fn next_phase(&self) -> Option<&PhaseDefinition> {
        self.phases.get(self.phase_index + 1)
    }

    pub fn timer(&self) -> &PhaseTimer {
        &self.timer
    }

    pub fn timer_mut(&mut self) -> &mut PhaseTimer {
        &mut self.timer
    }

    pub fn metrics(&self) -> &TransitionMetrics {
        self.tracker.metrics()
    }

    pub fn transcript(&self) -> &[TranscriptMessage] {
        &self.transcript
    }

    pub fn narrative_mut(&mut self) -> &mut NarrativeState {
        &mut self.narrative
    }

    pub fn crisis_level(&self) -> CrisisLevel {
        self.crisis_level
    }

    pub fn style_adaptations(&self) -> &[String] {
        &self.style_adaptations
    }

    pub fn completed_phases(&self) -> &[String] {
        &self.completed_phases
    }

    /// Distressed whenever the crisis level is high or worse.
    pub fn emotional_state(&self) -> EmotionalState {
        if self.crisis_level >= CrisisLevel::High {
            EmotionalState::Distressed
        } else {
            self.emotional_state
        }
    }

    pub fn set_emotional_state(&mut self, state: EmotionalState) {
        self.emotional_state = state;
    }

    /// Returns true when the level changed.
    pub fn escalate_crisis(&mut self, trigger_count: usize) -> bool {
        let next = self.crisis_level.escalated(trigger_count);
        if next == self.crisis_level {
            return false;
        }
        warn!(session_id = %self.id, from = ?self.crisis_level, to = ?next, "Crisis level escalated");
        self.crisis_level = next;
        true
    }

    /// Records `adaptation` if the current phase offers it.
    pub fn apply_adaptation(&mut self, adaptation: &str) -> bool {
        if !self.current_phase().allows_adaptation(adaptation) {
            warn!(
                session_id = %self.id,
                phase = %self.current_phase().id,
                adaptation,
                "Adaptation not offered by this phase, ignoring"
            );
            return false;
        }
        if !self.style_adaptations.iter().any(|a| a == adaptation) {
            self.style_adaptations.push(adaptation.to_string());
        }
        true
    }

    /// Appends a message to the transcript and to the current phase slice.
    pub fn record(&mut self, message: TranscriptMessage, theme: Option<&ThemeConfig>) {
        if !message.is_blank() {
            let lowered = message.content.to_lowercase();
            match message.sender {
                Sender::User => {
                    self.user_message_count += 1;
                    self.user_word_count += message.content.split_whitespace().count() as u32;
                    self.last_user_message = Some(message.content.clone());
                    if INSIGHT_MARKERS.iter().any(|m| lowered.contains(m)) {
                        self.insights_gained.push(message.content.clone());
                    }
                }
                Sender::Expert => {
                    self.expert_message_count += 1;
                    self.last_expert_message = Some(message.content.clone());
                    for technique in theme.map(|t| t.related_techniques.as_slice()).unwrap_or_default() {
                        if lowered.contains(&technique.to_lowercase())
                            && !self.techniques_introduced.contains(technique)
                        {
                            self.techniques_introduced.push(technique.clone());
                        }
                    }
                }
                Sender::System => {}
            }
        }
        self.transcript.push(message.clone());
        self.tracker.record(message);
    }

    pub fn phase_clock(&self, now: DateTime<Utc>) -> PhaseClock {
        PhaseClock {
            now,
            phase_started_at: self.timer.phase_started_at(),
            phase_elapsed: self.timer.phase_elapsed(now),
            session_elapsed: self.timer.session_elapsed(now),
            planned_override: self.timer.planned_override(),
        }
    }

    pub fn evaluation_request(&self, now: DateTime<Utc>) -> EvaluationRequest<'_> {
        EvaluationRequest {
            session_id: self.id,
            session_type: self.session_type,
            phase_id: &self.current_phase().id,
            transcript: self.tracker.messages(),
            clock: self.phase_clock(now),
        }
    }

    /// Closes the current phase and starts the next one. Returns `None`
    /// when the current phase was the last.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Option<PhaseTimerStart> {
        let finished = self.current_phase().id.clone();
        if !self.completed_phases.contains(&finished) {
            self.completed_phases.push(finished);
        }
        let next = self.phases.get(self.phase_index + 1)?;
        let started = self.timer.start_phase(next, now);
        self.phase_index += 1;
        self.phase_transcript_start = self.transcript.len();
        self.tracker.reset(self.timer.phase_started_at());
        info!(
            session_id = %self.id,
            phase = %self.current_phase().id,
            planned_ms = started.planned_duration_ms,
            "Phase started"
        );
        Some(started)
    }

    pub fn conclude(&mut self, status: SessionStatus, now: DateTime<Utc>) {
        if self.final_elapsed.is_none() {
            self.final_elapsed = Some(self.timer.session_elapsed(now));
        }
        self.status = status;
    }

    /// Net session time, frozen once the session ended.
    pub fn session_elapsed(&self, now: DateTime<Utc>) -> Duration {
        self.final_elapsed
            .unwrap_or_else(|| self.timer.session_elapsed(now))
    }

    /// Effective plans of the phases run so far plus the catalog plans of
    /// the phases still ahead, capped by the ceiling.
    pub fn planned_total(&self) -> Duration {
        let ahead = self.phases[self.phase_index + 1..]
            .iter()
            .map(PhaseDefinition::planned_duration)
            .fold(Duration::zero(), |acc, d| acc + d);
        (self.timer.planned_so_far() + ahead).min(self.timer.ceiling())
    }

    pub fn progress(&self) -> PhaseProgress {
        let mut progress = PhaseProgress {
            completed_phases: self.completed_phases.clone(),
            techniques_introduced: self.techniques_introduced.clone(),
            insights_gained: self.insights_gained.clone(),
            ..PhaseProgress::default()
        };
        for (index, phase) in self.phases.iter().enumerate() {
            let bucket = if self.completed_phases.contains(&phase.id) {
                &mut progress.objectives_completed
            } else if index == self.phase_index {
                &mut progress.objectives_in_progress
            } else {
                &mut progress.objectives_pending
            };
            bucket.extend(phase.objectives.iter().cloned());
        }
        progress
    }

    /// Captures the resumable state. Each call takes the next sequence number.
    pub fn checkpoint(&mut self, now: DateTime<Utc>) -> Checkpoint {
        self.checkpoint_sequence += 1;
        let phase = self.current_phase();
        let exchanges = self.user_message_count + self.expert_message_count;
        Checkpoint {
            session_id: self.id,
            saved_at: now,
            sequence: self.checkpoint_sequence,
            session_type: self.session_type,
            theme_id: self.theme_id.clone(),
            active: self.is_active(),
            conversation: ConversationState {
                current_phase_id: phase.id.clone(),
                current_phase_name: phase.name.clone(),
                phase_index: self.phase_index,
                elapsed_in_phase_ms: self.timer.phase_elapsed(now).num_milliseconds(),
                session_elapsed_ms: self.session_elapsed(now).num_milliseconds(),
                message_exchange_count: exchanges,
                last_user_message: self.last_user_message.clone(),
                last_expert_message: self.last_expert_message.clone(),
            },
            progress: self.progress(),
            interaction: InteractionSummary {
                expert_style: self.expert_style,
                emotional_state: self.emotional_state,
                crisis_level: self.crisis_level,
                style_adaptations: self.style_adaptations.clone(),
                user_message_count: self.user_message_count,
                expert_message_count: self.expert_message_count,
                user_word_count: self.user_word_count,
            },
            recovery: RecoveryHints {
                interruption_point: format!("{} after {exchanges} exchanges", phase.id),
                recommended_approach: ResumeApproach::ResumeImmediately,
                paused_at_save: self.timer.is_paused(),
            },
            timer: self.timer.snapshot(now),
            narrative: self.narrative.clone(),
            transcript: self.transcript.clone(),
            phase_transcript_start: self.phase_transcript_start,
            checksum: String::new(),
        }
    }

    pub fn archive(&self, now: DateTime<Utc>, end_reason: &str) -> SessionArchive {
        let actual = self.session_elapsed(now);
        let planned = self.planned_total();
        SessionArchive {
            session_id: self.id,
            session_type: self.session_type,
            theme_id: self.theme_id.clone(),
            started_at: self.timer.session_started_at(),
            ended_at: now,
            final_duration_ms: actual.num_milliseconds(),
            planned_duration_ms: planned.num_milliseconds(),
            efficiency_score: efficiency_score(planned, actual),
            completed_phases: self.completed_phases.clone(),
            end_reason: end_reason.to_string(),
            crisis_level: self.crisis_level,
            style_adaptations: self.style_adaptations.clone(),
            insights_gained: self.insights_gained.clone(),
        }
    }

    pub fn view(&self, now: DateTime<Utc>) -> SessionView {
        let phase = self.current_phase();
        SessionView {
            session_id: self.id,
            session_type: self.session_type,
            theme_id: self.theme_id.clone(),
            status: self.status,
            expert_style: self.expert_style,
            current_phase_id: phase.id.clone(),
            current_phase_name: phase.name.clone(),
            phase_index: self.phase_index,
            phase_count: self.phases.len(),
            phase_elapsed_ms: self.timer.phase_elapsed(now).num_milliseconds(),
            session_elapsed_ms: self.session_elapsed(now).num_milliseconds(),
            planned_duration_ms: self.timer.planned().num_milliseconds(),
            max_extension_ms: self.timer.max_extension().num_milliseconds(),
            remaining_ceiling_ms: self.timer.remaining_ceiling(now).num_milliseconds(),
            phase_progress_percent: self.timer.progress_percent(now),
            paused: self.timer.is_paused(),
            crisis_level: self.crisis_level,
            emotional_state: self.emotional_state(),
            style_adaptations: self.style_adaptations.clone(),
            completed_phases: self.completed_phases.clone(),
            metrics: self.tracker.metrics().clone(),
            pending_adjustment: self.timer.pending_adjustment().cloned(),
        }
    }
}
