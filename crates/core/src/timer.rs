//! Adaptive phase timer.
//!
//! Elapsed time is never accumulated tick by tick. It is derived on demand as
//! `now - start - paused`, where `paused` is the sum of closed pause intervals
//! plus the currently open one. Pausing twice is therefore harmless and the
//! figures cannot drift between ticks.

use crate::phase::PhaseDefinition;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Below this much remaining ceiling every adjustment degrades to `Maintain`.
const ADJUSTMENT_FLOOR_MS: i64 = 60_000;
const EXTEND_CAP_MS: i64 = 5 * 60_000;
const EXTEND_CEILING_SHARE: f64 = 0.3;
const EXTEND_CONFIRMATION_MS: i64 = 2 * 60_000;
const COMPRESS_SHARE: f64 = 0.4;
const EMERGENCY_EXTEND_CAP_MS: i64 = 8 * 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimerStart {
    pub planned_duration_ms: i64,
    pub max_extension_ms: i64,
    pub auto_save_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentKind {
    Extend,
    Compress,
    EmergencyExtend,
    Maintain,
}

impl fmt::Display for AdjustmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdjustmentKind::Extend => "extend",
            AdjustmentKind::Compress => "compress",
            AdjustmentKind::EmergencyExtend => "emergency_extend",
            AdjustmentKind::Maintain => "maintain",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentDecision {
    pub requested: AdjustmentKind,
    /// What the timer actually does; `Maintain` when the request degraded.
    pub decision: AdjustmentKind,
    /// Magnitude of the change. Compressions shorten the plan by this amount.
    pub adjustment_duration_ms: i64,
    pub requires_confirmation: bool,
    pub applied: bool,
    pub reason: String,
    pub planned_duration_ms: i64,
    pub remaining_ceiling_ms: i64,
}

/// Timer values persisted in a checkpoint. Any pause still open at save
/// time is folded into the paused totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub session_started_at: DateTime<Utc>,
    pub phase_started_at: DateTime<Utc>,
    pub session_paused_ms: i64,
    pub phase_paused_ms: i64,
    pub catalog_planned_ms: i64,
    pub planned_ms: i64,
    pub max_extension_ms: i64,
    #[serde(default)]
    pub completed_planned_ms: i64,
}

#[derive(Debug, Clone)]
pub struct PhaseTimer {
    ceiling: Duration,
    auto_save_enabled: bool,
    session_started_at: DateTime<Utc>,
    phase_started_at: DateTime<Utc>,
    session_paused: Duration,
    phase_paused: Duration,
    paused_since: Option<DateTime<Utc>>,
    catalog_planned: Duration,
    planned: Duration,
    max_extension: Duration,
    /// Effective plans of the phases already left.
    completed_planned: Duration,
    pending: Option<AdjustmentDecision>,
}

impl PhaseTimer {
    pub fn new(ceiling: Duration, session_started_at: DateTime<Utc>, auto_save_enabled: bool) -> Self {
        Self {
            ceiling,
            auto_save_enabled,
            session_started_at,
            phase_started_at: session_started_at,
            session_paused: Duration::zero(),
            phase_paused: Duration::zero(),
            paused_since: None,
            catalog_planned: Duration::zero(),
            planned: Duration::zero(),
            max_extension: Duration::zero(),
            completed_planned: Duration::zero(),
            pending: None,
        }
    }

    /// Starts the clock of `phase`. The planned duration is clamped to the
    /// remaining ceiling and the clamp becomes the phase's override.
    pub fn start_phase(&mut self, phase: &PhaseDefinition, now: DateTime<Utc>) -> PhaseTimerStart {
        if let Some(since) = self.paused_since {
            // Carry an open pause into the new phase without charging it twice.
            self.session_paused += non_negative(now - since);
            self.paused_since = Some(now);
        }
        self.completed_planned += self.planned;
        self.phase_started_at = now;
        self.phase_paused = Duration::zero();
        self.pending = None;

        let remaining = non_negative(self.remaining_ceiling(now));
        self.catalog_planned = phase.planned_duration();
        self.planned = self.catalog_planned.min(remaining);
        self.max_extension = non_negative(remaining - self.planned);

        PhaseTimerStart {
            planned_duration_ms: self.planned.num_milliseconds(),
            max_extension_ms: self.max_extension.num_milliseconds(),
            auto_save_enabled: self.auto_save_enabled,
        }
    }

    /// Returns false when the timer was already paused.
    pub fn pause(&mut self, now: DateTime<Utc>) -> bool {
        if self.paused_since.is_some() {
            return false;
        }
        self.paused_since = Some(now);
        true
    }

    /// Returns false when the timer was not paused.
    pub fn resume(&mut self, now: DateTime<Utc>) -> bool {
        let Some(since) = self.paused_since.take() else {
            return false;
        };
        let interval = non_negative(now - since);
        self.session_paused += interval;
        self.phase_paused += interval;
        true
    }

    pub fn is_paused(&self) -> bool {
        self.paused_since.is_some()
    }

    pub fn auto_save_enabled(&self) -> bool {
        self.auto_save_enabled
    }

    fn open_pause(&self, now: DateTime<Utc>) -> Duration {
        self.paused_since
            .map_or(Duration::zero(), |since| non_negative(now - since))
    }

    pub fn paused_total(&self, now: DateTime<Utc>) -> Duration {
        self.session_paused + self.open_pause(now)
    }

    pub fn phase_elapsed(&self, now: DateTime<Utc>) -> Duration {
        non_negative(now - self.phase_started_at - self.phase_paused - self.open_pause(now))
    }

    pub fn session_elapsed(&self, now: DateTime<Utc>) -> Duration {
        non_negative(now - self.session_started_at - self.paused_total(now))
    }

    pub fn remaining_ceiling(&self, now: DateTime<Utc>) -> Duration {
        self.ceiling - self.session_elapsed(now)
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn phase_started_at(&self) -> DateTime<Utc> {
        self.phase_started_at
    }

    pub fn session_started_at(&self) -> DateTime<Utc> {
        self.session_started_at
    }

    pub fn planned(&self) -> Duration {
        self.planned
    }

    /// The effective plan when it differs from the catalog entry.
    pub fn planned_override(&self) -> Option<Duration> {
        (self.planned != self.catalog_planned).then_some(self.planned)
    }

    pub fn max_extension(&self) -> Duration {
        self.max_extension
    }

    /// Sum of the effective plans of every phase started so far, the
    /// current one included.
    pub fn planned_so_far(&self) -> Duration {
        self.completed_planned + self.planned
    }

    pub fn pending_adjustment(&self) -> Option<&AdjustmentDecision> {
        self.pending.as_ref()
    }

    /// Share of the planned phase duration already used, in [0, 100].
    pub fn progress_percent(&self, now: DateTime<Utc>) -> f64 {
        let planned = self.planned.num_milliseconds();
        if planned <= 0 {
            return 100.0;
        }
        let ratio = self.phase_elapsed(now).num_milliseconds() as f64 / planned as f64;
        (ratio * 100.0).clamp(0.0, 100.0)
    }

    /// Decides on an adjustment of the current phase plan. Decisions that
    /// need confirmation are parked until [`PhaseTimer::confirm_pending`].
    pub fn request_adjustment(
        &mut self,
        kind: AdjustmentKind,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AdjustmentDecision {
        let remaining = self.remaining_ceiling(now);
        let remaining_ms = remaining.num_milliseconds();

        if remaining_ms <= ADJUSTMENT_FLOOR_MS {
            return self.maintain(
                kind,
                format!("only {remaining_ms} ms left before the session ceiling"),
                remaining_ms,
            );
        }

        let (amount_ms, requires_confirmation) = match kind {
            AdjustmentKind::Extend => {
                let amount = EXTEND_CAP_MS.min(scaled(remaining_ms, EXTEND_CEILING_SHARE));
                (amount, amount > EXTEND_CONFIRMATION_MS)
            }
            AdjustmentKind::Compress => {
                let unused = (self.planned - self.phase_elapsed(now)).num_milliseconds().max(0);
                (scaled(self.planned.num_milliseconds(), COMPRESS_SHARE).min(unused), false)
            }
            AdjustmentKind::EmergencyExtend => (EMERGENCY_EXTEND_CAP_MS.min(remaining_ms), true),
            AdjustmentKind::Maintain => (0, false),
        };

        if amount_ms <= 0 {
            return self.maintain(kind, reason.to_string(), remaining_ms);
        }

        let decision = AdjustmentDecision {
            requested: kind,
            decision: kind,
            adjustment_duration_ms: amount_ms,
            requires_confirmation,
            applied: false,
            reason: reason.to_string(),
            planned_duration_ms: self.planned.num_milliseconds(),
            remaining_ceiling_ms: remaining_ms,
        };

        if requires_confirmation {
            self.pending = Some(decision.clone());
            decision
        } else {
            self.pending = None;
            self.apply(decision, now)
        }
    }

    /// Applies the parked adjustment, if any.
    pub fn confirm_pending(&mut self, now: DateTime<Utc>) -> Option<AdjustmentDecision> {
        let pending = self.pending.take()?;
        Some(self.apply(pending, now))
    }

    fn apply(&mut self, mut decision: AdjustmentDecision, now: DateTime<Utc>) -> AdjustmentDecision {
        let amount = Duration::milliseconds(decision.adjustment_duration_ms);
        self.planned = match decision.decision {
            AdjustmentKind::Compress => non_negative(self.planned - amount),
            AdjustmentKind::Extend | AdjustmentKind::EmergencyExtend => self.planned + amount,
            AdjustmentKind::Maintain => self.planned,
        };
        let remaining = non_negative(self.remaining_ceiling(now));
        self.max_extension = non_negative(remaining - (self.planned - self.phase_elapsed(now)));
        decision.applied = true;
        decision.planned_duration_ms = self.planned.num_milliseconds();
        decision
    }

    fn maintain(&self, requested: AdjustmentKind, reason: String, remaining_ms: i64) -> AdjustmentDecision {
        AdjustmentDecision {
            requested,
            decision: AdjustmentKind::Maintain,
            adjustment_duration_ms: 0,
            requires_confirmation: false,
            applied: false,
            reason,
            planned_duration_ms: self.planned.num_milliseconds(),
            remaining_ceiling_ms: remaining_ms,
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> TimerSnapshot {
        let open = self.open_pause(now);
        TimerSnapshot {
            session_started_at: self.session_started_at,
            phase_started_at: self.phase_started_at,
            session_paused_ms: (self.session_paused + open).num_milliseconds(),
            phase_paused_ms: (self.phase_paused + open).num_milliseconds(),
            catalog_planned_ms: self.catalog_planned.num_milliseconds(),
            planned_ms: self.planned.num_milliseconds(),
            max_extension_ms: self.max_extension.num_milliseconds(),
            completed_planned_ms: self.completed_planned.num_milliseconds(),
        }
    }

    /// Rebuilds a running timer, moving every timestamp forward by `shift`
    /// so the interruption is not charged to the phase or the ceiling.
    pub fn restore(
        ceiling: Duration,
        auto_save_enabled: bool,
        snapshot: &TimerSnapshot,
        shift: Duration,
    ) -> Self {
        Self {
            ceiling,
            auto_save_enabled,
            session_started_at: snapshot.session_started_at + shift,
            phase_started_at: snapshot.phase_started_at + shift,
            session_paused: Duration::milliseconds(snapshot.session_paused_ms),
            phase_paused: Duration::milliseconds(snapshot.phase_paused_ms),
            paused_since: None,
            catalog_planned: Duration::milliseconds(snapshot.catalog_planned_ms),
            planned: Duration::milliseconds(snapshot.planned_ms),
            max_extension: Duration::milliseconds(snapshot.max_extension_ms),
            completed_planned: Duration::milliseconds(snapshot.completed_planned_ms),
            pending: None,
        }
    }
}

/// `min(1, planned / actual)`; a session that took no time is fully efficient.
pub fn efficiency_score(planned: Duration, actual: Duration) -> f64 {
    let actual_ms = actual.num_milliseconds();
    if actual_ms <= 0 {
        return 1.0;
    }
    (planned.num_milliseconds() as f64 / actual_ms as f64).min(1.0)
}

fn non_negative(d: Duration) -> Duration {
    d.max(Duration::zero())
}

fn scaled(ms: i64, share: f64) -> i64 {
    (ms as f64 * share) as i64
}
