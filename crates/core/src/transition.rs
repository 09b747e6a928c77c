//! Transition Decision Engine
//!
//! Turns the metrics of the active phase into a verdict. Rules are checked
//! in a fixed order and the first match wins:
//!
//! 0. net session time reached the absolute ceiling (minus safety margin)
//! 1. expert question count reached the phase's `force_transition_after`
//! 2. the expert asked `consecutive_question_limit` questions in a row
//! 3. net phase time exceeded the planned duration
//! 4. enough user replies, the latest one still fresh (natural transition)
//!
//! Rules 0 to 3 are forced and always outrank rule 4. The engine never
//! fails: an unknown phase is a forced transition and an empty transcript
//! simply yields neutral metrics.

use crate::config::EngineConfig;
use crate::metrics::TransitionMetrics;
use crate::phase::{PhaseCatalog, SessionType};
use crate::transcript::TranscriptMessage;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Continue,
    /// Advisory: the phase is nearly over but the user is still engaged.
    Extend,
    Transition,
    Force,
}

impl Verdict {
    pub fn changes_phase(self) -> bool {
        matches!(self, Verdict::Transition | Verdict::Force)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Continue => "continue",
            Verdict::Extend => "extend",
            Verdict::Transition => "transition",
            Verdict::Force => "force",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionReason {
    SessionCeilingReached { session_elapsed_ms: i64, ceiling_ms: i64 },
    QuestionCeilingExceeded { question_count: u32, limit: u32 },
    ConsecutiveQuestionOverload { streak: u32, limit: u32 },
    DurationExceeded { elapsed_ms: i64, planned_ms: i64 },
    UnknownPhase { phase_id: String },
    ObjectivesMet { user_responses: u32, min_interactions: u32 },
    NearingPlannedDuration { elapsed_ms: i64, planned_ms: i64 },
    WatchdogOverrun { elapsed_ms: i64, planned_ms: i64 },
    InProgress,
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionCeilingReached {
                session_elapsed_ms,
                ceiling_ms,
            } => write!(
                f,
                "absolute session ceiling reached ({session_elapsed_ms} of {ceiling_ms} ms)"
            ),
            Self::QuestionCeilingExceeded {
                question_count,
                limit,
            } => write!(
                f,
                "question ceiling exceeded ({question_count} expert questions, limit {limit})"
            ),
            Self::ConsecutiveQuestionOverload { streak, limit } => write!(
                f,
                "consecutive question overload ({streak} questions without a reply, limit {limit})"
            ),
            Self::DurationExceeded {
                elapsed_ms,
                planned_ms,
            } => write!(f, "phase duration exceeded ({elapsed_ms} of {planned_ms} ms)"),
            Self::UnknownPhase { phase_id } => write!(f, "unknown phase '{phase_id}'"),
            Self::ObjectivesMet {
                user_responses,
                min_interactions,
            } => write!(
                f,
                "phase objectives met ({user_responses} replies, minimum {min_interactions})"
            ),
            Self::NearingPlannedDuration {
                elapsed_ms,
                planned_ms,
            } => write!(
                f,
                "phase nearing its planned duration ({elapsed_ms} of {planned_ms} ms)"
            ),
            Self::WatchdogOverrun {
                elapsed_ms,
                planned_ms,
            } => write!(
                f,
                "watchdog: phase stalled past its plan ({elapsed_ms} of {planned_ms} ms)"
            ),
            Self::InProgress => f.write_str("phase in progress"),
        }
    }
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionDecision {
    pub verdict: Verdict,
    pub reason: TransitionReason,
    pub forced: bool,
    /// The session must conclude rather than move to another phase.
    pub terminal: bool,
    pub metrics: TransitionMetrics,
}

impl TransitionDecision {
    fn forced(reason: TransitionReason, metrics: TransitionMetrics) -> Self {
        Self {
            verdict: Verdict::Force,
            reason,
            forced: true,
            terminal: false,
            metrics,
        }
    }

    /// Forced transition raised by the stall watchdog rather than by a message.
    pub fn watchdog_overrun(elapsed: Duration, planned: Duration, metrics: TransitionMetrics) -> Self {
        Self::forced(
            TransitionReason::WatchdogOverrun {
                elapsed_ms: elapsed.num_milliseconds(),
                planned_ms: planned.num_milliseconds(),
            },
            metrics,
        )
    }

    fn unforced(verdict: Verdict, reason: TransitionReason, metrics: TransitionMetrics) -> Self {
        Self {
            verdict,
            reason,
            forced: false,
            terminal: false,
            metrics,
        }
    }
}

/// Net timing of the phase being evaluated, as accounted by the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseClock {
    pub now: DateTime<Utc>,
    pub phase_started_at: DateTime<Utc>,
    /// Phase time net of paused intervals.
    pub phase_elapsed: Duration,
    /// Session time net of paused intervals.
    pub session_elapsed: Duration,
    /// Effective planned duration when it differs from the catalog entry.
    pub planned_override: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct EvaluationRequest<'a> {
    pub session_id: Uuid,
    pub session_type: SessionType,
    pub phase_id: &'a str,
    /// Messages of the current phase; older entries are ignored.
    pub transcript: &'a [TranscriptMessage],
    pub clock: PhaseClock,
}

#[derive(Debug, Clone)]
struct DecisionPolicy {
    terminal_threshold: Duration,
    session_ceiling: Duration,
    consecutive_question_limit: u32,
    response_freshness: Duration,
    extend_advice_ratio: f64,
}

#[derive(Debug, Clone)]
pub struct TransitionDecisionEngine {
    catalog: Arc<PhaseCatalog>,
    policy: DecisionPolicy,
}

impl TransitionDecisionEngine {
    pub fn new(catalog: Arc<PhaseCatalog>, config: &EngineConfig) -> Self {
        Self {
            catalog,
            policy: DecisionPolicy {
                terminal_threshold: config.terminal_threshold(),
                session_ceiling: config.session_ceiling,
                consecutive_question_limit: config.consecutive_question_limit,
                response_freshness: config.response_freshness,
                extend_advice_ratio: config.extend_advice_ratio,
            },
        }
    }

    pub fn evaluate(&self, request: &EvaluationRequest<'_>) -> TransitionDecision {
        let clock = request.clock;
        let metrics = TransitionMetrics::from_transcript(request.transcript, clock.phase_started_at);

        if clock.session_elapsed >= self.policy.terminal_threshold {
            let mut decision = TransitionDecision::forced(
                TransitionReason::SessionCeilingReached {
                    session_elapsed_ms: clock.session_elapsed.num_milliseconds(),
                    ceiling_ms: self.policy.session_ceiling.num_milliseconds(),
                },
                metrics,
            );
            decision.terminal = true;
            warn!(session_id = %request.session_id, reason = %decision.reason, "Forcing session conclusion");
            return decision;
        }

        let Some(phase) = self.catalog.find(request.session_type, request.phase_id) else {
            warn!(session_id = %request.session_id, phase = %request.phase_id, "Unknown phase, forcing progress");
            return TransitionDecision::forced(
                TransitionReason::UnknownPhase {
                    phase_id: request.phase_id.to_string(),
                },
                metrics,
            );
        };

        let planned = clock.planned_override.unwrap_or_else(|| phase.planned_duration());

        let decision = if phase.force_transition_after > 0
            && metrics.question_count >= phase.force_transition_after
        {
            TransitionDecision::forced(
                TransitionReason::QuestionCeilingExceeded {
                    question_count: metrics.question_count,
                    limit: phase.force_transition_after,
                },
                metrics,
            )
        } else if metrics.consecutive_expert_questions >= self.policy.consecutive_question_limit {
            TransitionDecision::forced(
                TransitionReason::ConsecutiveQuestionOverload {
                    streak: metrics.consecutive_expert_questions,
                    limit: self.policy.consecutive_question_limit,
                },
                metrics,
            )
        } else if clock.phase_elapsed > planned {
            TransitionDecision::forced(
                TransitionReason::DurationExceeded {
                    elapsed_ms: clock.phase_elapsed.num_milliseconds(),
                    planned_ms: planned.num_milliseconds(),
                },
                metrics,
            )
        } else {
            let fresh = metrics
                .last_user_response_at
                .is_some_and(|at| clock.now - at <= self.policy.response_freshness);
            let near_end = clock.phase_elapsed.num_milliseconds() as f64
                >= planned.num_milliseconds() as f64 * self.policy.extend_advice_ratio;

            if fresh && metrics.user_response_count >= phase.min_interactions {
                TransitionDecision::unforced(
                    Verdict::Transition,
                    TransitionReason::ObjectivesMet {
                        user_responses: metrics.user_response_count,
                        min_interactions: phase.min_interactions,
                    },
                    metrics,
                )
            } else if fresh && near_end {
                TransitionDecision::unforced(
                    Verdict::Extend,
                    TransitionReason::NearingPlannedDuration {
                        elapsed_ms: clock.phase_elapsed.num_milliseconds(),
                        planned_ms: planned.num_milliseconds(),
                    },
                    metrics,
                )
            } else {
                TransitionDecision::unforced(Verdict::Continue, TransitionReason::InProgress, metrics)
            }
        };

        debug!(
            session_id = %request.session_id,
            phase = %phase.id,
            verdict = %decision.verdict,
            reason = %decision.reason,
            "Evaluated phase"
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn engine() -> TransitionDecisionEngine {
        TransitionDecisionEngine::new(Arc::new(PhaseCatalog::builtin()), &EngineConfig::default())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, 3, 19, 0, 0).unwrap()
    }

    fn clock_at(elapsed: Duration) -> PhaseClock {
        PhaseClock {
            now: t0() + elapsed,
            phase_started_at: t0(),
            phase_elapsed: elapsed,
            session_elapsed: elapsed,
            planned_override: None,
        }
    }

    fn evaluate(phase_id: &str, transcript: &[TranscriptMessage], clock: PhaseClock) -> TransitionDecision {
        engine().evaluate(&EvaluationRequest {
            session_id: Uuid::nil(),
            session_type: SessionType::Standard,
            phase_id,
            transcript,
            clock,
        })
    }

    fn at(secs: i64) -> DateTime<Utc> {
        t0() + Duration::seconds(secs)
    }

    #[test]
    fn test_question_ceiling_forces_and_names_the_ceiling() {
        // `review` forces after 5 expert questions.
        let transcript = vec![
            TranscriptMessage::expert("Comment s'est passée la semaine ?", at(1)),
            TranscriptMessage::user("Bien.", at(10)),
            TranscriptMessage::expert("Avez-vous pratiqué ?", at(20)),
            TranscriptMessage::expert("Combien de fois ?", at(25)),
            TranscriptMessage::expert("À quel moment ?", at(30)),
            TranscriptMessage::expert("Qu'avez-vous ressenti ?", at(35)),
        ];

        let decision = evaluate("review", &transcript, clock_at(Duration::seconds(40)));

        assert_eq!(decision.verdict, Verdict::Force);
        assert!(decision.forced);
        assert!(matches!(
            decision.reason,
            TransitionReason::QuestionCeilingExceeded { question_count: 5, limit: 5 }
        ));
        assert!(decision.reason.to_string().contains("ceiling"));
        assert_eq!(decision.metrics.user_response_count, 1);
    }

    #[test]
    fn test_three_consecutive_questions_force_regardless_of_other_signals() {
        let transcript = vec![
            TranscriptMessage::user("Je suis prêt.", at(1)),
            TranscriptMessage::user("Vraiment prêt.", at(2)),
            TranscriptMessage::expert("Une question ?", at(3)),
            TranscriptMessage::expert("Une autre ?", at(4)),
            TranscriptMessage::expert("Et encore ?", at(5)),
        ];

        for elapsed in [Duration::seconds(6), Duration::minutes(2)] {
            let decision = evaluate("core_content", &transcript, clock_at(elapsed));
            assert_eq!(decision.verdict, Verdict::Force);
            assert!(matches!(
                decision.reason,
                TransitionReason::ConsecutiveQuestionOverload { streak: 3, limit: 3 }
            ));
        }
    }

    #[test]
    fn test_duration_exceeded_outranks_natural_completion() {
        // check_in: 3 minutes, 2 interactions.
        let transcript = vec![
            TranscriptMessage::user("Bonjour", at(170)),
            TranscriptMessage::user("Ça va", at(185)),
        ];
        let decision = evaluate("check_in", &transcript, clock_at(Duration::seconds(190)));
        assert_eq!(decision.verdict, Verdict::Force);
        assert!(matches!(decision.reason, TransitionReason::DurationExceeded { .. }));
    }

    #[test]
    fn test_planned_override_is_honoured() {
        let mut clock = clock_at(Duration::seconds(100));
        clock.planned_override = Some(Duration::seconds(90));
        let decision = evaluate("check_in", &[], clock);
        assert!(matches!(
            decision.reason,
            TransitionReason::DurationExceeded { planned_ms: 90_000, .. }
        ));
    }

    #[test]
    fn test_natural_transition_requires_fresh_reply() {
        let transcript = vec![
            TranscriptMessage::expert("Comment vous sentez-vous ?", at(5)),
            TranscriptMessage::user("Fatigué", at(20)),
            TranscriptMessage::user("Mais content d'être là", at(30)),
        ];

        let fresh = evaluate("check_in", &transcript, clock_at(Duration::seconds(60)));
        assert_eq!(fresh.verdict, Verdict::Transition);
        assert!(!fresh.forced);

        let stale = evaluate("check_in", &transcript, clock_at(Duration::seconds(95)));
        assert_eq!(stale.verdict, Verdict::Continue);
        assert_eq!(stale.reason, TransitionReason::InProgress);
    }

    #[test]
    fn test_extend_advice_near_planned_end() {
        // core_content: 9 minutes, 4 interactions. 8 minutes in, one fresh reply.
        let transcript = vec![TranscriptMessage::user("Je commence à comprendre", at(470))];
        let decision = evaluate("core_content", &transcript, clock_at(Duration::minutes(8)));
        assert_eq!(decision.verdict, Verdict::Extend);
        assert!(!decision.forced);
    }

    #[test]
    fn test_unknown_phase_forces_progress() {
        let decision = evaluate("meditation_libre", &[], clock_at(Duration::seconds(1)));
        assert_eq!(decision.verdict, Verdict::Force);
        assert!(matches!(decision.reason, TransitionReason::UnknownPhase { .. }));
    }

    #[test]
    fn test_empty_transcript_continues_with_neutral_metrics() {
        let decision = evaluate("practice", &[], clock_at(Duration::seconds(10)));
        assert_eq!(decision.verdict, Verdict::Continue);
        assert_eq!(decision.metrics, TransitionMetrics::empty(t0()));
    }

    #[test]
    fn test_session_ceiling_is_terminal() {
        let mut clock = clock_at(Duration::seconds(30));
        clock.session_elapsed = Duration::minutes(29);
        let decision = evaluate("practice", &[], clock);
        assert_eq!(decision.verdict, Verdict::Force);
        assert!(decision.terminal);
        assert!(matches!(decision.reason, TransitionReason::SessionCeilingReached { .. }));
    }
}
