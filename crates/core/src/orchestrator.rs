//! Session Orchestrator
//!
//! Entry point of the engine. Every session lives behind its own mutex so a
//! message is recorded, evaluated and applied atomically, while different
//! sessions proceed in parallel. Each active session also runs two
//! background tasks: a periodic auto-save and a stall watchdog that forces
//! a transition when a phase overruns its plan with nobody talking.
//!
//! The session mutex is never held across store I/O. Checkpoints are built
//! under the lock and handed to a per-session writer task, which applies
//! them in the order they were taken.

use crate::checkpoint::{Checkpoint, CheckpointService, ResumeApproach, SaveResult, SessionArchive};
use crate::clock::Clock;
use crate::coherence::{OutgoingValidation, ThematicAnalysis, ThematicCoherenceValidator};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result, StoreError};
use crate::metrics::TransitionMetrics;
use crate::narrative::{Bridge, BridgeRequest, EmotionalState, ExpertStyle, NarrativeSelector};
use crate::phase::{PhaseCatalog, SessionType};
use crate::session::{Session, SessionParams, SessionStatus, SessionView};
use crate::store::DurableStore;
use crate::theme::ThemeRegistry;
use crate::timer::{AdjustmentDecision, AdjustmentKind, PhaseTimerStart, efficiency_score};
use crate::transcript::TranscriptMessage;
use crate::transition::{TransitionDecision, TransitionDecisionEngine, TransitionReason, Verdict};
use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSession {
    pub session_type: SessionType,
    pub theme_id: String,
    #[serde(default)]
    pub expert_style: ExpertStyle,
    /// Caller-chosen id; a fresh one is generated when absent.
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStarted {
    pub session_id: Uuid,
    pub current_phase_id: String,
    pub current_phase_name: String,
    pub timer: PhaseTimerStart,
    pub opening_text: Option<String>,
    pub checkpoint: SaveResult,
}

/// What the presentation layer receives after each message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOutcome {
    pub session_id: Uuid,
    pub verdict: Verdict,
    pub reason: TransitionReason,
    pub reason_text: String,
    pub forced: bool,
    pub bridge_text: Option<String>,
    pub recentering_hint: Option<String>,
    pub phase_progress_percent: f64,
    /// Phase that was left, when this turn changed phase.
    pub previous_phase: Option<String>,
    pub current_phase: String,
    pub next_phase: Option<String>,
    pub session_complete: bool,
    pub metrics: TransitionMetrics,
    pub analysis: Option<ThematicAnalysis>,
    /// Expert text as recorded, after prohibited-term excision.
    pub corrected_text: Option<String>,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopReport {
    pub session_id: Uuid,
    pub final_duration_ms: i64,
    pub planned_duration_ms: i64,
    pub efficiency_score: f64,
    pub final_save_completed: bool,
    pub completed_phases: Vec<String>,
}

/// Result of a recovery attempt. When the checkpoint fails verification
/// nothing is resumed: `session` and `resume_text` are absent and the
/// recommendation is to start fresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryOutcome {
    pub session_id: Uuid,
    pub data_integrity_verified: bool,
    pub recommendation: ResumeApproach,
    pub time_since_checkpoint_ms: Option<i64>,
    pub resume_text: Option<String>,
    pub session: Option<SessionView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    PhaseChanged {
        session_id: Uuid,
        from_phase: String,
        to_phase: String,
        forced: bool,
        reason: String,
        bridge_text: String,
    },
    WatchdogForcedTransition {
        session_id: Uuid,
        from_phase: String,
        to_phase: Option<String>,
        reason: String,
    },
    CheckpointSaved {
        session_id: Uuid,
        sequence: u64,
        saved_at: DateTime<Utc>,
    },
    CheckpointFailed {
        session_id: Uuid,
        error: String,
    },
    SessionConcluded {
        session_id: Uuid,
        reason: String,
        final_duration_ms: i64,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::PhaseChanged { session_id, .. }
            | Self::WatchdogForcedTransition { session_id, .. }
            | Self::CheckpointSaved { session_id, .. }
            | Self::CheckpointFailed { session_id, .. }
            | Self::SessionConcluded { session_id, .. } => *session_id,
        }
    }
}

struct PhaseChange {
    from: String,
    to: Option<String>,
    bridge: Option<Bridge>,
}

enum Persist {
    Checkpoint(Checkpoint, Option<oneshot::Sender<Result<SaveResult>>>),
    Archive(SessionArchive),
    Flush(oneshot::Sender<()>),
}

/// Sending half of a session's writer task.
#[derive(Clone)]
struct PersistQueue {
    session_id: Uuid,
    requests: mpsc::UnboundedSender<Persist>,
}

impl PersistQueue {
    fn spawn(shared: Arc<Shared>, session_id: Uuid) -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let span = info_span!("checkpoint_writer", %session_id);
        tokio::spawn(writer_loop(shared, session_id, rx).instrument(span));
        Self { session_id, requests }
    }

    fn send(&self, request: Persist) -> bool {
        if self.requests.send(request).is_err() {
            warn!(session_id = %self.session_id, "Checkpoint writer stopped, request dropped");
            return false;
        }
        true
    }

    /// Queues a save. Failures are logged and published by the writer.
    fn checkpoint(&self, checkpoint: Checkpoint) {
        self.send(Persist::Checkpoint(checkpoint, None));
    }

    fn archive(&self, archive: SessionArchive) {
        self.send(Persist::Archive(archive));
    }

    /// Queues a save and waits for the store's answer.
    async fn save(&self, checkpoint: Checkpoint) -> Result<SaveResult> {
        let (ack, done) = oneshot::channel();
        if !self.send(Persist::Checkpoint(checkpoint, Some(ack))) {
            return Err(writer_gone());
        }
        done.await.map_err(|_| writer_gone())?
    }

    /// Waits until every request queued so far has been written.
    async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        if !self.send(Persist::Flush(ack)) {
            return Err(writer_gone());
        }
        done.await.map_err(|_| writer_gone())
    }
}

fn writer_gone() -> EngineError {
    EngineError::Persistence(StoreError::Unavailable("checkpoint writer stopped".into()))
}

struct SessionRuntime {
    session: Session,
    rng: StdRng,
    persist: PersistQueue,
}

struct SessionHandle {
    runtime: Arc<Mutex<SessionRuntime>>,
    persist: PersistQueue,
    tasks: Vec<JoinHandle<()>>,
}

/// Claim on a session id while it is being started or recovered.
struct Reservation<'a> {
    starting: &'a std::sync::Mutex<HashSet<Uuid>>,
    session_id: Uuid,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.starting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.session_id);
    }
}

impl SessionHandle {
    fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Shared {
    config: EngineConfig,
    themes: Arc<ThemeRegistry>,
    catalog: Arc<PhaseCatalog>,
    engine: TransitionDecisionEngine,
    coherence: ThematicCoherenceValidator,
    narrative: NarrativeSelector,
    checkpoints: CheckpointService,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<SessionEvent>,
}

pub struct SessionOrchestrator {
    shared: Arc<Shared>,
    sessions: RwLock<HashMap<Uuid, SessionHandle>>,
    starting: std::sync::Mutex<HashSet<Uuid>>,
}

impl SessionOrchestrator {
    pub fn new(
        config: EngineConfig,
        themes: Arc<ThemeRegistry>,
        catalog: Arc<PhaseCatalog>,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Shared {
            engine: TransitionDecisionEngine::new(catalog.clone(), &config),
            coherence: ThematicCoherenceValidator::new(themes.clone(), config.coherence.clone()),
            narrative: NarrativeSelector::new(config.narrative.clone()),
            checkpoints: CheckpointService::new(store, clock.clone()),
            config,
            themes,
            catalog,
            clock,
            events,
        };
        Self {
            shared: Arc::new(shared),
            sessions: RwLock::new(HashMap::new()),
            starting: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Loads both catalogs from the store (built-in ones when absent) and
    /// builds the orchestrator.
    pub async fn bootstrap(
        config: EngineConfig,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let themes = ThemeRegistry::load(store.as_ref()).await?;
        let catalog = PhaseCatalog::load(store.as_ref()).await?;
        Ok(Self::new(config, Arc::new(themes), Arc::new(catalog), store, clock))
    }

    pub fn themes(&self) -> Arc<ThemeRegistry> {
        self.shared.themes.clone()
    }

    pub fn catalog(&self) -> Arc<PhaseCatalog> {
        self.shared.catalog.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    #[instrument(skip(self, request), fields(session_type = ?request.session_type, theme = %request.theme_id))]
    pub async fn start_session(&self, request: StartSession) -> Result<SessionStarted> {
        let session_id = request.session_id.unwrap_or_else(Uuid::new_v4);
        let _reservation = self.reserve(session_id).await?;
        if !self.shared.themes.contains(&request.theme_id) {
            warn!(theme = %request.theme_id, "Unknown theme, coherence checks will stay neutral");
        }

        let config = &self.shared.config;
        let now = self.shared.clock.now();
        let phases = self.shared.catalog.sequence(request.session_type).to_vec();
        let params = SessionParams {
            id: session_id,
            session_type: request.session_type,
            theme_id: request.theme_id,
            expert_style: request.expert_style,
        };
        let (mut session, timer) =
            Session::start(params, phases, config.session_ceiling, config.autosave_enabled(), now)?;

        let mut rng = self.shared.session_rng();
        let first_name = session.current_phase().name.clone();
        let style = session.expert_style();
        let opening = self
            .shared
            .narrative
            .select_opening(session.narrative_mut(), style, &first_name, &mut rng);

        // A session that cannot be persisted is not started.
        let checkpoint = self.shared.save_checkpoint(session.checkpoint(now)).await?;

        let started = SessionStarted {
            session_id,
            current_phase_id: session.current_phase().id.clone(),
            current_phase_name: first_name,
            timer,
            opening_text: opening.map(|b| b.text),
            checkpoint,
        };
        self.register(session_id, session, rng).await;
        info!(%session_id, phase = %started.current_phase_id, "Session started");
        Ok(started)
    }

    #[instrument(skip(self, content))]
    pub async fn record_user_message(&self, session_id: Uuid, content: &str) -> Result<TurnOutcome> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        ensure_active(&rt.session)?;

        let analysis = self
            .shared
            .coherence
            .analyze_message(content, rt.session.theme_id());
        rt.session.escalate_crisis(analysis.severity_triggers.len());
        if analysis.assessment.is_digression {
            info!(
                %session_id,
                severity = ?analysis.assessment.severity,
                strategy = ?analysis.assessment.recommended_strategy,
                "Digression detected"
            );
        }

        let now = self.shared.clock.now();
        let message = TranscriptMessage::user(content, now);
        Ok(self.shared.turn(&mut rt, message, Some(analysis), None, now))
    }

    /// Records an expert reply. Prohibited terms are excised before the
    /// text enters the transcript.
    #[instrument(skip(self, content))]
    pub async fn record_expert_message(&self, session_id: Uuid, content: &str) -> Result<TurnOutcome> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        ensure_active(&rt.session)?;

        let validation = self
            .shared
            .coherence
            .validate_outgoing(content, rt.session.theme_id());
        if !validation.compliant {
            debug!(%session_id, violations = ?validation.violations, "Expert reply off theme");
        }

        let now = self.shared.clock.now();
        let message = TranscriptMessage::expert(validation.corrected_text.clone(), now);
        Ok(self.shared.turn(&mut rt, message, None, Some(validation), now))
    }

    /// Evaluates the current phase without recording a message.
    pub async fn evaluate(&self, session_id: Uuid) -> Result<TurnOutcome> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        ensure_active(&rt.session)?;
        let now = self.shared.clock.now();
        let decision = self.shared.engine.evaluate(&rt.session.evaluation_request(now));
        let change = self.shared.apply_decision(&mut rt, &decision, now);
        Ok(self.shared.outcome(&rt.session, decision, change, None, None, now))
    }

    /// Starts a processing interval. Returns false if one was already open.
    pub async fn pause(&self, session_id: Uuid) -> Result<bool> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        ensure_active(&rt.session)?;
        let now = self.shared.clock.now();
        Ok(rt.session.timer_mut().pause(now))
    }

    pub async fn resume(&self, session_id: Uuid) -> Result<bool> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        ensure_active(&rt.session)?;
        let now = self.shared.clock.now();
        Ok(rt.session.timer_mut().resume(now))
    }

    #[instrument(skip(self, reason))]
    pub async fn request_adjustment(
        &self,
        session_id: Uuid,
        kind: AdjustmentKind,
        reason: &str,
    ) -> Result<AdjustmentDecision> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        ensure_active(&rt.session)?;
        let now = self.shared.clock.now();
        let decision = rt.session.timer_mut().request_adjustment(kind, reason, now);
        info!(
            %session_id,
            requested = %decision.requested,
            decision = %decision.decision,
            amount_ms = decision.adjustment_duration_ms,
            pending = decision.requires_confirmation,
            "Adjustment decided"
        );
        Ok(decision)
    }

    /// Applies the adjustment waiting for confirmation, if any.
    pub async fn confirm_adjustment(&self, session_id: Uuid) -> Result<Option<AdjustmentDecision>> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        ensure_active(&rt.session)?;
        let now = self.shared.clock.now();
        Ok(rt.session.timer_mut().confirm_pending(now))
    }

    pub async fn apply_adaptation(&self, session_id: Uuid, adaptation: &str) -> Result<bool> {
        let runtime = self.runtime(session_id).await?;
        let mut rt = runtime.lock().await;
        ensure_active(&rt.session)?;
        Ok(rt.session.apply_adaptation(adaptation))
    }

    pub async fn set_emotional_state(&self, session_id: Uuid, state: EmotionalState) -> Result<()> {
        let runtime = self.runtime(session_id).await?;
        runtime.lock().await.session.set_emotional_state(state);
        Ok(())
    }

    /// Writes a checkpoint now. Unlike auto-save, failures are returned.
    pub async fn checkpoint(&self, session_id: Uuid) -> Result<SaveResult> {
        let runtime = self.runtime(session_id).await?;
        let (checkpoint, persist) = {
            let mut rt = runtime.lock().await;
            let now = self.shared.clock.now();
            (rt.session.checkpoint(now), rt.persist.clone())
        };
        persist.save(checkpoint).await
    }

    /// Waits until every checkpoint and archive queued for the session has
    /// reached the store.
    pub async fn flush(&self, session_id: Uuid) -> Result<()> {
        let persist = self
            .sessions
            .read()
            .await
            .get(&session_id)
            .map(|handle| handle.persist.clone())
            .ok_or(EngineError::UnknownSession(session_id))?;
        persist.flush().await
    }

    pub async fn status(&self, session_id: Uuid) -> Result<SessionView> {
        let runtime = self.runtime(session_id).await?;
        let rt = runtime.lock().await;
        Ok(rt.session.view(self.shared.clock.now()))
    }

    pub async fn transcript(&self, session_id: Uuid) -> Result<Vec<TranscriptMessage>> {
        let runtime = self.runtime(session_id).await?;
        let rt = runtime.lock().await;
        Ok(rt.session.transcript().to_vec())
    }

    /// Rebuilds a session from its latest checkpoint after an interruption.
    /// A checkpoint that fails verification is never resumed: the outcome
    /// reports it unverified and recommends a fresh start.
    #[instrument(skip(self))]
    pub async fn recover(&self, session_id: Uuid) -> Result<RecoveryOutcome> {
        let _reservation = self.reserve(session_id).await?;

        let result = self.shared.checkpoints.recover(session_id).await?;
        let Some(checkpoint) = result.recovered else {
            error!(%session_id, "Recovery refused, checkpoint failed verification");
            return Ok(RecoveryOutcome {
                session_id,
                data_integrity_verified: false,
                recommendation: result.recommendation,
                time_since_checkpoint_ms: None,
                resume_text: None,
                session: None,
            });
        };
        if !checkpoint.active {
            return Err(EngineError::SessionInactive(session_id));
        }
        let config = &self.shared.config;
        if checkpoint.conversation.session_elapsed_ms >= config.terminal_threshold().num_milliseconds() {
            return Err(EngineError::TimingViolation {
                elapsed_ms: checkpoint.conversation.session_elapsed_ms,
            });
        }

        let now = self.shared.clock.now();
        let phases = self.shared.catalog.sequence(checkpoint.session_type).to_vec();
        let mut session = Session::restore(
            &checkpoint,
            phases,
            config.session_ceiling,
            config.autosave_enabled(),
            now,
        )?;
        let phase_name = session.current_phase().name.clone();
        let bridge = self.shared.narrative.resume_bridge(
            session.narrative_mut(),
            &phase_name,
            result.recommendation.needs_recap(),
        );
        self.shared.save_checkpoint(session.checkpoint(now)).await?;

        let outcome = RecoveryOutcome {
            session_id,
            data_integrity_verified: result.data_integrity_verified,
            recommendation: result.recommendation,
            time_since_checkpoint_ms: result.time_since_checkpoint_ms,
            resume_text: Some(bridge.text),
            session: Some(session.view(now)),
        };
        self.register(session_id, session, self.shared.session_rng()).await;
        info!(%session_id, recommendation = ?outcome.recommendation, "Session recovered");
        Ok(outcome)
    }

    /// Ends the session: cancels its background tasks, writes a final
    /// checkpoint and reports the timing summary.
    #[instrument(skip(self))]
    pub async fn stop(&self, session_id: Uuid) -> Result<StopReport> {
        let handle = self
            .sessions
            .write()
            .await
            .remove(&session_id)
            .ok_or(EngineError::UnknownSession(session_id))?;
        handle.abort();

        let (checkpoint, archive, mut report) = {
            let mut rt = handle.runtime.lock().await;
            let now = self.shared.clock.now();
            let was_active = rt.session.is_active();
            if was_active {
                rt.session.conclude(SessionStatus::Stopped, now);
            }
            let actual = rt.session.session_elapsed(now);
            let planned = rt.session.planned_total();
            let report = StopReport {
                session_id,
                final_duration_ms: actual.num_milliseconds(),
                planned_duration_ms: planned.num_milliseconds(),
                efficiency_score: efficiency_score(planned, actual),
                final_save_completed: false,
                completed_phases: rt.session.completed_phases().to_vec(),
            };
            let archive = was_active.then(|| rt.session.archive(now, "stopped"));
            (rt.session.checkpoint(now), archive, report)
        };

        // The writer applies this after anything already queued.
        report.final_save_completed = match handle.persist.save(checkpoint).await {
            Ok(_) => true,
            Err(e) => {
                error!(%session_id, error = %e, "Final checkpoint failed");
                false
            }
        };
        if let Some(archive) = archive {
            self.shared.archive(&archive).await;
        }

        info!(
            %session_id,
            final_duration_ms = report.final_duration_ms,
            efficiency = report.efficiency_score,
            "Session stopped"
        );
        Ok(report)
    }

    /// Cancels the background tasks of every session, then waits for the
    /// checkpoints already queued.
    pub async fn shutdown(&self) {
        let sessions = self.sessions.read().await;
        for handle in sessions.values() {
            handle.abort();
        }
        for (session_id, handle) in sessions.iter() {
            if let Err(e) = handle.persist.flush().await {
                warn!(%session_id, error = %e, "Pending checkpoints not flushed");
            }
        }
        info!(count = sessions.len(), "Session tasks cancelled");
    }

    /// Claims `session_id` for a start or a recovery. Fails when the id is
    /// live or already claimed.
    async fn reserve(&self, session_id: Uuid) -> Result<Reservation<'_>> {
        let sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(&session_id) {
            if handle.runtime.lock().await.session.is_active() {
                return Err(EngineError::SessionAlreadyActive(session_id));
            }
        }
        let claimed = {
            let mut starting = self.starting.lock().unwrap_or_else(|e| e.into_inner());
            starting.insert(session_id)
        };
        if !claimed {
            return Err(EngineError::SessionAlreadyActive(session_id));
        }
        Ok(Reservation {
            starting: &self.starting,
            session_id,
        })
    }

    async fn runtime(&self, session_id: Uuid) -> Result<Arc<Mutex<SessionRuntime>>> {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map(|handle| handle.runtime.clone())
            .ok_or(EngineError::UnknownSession(session_id))
    }

    async fn register(&self, session_id: Uuid, session: Session, rng: StdRng) {
        let auto_save = session.timer().auto_save_enabled();
        let persist = PersistQueue::spawn(self.shared.clone(), session_id);
        let runtime = Arc::new(Mutex::new(SessionRuntime {
            session,
            rng,
            persist: persist.clone(),
        }));
        let tasks = self.spawn_tasks(session_id, &runtime, auto_save);
        let previous = self.sessions.write().await.insert(
            session_id,
            SessionHandle {
                runtime,
                persist,
                tasks,
            },
        );
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn spawn_tasks(
        &self,
        session_id: Uuid,
        runtime: &Arc<Mutex<SessionRuntime>>,
        auto_save: bool,
    ) -> Vec<JoinHandle<()>> {
        let span = info_span!("session_runtime", %session_id);
        let mut tasks = Vec::new();
        if auto_save {
            tasks.push(tokio::spawn(
                autosave_loop(self.shared.clone(), runtime.clone()).instrument(span.clone()),
            ));
        }
        if !self.shared.config.watchdog_interval.is_zero() {
            tasks.push(tokio::spawn(
                watchdog_loop(self.shared.clone(), runtime.clone(), session_id).instrument(span),
            ));
        }
        tasks
    }
}

impl Shared {
    fn session_rng(&self) -> StdRng {
        match self.config.narrative_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        }
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn save_checkpoint(&self, checkpoint: Checkpoint) -> Result<SaveResult> {
        let session_id = checkpoint.session_id;
        match self.checkpoints.save(checkpoint).await {
            Ok(saved) => {
                self.publish(SessionEvent::CheckpointSaved {
                    session_id,
                    sequence: saved.sequence,
                    saved_at: saved.saved_at,
                });
                Ok(saved)
            }
            Err(e) => {
                self.publish(SessionEvent::CheckpointFailed {
                    session_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn archive(&self, archive: &SessionArchive) {
        if let Err(e) = self.checkpoints.archive(archive).await {
            warn!(session_id = %archive.session_id, error = %e, "Could not write session archive");
        }
    }

    fn turn(
        &self,
        runtime: &mut SessionRuntime,
        message: TranscriptMessage,
        analysis: Option<ThematicAnalysis>,
        validation: Option<OutgoingValidation>,
        now: DateTime<Utc>,
    ) -> TurnOutcome {
        let theme = self.themes.get(runtime.session.theme_id());
        runtime.session.record(message, theme);
        let decision = self.engine.evaluate(&runtime.session.evaluation_request(now));
        let change = self.apply_decision(runtime, &decision, now);
        self.outcome(&runtime.session, decision, change, analysis, validation, now)
    }

    /// Moves to the next phase or concludes the session when the verdict
    /// asks for it. The boundary checkpoint is queued, not awaited.
    fn apply_decision(
        &self,
        runtime: &mut SessionRuntime,
        decision: &TransitionDecision,
        now: DateTime<Utc>,
    ) -> Option<PhaseChange> {
        if !decision.verdict.changes_phase() {
            return None;
        }
        let session = &mut runtime.session;
        let persist = &runtime.persist;
        let from = session.current_phase().id.clone();

        if decision.terminal || session.advance(now).is_none() {
            self.conclude(session, persist, &decision.reason.to_string(), now);
            return Some(PhaseChange {
                from,
                to: None,
                bridge: None,
            });
        }

        let to_id = session.current_phase().id.clone();
        let to_name = session.current_phase().name.clone();
        let request = BridgeRequest {
            from_phase_id: &from,
            to_phase_id: &to_id,
            to_phase_name: &to_name,
            style: session.expert_style(),
            emotional_state: session.emotional_state(),
            forced: decision.forced,
        };
        let bridge = self
            .narrative
            .select_bridge(session.narrative_mut(), &request, &mut runtime.rng);

        info!(
            session_id = %session.id(),
            from = %from,
            to = %to_id,
            forced = decision.forced,
            reason = %decision.reason,
            "Phase transition"
        );
        persist.checkpoint(session.checkpoint(now));
        self.publish(SessionEvent::PhaseChanged {
            session_id: session.id(),
            from_phase: from.clone(),
            to_phase: to_id.clone(),
            forced: decision.forced,
            reason: decision.reason.to_string(),
            bridge_text: bridge.text.clone(),
        });

        Some(PhaseChange {
            from,
            to: Some(to_id),
            bridge: Some(bridge),
        })
    }

    fn conclude(&self, session: &mut Session, persist: &PersistQueue, reason: &str, now: DateTime<Utc>) {
        session.conclude(SessionStatus::Concluded, now);
        persist.checkpoint(session.checkpoint(now));
        persist.archive(session.archive(now, reason));

        let final_duration_ms = session.session_elapsed(now).num_milliseconds();
        info!(session_id = %session.id(), reason, final_duration_ms, "Session concluded");
        self.publish(SessionEvent::SessionConcluded {
            session_id: session.id(),
            reason: reason.to_string(),
            final_duration_ms,
        });
    }

    fn outcome(
        &self,
        session: &Session,
        decision: TransitionDecision,
        change: Option<PhaseChange>,
        analysis: Option<ThematicAnalysis>,
        validation: Option<OutgoingValidation>,
        now: DateTime<Utc>,
    ) -> TurnOutcome {
        let active = session.is_active();
        TurnOutcome {
            session_id: session.id(),
            verdict: decision.verdict,
            reason_text: decision.reason.to_string(),
            reason: decision.reason,
            forced: decision.forced,
            bridge_text: change
                .as_ref()
                .and_then(|c| c.bridge.as_ref())
                .map(|b| b.text.clone()),
            recentering_hint: analysis.as_ref().and_then(|a| a.recentering_hint.clone()),
            phase_progress_percent: if active {
                session.timer().progress_percent(now)
            } else {
                100.0
            },
            previous_phase: change.map(|c| c.from),
            current_phase: session.current_phase().id.clone(),
            next_phase: session.next_phase().map(|p| p.id.clone()),
            session_complete: !active,
            metrics: decision.metrics,
            corrected_text: validation.as_ref().map(|v| v.corrected_text.clone()),
            violations: validation.map(|v| v.violations).unwrap_or_default(),
            analysis,
        }
    }

    /// Forced decision for a stalled session, if one is due.
    fn watchdog_check(&self, session: &Session, now: DateTime<Utc>) -> Option<TransitionDecision> {
        let timer = session.timer();
        if timer.session_elapsed(now) >= self.config.terminal_threshold() {
            return Some(self.engine.evaluate(&session.evaluation_request(now)));
        }
        let elapsed = timer.phase_elapsed(now);
        let planned = timer.planned();
        (elapsed > planned + self.config.watchdog_grace)
            .then(|| TransitionDecision::watchdog_overrun(elapsed, planned, session.metrics().clone()))
    }
}

fn ensure_active(session: &Session) -> Result<()> {
    if session.is_active() {
        Ok(())
    } else {
        Err(EngineError::SessionInactive(session.id()))
    }
}

async fn autosave_loop(shared: Arc<Shared>, runtime: Arc<Mutex<SessionRuntime>>) {
    let period = shared.config.autosave_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let mut rt = runtime.lock().await;
        if !rt.session.is_active() {
            debug!("Session ended, auto-save stopped");
            break;
        }
        let now = shared.clock.now();
        let checkpoint = rt.session.checkpoint(now);
        rt.persist.checkpoint(checkpoint);
    }
}

/// Applies persistence requests for one session, in order. Exits once every
/// sender is gone.
async fn writer_loop(shared: Arc<Shared>, session_id: Uuid, mut requests: mpsc::UnboundedReceiver<Persist>) {
    while let Some(request) = requests.recv().await {
        match request {
            Persist::Checkpoint(checkpoint, ack) => {
                let result = shared.save_checkpoint(checkpoint).await;
                match ack {
                    Some(ack) => {
                        // The caller may have gone away.
                        let _ = ack.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            warn!(%session_id, error = %e, "Checkpoint failed, retrying on next save");
                        }
                    }
                }
            }
            Persist::Archive(archive) => shared.archive(&archive).await,
            Persist::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!(%session_id, "Checkpoint writer stopped");
}

async fn watchdog_loop(shared: Arc<Shared>, runtime: Arc<Mutex<SessionRuntime>>, session_id: Uuid) {
    let period = shared.config.watchdog_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let mut rt = runtime.lock().await;
        if !rt.session.is_active() {
            debug!("Session ended, watchdog stopped");
            break;
        }
        let now = shared.clock.now();
        let Some(decision) = shared.watchdog_check(&rt.session, now) else {
            continue;
        };

        let from_phase = rt.session.current_phase().id.clone();
        warn!(phase = %from_phase, reason = %decision.reason, "Watchdog forcing transition");
        let change = shared.apply_decision(&mut rt, &decision, now);
        shared.publish(SessionEvent::WatchdogForcedTransition {
            session_id,
            from_phase,
            to_phase: change.and_then(|c| c.to),
            reason: decision.reason.to_string(),
        });
        if !rt.session.is_active() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::session::CrisisLevel;
    use crate::store::{InMemoryStore, MockDurableStore, archive_key, checkpoint_key};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory store whose writes take `delay` of tokio time.
    struct SlowStore {
        inner: InMemoryStore,
        delay: std::time::Duration,
        puts: AtomicUsize,
    }

    impl SlowStore {
        fn new(delay: std::time::Duration) -> Self {
            Self {
                inner: InMemoryStore::new(),
                delay,
                puts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DurableStore for SlowStore {
        async fn get(&self, key: &str) -> std::result::Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, record: String) -> std::result::Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.inner.put(key, record).await
        }

        async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
            self.inner.delete(key).await
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 10, 20, 0, 0).unwrap()
    }

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            autosave_interval: std::time::Duration::ZERO,
            watchdog_interval: std::time::Duration::ZERO,
            narrative_seed: Some(42),
            ..EngineConfig::default()
        }
    }

    fn orchestrator_with(
        config: EngineConfig,
        store: Arc<dyn DurableStore>,
        clock: &ManualClock,
    ) -> SessionOrchestrator {
        SessionOrchestrator::new(
            config,
            Arc::new(ThemeRegistry::builtin()),
            Arc::new(PhaseCatalog::builtin()),
            store,
            Arc::new(clock.clone()),
        )
    }

    fn standard(theme: &str) -> StartSession {
        StartSession {
            session_type: SessionType::Standard,
            theme_id: theme.to_string(),
            expert_style: ExpertStyle::Warm,
            session_id: None,
        }
    }

    async fn next_matching<F>(rx: &mut broadcast::Receiver<SessionEvent>, pred: F) -> SessionEvent
    where
        F: Fn(&SessionEvent) -> bool,
    {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_start_writes_initial_checkpoint_and_single_opening() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = orchestrator_with(quiet_config(), store.clone(), &clock);

        let started = orchestrator.start_session(standard("gestion_stress")).await.unwrap();

        assert_eq!(started.current_phase_id, "check_in");
        assert_eq!(started.timer.planned_duration_ms, 3 * 60_000);
        assert_eq!(started.checkpoint.sequence, 1);
        assert!(started.opening_text.unwrap().starts_with("Bonjour"));
        assert!(store.get(&checkpoint_key(started.session_id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_fails_when_checkpoint_cannot_be_written() {
        let mut store = MockDurableStore::new();
        store
            .expect_put()
            .returning(|_, _| Err(StoreError::Unavailable("connection refused".into())));
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(store), &clock);
        let id = Uuid::new_v4();

        let err = orchestrator
            .start_session(StartSession {
                session_id: Some(id),
                ..standard("gestion_stress")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::Persistence(_)));
        assert!(matches!(
            orchestrator.status(id).await,
            Err(EngineError::UnknownSession(_))
        ));

        // The failed attempt does not keep the id claimed.
        let retry = orchestrator
            .start_session(StartSession {
                session_id: Some(id),
                ..standard("gestion_stress")
            })
            .await;
        assert!(matches!(retry, Err(EngineError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_starting_a_live_session_twice_conflicts() {
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(InMemoryStore::new()), &clock);
        let id = Uuid::new_v4();
        let request = StartSession {
            session_id: Some(id),
            ..standard("gestion_stress")
        };

        orchestrator.start_session(request.clone()).await.unwrap();
        assert!(matches!(
            orchestrator.start_session(request).await,
            Err(EngineError::SessionAlreadyActive(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_starts_of_one_id_admit_one() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(SlowStore::new(std::time::Duration::from_secs(1)));
        let orchestrator = orchestrator_with(quiet_config(), store.clone(), &clock);
        let request = StartSession {
            session_id: Some(Uuid::new_v4()),
            ..standard("gestion_stress")
        };

        let (a, b) = tokio::join!(
            orchestrator.start_session(request.clone()),
            orchestrator.start_session(request)
        );

        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(EngineError::SessionAlreadyActive(_))))
        );
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_natural_transition_supplies_bridge_without_greeting() {
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(InMemoryStore::new()), &clock);
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        clock.advance(Duration::seconds(10));
        orchestrator
            .record_expert_message(id, "Comment vous sentez-vous face au stress ?")
            .await
            .unwrap();
        clock.advance(Duration::seconds(10));
        let first = orchestrator.record_user_message(id, "Un peu tendu").await.unwrap();
        assert_eq!(first.verdict, Verdict::Continue);

        clock.advance(Duration::seconds(10));
        let second = orchestrator
            .record_user_message(id, "Mais prêt à avancer")
            .await
            .unwrap();

        assert_eq!(second.verdict, Verdict::Transition);
        assert!(!second.forced);
        assert_eq!(second.previous_phase.as_deref(), Some("check_in"));
        assert_eq!(second.current_phase, "review");
        assert_eq!(second.next_phase.as_deref(), Some("core_content"));
        let bridge = second.bridge_text.unwrap();
        assert!(!bridge.to_lowercase().contains("bonjour"));
        assert!(bridge.contains("Retour sur la semaine"));

        let view = orchestrator.status(id).await.unwrap();
        assert_eq!(view.metrics.user_response_count, 0);
        assert_eq!(view.completed_phases, vec!["check_in".to_string()]);
    }

    #[tokio::test]
    async fn test_consecutive_questions_force_transition() {
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(InMemoryStore::new()), &clock);
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        let mut last = None;
        for question in ["Comment allez-vous ?", "Avez-vous bien dormi ?", "Et le stress ?"] {
            clock.advance(Duration::seconds(5));
            last = Some(orchestrator.record_expert_message(id, question).await.unwrap());
        }

        let outcome = last.unwrap();
        assert_eq!(outcome.verdict, Verdict::Force);
        assert!(outcome.forced);
        assert!(matches!(
            outcome.reason,
            TransitionReason::ConsecutiveQuestionOverload { streak: 3, .. }
        ));
        assert_eq!(outcome.current_phase, "review");
    }

    #[tokio::test]
    async fn test_digression_returns_recentering_hint() {
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(InMemoryStore::new()), &clock);
        let id = orchestrator
            .start_session(standard("techniques_relaxation"))
            .await
            .unwrap()
            .session_id;

        let outcome = orchestrator
            .record_user_message(id, "je suis anxieux à propos de mon travail")
            .await
            .unwrap();

        assert_eq!(outcome.verdict, Verdict::Continue);
        assert!(outcome.recentering_hint.is_some());
        let analysis = outcome.analysis.unwrap();
        assert!(analysis.assessment.is_digression);
        assert!(analysis.assessment.relevance_score < 0.5);
    }

    #[tokio::test]
    async fn test_expert_reply_is_recorded_after_excision() {
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(InMemoryStore::new()), &clock);
        let id = orchestrator
            .start_session(standard("techniques_relaxation"))
            .await
            .unwrap()
            .session_id;

        let outcome = orchestrator
            .record_expert_message(id, "La respiration aide, oublions les médicaments.")
            .await
            .unwrap();

        assert_eq!(
            outcome.corrected_text.as_deref(),
            Some("La respiration aide, oublions les […].")
        );
        assert_eq!(outcome.violations.len(), 1);
        let transcript = orchestrator.transcript(id).await.unwrap();
        assert_eq!(transcript[0].content, "La respiration aide, oublions les […].");
    }

    #[tokio::test]
    async fn test_severity_triggers_escalate_crisis_level() {
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(InMemoryStore::new()), &clock);
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        orchestrator
            .record_user_message(id, "C'est l'urgence en ce moment")
            .await
            .unwrap();

        let view = orchestrator.status(id).await.unwrap();
        assert_eq!(view.crisis_level, CrisisLevel::High);
        assert_eq!(view.emotional_state, EmotionalState::Distressed);
    }

    #[tokio::test]
    async fn test_unknown_theme_fails_forward() {
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(InMemoryStore::new()), &clock);
        let id = orchestrator
            .start_session(standard("astrologie"))
            .await
            .unwrap()
            .session_id;

        let outcome = orchestrator.record_user_message(id, "Bonjour").await.unwrap();
        assert!(outcome.analysis.unwrap().degraded);
        assert!(outcome.recentering_hint.is_none());
    }

    #[tokio::test]
    async fn test_ceiling_concludes_and_archives() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = orchestrator_with(quiet_config(), store.clone(), &clock);
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        clock.advance(Duration::minutes(29));
        let outcome = orchestrator.evaluate(id).await.unwrap();

        assert_eq!(outcome.verdict, Verdict::Force);
        assert!(outcome.session_complete);
        assert!(matches!(outcome.reason, TransitionReason::SessionCeilingReached { .. }));
        orchestrator.flush(id).await.unwrap();
        assert!(store.get(&archive_key(id)).await.unwrap().is_some());
        assert!(matches!(
            orchestrator.record_user_message(id, "encore ?").await,
            Err(EngineError::SessionInactive(_))
        ));
        let view = orchestrator.status(id).await.unwrap();
        assert!(view.session_elapsed_ms <= 30 * 60_000);
    }

    #[tokio::test]
    async fn test_leaving_the_last_phase_concludes() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = orchestrator_with(quiet_config(), store.clone(), &clock);
        let id = orchestrator
            .start_session(StartSession {
                session_type: SessionType::First,
                ..standard("confiance_en_soi")
            })
            .await
            .unwrap()
            .session_id;

        let mut outcome = None;
        for _ in 0..40 {
            clock.advance(Duration::seconds(5));
            let turn = orchestrator.record_user_message(id, "D'accord").await.unwrap();
            let done = turn.session_complete;
            outcome = Some(turn);
            if done {
                break;
            }
        }

        let outcome = outcome.unwrap();
        assert!(outcome.session_complete);
        assert_eq!(outcome.previous_phase.as_deref(), Some("wrap_up"));
        assert!(outcome.bridge_text.is_none());
        let view = orchestrator.status(id).await.unwrap();
        assert_eq!(view.status, SessionStatus::Concluded);
        assert_eq!(view.completed_phases.len(), 5);
        orchestrator.flush(id).await.unwrap();
        assert!(store.get(&archive_key(id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_pause_is_idempotent_and_excluded_from_elapsed() {
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(InMemoryStore::new()), &clock);
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        clock.advance(Duration::seconds(20));
        assert!(orchestrator.pause(id).await.unwrap());
        assert!(!orchestrator.pause(id).await.unwrap());
        clock.advance(Duration::seconds(40));
        assert!(orchestrator.resume(id).await.unwrap());
        assert!(!orchestrator.resume(id).await.unwrap());
        clock.advance(Duration::seconds(10));

        let view = orchestrator.status(id).await.unwrap();
        assert_eq!(view.phase_elapsed_ms, 30_000);
        assert_eq!(view.session_elapsed_ms, 30_000);
    }

    #[tokio::test]
    async fn test_large_extension_waits_for_confirmation() {
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(InMemoryStore::new()), &clock);
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        let decision = orchestrator
            .request_adjustment(id, AdjustmentKind::Extend, "user deeply engaged")
            .await
            .unwrap();
        assert!(decision.requires_confirmation);
        assert!(!decision.applied);
        assert!(orchestrator.status(id).await.unwrap().pending_adjustment.is_some());

        let confirmed = orchestrator.confirm_adjustment(id).await.unwrap().unwrap();
        assert!(confirmed.applied);
        let view = orchestrator.status(id).await.unwrap();
        assert_eq!(view.planned_duration_ms, 8 * 60_000);
        assert!(view.pending_adjustment.is_none());
        assert!(orchestrator.confirm_adjustment(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_adaptations_follow_phase_options() {
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(InMemoryStore::new()), &clock);
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        assert!(orchestrator.apply_adaptation(id, "more_examples").await.unwrap());
        assert!(!orchestrator.apply_adaptation(id, "skip_everything").await.unwrap());
        assert_eq!(
            orchestrator.status(id).await.unwrap().style_adaptations,
            vec!["more_examples".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stop_reports_and_releases_session() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = orchestrator_with(quiet_config(), store.clone(), &clock);
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        clock.advance(Duration::minutes(14));
        let report = orchestrator.stop(id).await.unwrap();

        assert!(report.final_save_completed);
        assert_eq!(report.final_duration_ms, 14 * 60_000);
        assert_eq!(report.planned_duration_ms, 28 * 60_000);
        assert!((report.efficiency_score - 1.0).abs() < f64::EPSILON);
        assert!(store.get(&archive_key(id)).await.unwrap().is_some());
        assert!(matches!(
            orchestrator.stop(id).await,
            Err(EngineError::UnknownSession(_))
        ));
        assert!(matches!(
            orchestrator.recover(id).await,
            Err(EngineError::SessionInactive(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_surfaces_final_save_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut store = MockDurableStore::new();
        store.expect_put().returning(move |_, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(())
            } else {
                Err(StoreError::Unavailable("disk full".into()))
            }
        });
        let clock = ManualClock::new(t0());
        let orchestrator = orchestrator_with(quiet_config(), Arc::new(store), &clock);
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        clock.advance(Duration::minutes(2));
        let report = orchestrator.stop(id).await.unwrap();
        assert!(!report.final_save_completed);
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_recover_after_crash_rebuilds_phase_state() {
        let clock = ManualClock::new(t0());
        let store: Arc<InMemoryStore> = Arc::new(InMemoryStore::new());
        let first = orchestrator_with(quiet_config(), store.clone(), &clock);
        let id = first
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        clock.advance(Duration::seconds(30));
        first
            .record_expert_message(id, "Quel est votre niveau de stress ?")
            .await
            .unwrap();
        clock.advance(Duration::seconds(30));
        first.checkpoint(id).await.unwrap();

        // The process dies; a new one picks the session up 12 minutes later.
        drop(first);
        clock.advance(Duration::minutes(12));
        let second = orchestrator_with(quiet_config(), store.clone(), &clock);
        let outcome = second.recover(id).await.unwrap();

        assert!(outcome.data_integrity_verified);
        assert_eq!(outcome.recommendation, ResumeApproach::BriefRecap);
        assert!(outcome.resume_text.unwrap().contains("Rappelons"));
        let view = outcome.session.unwrap();
        assert_eq!(view.current_phase_id, "check_in");
        assert_eq!(view.phase_elapsed_ms, 60_000);
        assert_eq!(view.metrics.question_count, 1);

        assert!(matches!(
            second.recover(id).await,
            Err(EngineError::SessionAlreadyActive(_))
        ));
    }

    #[tokio::test]
    async fn test_recover_refuses_corrupted_checkpoint() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(InMemoryStore::new());
        let first = orchestrator_with(quiet_config(), store.clone(), &clock);
        let id = first
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;
        drop(first);

        let key = checkpoint_key(id);
        let record = store.get(&key).await.unwrap().unwrap();
        store
            .put(&key, record.replacen("check_in", "check_im", 1))
            .await
            .unwrap();

        let second = orchestrator_with(quiet_config(), store, &clock);
        let outcome = second.recover(id).await.unwrap();

        assert!(!outcome.data_integrity_verified);
        assert_eq!(outcome.recommendation, ResumeApproach::StartFresh);
        assert!(outcome.session.is_none());
        assert!(outcome.resume_text.is_none());
        assert!(outcome.time_since_checkpoint_ms.is_none());
        assert!(matches!(
            second.status(id).await,
            Err(EngineError::UnknownSession(_))
        ));

        // Starting over under the same id is allowed.
        second
            .start_session(StartSession {
                session_id: Some(id),
                ..standard("gestion_stress")
            })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_forces_stalled_phase() {
        let clock = ManualClock::new(t0());
        let config = EngineConfig {
            autosave_interval: std::time::Duration::ZERO,
            watchdog_interval: std::time::Duration::from_secs(15),
            narrative_seed: Some(7),
            ..EngineConfig::default()
        };
        let orchestrator = orchestrator_with(config, Arc::new(InMemoryStore::new()), &clock);
        let mut events = orchestrator.subscribe();
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        // check_in plans 3 minutes, the grace is 30 seconds.
        clock.advance(Duration::minutes(4));
        let event = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::WatchdogForcedTransition { .. })
        })
        .await;

        match event {
            SessionEvent::WatchdogForcedTransition {
                session_id,
                from_phase,
                to_phase,
                reason,
            } => {
                assert_eq!(session_id, id);
                assert_eq!(from_phase, "check_in");
                assert_eq!(to_phase.as_deref(), Some("review"));
                assert!(reason.contains("watchdog"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(orchestrator.status(id).await.unwrap().current_phase_id, "review");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_concludes_at_ceiling() {
        let clock = ManualClock::new(t0());
        let config = EngineConfig {
            autosave_interval: std::time::Duration::ZERO,
            watchdog_interval: std::time::Duration::from_secs(15),
            ..EngineConfig::default()
        };
        let orchestrator = orchestrator_with(config, Arc::new(InMemoryStore::new()), &clock);
        let mut events = orchestrator.subscribe();
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        clock.advance(Duration::seconds(29 * 60 + 5));
        let event = next_matching(&mut events, |e| matches!(e, SessionEvent::SessionConcluded { .. })).await;

        assert_eq!(event.session_id(), id);
        assert_eq!(
            orchestrator.status(id).await.unwrap().status,
            SessionStatus::Concluded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_autosave_retries_after_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut store = MockDurableStore::new();
        store.expect_put().returning(move |_, _| {
            match counter.fetch_add(1, Ordering::SeqCst) {
                1 => Err(StoreError::Unavailable("timeout".into())),
                _ => Ok(()),
            }
        });
        let clock = ManualClock::new(t0());
        let config = EngineConfig {
            autosave_interval: std::time::Duration::from_secs(30),
            watchdog_interval: std::time::Duration::ZERO,
            ..EngineConfig::default()
        };
        let orchestrator = orchestrator_with(config, Arc::new(store), &clock);
        let mut events = orchestrator.subscribe();
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        let failed = next_matching(&mut events, |e| matches!(e, SessionEvent::CheckpointFailed { .. })).await;
        assert_eq!(failed.session_id(), id);

        let saved = next_matching(&mut events, |e| matches!(e, SessionEvent::CheckpointSaved { .. })).await;
        match saved {
            SessionEvent::CheckpointSaved { sequence, .. } => assert_eq!(sequence, 3),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(orchestrator.status(id).await.unwrap().status == SessionStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_autosave_does_not_hold_the_session() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(SlowStore::new(std::time::Duration::from_secs(10)));
        let config = EngineConfig {
            autosave_interval: std::time::Duration::from_secs(30),
            watchdog_interval: std::time::Duration::ZERO,
            narrative_seed: Some(42),
            ..EngineConfig::default()
        };
        let orchestrator = orchestrator_with(config, store.clone(), &clock);
        let mut events = orchestrator.subscribe();
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        // The first auto-save fires at 30 s and its write lasts until 40 s.
        tokio::time::sleep(std::time::Duration::from_millis(30_500)).await;
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);

        let sent = tokio::time::Instant::now();
        let turn = orchestrator.record_user_message(id, "Un peu tendu").await.unwrap();
        assert_eq!(turn.verdict, Verdict::Continue);
        assert!(sent.elapsed() < std::time::Duration::from_secs(1));

        let saved = next_matching(&mut events, |e| {
            matches!(e, SessionEvent::CheckpointSaved { sequence: 2, .. })
        })
        .await;
        assert_eq!(saved.session_id(), id);
        assert_eq!(store.puts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_phase_boundary_checkpoints_are_written_in_order() {
        let clock = ManualClock::new(t0());
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = orchestrator_with(quiet_config(), store.clone(), &clock);
        let id = orchestrator
            .start_session(standard("gestion_stress"))
            .await
            .unwrap()
            .session_id;

        for question in ["Comment allez-vous ?", "Avez-vous bien dormi ?", "Et le stress ?"] {
            clock.advance(Duration::seconds(5));
            orchestrator.record_expert_message(id, question).await.unwrap();
        }
        let explicit = orchestrator.checkpoint(id).await.unwrap();
        assert_eq!(explicit.sequence, 3);

        let record = store.get(&checkpoint_key(id)).await.unwrap().unwrap();
        let stored: Checkpoint = serde_json::from_str(&record).unwrap();
        assert_eq!(stored.sequence, 3);
        assert_eq!(stored.conversation.current_phase_id, "review");
    }
}
