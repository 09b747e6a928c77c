//! Engine configuration.

use crate::coherence::CoherenceConfig;
use crate::narrative::NarrativeConfig;
use chrono::Duration;

/// Thresholds and schedules shared by every session of an orchestrator.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Absolute ceiling on net (unpaused) session time.
    pub session_ceiling: Duration,
    /// The session is force-concluded once net time reaches
    /// `session_ceiling - ceiling_safety_margin`.
    pub ceiling_safety_margin: Duration,
    pub consecutive_question_limit: u32,
    /// A user reply older than this no longer counts as fresh.
    pub response_freshness: Duration,
    /// Share of the planned phase duration after which an engaged but
    /// unfinished phase is advised to extend.
    pub extend_advice_ratio: f64,
    pub autosave_interval: std::time::Duration,
    pub watchdog_interval: std::time::Duration,
    /// Overrun tolerated past the planned duration before the watchdog forces.
    pub watchdog_grace: Duration,
    /// Seeds per-session narrative selection; entropy is used when absent.
    pub narrative_seed: Option<u64>,
    pub coherence: CoherenceConfig,
    pub narrative: NarrativeConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_ceiling: Duration::minutes(30),
            ceiling_safety_margin: Duration::seconds(60),
            consecutive_question_limit: 3,
            response_freshness: Duration::seconds(60),
            extend_advice_ratio: 0.8,
            autosave_interval: std::time::Duration::from_secs(30),
            watchdog_interval: std::time::Duration::from_secs(15),
            watchdog_grace: Duration::seconds(30),
            narrative_seed: None,
            coherence: CoherenceConfig::default(),
            narrative: NarrativeConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Net session time at which the engine concludes the session.
    pub fn terminal_threshold(&self) -> Duration {
        self.session_ceiling - self.ceiling_safety_margin
    }

    /// A zero auto-save interval disables periodic checkpoints.
    pub fn autosave_enabled(&self) -> bool {
        !self.autosave_interval.is_zero()
    }
}
