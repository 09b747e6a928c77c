//! Session-phase orchestration engine.
//!
//! Drives a guided conversational session through an ordered sequence of
//! phases. Each recorded message is evaluated against the phase's transition
//! rules, checked for thematic drift, and may move the session forward with
//! a narrative bridge. Sessions are checkpointed to a [`DurableStore`] and
//! can be resumed after an interruption.

pub mod checkpoint;
pub mod clock;
pub mod coherence;
pub mod config;
pub mod error;
pub mod metrics;
pub mod narrative;
pub mod orchestrator;
pub mod phase;
pub mod session;
pub mod store;
pub mod theme;
pub mod timer;
pub mod transcript;
pub mod transition;

pub use checkpoint::{Checkpoint, CheckpointService, RecoverResult, ResumeApproach, SaveResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use coherence::{
    CoherenceConfig, DigressionSeverity, RecenteringStrategy, ThematicAnalysis,
    ThematicCoherenceValidator,
};
pub use config::EngineConfig;
pub use error::{EngineError, Result, StoreError};
pub use metrics::TransitionMetrics;
pub use narrative::{EmotionalState, ExpertStyle, NarrativeConfig};
pub use orchestrator::{
    RecoveryOutcome, SessionEvent, SessionOrchestrator, SessionStarted, StartSession, StopReport,
    TurnOutcome,
};
pub use phase::{PhaseCatalog, PhaseDefinition, SessionType};
pub use session::{CrisisLevel, SessionStatus, SessionView};
pub use store::{DurableStore, InMemoryStore};
pub use theme::{ThemeConfig, ThemeRegistry};
pub use timer::{AdjustmentDecision, AdjustmentKind, PhaseTimerStart};
pub use transcript::{Sender, TranscriptMessage};
pub use transition::{TransitionDecision, TransitionReason, Verdict};
