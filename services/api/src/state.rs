//! Shared Application State
//!
//! Holds the session orchestrator and the optional Postgres store. Cloned
//! into every handler and WebSocket task.

use crate::config::Config;
use crate::db::PgStore;
use crate::models::MessageRole;
use cadence_core::{EngineError, SessionOrchestrator, TurnOutcome};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    /// Present when `DATABASE_URL` is configured; message history is only
    /// persisted in that case.
    pub db: Option<Arc<PgStore>>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Records a message with the engine and appends it to the history.
    /// Expert replies are stored as corrected by the coherence check.
    pub async fn record_message(
        &self,
        session_id: Uuid,
        role: MessageRole,
        content: &str,
    ) -> Result<TurnOutcome, EngineError> {
        let outcome = match role {
            MessageRole::User => self.orchestrator.record_user_message(session_id, content).await?,
            MessageRole::Expert => {
                self.orchestrator
                    .record_expert_message(session_id, content)
                    .await?
            }
        };

        if let Some(db) = &self.db {
            let stored = outcome.corrected_text.as_deref().unwrap_or(content);
            if let Err(e) = db.add_message(session_id, role, stored).await {
                warn!(%session_id, error = ?e, "Could not append message to history");
            }
        }
        Ok(outcome)
    }
}
