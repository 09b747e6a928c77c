//! Phase Catalog
//!
//! Ordered phase definitions per session type. Definitions are immutable:
//! duration changes made during a session live on the session's timer as an
//! override, never on the catalog entry.

use crate::error::StoreError;
use crate::store::{DurableStore, PHASE_CATALOG_KEY};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// The user's very first session, with a discovery phase.
    First,
    Standard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub id: String,
    pub name: String,
    pub planned_duration_ms: i64,
    pub objectives: Vec<String>,
    pub completion_criteria: Vec<String>,
    pub adaptation_options: Vec<String>,
    /// User replies required before a natural transition is considered.
    pub min_interactions: u32,
    /// Expert questions after which the phase is force-ended.
    pub force_transition_after: u32,
}

impl PhaseDefinition {
    pub fn planned_duration(&self) -> Duration {
        Duration::milliseconds(self.planned_duration_ms)
    }

    pub fn allows_adaptation(&self, adaptation: &str) -> bool {
        self.adaptation_options.iter().any(|a| a == adaptation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseCatalog {
    pub first: Vec<PhaseDefinition>,
    pub standard: Vec<PhaseDefinition>,
}

impl PhaseCatalog {
    /// Loads the catalog stored under `catalog/phases`, or the built-in one
    /// when the store holds none.
    pub async fn load(store: &dyn DurableStore) -> Result<Self, StoreError> {
        match store.get(PHASE_CATALOG_KEY).await? {
            Some(record) => {
                let catalog: PhaseCatalog = serde_json::from_str(&record)?;
                info!(
                    first = catalog.first.len(),
                    standard = catalog.standard.len(),
                    "Loaded phase catalog from store"
                );
                Ok(catalog)
            }
            None => {
                warn!("No phase catalog in store, using built-in phases");
                Ok(Self::builtin())
            }
        }
    }

    pub fn sequence(&self, session_type: SessionType) -> &[PhaseDefinition] {
        match session_type {
            SessionType::First => &self.first,
            SessionType::Standard => &self.standard,
        }
    }

    pub fn find(&self, session_type: SessionType, phase_id: &str) -> Option<&PhaseDefinition> {
        self.sequence(session_type).iter().find(|p| p.id == phase_id)
    }

    pub fn total_planned(&self, session_type: SessionType) -> Duration {
        self.sequence(session_type)
            .iter()
            .map(PhaseDefinition::planned_duration)
            .fold(Duration::zero(), |acc, d| acc + d)
    }

    pub fn builtin() -> Self {
        Self {
            first: vec![
                phase(
                    "welcome",
                    "Accueil",
                    4,
                    &["Créer un climat de confiance", "Présenter le déroulement de la séance"],
                    &["L'utilisateur a exprimé son état du jour"],
                    2,
                    5,
                ),
                phase(
                    "discovery",
                    "Découverte",
                    6,
                    &["Comprendre les attentes", "Identifier les situations difficiles"],
                    &["Au moins une situation concrète décrite"],
                    3,
                    6,
                ),
                phase(
                    "core_content",
                    "Contenu principal",
                    8,
                    &["Expliquer la technique du jour", "Relier la technique aux attentes"],
                    &["La technique a été présentée", "L'utilisateur a reformulé"],
                    3,
                    7,
                ),
                phase(
                    "practice",
                    "Pratique guidée",
                    6,
                    &["Pratiquer la technique", "Recueillir le ressenti"],
                    &["Un exercice complet a été réalisé"],
                    3,
                    6,
                ),
                phase(
                    "wrap_up",
                    "Clôture",
                    4,
                    &["Synthétiser les apprentissages", "Proposer un exercice pour la semaine"],
                    &["Un engagement pour la suite est formulé"],
                    1,
                    4,
                ),
            ],
            standard: vec![
                phase(
                    "check_in",
                    "Point d'arrivée",
                    3,
                    &["Prendre des nouvelles", "Évaluer l'état émotionnel"],
                    &["L'utilisateur a décrit son état du jour"],
                    2,
                    4,
                ),
                phase(
                    "review",
                    "Retour sur la semaine",
                    4,
                    &["Revoir l'exercice de la semaine", "Identifier les obstacles"],
                    &["L'exercice précédent a été discuté"],
                    2,
                    5,
                ),
                phase(
                    "core_content",
                    "Contenu principal",
                    9,
                    &["Approfondir le thème", "Introduire une nouvelle technique"],
                    &["La technique a été présentée", "L'utilisateur a reformulé"],
                    4,
                    8,
                ),
                phase(
                    "practice",
                    "Pratique guidée",
                    8,
                    &["Pratiquer la technique", "Ajuster selon le ressenti"],
                    &["Un exercice complet a été réalisé"],
                    3,
                    7,
                ),
                phase(
                    "wrap_up",
                    "Clôture",
                    4,
                    &["Synthétiser la séance", "Fixer l'exercice de la semaine"],
                    &["Un engagement pour la suite est formulé"],
                    1,
                    4,
                ),
            ],
        }
    }
}

fn phase(
    id: &str,
    name: &str,
    minutes: i64,
    objectives: &[&str],
    completion_criteria: &[&str],
    min_interactions: u32,
    force_transition_after: u32,
) -> PhaseDefinition {
    PhaseDefinition {
        id: id.to_string(),
        name: name.to_string(),
        planned_duration_ms: minutes * 60_000,
        objectives: objectives.iter().map(|s| s.to_string()).collect(),
        completion_criteria: completion_criteria.iter().map(|s| s.to_string()).collect(),
        adaptation_options: vec![
            "slower_pace".to_string(),
            "more_examples".to_string(),
            "shorter_exercises".to_string(),
            "extra_support".to_string(),
        ],
        min_interactions,
        force_transition_after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_sequences_fit_under_ceiling() {
        let catalog = PhaseCatalog::builtin();
        for session_type in [SessionType::First, SessionType::Standard] {
            assert_eq!(catalog.sequence(session_type).len(), 5);
            assert!(catalog.total_planned(session_type) < Duration::minutes(30));
        }
    }

    #[test]
    fn test_find_is_scoped_by_session_type() {
        let catalog = PhaseCatalog::builtin();
        assert!(catalog.find(SessionType::First, "discovery").is_some());
        assert!(catalog.find(SessionType::Standard, "discovery").is_none());
        assert_eq!(
            catalog
                .find(SessionType::Standard, "check_in")
                .unwrap()
                .planned_duration(),
            Duration::minutes(3)
        );
    }

    #[test]
    fn test_adaptation_options() {
        let catalog = PhaseCatalog::builtin();
        let practice = catalog.find(SessionType::Standard, "practice").unwrap();
        assert!(practice.allows_adaptation("slower_pace"));
        assert!(!practice.allows_adaptation("skip_phase"));
    }

    #[test]
    fn test_catalog_serde_shape() {
        let catalog = PhaseCatalog::builtin();
        let json = serde_json::to_string(&catalog).unwrap();
        assert!(json.contains("\"force_transition_after\""));
        let back: PhaseCatalog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, catalog);
    }
}
