//! Theme Registry
//!
//! Static catalog of session themes. Each theme lists the vocabulary that
//! keeps a conversation on-topic (core concepts, focus keywords, allowed
//! subtopics) and the topics the expert must stay away from. The registry is
//! loaded once at start-up and shared read-only between sessions.

use crate::error::StoreError;
use crate::store::{DurableStore, THEME_CATALOG_KEY};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Reference data describing one session theme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThemeConfig {
    pub id: String,
    pub display_name: String,
    pub category: String,
    pub core_concepts: Vec<String>,
    pub allowed_subtopics: Vec<String>,
    pub related_techniques: Vec<String>,
    pub prohibited_topics: Vec<String>,
    pub focus_keywords: Vec<String>,
}

/// Read-only lookup of themes by id.
#[derive(Debug, Clone, Default)]
pub struct ThemeRegistry {
    themes: HashMap<String, ThemeConfig>,
}

impl ThemeRegistry {
    pub fn new(themes: Vec<ThemeConfig>) -> Self {
        Self {
            themes: themes.into_iter().map(|t| (t.id.clone(), t)).collect(),
        }
    }

    /// Loads the catalog stored under `catalog/themes`, or the built-in one
    /// when the store holds none.
    pub async fn load(store: &dyn DurableStore) -> Result<Self, StoreError> {
        match store.get(THEME_CATALOG_KEY).await? {
            Some(record) => {
                let themes: Vec<ThemeConfig> = serde_json::from_str(&record)?;
                info!(count = themes.len(), "Loaded theme catalog from store");
                Ok(Self::new(themes))
            }
            None => {
                warn!("No theme catalog in store, using built-in themes");
                Ok(Self::builtin())
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&ThemeConfig> {
        self.themes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.themes.contains_key(id)
    }

    /// All themes, sorted by id.
    pub fn list(&self) -> Vec<&ThemeConfig> {
        let mut themes: Vec<_> = self.themes.values().collect();
        themes.sort_by(|a, b| a.id.cmp(&b.id));
        themes
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            theme(
                "gestion_stress",
                "Gestion du stress",
                "bien-être",
                &["stress", "régulation émotionnelle", "pleine conscience", "récupération"],
                &["signaux corporels", "pensées automatiques", "équilibre", "limites"],
                &["cohérence cardiaque", "restructuration cognitive", "scan corporel"],
                &["problèmes financiers", "problèmes relationnels", "diagnostic médical"],
                &["stress", "pression", "tension", "calme", "respirer", "souffle", "détente"],
            ),
            theme(
                "techniques_relaxation",
                "Techniques de relaxation",
                "relaxation",
                &["respiration", "relaxation", "visualisation", "ancrage"],
                &["posture", "environnement calme", "routine du soir", "sensations"],
                &["respiration abdominale", "relaxation musculaire progressive", "lieu sûr"],
                &["problèmes financiers", "problèmes relationnels", "médicaments"],
                &["détente", "calme", "respirer", "souffle", "muscles", "relâcher", "apaisement"],
            ),
            theme(
                "confiance_en_soi",
                "Confiance en soi",
                "développement personnel",
                &["estime de soi", "auto-compassion", "forces personnelles", "dialogue intérieur"],
                &["réussites", "valeurs", "affirmation", "objectifs"],
                &["journal des réussites", "recadrage", "affirmations positives"],
                &["comparaison sociale", "problèmes financiers", "diagnostic médical"],
                &["confiance", "capable", "fierté", "valeur", "forces", "oser"],
            ),
            theme(
                "sommeil_reparateur",
                "Sommeil réparateur",
                "santé",
                &["sommeil", "rythme", "endormissement", "récupération"],
                &["routine du soir", "écrans", "lumière", "sieste"],
                &["hygiène du sommeil", "relaxation musculaire progressive", "scan corporel"],
                &["médicaments", "problèmes financiers", "problèmes relationnels"],
                &["dormir", "nuit", "fatigue", "réveil", "repos", "lit"],
            ),
        ])
    }
}

#[allow(clippy::too_many_arguments)]
fn theme(
    id: &str,
    display_name: &str,
    category: &str,
    core_concepts: &[&str],
    allowed_subtopics: &[&str],
    related_techniques: &[&str],
    prohibited_topics: &[&str],
    focus_keywords: &[&str],
) -> ThemeConfig {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    ThemeConfig {
        id: id.to_string(),
        display_name: display_name.to_string(),
        category: category.to_string(),
        core_concepts: owned(core_concepts),
        allowed_subtopics: owned(allowed_subtopics),
        related_techniques: owned(related_techniques),
        prohibited_topics: owned(prohibited_topics),
        focus_keywords: owned(focus_keywords),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[test]
    fn test_builtin_lookup() {
        let registry = ThemeRegistry::builtin();
        let relaxation = registry.get("techniques_relaxation").unwrap();
        assert_eq!(relaxation.display_name, "Techniques de relaxation");
        assert!(relaxation.core_concepts.contains(&"respiration".to_string()));
        assert!(registry.get("astrologie").is_none());
    }

    #[test]
    fn test_list_is_sorted() {
        let registry = ThemeRegistry::builtin();
        let ids: Vec<_> = registry.list().iter().map(|t| t.id.as_str()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 4);
    }

    #[tokio::test]
    async fn test_load_falls_back_to_builtin() {
        let store = InMemoryStore::new();
        let registry = ThemeRegistry::load(&store).await.unwrap();
        assert!(registry.contains("gestion_stress"));
    }

    #[tokio::test]
    async fn test_load_from_store() {
        let store = InMemoryStore::new();
        let custom = vec![theme(
            "marche_consciente",
            "Marche consciente",
            "mouvement",
            &["marche"],
            &[],
            &[],
            &[],
            &["pas"],
        )];
        store
            .put(THEME_CATALOG_KEY, serde_json::to_string(&custom).unwrap())
            .await
            .unwrap();

        let registry = ThemeRegistry::load(&store).await.unwrap();
        assert!(registry.contains("marche_consciente"));
        assert!(!registry.contains("gestion_stress"));
    }
}
