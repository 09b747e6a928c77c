//! Transition Narrative Selector
//!
//! Picks the short bridge sentence handed to the reply generator when a
//! phase changes. A session gets exactly one opening; once it is used, any
//! template carrying a greeting is filtered out, and the previous bridge is
//! never picked twice in a row.

use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const PHASE_PLACEHOLDER: &str = "{next_phase}";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpertStyle {
    #[default]
    Warm,
    Structured,
    Energetic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionalState {
    #[default]
    Calm,
    Engaged,
    Anxious,
    Distressed,
}

/// A bridge sentence. `None` filters match anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeTemplate {
    pub id: String,
    pub text: String,
    pub to_phase: Option<String>,
    pub style: Option<ExpertStyle>,
    pub emotional_state: Option<EmotionalState>,
    pub forced: Option<bool>,
}

impl BridgeTemplate {
    fn new(id: &str, text: &str) -> Self {
        Self {
            id: id.to_string(),
            text: text.to_string(),
            to_phase: None,
            style: None,
            emotional_state: None,
            forced: None,
        }
    }

    fn to_phase(mut self, phase_id: &str) -> Self {
        self.to_phase = Some(phase_id.to_string());
        self
    }

    fn style(mut self, style: ExpertStyle) -> Self {
        self.style = Some(style);
        self
    }

    fn emotional(mut self, state: EmotionalState) -> Self {
        self.emotional_state = Some(state);
        self
    }

    fn forced(mut self, forced: bool) -> Self {
        self.forced = Some(forced);
        self
    }

    fn matches(&self, request: &BridgeRequest<'_>) -> bool {
        self.to_phase.as_deref().is_none_or(|p| p == request.to_phase_id)
            && self.style.is_none_or(|s| s == request.style)
            && self.emotional_state.is_none_or(|e| e == request.emotional_state)
            && self.forced.is_none_or(|f| f == request.forced)
    }

    fn render(&self, next_phase: &str) -> Bridge {
        Bridge {
            template_id: self.id.clone(),
            text: self.text.replace(PHASE_PLACEHOLDER, next_phase),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bridge {
    pub template_id: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct NarrativeConfig {
    pub greeting_denylist: Vec<String>,
    pub openings: Vec<BridgeTemplate>,
    pub bridges: Vec<BridgeTemplate>,
    /// Theme-neutral bridges used when filtering leaves nothing. At least
    /// two are needed to alternate.
    pub fallbacks: Vec<BridgeTemplate>,
}

impl Default for NarrativeConfig {
    fn default() -> Self {
        use EmotionalState::*;
        use ExpertStyle::*;

        Self {
            greeting_denylist: [
                "bonjour", "bonsoir", "salut", "bienvenue", "hello", "good morning", "welcome",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            openings: vec![
                BridgeTemplate::new(
                    "opening_warm",
                    "Bonjour et bienvenue. Prenons quelques minutes pour commencer par : {next_phase}.",
                )
                .style(Warm),
                BridgeTemplate::new(
                    "opening_structured",
                    "Bonjour. Voici le déroulé de notre séance, en commençant par : {next_phase}.",
                )
                .style(Structured),
                BridgeTemplate::new(
                    "opening_energetic",
                    "Bonjour ! Ravi de vous retrouver, on démarre avec : {next_phase} !",
                )
                .style(Energetic),
            ],
            bridges: vec![
                BridgeTemplate::new(
                    "warm_next",
                    "Merci pour ce partage. Si vous le voulez bien, passons à : {next_phase}.",
                )
                .style(Warm),
                BridgeTemplate::new(
                    "warm_gentle",
                    "Vous avancez bien. Prenons maintenant un moment pour : {next_phase}.",
                )
                .style(Warm),
                BridgeTemplate::new(
                    "structured_next",
                    "Cette étape est terminée. Étape suivante : {next_phase}.",
                )
                .style(Structured),
                BridgeTemplate::new(
                    "structured_recap",
                    "Faisons le point avant d'aborder : {next_phase}.",
                )
                .style(Structured),
                BridgeTemplate::new("energetic_next", "Super, on enchaîne avec : {next_phase} !")
                    .style(Energetic),
                BridgeTemplate::new(
                    "energetic_welcome",
                    "Bienvenue dans la suite de la séance : {next_phase} !",
                )
                .style(Energetic),
                BridgeTemplate::new(
                    "practice_welcome",
                    "Bonjour à la pratique ! Place à : {next_phase}.",
                )
                .to_phase("practice"),
                BridgeTemplate::new(
                    "forced_time",
                    "Le temps file, je vous propose d'avancer vers : {next_phase}.",
                )
                .forced(true),
                BridgeTemplate::new(
                    "distressed_pause",
                    "Prenons un instant pour souffler. Quand vous serez prêt, nous passerons à : {next_phase}.",
                )
                .emotional(Distressed),
                BridgeTemplate::new(
                    "anxious_reassure",
                    "Tout va bien, nous avançons à votre rythme vers : {next_phase}.",
                )
                .emotional(Anxious),
                BridgeTemplate::new(
                    "wrap_up_close",
                    "Nous arrivons doucement à la fin de la séance : {next_phase}.",
                )
                .to_phase("wrap_up"),
            ],
            fallbacks: vec![
                BridgeTemplate::new("fallback_next", "Passons maintenant à : {next_phase}."),
                BridgeTemplate::new("fallback_continue", "Continuons avec : {next_phase}."),
            ],
        }
    }
}

/// Per-session narrative memory, persisted with the session checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NarrativeState {
    pub opening_used: bool,
    pub last_bridge_id: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeRequest<'a> {
    pub from_phase_id: &'a str,
    pub to_phase_id: &'a str,
    pub to_phase_name: &'a str,
    pub style: ExpertStyle,
    pub emotional_state: EmotionalState,
    pub forced: bool,
}

#[derive(Debug, Clone)]
pub struct NarrativeSelector {
    config: NarrativeConfig,
}

impl NarrativeSelector {
    pub fn new(config: NarrativeConfig) -> Self {
        Self { config }
    }

    pub fn contains_greeting(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.config
            .greeting_denylist
            .iter()
            .any(|g| text.contains(&g.to_lowercase()))
    }

    /// The session's single opening. Returns `None` once it has been used.
    pub fn select_opening<R: Rng + ?Sized>(
        &self,
        state: &mut NarrativeState,
        style: ExpertStyle,
        first_phase_name: &str,
        rng: &mut R,
    ) -> Option<Bridge> {
        if state.opening_used {
            warn!("Opening narrative already used for this session");
            return None;
        }
        let styled: Vec<&BridgeTemplate> = self
            .config
            .openings
            .iter()
            .filter(|t| t.style.is_none_or(|s| s == style))
            .collect();
        let template = styled
            .choose(rng)
            .copied()
            .or_else(|| self.config.openings.first())?;

        state.opening_used = true;
        state.last_bridge_id = Some(template.id.clone());
        Some(template.render(first_phase_name))
    }

    pub fn select_bridge<R: Rng + ?Sized>(
        &self,
        state: &mut NarrativeState,
        request: &BridgeRequest<'_>,
        rng: &mut R,
    ) -> Bridge {
        let last = state.last_bridge_id.as_deref();
        let candidates: Vec<&BridgeTemplate> = self
            .config
            .bridges
            .iter()
            .filter(|t| t.matches(request))
            .filter(|t| !(state.opening_used && self.contains_greeting(&t.text)))
            .filter(|t| Some(t.id.as_str()) != last)
            .collect();

        let template = match candidates.choose(rng) {
            Some(template) => *template,
            None => {
                debug!(
                    from = request.from_phase_id,
                    to = request.to_phase_id,
                    "No bridge candidate left, using neutral fallback"
                );
                self.fallback(last)
            }
        };

        state.last_bridge_id = Some(template.id.clone());
        template.render(request.to_phase_name)
    }

    /// Bridge used when a recovered session picks up again.
    pub fn resume_bridge(&self, state: &mut NarrativeState, phase_name: &str, recap: bool) -> Bridge {
        let bridge = if recap {
            Bridge {
                template_id: "resume_recap".to_string(),
                text: format!(
                    "Reprenons. Rappelons brièvement où nous en étions avant de poursuivre : {phase_name}."
                ),
            }
        } else {
            Bridge {
                template_id: "resume_immediate".to_string(),
                text: format!("Reprenons là où nous nous étions arrêtés : {phase_name}."),
            }
        };
        state.last_bridge_id = Some(bridge.template_id.clone());
        bridge
    }

    fn fallback(&self, last: Option<&str>) -> &BridgeTemplate {
        self.config
            .fallbacks
            .iter()
            .find(|t| Some(t.id.as_str()) != last)
            .or_else(|| self.config.fallbacks.first())
            .unwrap_or(&NEUTRAL_FALLBACK)
    }
}

static NEUTRAL_FALLBACK: std::sync::LazyLock<BridgeTemplate> =
    std::sync::LazyLock::new(|| BridgeTemplate::new("fallback_neutral", "Poursuivons : {next_phase}."));

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn request<'a>(to: &'a str, style: ExpertStyle) -> BridgeRequest<'a> {
        BridgeRequest {
            from_phase_id: "welcome",
            to_phase_id: to,
            to_phase_name: to,
            style,
            emotional_state: EmotionalState::Calm,
            forced: false,
        }
    }

    #[test]
    fn test_opening_is_used_once() {
        let selector = NarrativeSelector::new(NarrativeConfig::default());
        let mut state = NarrativeState::default();
        let mut rng = StdRng::seed_from_u64(7);

        let opening = selector
            .select_opening(&mut state, ExpertStyle::Warm, "Accueil", &mut rng)
            .unwrap();
        assert!(opening.text.contains("Accueil"));
        assert!(state.opening_used);
        assert!(
            selector
                .select_opening(&mut state, ExpertStyle::Warm, "Accueil", &mut rng)
                .is_none()
        );
    }

    #[test]
    fn test_no_greeting_repeats_across_transitions() {
        let selector = NarrativeSelector::new(NarrativeConfig::default());
        for seed in 0..20 {
            let mut state = NarrativeState::default();
            let mut rng = StdRng::seed_from_u64(seed);
            let mut texts = vec![
                selector
                    .select_opening(&mut state, ExpertStyle::Energetic, "Accueil", &mut rng)
                    .unwrap()
                    .text,
            ];
            for to in ["discovery", "core_content", "practice", "practice", "wrap_up"] {
                texts.push(
                    selector
                        .select_bridge(&mut state, &request(to, ExpertStyle::Energetic), &mut rng)
                        .text,
                );
            }
            let greetings = texts.iter().filter(|t| selector.contains_greeting(t)).count();
            assert_eq!(greetings, 1, "seed {seed}: {texts:?}");
        }
    }

    #[test]
    fn test_previous_bridge_is_not_repeated() {
        let selector = NarrativeSelector::new(NarrativeConfig::default());
        let mut state = NarrativeState {
            opening_used: true,
            last_bridge_id: None,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let mut previous = None;
        for _ in 0..30 {
            let bridge = selector.select_bridge(&mut state, &request("review", ExpertStyle::Structured), &mut rng);
            assert_ne!(Some(bridge.template_id.clone()), previous);
            previous = Some(bridge.template_id);
        }
    }

    #[test]
    fn test_fallback_alternates_when_filtering_empties_candidates() {
        let config = NarrativeConfig {
            bridges: vec![BridgeTemplate::new("only_greeting", "Bonjour, voici : {next_phase}.")],
            ..NarrativeConfig::default()
        };
        let selector = NarrativeSelector::new(config);
        let mut state = NarrativeState {
            opening_used: true,
            last_bridge_id: None,
        };
        let mut rng = StdRng::seed_from_u64(1);

        let first = selector.select_bridge(&mut state, &request("review", ExpertStyle::Warm), &mut rng);
        let second = selector.select_bridge(&mut state, &request("practice", ExpertStyle::Warm), &mut rng);

        assert_eq!(first.template_id, "fallback_next");
        assert_eq!(second.template_id, "fallback_continue");
        assert_eq!(second.text, "Continuons avec : practice.");
    }

    #[test]
    fn test_distressed_state_prefers_soft_bridges() {
        let selector = NarrativeSelector::new(NarrativeConfig::default());
        let mut state = NarrativeState {
            opening_used: true,
            last_bridge_id: None,
        };
        let mut rng = StdRng::seed_from_u64(11);
        let req = BridgeRequest {
            emotional_state: EmotionalState::Distressed,
            ..request("review", ExpertStyle::Structured)
        };
        let ids: Vec<String> = (0..50)
            .map(|_| selector.select_bridge(&mut state, &req, &mut rng).template_id)
            .collect();
        assert!(ids.iter().any(|id| id == "distressed_pause"));
        assert!(ids.iter().all(|id| id != "anxious_reassure"));
    }

    #[test]
    fn test_resume_bridge_has_no_greeting() {
        let selector = NarrativeSelector::new(NarrativeConfig::default());
        let mut state = NarrativeState {
            opening_used: true,
            last_bridge_id: Some("warm_next".into()),
        };
        let bridge = selector.resume_bridge(&mut state, "Pratique", true);
        assert!(!selector.contains_greeting(&bridge.text));
        assert_eq!(state.last_bridge_id.as_deref(), Some("resume_recap"));
    }
}
