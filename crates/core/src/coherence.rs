//! Thematic Coherence Validator
//!
//! Scores messages against the active theme, decides whether the user is
//! digressing and how to bring the conversation back, and screens outgoing
//! expert replies for prohibited topics.

use crate::theme::{ThemeConfig, ThemeRegistry};
use regex::{NoExpand, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct CoherenceConfig {
    pub focus_keyword_weight: f64,
    pub core_concept_weight: f64,
    pub subtopic_weight: f64,
    pub prohibited_penalty: f64,
    /// Messages scoring below this are candidates for digression.
    pub digression_threshold: f64,
    /// Topics that pull any session off course, whatever the theme.
    pub off_topic_keywords: Vec<String>,
    /// Terms signalling distress; they weigh heavily on severity.
    pub severity_triggers: Vec<String>,
    /// Minimum share of core concepts an outgoing reply must mention.
    pub min_core_concept_share: f64,
    /// Word count at which user engagement saturates.
    pub engagement_saturation_words: usize,
    pub placeholder: String,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            focus_keyword_weight: 0.1,
            core_concept_weight: 0.2,
            subtopic_weight: 0.05,
            prohibited_penalty: 0.3,
            digression_threshold: 0.5,
            off_topic_keywords: owned(&[
                "travail", "boulot", "patron", "argent", "politique", "élections", "football",
                "match", "vacances", "météo", "série", "film", "voiture", "impôts",
            ]),
            severity_triggers: owned(&[
                "suicide", "me tuer", "en finir", "me faire du mal", "mourir", "violence",
                "urgence", "je n'en peux plus",
            ]),
            min_core_concept_share: 0.25,
            engagement_saturation_words: 20,
            placeholder: "[…]".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigressionSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecenteringStrategy {
    /// Straight back to the theme, no softening.
    DirectRefocus,
    /// Acknowledge the concern, defer it, redirect.
    EmpatheticBridge,
    GentleRedirect,
    AcknowledgeAndPostpone,
}

impl RecenteringStrategy {
    pub fn hint(self, theme_name: &str) -> String {
        match self {
            Self::DirectRefocus => format!("Recentrons-nous maintenant sur : {theme_name}."),
            Self::EmpatheticBridge => format!(
                "J'entends que c'est important pour vous. Gardons-le de côté pour plus tard et revenons à : {theme_name}."
            ),
            Self::GentleRedirect => {
                format!("C'est intéressant. Voyons comment cela rejoint : {theme_name}.")
            }
            Self::AcknowledgeAndPostpone => format!(
                "Notons ce point pour y revenir plus tard, et poursuivons avec : {theme_name}."
            ),
        }
    }
}

/// Per-message verdict on topic drift. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigressionAssessment {
    pub relevance_score: f64,
    pub detected_topics: Vec<String>,
    pub off_topic_elements: Vec<String>,
    pub severity: DigressionSeverity,
    pub user_engagement: f64,
    pub is_digression: bool,
    pub recommended_strategy: Option<RecenteringStrategy>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThematicAnalysis {
    pub theme_id: String,
    pub matched_keywords: Vec<String>,
    pub matched_concepts: Vec<String>,
    pub matched_subtopics: Vec<String>,
    pub prohibited_matches: Vec<String>,
    pub severity_triggers: Vec<String>,
    pub assessment: DigressionAssessment,
    pub recentering_hint: Option<String>,
    /// Set when the theme was unknown and a neutral analysis was returned.
    pub degraded: bool,
}

impl ThematicAnalysis {
    fn neutral(theme_id: &str) -> Self {
        Self {
            theme_id: theme_id.to_string(),
            matched_keywords: Vec::new(),
            matched_concepts: Vec::new(),
            matched_subtopics: Vec::new(),
            prohibited_matches: Vec::new(),
            severity_triggers: Vec::new(),
            assessment: DigressionAssessment {
                relevance_score: 1.0,
                detected_topics: Vec::new(),
                off_topic_elements: Vec::new(),
                severity: DigressionSeverity::Low,
                user_engagement: 0.0,
                is_digression: false,
                recommended_strategy: None,
            },
            recentering_hint: None,
            degraded: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingValidation {
    pub compliant: bool,
    pub violations: Vec<String>,
    pub corrected_text: String,
}

/// Case-insensitive whole-word patterns for a list of terms, so that
/// `série` does not fire inside `sérieux`.
#[derive(Debug, Clone, Default)]
struct TermSet {
    terms: Vec<(String, Regex)>,
}

impl TermSet {
    fn new(terms: &[String]) -> Self {
        let terms = terms
            .iter()
            .filter(|term| !term.trim().is_empty())
            .filter_map(|term| match word_pattern(term) {
                Ok(re) => Some((term.clone(), re)),
                Err(e) => {
                    warn!(error = %e, term = %term, "Could not compile term pattern, skipping");
                    None
                }
            })
            .collect();
        Self { terms }
    }

    fn matching(&self, text: &str) -> Vec<String> {
        self.terms
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(term, _)| term.clone())
            .collect()
    }

    fn pattern(&self, term: &str) -> Option<&Regex> {
        self.terms.iter().find(|(t, _)| t == term).map(|(_, re)| re)
    }
}

/// `\b` is only anchored on ends that are word characters.
fn word_pattern(term: &str) -> Result<Regex, regex::Error> {
    let is_word = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '_');
    let start = if is_word(term.chars().next()) { r"\b" } else { "" };
    let end = if is_word(term.chars().last()) { r"\b" } else { "" };
    RegexBuilder::new(&format!("{start}{}{end}", regex::escape(term)))
        .case_insensitive(true)
        .build()
}

#[derive(Debug, Clone)]
struct ThemeTerms {
    focus_keywords: TermSet,
    core_concepts: TermSet,
    allowed_subtopics: TermSet,
    prohibited_topics: TermSet,
}

impl ThemeTerms {
    fn new(theme: &ThemeConfig) -> Self {
        Self {
            focus_keywords: TermSet::new(&theme.focus_keywords),
            core_concepts: TermSet::new(&theme.core_concepts),
            allowed_subtopics: TermSet::new(&theme.allowed_subtopics),
            prohibited_topics: TermSet::new(&theme.prohibited_topics),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThematicCoherenceValidator {
    themes: Arc<ThemeRegistry>,
    config: CoherenceConfig,
    theme_terms: HashMap<String, ThemeTerms>,
    off_topic: TermSet,
    triggers: TermSet,
}

impl ThematicCoherenceValidator {
    /// Compiles the term patterns of every theme once.
    pub fn new(themes: Arc<ThemeRegistry>, config: CoherenceConfig) -> Self {
        let theme_terms = themes
            .list()
            .into_iter()
            .map(|theme| (theme.id.clone(), ThemeTerms::new(theme)))
            .collect();
        Self {
            off_topic: TermSet::new(&config.off_topic_keywords),
            triggers: TermSet::new(&config.severity_triggers),
            themes,
            config,
            theme_terms,
        }
    }

    fn theme(&self, theme_id: &str) -> Option<(&ThemeConfig, &ThemeTerms)> {
        self.themes.get(theme_id).zip(self.theme_terms.get(theme_id))
    }

    pub fn analyze_message(&self, message: &str, theme_id: &str) -> ThematicAnalysis {
        let Some((theme, terms)) = self.theme(theme_id) else {
            warn!(theme = %theme_id, "Unknown theme, skipping coherence analysis");
            return ThematicAnalysis::neutral(theme_id);
        };

        let matched_keywords = terms.focus_keywords.matching(message);
        let matched_concepts = terms.core_concepts.matching(message);
        let matched_subtopics = terms.allowed_subtopics.matching(message);
        let prohibited_matches = terms.prohibited_topics.matching(message);
        let generic_off_topic = self.off_topic.matching(message);
        let severity_triggers = self.triggers.matching(message);

        let relevance_score = (matched_keywords.len() as f64 * self.config.focus_keyword_weight
            + matched_concepts.len() as f64 * self.config.core_concept_weight
            + matched_subtopics.len() as f64 * self.config.subtopic_weight
            - prohibited_matches.len() as f64 * self.config.prohibited_penalty)
            .clamp(0.0, 1.0);

        let mut off_topic_elements = prohibited_matches.clone();
        off_topic_elements.extend(generic_off_topic);

        let user_engagement = self.estimate_engagement(message);
        let is_digression = relevance_score < self.config.digression_threshold
            && (!off_topic_elements.is_empty() || !severity_triggers.is_empty());
        let severity = if is_digression {
            severity_tier(off_topic_elements.len(), severity_triggers.len(), user_engagement)
        } else {
            DigressionSeverity::Low
        };
        let recommended_strategy = is_digression.then(|| select_strategy(severity, user_engagement));
        let recentering_hint = recommended_strategy.map(|s| s.hint(&theme.display_name));

        let mut detected_topics = matched_concepts.clone();
        detected_topics.extend(matched_subtopics.iter().cloned());
        detected_topics.extend(matched_keywords.iter().cloned());

        debug!(
            theme = %theme.id,
            relevance = relevance_score,
            digression = is_digression,
            ?severity,
            "Analyzed message"
        );

        ThematicAnalysis {
            theme_id: theme.id.clone(),
            matched_keywords,
            matched_concepts,
            matched_subtopics,
            prohibited_matches,
            severity_triggers,
            assessment: DigressionAssessment {
                relevance_score,
                detected_topics,
                off_topic_elements,
                severity,
                user_engagement,
                is_digression,
                recommended_strategy,
            },
            recentering_hint,
            degraded: false,
        }
    }

    /// Checks an expert reply. Prohibited terms are excised, nothing is added.
    pub fn validate_outgoing(&self, response_text: &str, theme_id: &str) -> OutgoingValidation {
        let Some((theme, terms)) = self.theme(theme_id) else {
            warn!(theme = %theme_id, "Unknown theme, outgoing reply passed through");
            return OutgoingValidation {
                compliant: true,
                violations: Vec::new(),
                corrected_text: response_text.to_string(),
            };
        };
        let mut violations = Vec::new();

        let required = self.required_concepts(theme);
        let present = terms.core_concepts.matching(response_text).len();
        if present < required {
            violations.push(format!(
                "mentions {present} of the {required} core concepts required for '{}'",
                theme.display_name
            ));
        }

        let prohibited = terms.prohibited_topics.matching(response_text);
        let mut corrected_text = response_text.to_string();
        for term in &prohibited {
            violations.push(format!("mentions prohibited topic '{term}'"));
            if let Some(re) = terms.prohibited_topics.pattern(term) {
                corrected_text = re
                    .replace_all(&corrected_text, NoExpand(&self.config.placeholder))
                    .into_owned();
            }
        }

        OutgoingValidation {
            compliant: violations.is_empty(),
            violations,
            corrected_text,
        }
    }

    fn required_concepts(&self, theme: &ThemeConfig) -> usize {
        (theme.core_concepts.len() as f64 * self.config.min_core_concept_share).ceil() as usize
    }

    fn estimate_engagement(&self, message: &str) -> f64 {
        let words = message.split_whitespace().count() as f64;
        let saturation = self.config.engagement_saturation_words.max(1) as f64;
        (words / saturation).min(1.0)
    }
}

fn severity_tier(off_topic: usize, triggers: usize, engagement: f64) -> DigressionSeverity {
    let weight = off_topic as f64 * 0.2 + triggers as f64 * 0.6 + engagement * 0.3;
    if weight >= 0.9 {
        DigressionSeverity::Critical
    } else if weight >= 0.6 {
        DigressionSeverity::High
    } else if weight >= 0.35 {
        DigressionSeverity::Medium
    } else {
        DigressionSeverity::Low
    }
}

fn select_strategy(severity: DigressionSeverity, engagement: f64) -> RecenteringStrategy {
    match severity {
        DigressionSeverity::Critical => RecenteringStrategy::DirectRefocus,
        DigressionSeverity::High if engagement >= 0.5 => RecenteringStrategy::EmpatheticBridge,
        DigressionSeverity::High | DigressionSeverity::Medium => RecenteringStrategy::GentleRedirect,
        DigressionSeverity::Low => RecenteringStrategy::AcknowledgeAndPostpone,
    }
}
