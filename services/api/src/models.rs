//! API and Database Models
//!
//! Row types mapped with `sqlx`, plus the request and response bodies
//! documented with `utoipa`. Engine results are embedded as-is; their shape
//! is owned by `cadence-core`, so they appear as free-form objects in the
//! OpenAPI document.

use cadence_core::{
    AdjustmentDecision, AdjustmentKind, ExpertStyle, RecoveryOutcome, SaveResult, SessionStarted,
    SessionType, SessionView, StopReport, ThemeConfig, TranscriptMessage, TurnOutcome,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Serialize, Deserialize, ToSchema, Clone, Copy, PartialEq)]
#[sqlx(type_name = "message_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Expert,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Expert => write!(f, "expert"),
        }
    }
}

/// A persisted history row.
#[derive(Serialize, Deserialize, ToSchema, FromRow, Debug, Clone)]
pub struct Message {
    pub id: i64,
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    #[schema(value_type = String, example = "user")]
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct CreateSessionPayload {
    #[schema(value_type = String, example = "standard")]
    pub session_type: SessionType,
    #[schema(example = "gestion_stress")]
    pub theme_id: String,
    #[serde(default)]
    #[schema(value_type = Option<String>, example = "warm")]
    pub expert_style: Option<ExpertStyle>,
    #[serde(default)]
    #[schema(value_type = Option<String>, format = Uuid)]
    pub session_id: Option<Uuid>,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct RecordMessagePayload {
    #[schema(value_type = String, example = "user")]
    pub role: MessageRole,
    #[schema(example = "Je me sens tendu depuis lundi.")]
    pub content: String,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct AdjustmentPayload {
    #[schema(value_type = String, example = "extend")]
    pub kind: AdjustmentKind,
    #[schema(example = "user deeply engaged")]
    pub reason: String,
}

#[derive(Deserialize, ToSchema, Debug)]
pub struct AdaptationPayload {
    #[schema(example = "more_examples")]
    pub adaptation: String,
}

#[derive(Serialize, ToSchema)]
pub struct SessionStartedResponse {
    #[schema(value_type = Object)]
    pub started: SessionStarted,
}

#[derive(Serialize, ToSchema)]
pub struct SessionResponse {
    #[schema(value_type = Object)]
    pub session: SessionView,
}

#[derive(Serialize, ToSchema)]
pub struct TurnResponse {
    #[schema(value_type = Object)]
    pub turn: TurnOutcome,
}

#[derive(Serialize, ToSchema)]
pub struct TranscriptResponse {
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    /// Messages held by the live session.
    #[schema(value_type = Vec<Object>)]
    pub transcript: Vec<TranscriptMessage>,
    /// Persisted history; empty when no database is configured.
    pub history: Vec<Message>,
}

#[derive(Serialize, ToSchema)]
pub struct ToggleResponse {
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    /// False when the call was a no-op (already paused, not paused).
    pub changed: bool,
}

#[derive(Serialize, ToSchema)]
pub struct AdjustmentResponse {
    #[schema(value_type = Option<Object>)]
    pub adjustment: Option<AdjustmentDecision>,
}

#[derive(Serialize, ToSchema)]
pub struct AdaptationResponse {
    pub applied: bool,
}

#[derive(Serialize, ToSchema)]
pub struct CheckpointResponse {
    #[schema(value_type = Object)]
    pub checkpoint: SaveResult,
}

#[derive(Serialize, ToSchema)]
pub struct RecoveryResponse {
    #[schema(value_type = Object)]
    pub recovery: RecoveryOutcome,
}

#[derive(Serialize, ToSchema)]
pub struct StopResponse {
    #[schema(value_type = Object)]
    pub report: StopReport,
}

#[derive(Serialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ThemeSummary {
    pub id: String,
    pub display_name: String,
    pub category: String,
    pub core_concepts: Vec<String>,
    pub related_techniques: Vec<String>,
}

impl From<&ThemeConfig> for ThemeSummary {
    fn from(theme: &ThemeConfig) -> Self {
        Self {
            id: theme.id.clone(),
            display_name: theme.display_name.clone(),
            category: theme.category.clone(),
            core_concepts: theme.core_concepts.clone(),
            related_techniques: theme.related_techniques.clone(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ThemeRegistry;
    use chrono::TimeZone;

    #[test]
    fn test_message_role_serialization() {
        assert_eq!(serde_json::to_string(&MessageRole::User).unwrap(), "\"user\"");
        assert_eq!(serde_json::to_string(&MessageRole::Expert).unwrap(), "\"expert\"");

        let role: MessageRole = serde_json::from_str("\"expert\"").unwrap();
        assert_eq!(role, MessageRole::Expert);
        assert!(serde_json::from_str::<MessageRole>("\"assistant\"").is_err());
    }

    #[test]
    fn test_message_role_display() {
        assert_eq!(format!("{}", MessageRole::User), "user");
        assert_eq!(format!("{}", MessageRole::Expert), "expert");
    }

    #[test]
    fn test_create_session_payload_defaults() {
        let json = r#"{"session_type": "first", "theme_id": "confiance_en_soi"}"#;
        let payload: CreateSessionPayload = serde_json::from_str(json).unwrap();

        assert_eq!(payload.session_type, SessionType::First);
        assert_eq!(payload.theme_id, "confiance_en_soi");
        assert!(payload.expert_style.is_none());
        assert!(payload.session_id.is_none());
    }

    #[test]
    fn test_create_session_payload_missing_theme() {
        let result: Result<CreateSessionPayload, _> =
            serde_json::from_str(r#"{"session_type": "standard"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_adjustment_payload_deserialization() {
        let payload: AdjustmentPayload =
            serde_json::from_str(r#"{"kind": "emergency_extend", "reason": "crisis"}"#).unwrap();
        assert_eq!(payload.kind, AdjustmentKind::EmergencyExtend);
        assert_eq!(payload.reason, "crisis");
    }

    #[test]
    fn test_message_serialization() {
        let created_at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();
        let message = Message {
            id: 42,
            session_id: Uuid::nil(),
            role: MessageRole::Expert,
            content: "Respirons ensemble.".to_string(),
            created_at,
        };

        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"role\":\"expert\""));

        let deserialized: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.id, 42);
        assert_eq!(deserialized.created_at, created_at);
    }

    #[test]
    fn test_theme_summary_from_config() {
        let registry = ThemeRegistry::builtin();
        let summary = ThemeSummary::from(registry.get("techniques_relaxation").unwrap());

        assert_eq!(summary.display_name, "Techniques de relaxation");
        assert!(summary.core_concepts.contains(&"respiration".to_string()));
    }

    #[test]
    fn test_error_response_serialization() {
        let error = ErrorResponse {
            message: "Session not found".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&error).unwrap(),
            r#"{"message":"Session not found"}"#
        );
    }
}
