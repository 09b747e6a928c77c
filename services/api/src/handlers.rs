//! Axum Handlers for the REST API
//!
//! Thin adapters from HTTP to the session orchestrator. Engine errors are
//! mapped onto status codes by [`ApiError`].

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use cadence_core::{EngineError, StartSession};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    models::{
        AdaptationPayload, AdaptationResponse, AdjustmentPayload, AdjustmentResponse,
        CheckpointResponse, CreateSessionPayload, ErrorResponse, RecordMessagePayload,
        RecoveryResponse, SessionResponse, SessionStartedResponse, StopResponse, ThemeSummary,
        ToggleResponse, TranscriptResponse, TurnResponse,
    },
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Conflict(message) => {
                (StatusCode::CONFLICT, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Unavailable(message) => {
                warn!("Persistence unavailable: {}", message);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::UnknownPhase(_) | EngineError::UnknownTheme(_) => Self::BadRequest(message),
            EngineError::UnknownSession(_) | EngineError::NoCheckpoint(_) => Self::NotFound(message),
            EngineError::SessionInactive(_)
            | EngineError::SessionAlreadyActive(_)
            | EngineError::TimingViolation { .. } => Self::Conflict(message),
            EngineError::Persistence(_) => Self::Unavailable(message),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalServerError(err)
    }
}

/// Start a new session.
#[utoipa::path(
    post,
    path = "/sessions",
    request_body = CreateSessionPayload,
    responses(
        (status = 201, description = "Session started and first checkpoint written", body = SessionStartedResponse),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 409, description = "Session already running", body = ErrorResponse),
        (status = 503, description = "Checkpoint could not be written", body = ErrorResponse)
    )
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSessionPayload>,
) -> Result<impl IntoResponse, ApiError> {
    if payload.theme_id.trim().is_empty() {
        return Err(ApiError::BadRequest("theme_id must not be empty".to_string()));
    }
    let started = state
        .orchestrator
        .start_session(StartSession {
            session_type: payload.session_type,
            theme_id: payload.theme_id,
            expert_style: payload.expert_style.unwrap_or_default(),
            session_id: payload.session_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(SessionStartedResponse { started })))
}

/// Get the live state of a session.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session state", body = SessionResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.orchestrator.status(id).await?;
    Ok(Json(SessionResponse { session }))
}

/// Record a user or expert message and evaluate the phase.
#[utoipa::path(
    post,
    path = "/sessions/{id}/messages",
    request_body = RecordMessagePayload,
    responses(
        (status = 200, description = "Turn outcome", body = TurnResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session no longer active", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn record_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RecordMessagePayload>,
) -> Result<Json<TurnResponse>, ApiError> {
    let turn = state.record_message(id, payload.role, &payload.content).await?;
    Ok(Json(TurnResponse { turn }))
}

/// List the transcript of a session.
#[utoipa::path(
    get,
    path = "/sessions/{id}/messages",
    responses(
        (status = 200, description = "Transcript and persisted history", body = TranscriptResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<TranscriptResponse>, ApiError> {
    let transcript = state.orchestrator.transcript(id).await?;
    let history = match &state.db {
        Some(db) => db.get_session_messages(id).await?,
        None => Vec::new(),
    };
    Ok(Json(TranscriptResponse {
        session_id: id,
        transcript,
        history,
    }))
}

/// Open a processing interval; its time is excluded from every duration.
#[utoipa::path(
    post,
    path = "/sessions/{id}/pause",
    responses(
        (status = 200, description = "Pause state", body = ToggleResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn pause_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let changed = state.orchestrator.pause(id).await?;
    Ok(Json(ToggleResponse {
        session_id: id,
        changed,
    }))
}

/// Close the current processing interval.
#[utoipa::path(
    post,
    path = "/sessions/{id}/resume",
    responses(
        (status = 200, description = "Pause state", body = ToggleResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn resume_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let changed = state.orchestrator.resume(id).await?;
    Ok(Json(ToggleResponse {
        session_id: id,
        changed,
    }))
}

/// Ask the timer to extend, compress or emergency-extend the current phase.
#[utoipa::path(
    post,
    path = "/sessions/{id}/adjustments",
    request_body = AdjustmentPayload,
    responses(
        (status = 200, description = "Adjustment decision", body = AdjustmentResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn request_adjustment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AdjustmentPayload>,
) -> Result<Json<AdjustmentResponse>, ApiError> {
    let decision = state
        .orchestrator
        .request_adjustment(id, payload.kind, &payload.reason)
        .await?;
    Ok(Json(AdjustmentResponse {
        adjustment: Some(decision),
    }))
}

/// Apply the adjustment waiting for confirmation.
#[utoipa::path(
    post,
    path = "/sessions/{id}/adjustments/confirm",
    responses(
        (status = 200, description = "Applied adjustment, null when none was pending", body = AdjustmentResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn confirm_adjustment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AdjustmentResponse>, ApiError> {
    let adjustment = state.orchestrator.confirm_adjustment(id).await?;
    Ok(Json(AdjustmentResponse { adjustment }))
}

/// Record a style adaptation offered by the current phase.
#[utoipa::path(
    post,
    path = "/sessions/{id}/adaptations",
    request_body = AdaptationPayload,
    responses(
        (status = 200, description = "Whether the adaptation was applied", body = AdaptationResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn apply_adaptation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AdaptationPayload>,
) -> Result<Json<AdaptationResponse>, ApiError> {
    let applied = state
        .orchestrator
        .apply_adaptation(id, &payload.adaptation)
        .await?;
    Ok(Json(AdaptationResponse { applied }))
}

/// Write a checkpoint now.
#[utoipa::path(
    post,
    path = "/sessions/{id}/checkpoint",
    responses(
        (status = 200, description = "Checkpoint written", body = CheckpointResponse),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 503, description = "Store unavailable", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn save_checkpoint(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CheckpointResponse>, ApiError> {
    let checkpoint = state.orchestrator.checkpoint(id).await?;
    Ok(Json(CheckpointResponse { checkpoint }))
}

/// Resume an interrupted session from its latest checkpoint.
#[utoipa::path(
    post,
    path = "/sessions/{id}/recover",
    responses(
        (status = 200, description = "Session resumed", body = RecoveryResponse),
        (status = 404, description = "No checkpoint stored", body = ErrorResponse),
        (status = 409, description = "Session running or ended, or checkpoint failed verification with an unverified RecoveryResponse", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn recover_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let recovery = state.orchestrator.recover(id).await?;
    let status = if recovery.data_integrity_verified {
        StatusCode::OK
    } else {
        warn!(session_id = %id, "Checkpoint failed verification, nothing resumed");
        StatusCode::CONFLICT
    };
    Ok((status, Json(RecoveryResponse { recovery })))
}

/// Stop a session and write its final checkpoint.
#[utoipa::path(
    post,
    path = "/sessions/{id}/stop",
    responses(
        (status = 200, description = "Timing report", body = StopResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    params(("id" = Uuid, Path, description = "Session ID"))
)]
pub async fn stop_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<StopResponse>, ApiError> {
    let report = state.orchestrator.stop(id).await?;
    Ok(Json(StopResponse { report }))
}

/// List the available themes.
#[utoipa::path(
    get,
    path = "/themes",
    responses((status = 200, description = "Theme catalog", body = [ThemeSummary]))
)]
pub async fn list_themes(State(state): State<Arc<AppState>>) -> Json<Vec<ThemeSummary>> {
    let themes = state.orchestrator.themes();
    Json(themes.list().into_iter().map(ThemeSummary::from).collect())
}
