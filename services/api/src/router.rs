//! Axum Router Configuration
//!
//! REST routes for session control, the WebSocket endpoint, and the
//! OpenAPI document served through Swagger UI.

use crate::{
    handlers,
    models::{
        AdaptationPayload, AdaptationResponse, AdjustmentPayload, AdjustmentResponse,
        CheckpointResponse, CreateSessionPayload, ErrorResponse, Message, MessageRole,
        RecordMessagePayload, RecoveryResponse, SessionResponse, SessionStartedResponse,
        StopResponse, ThemeSummary, ToggleResponse, TranscriptResponse, TurnResponse,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::create_session,
        handlers::get_session,
        handlers::record_message,
        handlers::list_messages,
        handlers::pause_session,
        handlers::resume_session,
        handlers::request_adjustment,
        handlers::confirm_adjustment,
        handlers::apply_adaptation,
        handlers::save_checkpoint,
        handlers::recover_session,
        handlers::stop_session,
        handlers::list_themes,
    ),
    components(
        schemas(
            CreateSessionPayload, RecordMessagePayload, AdjustmentPayload, AdaptationPayload,
            SessionStartedResponse, SessionResponse, TurnResponse, TranscriptResponse,
            ToggleResponse, AdjustmentResponse, AdaptationResponse, CheckpointResponse,
            RecoveryResponse, StopResponse, ThemeSummary, Message, MessageRole, ErrorResponse
        )
    ),
    tags(
        (name = "Cadence API", description = "Phase orchestration for guided conversational sessions")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/sessions", post(handlers::create_session))
        .route("/sessions/{id}", get(handlers::get_session))
        .route(
            "/sessions/{id}/messages",
            get(handlers::list_messages).post(handlers::record_message),
        )
        .route("/sessions/{id}/pause", post(handlers::pause_session))
        .route("/sessions/{id}/resume", post(handlers::resume_session))
        .route(
            "/sessions/{id}/adjustments",
            post(handlers::request_adjustment),
        )
        .route(
            "/sessions/{id}/adjustments/confirm",
            post(handlers::confirm_adjustment),
        )
        .route(
            "/sessions/{id}/adaptations",
            post(handlers::apply_adaptation),
        )
        .route("/sessions/{id}/checkpoint", post(handlers::save_checkpoint))
        .route("/sessions/{id}/recover", post(handlers::recover_session))
        .route("/sessions/{id}/stop", post(handlers::stop_session))
        .route("/themes", get(handlers::list_themes))
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
