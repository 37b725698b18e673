use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::schemas::session::{
    AnswerBody, EndedResponse, RecordAnswerRequest, RecordAnswerResponse, ResultResponse,
    SessionResponse, StartSessionRequest, SubmitResponse,
};
use crate::tasks::driver::SessionHandle;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/", post(start_session))
        .route("/:session_id", get(get_session))
        .route("/:session_id/resume", post(resume_session))
        .route("/:session_id/answers/:question_id", put(record_answer))
        .route("/:session_id/submit", post(submit_session))
        .route("/:session_id/retry", post(retry_submit))
        .route("/:session_id/result", get(get_result))
        .route("/:session_id/ended", get(wait_ended))
}

async fn live_handle(state: &AppState, session_id: &str) -> Result<SessionHandle, ApiError> {
    state
        .registry()
        .get(session_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Session {session_id} is not running here")))
}

async fn start_session(
    State(state): State<AppState>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let handle = state.registry().start(&payload.test_id).await?;
    tracing::info!(session_id = %handle.session_id(), test_id = %payload.test_id, "Exam session started");
    Ok((StatusCode::CREATED, Json(handle.snapshot().into())))
}

async fn resume_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let handle = state.registry().resume(&session_id).await?;
    Ok(Json(handle.snapshot().into()))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let handle = live_handle(&state, &session_id).await?;
    Ok(Json(handle.snapshot().into()))
}

async fn record_answer(
    State(state): State<AppState>,
    Path((session_id, question_id)): Path<(String, String)>,
    Json(body): Json<AnswerBody>,
) -> Result<Json<RecordAnswerResponse>, ApiError> {
    let payload = RecordAnswerRequest { question_id, value: body.value };
    payload.validate().map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let handle = live_handle(&state, &session_id).await?;
    let local_version = handle.record(payload.question_id.clone(), payload.value).await?;
    Ok(Json(RecordAnswerResponse { question_id: payload.question_id, local_version }))
}

async fn submit_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let handle = live_handle(&state, &session_id).await?;
    let outcome = handle.submit().await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { outcome, phase: handle.snapshot().phase })))
}

async fn retry_submit(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let handle = live_handle(&state, &session_id).await?;
    handle.retry_submit().await?;
    Ok((StatusCode::ACCEPTED, Json(handle.snapshot().into())))
}

async fn get_result(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<ResultResponse>, ApiError> {
    state
        .materializer()
        .get(&session_id)
        .await
        .map(|result| Json(result.into()))
        .ok_or_else(|| ApiError::NotFound(format!("No result for session {session_id} yet")))
}

/// Long-polls until the session reaches `Submitted` or `Expired`.
async fn wait_ended(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<EndedResponse>, ApiError> {
    let handle = live_handle(&state, &session_id).await?;
    match handle.ended().await {
        Some(phase) => Ok(Json(EndedResponse { session_id, ended: true, phase })),
        None => Ok(Json(EndedResponse { session_id, ended: false, phase: handle.snapshot().phase })),
    }
}
