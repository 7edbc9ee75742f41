use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::models::*;
use crate::{db, tasks, AppState};
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

// ============================================================
// Profile
// ============================================================

/// GET /profile - Current user, safe fields only
pub async fn get_profile(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Result<Json<SafeUser>, ApiError> {
    let user = db::get_user(&state.db, user_id)
        .await?
        .ok_or(ApiError::UserNotFound)?;
    Ok(Json(user.safe()))
}

/// PUT /profile - Merge entries into the profile mapping
pub async fn update_profile(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(payload): Json<UpdateProfileRequest>,
) -> Result<Json<SafeUser>, ApiError> {
    if payload.profile.is_empty() {
        return Err(ApiError::InvalidInput("profile entries are required".to_string()));
    }

    db::merge_profile(&state.db, user_id, &payload.profile).await?;
    state.user_cache.invalidate(user_id).await;

    let user = db::get_user(&state.db, user_id)
        .await?
        .ok_or(ApiError::UserNotFound)?;
    Ok(Json(user.safe()))
}

// ============================================================
// Emotions
// ============================================================

/// POST /emotions - Log one emotion directly
pub async fn log_emotion(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(payload): Json<LogEmotionRequest>,
) -> Result<Json<EmotionEntry>, ApiError> {
    let mood = payload.mood.trim();
    if mood.is_empty() {
        return Err(ApiError::InvalidInput("mood must be a non-empty string".to_string()));
    }
    if !(1..=10).contains(&payload.intensity) {
        return Err(ApiError::InvalidInput("intensity must be between 1 and 10".to_string()));
    }

    let entry = EmotionEntry {
        emotion: mood.to_string(),
        intensity: Some(payload.intensity),
        context: payload.notes.clone(),
        timestamp: Utc::now(),
    };
    db::append_emotion(&state.db, user_id, &entry)
        .await
        .map_err(|e| ApiError::CommitFailed(e.to_string()))?;
    state.user_cache.invalidate(user_id).await;

    Ok(Json(entry))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// GET /emotions - Recent emotional log entries, newest first
pub async fn list_emotions(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<EmotionEntry>>, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let user = db::get_user(&state.db, user_id)
        .await?
        .ok_or(ApiError::UserNotFound)?;

    let entries: Vec<EmotionEntry> = user
        .emotional_log
        .into_iter()
        .rev()
        .take(limit)
        .collect();
    Ok(Json(entries))
}

// ============================================================
// Memory
// ============================================================

/// GET /memory - Recent memory messages, newest first
pub async fn list_memory(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<MemoryMessage>>, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 50) as i64;
    let memory = db::recent_memory(&state.db, user_id, limit).await?;
    Ok(Json(memory))
}

// ============================================================
// Tasks
// ============================================================

/// GET /run-tasks - Drain one batch of queued tasks
pub async fn run_tasks(
    State(state): State<AppState>,
) -> Result<Json<tasks::TaskRunSummary>, ApiError> {
    let summary = tasks::drain_due_tasks(&state.db).await?;
    Ok(Json(summary))
}

// ============================================================
// Health & Metrics
// ============================================================

/// GET /health - Liveness plus store and upstream probes
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => "ok",
        Err(_) => "unreachable",
    };
    let llm_api = if state.llm.probe().await { "ok" } else { "unreachable" };

    Json(json!({
        "server": "ok",
        "database": database,
        "llm_api": llm_api,
    }))
}

/// GET /metrics - Completion counters snapshot
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
