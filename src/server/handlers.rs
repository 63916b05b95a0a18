//! Route handlers.
//!
//! Thin mapping of requests to core operations: payloads deserialize
//! into typed requests, handlers call the engine or storage, and every
//! failure funnels through the canonical error envelope.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::error::EngineError;
use crate::core::roll::RollRequest;
use crate::core::state::diff_leaf_paths;
use crate::core::turn::PreviewRequest;
use crate::storage::DocKind;

use super::error::{ApiError, ApiResult};
use super::AppState;

// ============================================================================
// Request Types
// ============================================================================

fn default_template() -> String {
    "example-rogue".to_string()
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub slug: String,
    #[serde(default = "default_template")]
    pub template_slug: String,
}

fn default_ttl() -> u64 {
    300
}

#[derive(Debug, Deserialize)]
pub struct LockClaimRequest {
    pub owner: String,
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct OwnerQuery {
    pub owner: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TailQuery {
    pub tail: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub preview_id: String,
    #[serde(default)]
    pub lock_owner: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommitAndNarrateRequest {
    pub preview_id: String,
    #[serde(default)]
    pub lock_owner: Option<String>,
    #[serde(default)]
    pub player_intent: String,
}

fn default_save_name() -> String {
    "manual".to_string()
}

#[derive(Debug, Deserialize)]
pub struct SaveCreateRequest {
    #[serde(default = "default_save_name")]
    pub name: String,
    #[serde(default = "default_save_name")]
    pub save_type: String,
    #[serde(default)]
    pub lock_owner: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CharacterQuery {
    #[serde(default = "default_true")]
    pub persist_shared: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct DocWriteQuery {
    #[serde(default)]
    pub dry_run: bool,
    pub lock_owner: Option<String>,
}

// ============================================================================
// Health & Sessions
// ============================================================================

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let sessions = state.storage.list_sessions().await?;
    Ok(Json(json!({ "sessions": sessions })))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> ApiResult<Json<Value>> {
    state
        .storage
        .create_session(&request.slug, &request.template_slug)
        .await?;
    Ok(Json(json!({ "slug": request.slug })))
}

pub async fn session_state(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.storage.load_state(&slug).await?;
    Ok(Json(session.to_value()?))
}

pub async fn session_transcript(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<TailQuery>,
) -> ApiResult<Json<Value>> {
    let tail = query.tail.or(Some(state.settings.transcript_tail));
    let page = state
        .storage
        .load_transcript(&slug, tail, query.cursor.as_deref())
        .await?;
    Ok(Json(json!({ "items": page.items, "cursor": page.cursor })))
}

pub async fn session_changelog(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<TailQuery>,
) -> ApiResult<Json<Value>> {
    let tail = query.tail.or(Some(state.settings.changelog_tail));
    let page = state
        .storage
        .load_changelog(&slug, tail, query.cursor.as_deref())
        .await?;
    Ok(Json(json!({ "items": page.items, "cursor": page.cursor })))
}

pub async fn session_turn(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.storage.load_state(&slug).await?;
    let prompt = match state.storage.load_doc(&slug, DocKind::TurnPrompt).await? {
        Value::String(text) => text,
        Value::Object(map) => map
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    };
    let lock_status = state.storage.get_lock(&slug).await?;
    Ok(Json(json!({
        "prompt": prompt,
        "turn_number": session.turn,
        "lock_status": lock_status,
    })))
}

/// Reserved: session diff between two commits.
pub async fn session_diff(Path(_slug): Path<String>) -> ApiResult<Json<Value>> {
    // Response shape, when it lands: {"files": [{"path", "changes"}]}.
    Err(ApiError(EngineError::Unavailable(
        "session diff is not implemented".into(),
    )))
}

// ============================================================================
// Lock
// ============================================================================

pub async fn claim_lock(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<LockClaimRequest>,
) -> ApiResult<Json<Value>> {
    let info = state
        .storage
        .claim_lock(&slug, &request.owner, request.ttl)
        .await?;
    Ok(Json(json!({ "lock": info })))
}

pub async fn release_lock(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Value>> {
    state
        .storage
        .release_lock(&slug, query.owner.as_deref())
        .await?;
    Ok(Json(json!({ "released": true })))
}

pub async fn get_lock(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Value>> {
    let info = state.storage.get_lock(&slug).await?;
    Ok(Json(json!({ "lock": info })))
}

// ============================================================================
// Turn Protocol
// ============================================================================

pub async fn turn_preview(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<PreviewRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state.engine.preview(&slug, request).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(EngineError::from)?))
}

pub async fn turn_commit(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<CommitRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .engine
        .commit(&slug, &request.preview_id, request.lock_owner.as_deref())
        .await?;
    Ok(Json(json!({
        "state": outcome.state,
        "log_indices": outcome.log_indices,
        "rolls": outcome.rolls,
    })))
}

pub async fn turn_cancel_preview(
    State(state): State<AppState>,
    Path((slug, preview_id)): Path<(String, String)>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Value>> {
    state
        .engine
        .cancel_preview(&slug, &preview_id, query.owner.as_deref())
        .await?;
    Ok(Json(json!({ "cancelled": true })))
}

pub async fn turn_commit_and_narrate(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<CommitAndNarrateRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .engine
        .commit_and_narrate(
            &state.llm,
            &slug,
            &request.preview_id,
            request.lock_owner.as_deref(),
            &request.player_intent,
        )
        .await?;
    Ok(Json(serde_json::to_value(outcome).map_err(EngineError::from)?))
}

pub async fn turn_records(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let records = state
        .storage
        .load_turn_records(&slug, query.limit.unwrap_or(20))
        .await?;
    Ok(Json(json!({ "turns": records })))
}

pub async fn turn_record(
    State(state): State<AppState>,
    Path((slug, turn)): Path<(String, u64)>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.storage.load_turn_record(&slug, turn).await?))
}

// ============================================================================
// Rolls
// ============================================================================

pub async fn roll(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<RollRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state.rolls.perform(&slug, request).await?;
    Ok(Json(serde_json::to_value(outcome).map_err(EngineError::from)?))
}

// ============================================================================
// Snapshots
// ============================================================================

pub async fn list_saves(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let saves = state
        .storage
        .list_snapshots(&slug, query.limit.unwrap_or(10))
        .await?;
    Ok(Json(json!({ "saves": saves })))
}

pub async fn create_save(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<SaveCreateRequest>,
) -> ApiResult<Json<Value>> {
    let lock = state.storage.get_lock(&slug).await?;
    crate::core::lock::require_lock(lock.as_ref(), request.lock_owner.as_deref())?;
    let record = state
        .storage
        .create_snapshot(&slug, &request.name, &request.save_type)
        .await?;
    Ok(Json(serde_json::to_value(record).map_err(EngineError::from)?))
}

pub async fn get_save(
    State(state): State<AppState>,
    Path((slug, save_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let record = state.storage.load_snapshot(&slug, &save_id).await?;
    Ok(Json(serde_json::to_value(record).map_err(EngineError::from)?))
}

pub async fn restore_save(
    State(state): State<AppState>,
    Path((slug, save_id)): Path<(String, String)>,
    Query(query): Query<OwnerQuery>,
) -> ApiResult<Json<Value>> {
    let lock = state.storage.get_lock(&slug).await?;
    crate::core::lock::require_lock(lock.as_ref(), query.owner.as_deref())?;
    state.storage.restore_snapshot(&slug, &save_id).await?;
    Ok(Json(json!({ "restored": save_id })))
}

// ============================================================================
// Characters
// ============================================================================

pub async fn get_character(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(state.storage.load_character(&slug).await?))
}

pub async fn put_character(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Query(query): Query<CharacterQuery>,
    Json(character): Json<Value>,
) -> ApiResult<Json<Value>> {
    if !character.is_object() {
        return Err(ApiError(EngineError::schema("character must be an object")));
    }
    let saved = state
        .storage
        .save_character(&slug, &character, query.persist_shared)
        .await?;
    Ok(Json(saved))
}

// ============================================================================
// Aux Docs
// ============================================================================

fn parse_doc_kind(kind: &str) -> Result<DocKind, ApiError> {
    DocKind::from_key(kind)
        .ok_or_else(|| ApiError(EngineError::schema(format!("unknown doc kind '{kind}'"))))
}

pub async fn get_doc(
    State(state): State<AppState>,
    Path((slug, kind)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let kind = parse_doc_kind(&kind)?;
    Ok(Json(state.storage.load_doc(&slug, kind).await?))
}

pub async fn put_doc(
    State(state): State<AppState>,
    Path((slug, kind)): Path<(String, String)>,
    Query(query): Query<DocWriteQuery>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let kind = parse_doc_kind(&kind)?;
    let lock = state.storage.get_lock(&slug).await?;
    crate::core::lock::require_lock(lock.as_ref(), query.lock_owner.as_deref())?;

    let current = state.storage.load_doc(&slug, kind).await?;
    let diffs = diff_leaf_paths(&current, &payload);
    let mut warnings: Vec<String> = Vec::new();
    if payload.is_array() != kind.empty_value().is_array() {
        warnings.push(format!(
            "payload shape differs from the usual {} layout",
            kind.key()
        ));
    }

    if query.dry_run {
        return Ok(Json(json!({
            "dry_run": true,
            "diffs": diffs,
            "warnings": warnings,
        })));
    }

    state.storage.save_doc(&slug, kind, &payload).await?;
    Ok(Json(json!({
        "saved": kind.key(),
        "diffs": diffs,
        "warnings": warnings,
    })))
}

// ============================================================================
// Entropy
// ============================================================================

pub async fn entropy_preview(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(5).clamp(1, 50);
    let entries = state.storage.entropy_peek(limit).await?;
    Ok(Json(json!({ "entropy": entries })))
}
