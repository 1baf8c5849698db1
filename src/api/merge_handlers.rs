use axum::{
    extract::{Path, State},
    response::Json,
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};

use crate::api::handlers::{error_response, ApiResult, AppState, ListResponse};
use crate::error::VcsError;
use crate::logic::MergeEngine;
use crate::model::{
    MergeOutcome, MergeRecord, ResolutionStrategy, ResolveOutcome, SchemaConflict, UserContext,
};
use crate::store::traits::Store;

// Request/response structures
#[derive(Debug, Deserialize)]
pub struct MergeRequest {
    pub source: String,
    pub target: String,
    pub message: Option<String>,
}

/// Outcome plus its one-line rendering (`MERGE_SUCCESS:<id>` or
/// `CONFLICTS_DETECTED:<id>`).
#[derive(Debug, Serialize)]
pub struct MergeResponse {
    pub result: String,
    #[serde(flatten)]
    pub outcome: MergeOutcome,
}

impl From<MergeOutcome> for MergeResponse {
    fn from(outcome: MergeOutcome) -> Self {
        Self {
            result: outcome.to_string(),
            outcome,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResolveConflictRequest {
    #[serde(flatten)]
    pub strategy: ResolutionStrategy,
    #[serde(default)]
    pub apply: bool,
}

/// POST /merges
pub async fn merge_branches<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    user: UserContext,
    RequestJson(req): RequestJson<MergeRequest>,
) -> ApiResult<MergeResponse> {
    let outcome =
        MergeEngine::merge_branches(&ctx.store, &req.source, &req.target, req.message, &user.user_id)
            .await
            .map_err(error_response)?;
    Ok(Json(outcome.into()))
}

/// GET /merges/:id
pub async fn get_merge<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(merge_id): Path<String>,
) -> ApiResult<MergeRecord> {
    ctx.store
        .get_merge(&merge_id)
        .await
        .and_then(|record| record.ok_or_else(|| VcsError::not_found("merge", merge_id.as_str())))
        .map(Json)
        .map_err(error_response)
}

/// GET /merges/:id/conflicts
pub async fn list_conflicts<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(merge_id): Path<String>,
) -> ApiResult<ListResponse<SchemaConflict>> {
    let conflicts = MergeEngine::list_conflicts(&ctx.store, &merge_id)
        .await
        .map_err(error_response)?;
    Ok(Json(ListResponse::new(conflicts)))
}

/// POST /merges/:id/conflicts/:cid/resolve
pub async fn resolve_conflict<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path((merge_id, conflict_id)): Path<(String, String)>,
    user: UserContext,
    RequestJson(req): RequestJson<ResolveConflictRequest>,
) -> ApiResult<ResolveOutcome> {
    MergeEngine::resolve_conflict(
        &ctx.store,
        &merge_id,
        &conflict_id,
        req.strategy,
        &user.user_id,
        req.apply,
    )
    .await
    .map(Json)
    .map_err(error_response)
}

/// POST /merges/:id/apply
pub async fn apply_merge<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(merge_id): Path<String>,
    user: UserContext,
) -> ApiResult<MergeResponse> {
    let outcome = MergeEngine::apply_resolved_merge(&ctx.store, &merge_id, &user.user_id)
        .await
        .map_err(error_response)?;
    Ok(Json(outcome.into()))
}
