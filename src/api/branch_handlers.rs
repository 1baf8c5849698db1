use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};

use crate::api::handlers::{error_response, ApiError, ApiResult, AppState, ListResponse};
use crate::api::user_extractor::SessionId;
use crate::error::WithWarnings;
use crate::logic::{BranchManager, SchemaDiff};
use crate::model::{
    Branch, BranchInfo, BranchOrder, BranchStatus, CheckoutResult, Commit, DeleteBranchResult,
    ListBranchesOptions, NewBranch, ObjectChange, Ref, RefKind, SchemaSnapshot, UserContext,
};
use crate::store::traits::Store;

#[derive(Debug, Deserialize)]
pub struct ListBranchesQuery {
    pub status: Option<String>,
    pub include_deleted: Option<bool>,
    pub order_by: Option<String>,
}

impl ListBranchesQuery {
    fn into_options(self) -> Result<ListBranchesOptions, ApiError> {
        let status = self
            .status
            .map(|s| s.parse::<BranchStatus>())
            .transpose()
            .map_err(error_response)?;
        let order_by = self
            .order_by
            .map(|s| s.parse::<BranchOrder>())
            .transpose()
            .map_err(error_response)?
            .unwrap_or_default();

        Ok(ListBranchesOptions {
            status,
            include_deleted: self.include_deleted.unwrap_or(false),
            order_by,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteBranchQuery {
    pub force: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ApplyChangesRequest {
    pub changes: Vec<ObjectChange>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct NewTagRequest {
    pub name: String,
    pub commit_sha: String,
}

#[derive(Debug, Serialize)]
pub struct CommitResponse {
    pub commit: Commit,
    pub warnings: Vec<String>,
}

impl From<WithWarnings<Commit>> for CommitResponse {
    fn from(result: WithWarnings<Commit>) -> Self {
        Self {
            commit: result.value,
            warnings: result.warnings,
        }
    }
}

/// POST /branches
pub async fn create_branch<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    user: UserContext,
    RequestJson(req): RequestJson<NewBranch>,
) -> Result<(StatusCode, Json<Branch>), ApiError> {
    let branch = BranchManager::create_branch(
        &ctx.store,
        req,
        &user.user_id,
        ctx.settings.max_branch_name_length,
    )
    .await
    .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(branch)))
}

/// GET /branches?status=&include_deleted=&order_by=
pub async fn list_branches<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Query(query): Query<ListBranchesQuery>,
) -> ApiResult<ListResponse<BranchInfo>> {
    let options = query.into_options()?;
    let branches = BranchManager::list_branches(&ctx.store, &options)
        .await
        .map_err(error_response)?;
    Ok(Json(ListResponse::new(branches)))
}

/// DELETE /branches/:name?force=
pub async fn delete_branch<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(name): Path<String>,
    user: UserContext,
    Query(query): Query<DeleteBranchQuery>,
) -> ApiResult<DeleteBranchResult> {
    BranchManager::delete_branch(
        &ctx.store,
        &name,
        query.force.unwrap_or(false),
        &user.user_id,
    )
    .await
    .map(Json)
    .map_err(error_response)
}

/// POST /branches/:name/checkout
pub async fn checkout_branch<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(name): Path<String>,
    user: UserContext,
    SessionId(session_id): SessionId,
) -> ApiResult<CheckoutResult> {
    let mut session = ctx.sessions.checkout(&session_id, &user);
    let result = BranchManager::checkout_branch(&ctx.store, &mut session, &name)
        .await
        .map_err(error_response)?;
    ctx.sessions.store(session);
    Ok(Json(result))
}

/// POST /branches/:name/objects
pub async fn apply_changes<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(name): Path<String>,
    user: UserContext,
    RequestJson(req): RequestJson<ApplyChangesRequest>,
) -> Result<(StatusCode, Json<CommitResponse>), ApiError> {
    let result =
        BranchManager::apply_changes(&ctx.store, &name, req.changes, &user.user_id, &req.message)
            .await
            .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(result.into())))
}

/// GET /branches/:name/log?limit=
pub async fn get_commit_log<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(name): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<ListResponse<Commit>> {
    let commits = BranchManager::get_commit_log(&ctx.store, &name, query.limit)
        .await
        .map_err(error_response)?;
    Ok(Json(ListResponse::new(commits)))
}

/// GET /branches/:name/snapshot
pub async fn get_snapshot<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(name): Path<String>,
) -> ApiResult<SchemaSnapshot> {
    SchemaDiff::get_schema_snapshot(&ctx.store, &name)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /tags
pub async fn create_tag<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    RequestJson(req): RequestJson<NewTagRequest>,
) -> Result<(StatusCode, Json<Ref>), ApiError> {
    let tag = BranchManager::create_tag(&ctx.store, &req.name, &req.commit_sha)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(tag)))
}

/// GET /tags
pub async fn list_tags<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
) -> ApiResult<ListResponse<Ref>> {
    let tags = BranchManager::list_refs(&ctx.store, RefKind::Tag)
        .await
        .map_err(error_response)?;
    Ok(Json(ListResponse::new(tags)))
}
