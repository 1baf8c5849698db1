use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    Json as RequestJson,
};
use serde::{Deserialize, Serialize};

use crate::api::handlers::{error_response, ApiError, ApiResult, AppState, ListResponse};
use crate::api::user_extractor::SessionId;
use crate::logic::DataBranching;
use crate::model::{
    DataConflict, DataMergeSummary, DataResolution, QualifiedName, Row, UserContext, MAIN_BRANCH,
};
use crate::store::traits::Store;

#[derive(Debug, Deserialize)]
pub struct CreateDataBranchRequest {
    pub branch: String,
    pub source_branch: Option<String>,
    pub tables: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateDataBranchResponse {
    pub branch: String,
    pub tables_copied: usize,
}

#[derive(Debug, Deserialize)]
pub struct SwitchBranchRequest {
    pub branch: String,
}

#[derive(Debug, Serialize)]
pub struct SwitchBranchResponse {
    pub session_id: String,
    pub previous_branch: String,
    pub current_branch: String,
}

#[derive(Debug, Deserialize)]
pub struct DetectConflictsRequest {
    pub merge_id: String,
    pub table: String,
    pub source: String,
    pub target: String,
}

#[derive(Debug, Serialize)]
pub struct DetectConflictsResponse {
    pub conflicts: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveDataConflictRequest {
    pub resolution: DataResolution,
}

#[derive(Debug, Deserialize)]
pub struct ApplyDataMergeRequest {
    pub source: String,
    pub target: String,
    pub strategy: DataResolution,
}

#[derive(Debug, Serialize)]
pub struct RowCountResponse {
    pub affected: u64,
}

fn parse_table(table: &str) -> Result<QualifiedName, ApiError> {
    table.parse::<QualifiedName>().map_err(error_response)
}

/// POST /data/branches
pub async fn create_data_branch<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    RequestJson(req): RequestJson<CreateDataBranchRequest>,
) -> Result<(StatusCode, Json<CreateDataBranchResponse>), ApiError> {
    let tables = req
        .tables
        .iter()
        .map(|t| parse_table(t))
        .collect::<Result<Vec<_>, _>>()?;
    let source = req.source_branch.as_deref().unwrap_or(MAIN_BRANCH);

    let tables_copied = DataBranching::create_data_branch(&ctx.store, &req.branch, source, &tables)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateDataBranchResponse {
            branch: req.branch,
            tables_copied,
        }),
    ))
}

/// POST /data/switch
pub async fn switch_branch<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    user: UserContext,
    SessionId(session_id): SessionId,
    RequestJson(req): RequestJson<SwitchBranchRequest>,
) -> ApiResult<SwitchBranchResponse> {
    let mut session = ctx.sessions.checkout(&session_id, &user);
    let previous_branch = session.current_branch.clone();
    DataBranching::switch_branch(&ctx.store, &mut session, &req.branch)
        .await
        .map_err(error_response)?;
    let current_branch = session.current_branch.clone();
    ctx.sessions.store(session);

    Ok(Json(SwitchBranchResponse {
        session_id,
        previous_branch,
        current_branch,
    }))
}

/// GET /data/tables/:table/rows, routed through the session's branch
pub async fn select_rows<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(table): Path<String>,
    user: UserContext,
    SessionId(session_id): SessionId,
) -> ApiResult<ListResponse<Row>> {
    let table = parse_table(&table)?;
    let session = ctx.sessions.checkout(&session_id, &user);
    let rows = DataBranching::select_rows(&ctx.store, &session, &table)
        .await
        .map_err(error_response)?;
    Ok(Json(ListResponse::new(rows)))
}

/// POST /data/tables/:table/rows
pub async fn insert_row<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(table): Path<String>,
    user: UserContext,
    SessionId(session_id): SessionId,
    RequestJson(row): RequestJson<Row>,
) -> Result<(StatusCode, Json<RowCountResponse>), ApiError> {
    let table = parse_table(&table)?;
    let session = ctx.sessions.checkout(&session_id, &user);
    DataBranching::insert_row(&ctx.store, &session, &table, row)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::CREATED, Json(RowCountResponse { affected: 1 })))
}

/// PUT /data/tables/:table/rows, matched on the primary key
pub async fn update_row<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(table): Path<String>,
    user: UserContext,
    SessionId(session_id): SessionId,
    RequestJson(row): RequestJson<Row>,
) -> ApiResult<RowCountResponse> {
    let table = parse_table(&table)?;
    let session = ctx.sessions.checkout(&session_id, &user);
    let updated = DataBranching::update_row(&ctx.store, &session, &table, row)
        .await
        .map_err(error_response)?;
    Ok(Json(RowCountResponse {
        affected: u64::from(updated),
    }))
}

/// DELETE /data/tables/:table/rows with the key columns as body
pub async fn delete_row<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(table): Path<String>,
    user: UserContext,
    SessionId(session_id): SessionId,
    RequestJson(key): RequestJson<Row>,
) -> ApiResult<RowCountResponse> {
    let table = parse_table(&table)?;
    let session = ctx.sessions.checkout(&session_id, &user);
    let deleted = DataBranching::delete_row(&ctx.store, &session, &table, &key)
        .await
        .map_err(error_response)?;
    Ok(Json(RowCountResponse {
        affected: u64::from(deleted),
    }))
}

/// POST /data/conflicts/detect
pub async fn detect_data_conflicts<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    RequestJson(req): RequestJson<DetectConflictsRequest>,
) -> ApiResult<DetectConflictsResponse> {
    let table = parse_table(&req.table)?;
    let result = DataBranching::detect_data_conflicts(
        &ctx.store,
        &req.merge_id,
        &table,
        &req.source,
        &req.target,
    )
    .await
    .map_err(error_response)?;

    Ok(Json(DetectConflictsResponse {
        conflicts: result.value,
        warnings: result.warnings,
    }))
}

/// GET /data/merges/:id/conflicts
pub async fn list_data_conflicts<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(merge_id): Path<String>,
) -> ApiResult<ListResponse<DataConflict>> {
    let conflicts = DataBranching::list_data_conflicts(&ctx.store, &merge_id)
        .await
        .map_err(error_response)?;
    Ok(Json(ListResponse::new(conflicts)))
}

/// POST /data/conflicts/:id/resolve
pub async fn resolve_data_conflict<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(conflict_id): Path<String>,
    RequestJson(req): RequestJson<ResolveDataConflictRequest>,
) -> ApiResult<DataConflict> {
    DataBranching::resolve_data_conflict(&ctx.store, &conflict_id, req.resolution)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /data/merges/:id/apply
pub async fn apply_data_merge<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(merge_id): Path<String>,
    RequestJson(req): RequestJson<ApplyDataMergeRequest>,
) -> ApiResult<DataMergeSummary> {
    DataBranching::apply_data_merge(&ctx.store, &merge_id, &req.source, &req.target, req.strategy)
        .await
        .map(Json)
        .map_err(error_response)
}
