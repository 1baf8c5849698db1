use axum::{
    extract::{Query, State},
    response::Json,
    Json as RequestJson,
};
use serde::Deserialize;

use crate::api::handlers::{error_response, ApiResult, AppState};
use crate::logic::{MigrationPlanner, SchemaDiff};
use crate::model::{CategorizedChange, ChangeType, DiffDocument, MigrationPlan, ObjectType};
use crate::store::traits::Store;

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    pub a: String,
    pub b: String,
}

#[derive(Debug, Deserialize)]
pub struct PlanQuery {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Deserialize)]
pub struct CategorizeRequest {
    pub object_type: ObjectType,
    pub change_type: ChangeType,
    pub old_definition: Option<String>,
    pub new_definition: Option<String>,
}

/// GET /diff?a=&b=
pub async fn compare_schemas<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<DiffDocument> {
    SchemaDiff::compare_schemas(&ctx.store, &query.a, &query.b)
        .await
        .map(Json)
        .map_err(error_response)
}

/// GET /plan?source=&target=
pub async fn plan_migration<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Query(query): Query<PlanQuery>,
) -> ApiResult<MigrationPlan> {
    MigrationPlanner::plan_migration(&ctx.store, &query.source, &query.target)
        .await
        .map(Json)
        .map_err(error_response)
}

/// POST /categorize
pub async fn categorize_change(
    RequestJson(req): RequestJson<CategorizeRequest>,
) -> Json<CategorizedChange> {
    Json(SchemaDiff::categorize_change(
        req.object_type,
        req.change_type,
        req.old_definition.as_deref(),
        req.new_definition.as_deref(),
    ))
}
