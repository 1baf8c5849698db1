use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::api::handlers::AppState;
use crate::api::{branch_handlers, data_handlers, diff_handlers, handlers, merge_handlers};
use crate::store::traits::Store;

pub fn create_router<S: Store + 'static>() -> Router<AppState<S>> {
    Router::new()
        // Health check
        .route("/health", get(handlers::health_check))
        // Branches and refs
        .route(
            "/branches",
            post(branch_handlers::create_branch::<S>).get(branch_handlers::list_branches::<S>),
        )
        .route(
            "/branches/:name",
            axum::routing::delete(branch_handlers::delete_branch::<S>),
        )
        .route(
            "/branches/:name/checkout",
            post(branch_handlers::checkout_branch::<S>),
        )
        .route(
            "/branches/:name/objects",
            post(branch_handlers::apply_changes::<S>),
        )
        .route("/branches/:name/log", get(branch_handlers::get_commit_log::<S>))
        .route(
            "/branches/:name/snapshot",
            get(branch_handlers::get_snapshot::<S>),
        )
        .route(
            "/tags",
            post(branch_handlers::create_tag::<S>).get(branch_handlers::list_tags::<S>),
        )
        // Schema merges
        .route("/merges", post(merge_handlers::merge_branches::<S>))
        .route("/merges/:id", get(merge_handlers::get_merge::<S>))
        .route(
            "/merges/:id/conflicts",
            get(merge_handlers::list_conflicts::<S>),
        )
        .route(
            "/merges/:id/conflicts/:cid/resolve",
            post(merge_handlers::resolve_conflict::<S>),
        )
        .route("/merges/:id/apply", post(merge_handlers::apply_merge::<S>))
        // Data branching
        .route("/data/branches", post(data_handlers::create_data_branch::<S>))
        .route("/data/switch", post(data_handlers::switch_branch::<S>))
        .route(
            "/sessions/:id",
            axum::routing::delete(handlers::end_session::<S>),
        )
        .route(
            "/data/tables/:table/rows",
            get(data_handlers::select_rows::<S>)
                .post(data_handlers::insert_row::<S>)
                .put(data_handlers::update_row::<S>)
                .delete(data_handlers::delete_row::<S>),
        )
        .route(
            "/data/conflicts/detect",
            post(data_handlers::detect_data_conflicts::<S>),
        )
        .route(
            "/data/conflicts/:id/resolve",
            post(data_handlers::resolve_data_conflict::<S>),
        )
        .route(
            "/data/merges/:id/conflicts",
            get(data_handlers::list_data_conflicts::<S>),
        )
        .route(
            "/data/merges/:id/apply",
            post(data_handlers::apply_data_merge::<S>),
        )
        // Schema diff
        .route("/diff", get(diff_handlers::compare_schemas::<S>))
        .route("/plan", get(diff_handlers::plan_migration::<S>))
        .route("/categorize", post(diff_handlers::categorize_change))
        .layer(CorsLayer::permissive())
}
