use vcdb::logic::{BranchManager, MigrationPlanner, SchemaDiff};
use vcdb::model::{
    ChangeCategory, ChangeType, Feasibility, NewBranch, ObjectChange, ObjectIdentity, ObjectType,
    RiskLevel, DEFAULT_MAX_BRANCH_NAME_LENGTH,
};
use vcdb::store::MemoryStore;

fn table(name: &str) -> ObjectIdentity {
    ObjectIdentity::table("public", name)
}

fn index(name: &str) -> ObjectIdentity {
    ObjectIdentity::new(ObjectType::Index, "public", name)
}

/// main: customers, orders, legacy. feature: customers, orders with a new
/// NOT NULL column, a new invoices table and an index; legacy dropped.
async fn diverged() -> MemoryStore {
    let store = MemoryStore::new();
    BranchManager::bootstrap(&store, "system").await.unwrap();
    BranchManager::apply_changes(
        &store,
        "main",
        vec![
            ObjectChange::upsert(table("customers"), "CREATE TABLE customers (id int PRIMARY KEY)"),
            ObjectChange::upsert(table("orders"), "CREATE TABLE orders (id int PRIMARY KEY)"),
            ObjectChange::upsert(table("legacy"), "CREATE TABLE legacy (id int)"),
        ],
        "alice",
        "initial schema",
    )
    .await
    .unwrap();

    BranchManager::create_branch(
        &store,
        NewBranch::new("feature"),
        "alice",
        DEFAULT_MAX_BRANCH_NAME_LENGTH,
    )
    .await
    .unwrap();
    BranchManager::apply_changes(
        &store,
        "feature",
        vec![
            ObjectChange::upsert(
                table("orders"),
                "CREATE TABLE orders (id int PRIMARY KEY, customer_id int NOT NULL)",
            ),
            ObjectChange::upsert(table("invoices"), "CREATE TABLE invoices (id int PRIMARY KEY)"),
            ObjectChange::upsert(index("orders_customer_idx"), "CREATE INDEX orders_customer_idx ON orders (customer_id)"),
            ObjectChange::Drop {
                identity: table("legacy"),
            },
        ],
        "alice",
        "feature schema",
    )
    .await
    .unwrap();
    store
}

#[tokio::test]
async fn test_summary_matches_change_list() {
    let store = diverged().await;
    let diff = SchemaDiff::compare_schemas(&store, "main", "feature")
        .await
        .unwrap();

    let count = |t: ChangeType| diff.changes.iter().filter(|c| c.change_type == t).count();
    assert_eq!(diff.summary.added, count(ChangeType::Added));
    assert_eq!(diff.summary.removed, count(ChangeType::Removed));
    assert_eq!(diff.summary.modified, count(ChangeType::Modified));
    assert_eq!(diff.summary.total, diff.changes.len());

    assert_eq!(diff.summary.added, 2);
    assert_eq!(diff.summary.removed, 1);
    assert_eq!(diff.summary.modified, 1);
}

#[tokio::test]
async fn test_reverse_diff_swaps_added_and_removed() {
    let store = diverged().await;
    let forward = SchemaDiff::compare_schemas(&store, "main", "feature")
        .await
        .unwrap();
    let backward = SchemaDiff::compare_schemas(&store, "feature", "main")
        .await
        .unwrap();

    assert_eq!(forward.summary.added, backward.summary.removed);
    assert_eq!(forward.summary.removed, backward.summary.added);
    assert_eq!(forward.summary.modified, backward.summary.modified);
}

#[tokio::test]
async fn test_fresh_branch_has_no_diff() {
    let store = diverged().await;
    BranchManager::create_branch(
        &store,
        NewBranch::new("empty"),
        "alice",
        DEFAULT_MAX_BRANCH_NAME_LENGTH,
    )
    .await
    .unwrap();

    let diff = SchemaDiff::compare_schemas(&store, "main", "empty")
        .await
        .unwrap();
    assert!(diff.is_empty());
}

#[tokio::test]
async fn test_snapshot_tracks_new_commits() {
    let store = diverged().await;
    let before = SchemaDiff::get_schema_snapshot(&store, "main").await.unwrap();
    assert_eq!(before.len(), 3);

    BranchManager::drop_object(&store, "main", table("legacy"), "alice")
        .await
        .unwrap();
    let after = SchemaDiff::get_schema_snapshot(&store, "main").await.unwrap();
    assert_eq!(after.len(), 2);
    assert_ne!(before.commit_sha, after.commit_sha);
}

#[tokio::test]
async fn test_migration_plan_for_feature_into_main() {
    let store = diverged().await;
    let plan = MigrationPlanner::plan_migration(&store, "feature", "main")
        .await
        .unwrap();

    assert_eq!(plan.source_branch, "feature");
    assert_eq!(plan.target_branch, "main");
    assert_eq!(plan.steps.len(), 4);

    let kinds: Vec<ChangeType> = plan.steps.iter().map(|s| s.change_type).collect();
    assert_eq!(
        kinds,
        vec![
            ChangeType::Added,
            ChangeType::Added,
            ChangeType::Modified,
            ChangeType::Removed
        ]
    );
    // Tables before the indexes that depend on them
    assert_eq!(plan.steps[0].identity, table("invoices"));
    assert_eq!(plan.steps[1].identity, index("orders_customer_idx"));
    assert_eq!(plan.steps[1].category, ChangeCategory::Optional);

    // NOT NULL column and a dropped table
    assert_eq!(plan.steps[2].category, ChangeCategory::Breaking);
    assert_eq!(plan.steps[3].definition, None);
    assert_eq!(plan.risk_level, RiskLevel::High);
    assert_eq!(plan.feasibility, Feasibility::ManualReview);
}

#[tokio::test]
async fn test_unknown_branch_is_not_found() {
    let store = diverged().await;
    let err = SchemaDiff::compare_schemas(&store, "main", "ghost")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
