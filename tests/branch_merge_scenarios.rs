use vcdb::logic::{BranchManager, MergeEngine, ObjectDatabase, SchemaDiff, ThreeWay};
use vcdb::model::{
    BranchStatus, ConflictType, MergeOutcome, MergeStatus, NewBranch, ObjectIdentity, ObjectKind,
    ResolutionStrategy, DEFAULT_MAX_BRANCH_NAME_LENGTH,
};
use vcdb::store::{BranchStore, MemoryStore, MergeStore, ObjectStore};
use vcdb::VcsError;

const H1: &str = "CREATE TABLE orders (id int PRIMARY KEY)";
const H2: &str = "CREATE TABLE orders (id int PRIMARY KEY, total numeric)";
const H3: &str = "CREATE TABLE orders (id int PRIMARY KEY, status text)";

fn orders() -> ObjectIdentity {
    ObjectIdentity::table("public", "orders")
}

async fn store_with_main() -> MemoryStore {
    let store = MemoryStore::new();
    BranchManager::bootstrap(&store, "system").await.unwrap();
    store
}

async fn track(store: &MemoryStore, branch: &str, definition: &str) {
    BranchManager::track_object(store, branch, orders(), definition, "alice")
        .await
        .unwrap();
}

async fn branch(store: &MemoryStore, name: &str) {
    BranchManager::create_branch(
        store,
        NewBranch::new(name),
        "alice",
        DEFAULT_MAX_BRANCH_NAME_LENGTH,
    )
    .await
    .unwrap();
}

async fn definition_on(store: &MemoryStore, branch: &str) -> Option<String> {
    SchemaDiff::get_schema_snapshot(store, branch)
        .await
        .unwrap()
        .get(&orders())
        .map(|entry| entry.definition.clone())
}

#[tokio::test]
async fn test_identical_content_is_stored_once() {
    let store = store_with_main().await;
    let first = ObjectDatabase::write_blob(&store, H1).await.unwrap();
    let second = ObjectDatabase::write_blob(&store, H1).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(store.object_count().await.unwrap(), 1);
    assert_eq!(store.get_object(&first).await.unwrap().kind, ObjectKind::Blob);
}

#[tokio::test]
async fn test_branch_names_are_unique() {
    let store = store_with_main().await;
    branch(&store, "x").await;

    let err = BranchManager::create_branch(&store, NewBranch::new("x"), "bob", 63)
        .await
        .unwrap_err();
    assert!(matches!(err, VcsError::AlreadyExists { .. }));
    assert_eq!(store.list_branches().await.unwrap().len(), 2);
}

#[test]
fn test_three_way_rule() {
    let (h1, h2, h3) = (Some("h1"), Some("h2"), Some("h3"));
    assert_eq!(MergeEngine::three_way(h1, h1, h2), ThreeWay::Take(Some("h2".into())));
    assert_eq!(MergeEngine::three_way(h1, h2, h1), ThreeWay::Take(Some("h2".into())));
    assert_eq!(MergeEngine::three_way(h1, h2, h2), ThreeWay::Take(Some("h2".into())));
    assert_eq!(MergeEngine::three_way(h1, h2, h3), ThreeWay::Conflict);
}

#[tokio::test]
async fn test_main_can_never_be_deleted() {
    let store = store_with_main().await;
    let err = BranchManager::delete_branch(&store, "main", true, "root")
        .await
        .unwrap_err();
    assert!(matches!(err, VcsError::Forbidden(_)));
}

#[tokio::test]
async fn test_unmerged_branch_needs_force() {
    let store = store_with_main().await;
    branch(&store, "feature").await;

    let err = BranchManager::delete_branch(&store, "feature", false, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, VcsError::Forbidden(_)));

    let result = BranchManager::delete_branch(&store, "feature", true, "alice")
        .await
        .unwrap();
    assert!(result.success);
    let deleted = store.get_branch("feature").await.unwrap().unwrap();
    assert_eq!(deleted.status, BranchStatus::Deleted);
}

#[tokio::test]
async fn test_clean_fast_forward() {
    let store = store_with_main().await;
    track(&store, "main", H1).await;
    branch(&store, "feature").await;
    assert_eq!(definition_on(&store, "feature").await.as_deref(), Some(H1));

    track(&store, "feature", H3).await;
    let outcome = MergeEngine::merge_branches(&store, "feature", "main", None, "alice")
        .await
        .unwrap();

    assert!(outcome.to_string().starts_with("MERGE_SUCCESS:"));
    assert!(matches!(
        outcome,
        MergeOutcome::MergeSuccess {
            fast_forward: true,
            ..
        }
    ));
    assert_eq!(definition_on(&store, "main").await.as_deref(), Some(H3));

    let feature = store.get_branch("feature").await.unwrap().unwrap();
    assert_eq!(feature.status, BranchStatus::Merged);

    // Merged branches may now be deleted without force
    BranchManager::delete_branch(&store, "feature", false, "alice")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_true_conflict_leaves_target_untouched() {
    let store = store_with_main().await;
    track(&store, "main", H1).await;
    branch(&store, "feature").await;
    track(&store, "main", H2).await;
    track(&store, "feature", H3).await;

    let outcome = MergeEngine::merge_branches(&store, "feature", "main", None, "alice")
        .await
        .unwrap();
    let merge_id = outcome.merge_id().to_string();
    assert_eq!(outcome.to_string(), format!("CONFLICTS_DETECTED:{}", merge_id));
    assert_eq!(definition_on(&store, "main").await.as_deref(), Some(H2));

    let conflicts = MergeEngine::list_conflicts(&store, &merge_id).await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, ConflictType::ModifyModify);
    assert_eq!(conflicts[0].conflict_object, orders());

    let feature = store.get_branch("feature").await.unwrap().unwrap();
    assert_eq!(feature.status, BranchStatus::Conflicted);
}

#[tokio::test]
async fn test_resolving_conflicts_then_applying() {
    let store = store_with_main().await;
    track(&store, "main", H1).await;
    branch(&store, "feature").await;
    track(&store, "main", H2).await;
    track(&store, "feature", H3).await;

    let outcome = MergeEngine::merge_branches(&store, "feature", "main", None, "alice")
        .await
        .unwrap();
    let merge_id = outcome.merge_id().to_string();
    let conflict = MergeEngine::list_conflicts(&store, &merge_id)
        .await
        .unwrap()
        .remove(0);

    // Annotate only
    let resolved = MergeEngine::resolve_conflict(
        &store,
        &merge_id,
        &conflict.id,
        ResolutionStrategy::TakeSource,
        "bob",
        false,
    )
    .await
    .unwrap();
    assert_eq!(resolved.remaining_conflicts, 0);
    assert_eq!(resolved.applied_commit_sha, None);
    assert_eq!(definition_on(&store, "main").await.as_deref(), Some(H2));

    // A resolved conflict stays resolved
    let err = MergeEngine::resolve_conflict(
        &store,
        &merge_id,
        &conflict.id,
        ResolutionStrategy::TakeTarget,
        "bob",
        false,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, VcsError::Forbidden(_)));

    let applied = MergeEngine::apply_resolved_merge(&store, &merge_id, "bob")
        .await
        .unwrap();
    assert!(applied.is_success());
    assert_eq!(definition_on(&store, "main").await.as_deref(), Some(H3));

    let record = store.get_merge(&merge_id).await.unwrap().unwrap();
    assert_eq!(record.status, MergeStatus::Resolved);

    let head = store.get_branch("main").await.unwrap().unwrap().head_commit_sha;
    let commit = ObjectDatabase::read_commit(&store, head.as_deref().unwrap())
        .await
        .unwrap();
    assert!(commit.is_merge());
}

#[tokio::test]
async fn test_each_side_keeps_its_own_changes() {
    let store = store_with_main().await;
    track(&store, "main", H1).await;
    branch(&store, "feature").await;

    let view = ObjectIdentity::new(vcdb::model::ObjectType::View, "public", "recent_orders");
    BranchManager::track_object(&store, "main", view.clone(), "CREATE VIEW recent_orders AS SELECT 1", "alice")
        .await
        .unwrap();
    track(&store, "feature", H3).await;

    let outcome = MergeEngine::merge_branches(&store, "feature", "main", Some("merge feature".into()), "alice")
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        MergeOutcome::MergeSuccess {
            fast_forward: false,
            ..
        }
    ));

    let snapshot = SchemaDiff::get_schema_snapshot(&store, "main").await.unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.get(&orders()).unwrap().definition, H3);
    assert!(snapshot.get(&view).is_some());
}

#[tokio::test]
async fn test_merging_into_missing_branch_is_not_found() {
    let store = store_with_main().await;
    branch(&store, "feature").await;
    let err = MergeEngine::merge_branches(&store, "feature", "release", None, "alice")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
