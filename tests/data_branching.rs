use serde_json::json;
use vcdb::logic::{BranchManager, DataBranching};
use vcdb::model::{
    DataConflictType, DataResolution, NewBranch, QualifiedName, Row, Session, UserContext,
    DEFAULT_MAX_BRANCH_NAME_LENGTH,
};
use vcdb::store::{MemoryStore, RelationStore};
use vcdb::VcsError;

fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn orders() -> QualifiedName {
    QualifiedName::new("public", "orders")
}

fn session(id: &str) -> Session {
    Session::new(id, UserContext::new("alice".into()))
}

async fn setup() -> MemoryStore {
    let store = MemoryStore::new();
    BranchManager::bootstrap(&store, "system").await.unwrap();
    BranchManager::create_branch(
        &store,
        NewBranch::new("feature"),
        "alice",
        DEFAULT_MAX_BRANCH_NAME_LENGTH,
    )
    .await
    .unwrap();

    store
        .create_relation(&orders(), Some(vec!["id".into()]))
        .unwrap();
    for (id, total) in [(1, 10), (2, 20), (3, 30)] {
        store
            .insert_row(&orders(), row(json!({"id": id, "total": total})))
            .await
            .unwrap();
    }
    store
}

async fn total_of(store: &MemoryStore, session: &Session, id: i64) -> Option<serde_json::Value> {
    DataBranching::select_rows(store, session, &orders())
        .await
        .unwrap()
        .into_iter()
        .find(|r| r["id"] == json!(id))
        .map(|r| r["total"].clone())
}

#[tokio::test]
async fn test_row_level_conflict_resolved_from_source() {
    let store = setup().await;
    let copied = DataBranching::create_data_branch(&store, "feature", "main", &[orders()])
        .await
        .unwrap();
    assert_eq!(copied, 1);

    let on_main = session("s-main");
    let mut on_feature = session("s-feature");
    DataBranching::switch_branch(&store, &mut on_feature, "feature")
        .await
        .unwrap();

    assert!(DataBranching::update_row(&store, &on_main, &orders(), row(json!({"id": 1, "total": 11})))
        .await
        .unwrap());
    assert!(DataBranching::update_row(&store, &on_feature, &orders(), row(json!({"id": 1, "total": 12})))
        .await
        .unwrap());

    let detected = DataBranching::detect_data_conflicts(&store, "merge-1", &orders(), "feature", "main")
        .await
        .unwrap();
    assert_eq!(detected.value, 1);
    assert!(detected.is_clean());

    let conflicts = DataBranching::list_data_conflicts(&store, &"merge-1".to_string())
        .await
        .unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].conflict_type, DataConflictType::UpdateUpdate);
    assert_eq!(conflicts[0].primary_key_value, json!({"id": 1}));
    assert_eq!(conflicts[0].resolution, DataResolution::Pending);

    let summary = DataBranching::apply_data_merge(
        &store,
        &"merge-1".to_string(),
        "feature",
        "main",
        DataResolution::Source,
    )
    .await
    .unwrap();
    assert_eq!(summary.tables, 1);
    assert_eq!(summary.rows_upserted, 1);

    assert_eq!(total_of(&store, &on_main, 1).await, Some(json!(12)));
    assert_eq!(total_of(&store, &on_main, 2).await, Some(json!(20)));
}

#[tokio::test]
async fn test_branch_copies_are_isolated() {
    let store = setup().await;
    DataBranching::create_data_branch(&store, "feature", "main", &[orders()])
        .await
        .unwrap();

    let on_main = session("a");
    let mut on_feature = session("b");
    DataBranching::switch_branch(&store, &mut on_feature, "feature")
        .await
        .unwrap();

    DataBranching::insert_row(&store, &on_feature, &orders(), row(json!({"id": 4, "total": 40})))
        .await
        .unwrap();
    assert!(DataBranching::delete_row(&store, &on_feature, &orders(), &row(json!({"id": 2})))
        .await
        .unwrap());

    assert_eq!(DataBranching::select_rows(&store, &on_feature, &orders()).await.unwrap().len(), 3);
    assert_eq!(DataBranching::select_rows(&store, &on_main, &orders()).await.unwrap().len(), 3);
    assert_eq!(total_of(&store, &on_main, 4).await, None);
    assert_eq!(total_of(&store, &on_main, 2).await, Some(json!(20)));

    // The original relation now lives behind the routing layer
    assert!(!store.relation_exists(&orders()).await.unwrap());
    assert!(store
        .relation_exists(&orders().branch_location("feature"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_one_sided_rows_are_classified() {
    let store = setup().await;
    DataBranching::create_data_branch(&store, "feature", "main", &[orders()])
        .await
        .unwrap();
    let on_main = session("a");
    let mut on_feature = session("b");
    DataBranching::switch_branch(&store, &mut on_feature, "feature")
        .await
        .unwrap();

    // Only the source still has row 2; only the target still has row 3
    DataBranching::delete_row(&store, &on_main, &orders(), &row(json!({"id": 2})))
        .await
        .unwrap();
    DataBranching::delete_row(&store, &on_feature, &orders(), &row(json!({"id": 3})))
        .await
        .unwrap();

    let detected = DataBranching::detect_data_conflicts(&store, "m", &orders(), "feature", "main")
        .await
        .unwrap();
    assert_eq!(detected.value, 2);

    let conflicts = DataBranching::list_data_conflicts(&store, &"m".to_string())
        .await
        .unwrap();
    let type_of = |id: i64| {
        conflicts
            .iter()
            .find(|c| c.primary_key_value == json!({"id": id}))
            .map(|c| c.conflict_type)
    };
    assert_eq!(type_of(2), Some(DataConflictType::UpdateDelete));
    assert_eq!(type_of(3), Some(DataConflictType::DeleteUpdate));

    // Source wins: row 2 comes back, row 3 goes away
    let summary = DataBranching::apply_data_merge(&store, &"m".to_string(), "feature", "main", DataResolution::Source)
        .await
        .unwrap();
    assert_eq!(summary.rows_upserted, 1);
    assert_eq!(summary.rows_deleted, 1);
    assert_eq!(total_of(&store, &on_main, 2).await, Some(json!(20)));
    assert_eq!(total_of(&store, &on_main, 3).await, None);
}

#[tokio::test]
async fn test_repeat_data_branch_copies_nothing() {
    let store = setup().await;
    let first = DataBranching::create_data_branch(&store, "feature", "main", &[orders()])
        .await
        .unwrap();
    let second = DataBranching::create_data_branch(&store, "feature", "main", &[orders()])
        .await
        .unwrap();
    assert_eq!((first, second), (1, 0));
}

#[tokio::test]
async fn test_main_cannot_hold_a_data_copy() {
    let store = setup().await;
    let err = DataBranching::create_data_branch(&store, "main", "feature", &[orders()])
        .await
        .unwrap_err();
    assert!(matches!(err, VcsError::Forbidden(_)));
}

#[tokio::test]
async fn test_switching_to_unknown_branch_keeps_session() {
    let store = setup().await;
    let mut s = session("a");
    let err = DataBranching::switch_branch(&store, &mut s, "nope")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(s.on_main());
}
