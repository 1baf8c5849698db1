use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{VcsError, VcsResult};
use crate::model::{
    row_key, Branch, DataBranchTable, DataConflict, DataResolution, Id, MergeRecord, ObjectHistoryEntry,
    ObjectKind, QualifiedName, Ref, RefKind, RoutedTable, Row, SchemaConflict, StoredObject,
    TrackingErrorRecord,
};
use crate::store::traits::{
    BranchStore, Coordination, DataBranchStore, HistoryStore, MergeStore, ObjectStore,
    RefStore, RelationStore, Store, StoreWrite, UnitOfWork, WriteBatch,
};
use crate::store::{BranchLocks, SnapshotCache};

#[derive(Debug, Clone, Default)]
struct MemoryRelation {
    primary_key: Option<Vec<String>>,
    rows: Vec<Row>,
}

impl MemoryRelation {
    fn position_of(&self, row: &Row) -> VcsResult<Option<usize>> {
        let Some(primary_key) = &self.primary_key else {
            return Ok(None);
        };
        let key = row_key(row, primary_key)?;
        for (idx, existing) in self.rows.iter().enumerate() {
            if row_key(existing, primary_key)? == key {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    objects: HashMap<String, StoredObject>,
    branches: HashMap<String, Branch>,
    refs: HashMap<(RefKind, String), Ref>,
    history: Vec<ObjectHistoryEntry>,
    tracking_errors: Vec<TrackingErrorRecord>,
    merges: HashMap<Id, MergeRecord>,
    conflicts: Vec<SchemaConflict>,
    routed_tables: HashMap<QualifiedName, RoutedTable>,
    data_branch_tables: Vec<DataBranchTable>,
    data_conflicts: Vec<DataConflict>,
    relations: HashMap<QualifiedName, MemoryRelation>,
}

impl MemoryState {
    fn apply(&mut self, write: StoreWrite) -> VcsResult<()> {
        match write {
            StoreWrite::UpdateBranch(branch) => self.update_branch(branch),
            StoreWrite::SetBranchRef { name, commit_sha } => {
                self.set_branch_ref(&name, &commit_sha);
                Ok(())
            }
            StoreWrite::InsertMerge(merge) => self.insert_merge(merge),
            StoreWrite::UpdateMerge(merge) => self.update_merge(merge),
            StoreWrite::InsertConflict(conflict) => self.insert_conflict(conflict),
            StoreWrite::UpdateConflict(conflict) => self.update_conflict(conflict),
            StoreWrite::InsertRoutedTable(routed) => self.insert_routed_table(routed),
            StoreWrite::InsertDataBranchTable(record) => self.insert_data_branch_table(record),
            StoreWrite::InsertDataConflict(conflict) => self.insert_data_conflict(conflict),
            StoreWrite::MarkDataConflictApplied(conflict) => {
                self.mark_data_conflict_applied(conflict)
            }
            StoreWrite::MoveRelation { from, to } => self.move_relation(&from, &to),
            StoreWrite::CopyRelation { from, to } => self.copy_relation(&from, &to).map(|_| ()),
            StoreWrite::InsertRowIfAbsent { table, row } => {
                self.insert_row(&table, row, true).map(|_| ())
            }
            StoreWrite::UpsertRow { table, row } => self.upsert_row(&table, row),
            StoreWrite::DeleteRow { table, key } => self.delete_row(&table, &key).map(|_| ()),
        }
    }

    fn update_branch(&mut self, branch: Branch) -> VcsResult<()> {
        match self.branches.get_mut(&branch.name) {
            Some(existing) => {
                *existing = branch;
                Ok(())
            }
            None => Err(VcsError::not_found("branch", branch.name)),
        }
    }

    fn set_branch_ref(&mut self, name: &str, target_commit_sha: &str) {
        self.refs.insert(
            (RefKind::Branch, name.to_string()),
            Ref::new(RefKind::Branch, name, target_commit_sha),
        );
    }

    fn insert_merge(&mut self, merge: MergeRecord) -> VcsResult<()> {
        if self.merges.contains_key(&merge.id) {
            return Err(VcsError::already_exists("merge", merge.id));
        }
        self.merges.insert(merge.id.clone(), merge);
        Ok(())
    }

    fn update_merge(&mut self, merge: MergeRecord) -> VcsResult<()> {
        match self.merges.get_mut(&merge.id) {
            Some(existing) => {
                *existing = merge;
                Ok(())
            }
            None => Err(VcsError::not_found("merge", merge.id)),
        }
    }

    fn insert_conflict(&mut self, conflict: SchemaConflict) -> VcsResult<()> {
        if !self.merges.contains_key(&conflict.merge_id) {
            return Err(VcsError::not_found("merge", conflict.merge_id));
        }
        self.conflicts.push(conflict);
        Ok(())
    }

    fn update_conflict(&mut self, conflict: SchemaConflict) -> VcsResult<()> {
        // Only a pending conflict can take a resolution.
        match self
            .conflicts
            .iter_mut()
            .find(|c| c.id == conflict.id && !c.is_resolved())
        {
            Some(existing) => {
                *existing = conflict;
                Ok(())
            }
            None => Err(VcsError::Forbidden(format!(
                "conflict '{}' is missing or already resolved",
                conflict.id
            ))),
        }
    }

    fn insert_routed_table(&mut self, routed: RoutedTable) -> VcsResult<()> {
        if self.routed_tables.contains_key(&routed.table) {
            return Err(VcsError::already_exists("routed table", routed.table.to_string()));
        }
        self.routed_tables.insert(routed.table.clone(), routed);
        Ok(())
    }

    fn insert_data_branch_table(&mut self, record: DataBranchTable) -> VcsResult<()> {
        if self
            .data_branch_tables
            .iter()
            .any(|t| t.branch_name == record.branch_name && t.source == record.source)
        {
            return Err(VcsError::already_exists(
                "data branch table",
                format!("{}:{}", record.branch_name, record.source),
            ));
        }
        self.data_branch_tables.push(record);
        Ok(())
    }

    fn insert_data_conflict(&mut self, conflict: DataConflict) -> VcsResult<()> {
        if self.data_conflicts.iter().any(|c| {
            c.merge_id == conflict.merge_id
                && c.table_name == conflict.table_name
                && c.primary_key_value == conflict.primary_key_value
        }) {
            return Err(VcsError::already_exists(
                "data conflict",
                format!(
                    "{}:{} {}",
                    conflict.merge_id, conflict.table_name, conflict.primary_key_value
                ),
            ));
        }
        self.data_conflicts.push(conflict);
        Ok(())
    }

    fn update_data_conflict(&mut self, conflict: DataConflict) -> VcsResult<()> {
        match self
            .data_conflicts
            .iter_mut()
            .find(|c| c.id == conflict.id && c.resolution == DataResolution::Pending)
        {
            Some(existing) => {
                *existing = conflict;
                Ok(())
            }
            None => Err(VcsError::Forbidden(format!(
                "data conflict '{}' is missing or already resolved",
                conflict.id
            ))),
        }
    }

    fn mark_data_conflict_applied(&mut self, conflict: DataConflict) -> VcsResult<()> {
        match self
            .data_conflicts
            .iter_mut()
            .find(|c| c.id == conflict.id && !c.is_applied())
        {
            Some(existing) => {
                existing.resolution = conflict.resolution;
                existing.resolved_at = conflict.resolved_at;
                existing.applied_at = conflict.applied_at;
                Ok(())
            }
            None => Err(VcsError::Forbidden(format!(
                "data conflict '{}' is missing or already applied",
                conflict.id
            ))),
        }
    }

    fn relation(&self, name: &QualifiedName) -> VcsResult<&MemoryRelation> {
        self.relations
            .get(name)
            .ok_or_else(|| VcsError::not_found("relation", name.to_string()))
    }

    fn relation_mut(&mut self, name: &QualifiedName) -> VcsResult<&mut MemoryRelation> {
        self.relations
            .get_mut(name)
            .ok_or_else(|| VcsError::not_found("relation", name.to_string()))
    }

    fn move_relation(&mut self, from: &QualifiedName, to: &QualifiedName) -> VcsResult<()> {
        if self.relations.contains_key(to) {
            return Err(VcsError::already_exists("relation", to.to_string()));
        }
        let relation = self
            .relations
            .remove(from)
            .ok_or_else(|| VcsError::not_found("relation", from.to_string()))?;
        self.relations.insert(to.clone(), relation);
        Ok(())
    }

    fn copy_relation(&mut self, from: &QualifiedName, to: &QualifiedName) -> VcsResult<u64> {
        if self.relations.contains_key(to) {
            return Err(VcsError::already_exists("relation", to.to_string()));
        }
        let copy = self.relation(from)?.clone();
        let copied = copy.rows.len() as u64;
        self.relations.insert(to.clone(), copy);
        Ok(copied)
    }

    /// Returns false when `if_absent` is set and the key is already taken
    fn insert_row(&mut self, name: &QualifiedName, row: Row, if_absent: bool) -> VcsResult<bool> {
        let relation = self.relation_mut(name)?;
        if relation.position_of(&row)?.is_some() {
            if if_absent {
                return Ok(false);
            }
            return Err(VcsError::already_exists(
                "row",
                format!("{} {}", name, serde_json::Value::Object(row)),
            ));
        }
        relation.rows.push(row);
        Ok(true)
    }

    fn upsert_row(&mut self, name: &QualifiedName, row: Row) -> VcsResult<()> {
        let relation = self.relation_mut(name)?;
        if relation.primary_key.is_none() {
            return Err(VcsError::Unsupported(format!(
                "upsert into {} requires a primary key",
                name
            )));
        }
        match relation.position_of(&row)? {
            Some(idx) => relation.rows[idx] = row,
            None => relation.rows.push(row),
        }
        Ok(())
    }

    fn delete_row(&mut self, name: &QualifiedName, key: &Row) -> VcsResult<bool> {
        let relation = self.relation_mut(name)?;
        let before = relation.rows.len();
        relation
            .rows
            .retain(|row| !key.iter().all(|(column, value)| row.get(column) == Some(value)));
        Ok(relation.rows.len() < before)
    }
}

/// Process-local store. Every trait call takes the state lock once, so
/// check-then-insert sequences inside a call are atomic. A batch is applied
/// to a copy of the state that replaces it only when every write succeeded.
#[derive(Debug)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    locks: BranchLocks,
    snapshots: SnapshotCache,
    fail_history_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_snapshot_ttl(Duration::from_secs(300))
    }

    pub fn with_snapshot_ttl(ttl: Duration) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            locks: BranchLocks::new(),
            snapshots: SnapshotCache::with_ttl(ttl),
            fail_history_writes: AtomicBool::new(false),
        }
    }

    /// Create an empty relation; AlreadyExists if present. Stands in for the
    /// DDL a host database would run.
    pub fn create_relation(
        &self,
        name: &QualifiedName,
        primary_key: Option<Vec<String>>,
    ) -> VcsResult<()> {
        let mut state = self.state.write();
        if state.relations.contains_key(name) {
            return Err(VcsError::already_exists("relation", name.to_string()));
        }
        state.relations.insert(
            name.clone(),
            MemoryRelation {
                primary_key,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    /// Make history writes fail, to exercise the best-effort tracking path
    pub fn set_fail_history_writes(&self, fail: bool) {
        self.fail_history_writes.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(&self, kind: ObjectKind, content: Vec<u8>) -> VcsResult<String> {
        let object = StoredObject::new(kind, content);
        let sha = object.sha.clone();
        self.state
            .write()
            .objects
            .entry(sha.clone())
            .or_insert(object);
        Ok(sha)
    }

    async fn get_object(&self, sha: &str) -> VcsResult<StoredObject> {
        self.state
            .read()
            .objects
            .get(sha)
            .cloned()
            .ok_or_else(|| VcsError::not_found("object", sha))
    }

    async fn object_exists(&self, sha: &str) -> VcsResult<bool> {
        Ok(self.state.read().objects.contains_key(sha))
    }

    async fn object_count(&self) -> VcsResult<u64> {
        Ok(self.state.read().objects.len() as u64)
    }
}

#[async_trait::async_trait]
impl BranchStore for MemoryStore {
    async fn insert_branch(&self, branch: Branch) -> VcsResult<()> {
        let mut state = self.state.write();
        if state.branches.contains_key(&branch.name) {
            return Err(VcsError::already_exists("branch", branch.name));
        }
        state.branches.insert(branch.name.clone(), branch);
        Ok(())
    }

    async fn get_branch(&self, name: &str) -> VcsResult<Option<Branch>> {
        Ok(self.state.read().branches.get(name).cloned())
    }

    async fn update_branch(&self, branch: Branch) -> VcsResult<()> {
        self.state.write().update_branch(branch)
    }

    async fn list_branches(&self) -> VcsResult<Vec<Branch>> {
        Ok(self.state.read().branches.values().cloned().collect())
    }
}

#[async_trait::async_trait]
impl RefStore for MemoryStore {
    async fn get_ref(&self, kind: RefKind, name: &str) -> VcsResult<Option<Ref>> {
        Ok(self
            .state
            .read()
            .refs
            .get(&(kind, name.to_string()))
            .cloned())
    }

    async fn insert_ref(&self, reference: Ref) -> VcsResult<()> {
        let mut state = self.state.write();
        let key = (reference.kind, reference.name.clone());
        if state.refs.contains_key(&key) {
            return Err(VcsError::already_exists(reference.kind.as_str(), reference.name));
        }
        state.refs.insert(key, reference);
        Ok(())
    }

    async fn set_branch_ref(&self, name: &str, target_commit_sha: &str) -> VcsResult<()> {
        self.state.write().set_branch_ref(name, target_commit_sha);
        Ok(())
    }

    async fn list_refs(&self, kind: RefKind) -> VcsResult<Vec<Ref>> {
        let mut refs: Vec<Ref> = self
            .state
            .read()
            .refs
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(refs)
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryStore {
    async fn record_history(&self, entry: ObjectHistoryEntry) -> VcsResult<()> {
        if self.fail_history_writes.load(Ordering::SeqCst) {
            return Err(VcsError::Storage("history table unavailable".to_string()));
        }
        self.state.write().history.push(entry);
        Ok(())
    }

    async fn list_history(&self, branch_name: &str) -> VcsResult<Vec<ObjectHistoryEntry>> {
        Ok(self
            .state
            .read()
            .history
            .iter()
            .filter(|e| e.branch_name == branch_name)
            .cloned()
            .collect())
    }

    async fn record_tracking_error(&self, record: TrackingErrorRecord) -> VcsResult<()> {
        self.state.write().tracking_errors.push(record);
        Ok(())
    }

    async fn list_tracking_errors(&self) -> VcsResult<Vec<TrackingErrorRecord>> {
        Ok(self.state.read().tracking_errors.clone())
    }
}

#[async_trait::async_trait]
impl MergeStore for MemoryStore {
    async fn insert_merge(&self, merge: MergeRecord) -> VcsResult<()> {
        self.state.write().insert_merge(merge)
    }

    async fn get_merge(&self, id: &Id) -> VcsResult<Option<MergeRecord>> {
        Ok(self.state.read().merges.get(id).cloned())
    }

    async fn update_merge(&self, merge: MergeRecord) -> VcsResult<()> {
        self.state.write().update_merge(merge)
    }

    async fn insert_conflict(&self, conflict: SchemaConflict) -> VcsResult<()> {
        self.state.write().insert_conflict(conflict)
    }

    async fn get_conflict(&self, id: &Id) -> VcsResult<Option<SchemaConflict>> {
        Ok(self
            .state
            .read()
            .conflicts
            .iter()
            .find(|c| &c.id == id)
            .cloned())
    }

    async fn list_conflicts(&self, merge_id: &Id) -> VcsResult<Vec<SchemaConflict>> {
        Ok(self
            .state
            .read()
            .conflicts
            .iter()
            .filter(|c| &c.merge_id == merge_id)
            .cloned()
            .collect())
    }

    async fn update_conflict(&self, conflict: SchemaConflict) -> VcsResult<()> {
        self.state.write().update_conflict(conflict)
    }
}

#[async_trait::async_trait]
impl DataBranchStore for MemoryStore {
    async fn get_routed_table(&self, table: &QualifiedName) -> VcsResult<Option<RoutedTable>> {
        Ok(self.state.read().routed_tables.get(table).cloned())
    }

    async fn insert_routed_table(&self, routed: RoutedTable) -> VcsResult<()> {
        self.state.write().insert_routed_table(routed)
    }

    async fn list_routed_tables(&self) -> VcsResult<Vec<RoutedTable>> {
        let mut tables: Vec<RoutedTable> =
            self.state.read().routed_tables.values().cloned().collect();
        tables.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(tables)
    }

    async fn get_data_branch_table(
        &self,
        branch_name: &str,
        source: &QualifiedName,
    ) -> VcsResult<Option<DataBranchTable>> {
        Ok(self
            .state
            .read()
            .data_branch_tables
            .iter()
            .find(|t| t.branch_name == branch_name && &t.source == source)
            .cloned())
    }

    async fn insert_data_branch_table(&self, record: DataBranchTable) -> VcsResult<()> {
        self.state.write().insert_data_branch_table(record)
    }

    async fn list_data_branch_tables(&self, branch_name: &str) -> VcsResult<Vec<DataBranchTable>> {
        Ok(self
            .state
            .read()
            .data_branch_tables
            .iter()
            .filter(|t| t.branch_name == branch_name)
            .cloned()
            .collect())
    }

    async fn insert_data_conflict(&self, conflict: DataConflict) -> VcsResult<()> {
        self.state.write().insert_data_conflict(conflict)
    }

    async fn get_data_conflict(&self, id: &Id) -> VcsResult<Option<DataConflict>> {
        Ok(self
            .state
            .read()
            .data_conflicts
            .iter()
            .find(|c| &c.id == id)
            .cloned())
    }

    async fn list_data_conflicts(&self, merge_id: &Id) -> VcsResult<Vec<DataConflict>> {
        Ok(self
            .state
            .read()
            .data_conflicts
            .iter()
            .filter(|c| &c.merge_id == merge_id)
            .cloned()
            .collect())
    }

    async fn update_data_conflict(&self, conflict: DataConflict) -> VcsResult<()> {
        self.state.write().update_data_conflict(conflict)
    }
}

#[async_trait::async_trait]
impl RelationStore for MemoryStore {
    async fn relation_exists(&self, name: &QualifiedName) -> VcsResult<bool> {
        Ok(self.state.read().relations.contains_key(name))
    }

    async fn count_rows(&self, name: &QualifiedName) -> VcsResult<u64> {
        Ok(self.state.read().relation(name)?.rows.len() as u64)
    }

    async fn primary_key(&self, name: &QualifiedName) -> VcsResult<Option<Vec<String>>> {
        Ok(self.state.read().relation(name)?.primary_key.clone())
    }

    async fn move_relation(&self, from: &QualifiedName, to: &QualifiedName) -> VcsResult<()> {
        self.state.write().move_relation(from, to)
    }

    async fn copy_relation(&self, from: &QualifiedName, to: &QualifiedName) -> VcsResult<u64> {
        self.state.write().copy_relation(from, to)
    }

    async fn scan_rows(&self, name: &QualifiedName) -> VcsResult<Vec<Row>> {
        Ok(self.state.read().relation(name)?.rows.clone())
    }

    async fn insert_row(&self, name: &QualifiedName, row: Row) -> VcsResult<()> {
        self.state.write().insert_row(name, row, false).map(|_| ())
    }

    async fn upsert_row(&self, name: &QualifiedName, row: Row) -> VcsResult<()> {
        self.state.write().upsert_row(name, row)
    }

    async fn delete_row(&self, name: &QualifiedName, key: &Row) -> VcsResult<bool> {
        self.state.write().delete_row(name, key)
    }
}

#[async_trait::async_trait]
impl UnitOfWork for MemoryStore {
    async fn commit(&self, batch: WriteBatch) -> VcsResult<()> {
        let mut state = self.state.write();
        let mut staged = state.clone();
        for write in batch {
            staged.apply(write)?;
        }
        *state = staged;
        Ok(())
    }
}

impl Coordination for MemoryStore {
    fn branch_locks(&self) -> &BranchLocks {
        &self.locks
    }

    fn snapshot_cache(&self) -> &SnapshotCache {
        &self.snapshots
    }
}

impl Store for MemoryStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = MemoryStore::new();
        let a = store.put_object(ObjectKind::Blob, b"CREATE TABLE t ()".to_vec()).await.unwrap();
        let b = store.put_object(ObjectKind::Blob, b"CREATE TABLE t ()".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.object_count().await.unwrap(), 1);
        assert!(store.object_exists(&a).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_missing_object_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get_object("deadbeef").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_branch_names_are_unique() {
        let store = MemoryStore::new();
        store.insert_branch(Branch::new_main_branch("alice")).await.unwrap();
        let err = store
            .insert_branch(Branch::new_main_branch("bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, VcsError::AlreadyExists { .. }));
        assert_eq!(store.list_branches().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tag_refs_cannot_be_reinserted() {
        let store = MemoryStore::new();
        store.insert_ref(Ref::new(RefKind::Tag, "v1", "c1")).await.unwrap();
        assert!(store.insert_ref(Ref::new(RefKind::Tag, "v1", "c2")).await.is_err());
        assert_eq!(
            store.get_ref(RefKind::Tag, "v1").await.unwrap().unwrap().target_commit_sha,
            "c1"
        );
    }

    #[tokio::test]
    async fn test_relation_rows_by_primary_key() {
        let store = MemoryStore::new();
        let orders = QualifiedName::new("public", "orders");
        store.create_relation(&orders, Some(vec!["id".into()])).unwrap();

        store.insert_row(&orders, row(json!({"id": 1, "total": 10}))).await.unwrap();
        assert!(store.insert_row(&orders, row(json!({"id": 1, "total": 99}))).await.is_err());

        store.upsert_row(&orders, row(json!({"id": 1, "total": 20}))).await.unwrap();
        store.upsert_row(&orders, row(json!({"id": 2, "total": 5}))).await.unwrap();
        let rows = store.scan_rows(&orders).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["total"], json!(20));

        assert!(store.delete_row(&orders, &row(json!({"id": 2}))).await.unwrap());
        assert!(!store.delete_row(&orders, &row(json!({"id": 2}))).await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_then_diverge() {
        let store = MemoryStore::new();
        let orders = QualifiedName::new("public", "orders");
        let copy = QualifiedName::new("_vcs_br_feature", "public__orders");
        store.create_relation(&orders, Some(vec!["id".into()])).unwrap();
        store.insert_row(&orders, row(json!({"id": 1}))).await.unwrap();

        assert_eq!(store.copy_relation(&orders, &copy).await.unwrap(), 1);
        store.insert_row(&copy, row(json!({"id": 2}))).await.unwrap();

        assert_eq!(store.scan_rows(&orders).await.unwrap().len(), 1);
        assert_eq!(store.scan_rows(&copy).await.unwrap().len(), 2);
        assert_eq!(store.primary_key(&copy).await.unwrap(), Some(vec!["id".to_string()]));
    }

    #[tokio::test]
    async fn test_failing_history_writes() {
        let store = MemoryStore::new();
        store.set_fail_history_writes(true);
        let entry = ObjectHistoryEntry {
            branch_name: "main".into(),
            identity: crate::model::ObjectIdentity::table("public", "t"),
            action: crate::model::HistoryAction::Create,
            old_hash: None,
            new_hash: Some("h".into()),
            commit_sha: "c".into(),
            author: "alice".into(),
            recorded_at: chrono::Utc::now(),
        };
        assert!(store.record_history(entry).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_no_trace() {
        let store = MemoryStore::new();
        let orders = QualifiedName::new("public", "orders");
        let copy = orders.branch_location("feature");
        store.create_relation(&orders, Some(vec!["id".into()])).unwrap();
        store.insert_row(&orders, row(json!({"id": 1}))).await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .push(StoreWrite::CopyRelation {
                from: orders.clone(),
                to: copy.clone(),
            })
            .push(StoreWrite::UpsertRow {
                table: copy.clone(),
                row: row(json!({"id": 2})),
            })
            .push(StoreWrite::MoveRelation {
                from: QualifiedName::new("public", "missing"),
                to: QualifiedName::new("public", "elsewhere"),
            });
        assert_eq!(batch.len(), 3);

        let err = store.commit(batch).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!store.relation_exists(&copy).await.unwrap());
        assert_eq!(store.scan_rows(&orders).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_existing_row() {
        let store = MemoryStore::new();
        let orders = QualifiedName::new("public", "orders");
        store.create_relation(&orders, Some(vec!["id".into()])).unwrap();
        store.insert_row(&orders, row(json!({"id": 1, "total": 10}))).await.unwrap();

        let batch = WriteBatch::from(vec![
            StoreWrite::InsertRowIfAbsent {
                table: orders.clone(),
                row: row(json!({"id": 1, "total": 99})),
            },
            StoreWrite::InsertRowIfAbsent {
                table: orders.clone(),
                row: row(json!({"id": 2, "total": 20})),
            },
        ]);
        store.commit(batch).await.unwrap();

        let rows = store.scan_rows(&orders).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["total"], json!(10));
    }

    #[tokio::test]
    async fn test_data_conflict_recorded_once_per_row() {
        use crate::model::DataConflictType;

        let store = MemoryStore::new();
        let conflict = |key: i64| {
            DataConflict::new(
                "m1",
                QualifiedName::new("public", "orders"),
                "feature",
                "main",
                json!({"id": key}),
                None,
                None,
                DataConflictType::UpdateDelete,
            )
        };
        store.insert_data_conflict(conflict(1)).await.unwrap();
        let err = store.insert_data_conflict(conflict(1)).await.unwrap_err();
        assert!(matches!(err, VcsError::AlreadyExists { .. }));
        store.insert_data_conflict(conflict(2)).await.unwrap();
        assert_eq!(store.list_data_conflicts(&"m1".to_string()).await.unwrap().len(), 2);
    }
}
