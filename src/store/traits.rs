use crate::error::VcsResult;
use crate::model::{
    Branch, DataBranchTable, DataConflict, Id, MergeRecord, ObjectHistoryEntry, ObjectKind,
    QualifiedName, Ref, RefKind, RoutedTable, Row, SchemaConflict, StoredObject,
    TrackingErrorRecord,
};
use crate::store::{BranchLocks, SnapshotCache};

/// Content-addressed storage of blobs, trees and commits.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Hash and persist `content`; a second put of the same content is a no-op
    /// returning the same sha.
    async fn put_object(&self, kind: ObjectKind, content: Vec<u8>) -> VcsResult<String>;
    /// Fetch an object, failing with NotFound when absent
    async fn get_object(&self, sha: &str) -> VcsResult<StoredObject>;
    async fn object_exists(&self, sha: &str) -> VcsResult<bool>;
    async fn object_count(&self) -> VcsResult<u64>;
}

#[async_trait::async_trait]
pub trait BranchStore: Send + Sync {
    /// Insert a new branch; AlreadyExists if the name was ever used
    async fn insert_branch(&self, branch: Branch) -> VcsResult<()>;
    /// Get a branch by name, deleted ones included
    async fn get_branch(&self, name: &str) -> VcsResult<Option<Branch>>;
    async fn update_branch(&self, branch: Branch) -> VcsResult<()>;
    async fn list_branches(&self) -> VcsResult<Vec<Branch>>;
}

#[async_trait::async_trait]
pub trait RefStore: Send + Sync {
    async fn get_ref(&self, kind: RefKind, name: &str) -> VcsResult<Option<Ref>>;
    /// Insert a ref; AlreadyExists if (kind, name) is taken
    async fn insert_ref(&self, reference: Ref) -> VcsResult<()>;
    /// Move a branch ref, creating it if needed
    async fn set_branch_ref(&self, name: &str, target_commit_sha: &str) -> VcsResult<()>;
    async fn list_refs(&self, kind: RefKind) -> VcsResult<Vec<Ref>>;
}

/// Append-only tracking records written beside schema changes.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    async fn record_history(&self, entry: ObjectHistoryEntry) -> VcsResult<()>;
    async fn list_history(&self, branch_name: &str) -> VcsResult<Vec<ObjectHistoryEntry>>;
    async fn record_tracking_error(&self, record: TrackingErrorRecord) -> VcsResult<()>;
    async fn list_tracking_errors(&self) -> VcsResult<Vec<TrackingErrorRecord>>;
}

#[async_trait::async_trait]
pub trait MergeStore: Send + Sync {
    async fn insert_merge(&self, merge: MergeRecord) -> VcsResult<()>;
    async fn get_merge(&self, id: &Id) -> VcsResult<Option<MergeRecord>>;
    async fn update_merge(&self, merge: MergeRecord) -> VcsResult<()>;
    async fn insert_conflict(&self, conflict: SchemaConflict) -> VcsResult<()>;
    async fn get_conflict(&self, id: &Id) -> VcsResult<Option<SchemaConflict>>;
    async fn list_conflicts(&self, merge_id: &Id) -> VcsResult<Vec<SchemaConflict>>;
    async fn update_conflict(&self, conflict: SchemaConflict) -> VcsResult<()>;
}

/// Routing and isolation records of the data plane.
#[async_trait::async_trait]
pub trait DataBranchStore: Send + Sync {
    async fn get_routed_table(&self, table: &QualifiedName) -> VcsResult<Option<RoutedTable>>;
    async fn insert_routed_table(&self, routed: RoutedTable) -> VcsResult<()>;
    async fn list_routed_tables(&self) -> VcsResult<Vec<RoutedTable>>;
    async fn get_data_branch_table(
        &self,
        branch_name: &str,
        source: &QualifiedName,
    ) -> VcsResult<Option<DataBranchTable>>;
    async fn insert_data_branch_table(&self, record: DataBranchTable) -> VcsResult<()>;
    async fn list_data_branch_tables(&self, branch_name: &str) -> VcsResult<Vec<DataBranchTable>>;
    async fn insert_data_conflict(&self, conflict: DataConflict) -> VcsResult<()>;
    async fn get_data_conflict(&self, id: &Id) -> VcsResult<Option<DataConflict>>;
    async fn list_data_conflicts(&self, merge_id: &Id) -> VcsResult<Vec<DataConflict>>;
    async fn update_data_conflict(&self, conflict: DataConflict) -> VcsResult<()>;
}

/// Physical relations: the host side that can enumerate and copy rows.
#[async_trait::async_trait]
pub trait RelationStore: Send + Sync {
    async fn relation_exists(&self, name: &QualifiedName) -> VcsResult<bool>;
    async fn count_rows(&self, name: &QualifiedName) -> VcsResult<u64>;
    async fn primary_key(&self, name: &QualifiedName) -> VcsResult<Option<Vec<String>>>;
    /// Move a relation to a new schema-qualified name
    async fn move_relation(&self, from: &QualifiedName, to: &QualifiedName) -> VcsResult<()>;
    /// Create `to` with the structure and current rows of `from`; returns rows copied
    async fn copy_relation(&self, from: &QualifiedName, to: &QualifiedName) -> VcsResult<u64>;
    async fn scan_rows(&self, name: &QualifiedName) -> VcsResult<Vec<Row>>;
    /// Insert a row; AlreadyExists when its primary key is taken
    async fn insert_row(&self, name: &QualifiedName, row: Row) -> VcsResult<()>;
    /// Insert or overwrite by primary key
    async fn upsert_row(&self, name: &QualifiedName, row: Row) -> VcsResult<()>;
    /// Delete the row with this `{column: value}` key; false if absent
    async fn delete_row(&self, name: &QualifiedName, key: &Row) -> VcsResult<bool>;
}

/// One write inside a [`WriteBatch`]. Each variant has the semantics of the
/// store method of the same name.
#[derive(Debug, Clone)]
pub enum StoreWrite {
    UpdateBranch(Branch),
    SetBranchRef { name: String, commit_sha: String },
    InsertMerge(MergeRecord),
    UpdateMerge(MergeRecord),
    InsertConflict(SchemaConflict),
    /// Compare-and-set on a pending conflict
    UpdateConflict(SchemaConflict),
    InsertRoutedTable(RoutedTable),
    InsertDataBranchTable(DataBranchTable),
    InsertDataConflict(DataConflict),
    /// Store the resolution and `applied_at` of a data conflict that has not
    /// been applied yet; Forbidden otherwise
    MarkDataConflictApplied(DataConflict),
    MoveRelation { from: QualifiedName, to: QualifiedName },
    CopyRelation { from: QualifiedName, to: QualifiedName },
    /// Insert unless a row with the same primary key exists
    InsertRowIfAbsent { table: QualifiedName, row: Row },
    UpsertRow { table: QualifiedName, row: Row },
    DeleteRow { table: QualifiedName, key: Row },
}

/// Ordered writes that land together or not at all.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<StoreWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: StoreWrite) -> &mut Self {
        self.writes.push(write);
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

impl IntoIterator for WriteBatch {
    type Item = StoreWrite;
    type IntoIter = std::vec::IntoIter<StoreWrite>;

    fn into_iter(self) -> Self::IntoIter {
        self.writes.into_iter()
    }
}

impl From<Vec<StoreWrite>> for WriteBatch {
    fn from(writes: Vec<StoreWrite>) -> Self {
        Self { writes }
    }
}

#[async_trait::async_trait]
pub trait UnitOfWork: Send + Sync {
    /// Apply every write in order. If one fails, none of them are visible
    /// and its error is returned.
    async fn commit(&self, batch: WriteBatch) -> VcsResult<()>;
}

/// In-process coordination shared by every caller of a store.
pub trait Coordination: Send + Sync {
    fn branch_locks(&self) -> &BranchLocks;
    fn snapshot_cache(&self) -> &SnapshotCache;
}

pub trait Store:
    ObjectStore
    + BranchStore
    + RefStore
    + HistoryStore
    + MergeStore
    + DataBranchStore
    + RelationStore
    + UnitOfWork
    + Coordination
    + Send
    + Sync
{
}
