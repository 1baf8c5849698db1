use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgConnection, PgPool, Row as SqlRow};

use crate::error::{VcsError, VcsResult};
use crate::model::{
    compress_content, decompress_content, Branch, DataBranchTable, DataConflict, Id,
    MergeRecord, ObjectHistoryEntry, ObjectIdentity, ObjectKind, QualifiedName, Ref, RefKind,
    RoutedTable, Row, SchemaConflict, StoredObject, TrackingErrorRecord,
};
use crate::store::traits::{
    BranchStore, Coordination, DataBranchStore, HistoryStore, MergeStore, ObjectStore,
    RefStore, RelationStore, Store, StoreWrite, UnitOfWork, WriteBatch,
};
use crate::store::{BranchLocks, SnapshotCache};

#[derive(Debug)]
pub struct PostgresStore {
    pool: PgPool,
    locks: BranchLocks,
    snapshots: SnapshotCache,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> VcsResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            locks: BranchLocks::new(),
            snapshots: SnapshotCache::new(),
        }
    }

    /// Replace the snapshot cache with one using the given TTL
    pub fn with_snapshot_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.snapshots = SnapshotCache::with_ttl(ttl);
        self
    }

    /// Run the embedded migrations
    pub async fn migrate(&self) -> VcsResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        log::info!("vcdb migrations applied");
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Map a unique violation to AlreadyExists, anything else to a database error.
fn unique_violation(err: sqlx::Error, kind: &str, name: &str) -> VcsError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return VcsError::already_exists(kind, name);
        }
    }
    VcsError::Database(err)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quoted(name: &QualifiedName) -> String {
    format!("{}.{}", quote_ident(&name.schema), quote_ident(&name.table))
}

fn branch_from_row(row: &PgRow) -> VcsResult<Branch> {
    let status: String = row.try_get("status")?;
    let branch_type: String = row.try_get("branch_type")?;
    Ok(Branch {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        parent_branch_id: row.try_get("parent_branch_id")?,
        parent_branch_name: row.try_get("parent_branch_name")?,
        status: status.parse()?,
        branch_type: branch_type.parse()?,
        head_commit_sha: row.try_get("head_commit_sha")?,
        fork_commit_sha: row.try_get("fork_commit_sha")?,
        description: row.try_get("description")?,
        metadata: row.try_get("metadata")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        merged_by: row.try_get("merged_by")?,
        merged_at: row.try_get("merged_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn ref_from_row(row: &PgRow) -> VcsResult<Ref> {
    let kind: String = row.try_get("kind")?;
    Ok(Ref {
        name: row.try_get("name")?,
        kind: kind.parse()?,
        target_commit_sha: row.try_get("target_commit_sha")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn identity_from_row(row: &PgRow) -> VcsResult<ObjectIdentity> {
    let object_type: String = row.try_get("object_type")?;
    Ok(ObjectIdentity {
        object_type: object_type.parse()?,
        schema_name: row.try_get("schema_name")?,
        object_name: row.try_get("object_name")?,
    })
}

fn merge_from_row(row: &PgRow) -> VcsResult<MergeRecord> {
    let status: String = row.try_get("status")?;
    Ok(MergeRecord {
        id: row.try_get("id")?,
        source_branch: row.try_get("source_branch")?,
        target_branch: row.try_get("target_branch")?,
        base_commit_sha: row.try_get("base_commit_sha")?,
        source_commit_sha: row.try_get("source_commit_sha")?,
        target_commit_sha: row.try_get("target_commit_sha")?,
        result_commit_sha: row.try_get("result_commit_sha")?,
        status: status.parse()?,
        message: row.try_get("message")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn conflict_from_row(row: &PgRow) -> VcsResult<SchemaConflict> {
    let conflict_type: String = row.try_get("conflict_type")?;
    let resolution: Option<serde_json::Value> = row.try_get("resolution")?;
    Ok(SchemaConflict {
        id: row.try_get("id")?,
        merge_id: row.try_get("merge_id")?,
        branch_a: row.try_get("branch_a")?,
        branch_b: row.try_get("branch_b")?,
        base_ref: row.try_get("base_ref")?,
        conflict_object: identity_from_row(row)?,
        conflict_type: conflict_type.parse()?,
        base_hash: row.try_get("base_hash")?,
        source_hash: row.try_get("source_hash")?,
        target_hash: row.try_get("target_hash")?,
        resolution: resolution.map(serde_json::from_value).transpose()?,
        resolved_hash: row.try_get("resolved_hash")?,
        resolved_by: row.try_get("resolved_by")?,
        resolved_at: row.try_get("resolved_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn routed_from_row(row: &PgRow) -> VcsResult<RoutedTable> {
    let primary_key: Option<serde_json::Value> = row.try_get("primary_key")?;
    Ok(RoutedTable {
        table: QualifiedName::new(
            &row.try_get::<String, _>("schema_name")?,
            &row.try_get::<String, _>("table_name")?,
        ),
        base: QualifiedName::new(
            &row.try_get::<String, _>("base_schema")?,
            &row.try_get::<String, _>("base_table")?,
        ),
        primary_key: primary_key.map(serde_json::from_value).transpose()?,
        created_at: row.try_get("created_at")?,
    })
}

fn data_branch_table_from_row(row: &PgRow) -> VcsResult<DataBranchTable> {
    let rows_copied: i64 = row.try_get("rows_copied")?;
    Ok(DataBranchTable {
        branch_name: row.try_get("branch_name")?,
        source: QualifiedName::new(
            &row.try_get::<String, _>("source_schema")?,
            &row.try_get::<String, _>("source_table")?,
        ),
        branch_table: QualifiedName::new(
            &row.try_get::<String, _>("branch_schema")?,
            &row.try_get::<String, _>("branch_table")?,
        ),
        uses_cow: row.try_get("uses_cow")?,
        rows_copied: rows_copied.max(0) as u64,
        created_at: row.try_get("created_at")?,
    })
}

fn json_object(value: Option<serde_json::Value>) -> Option<Row> {
    match value {
        Some(serde_json::Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn data_conflict_from_row(row: &PgRow) -> VcsResult<DataConflict> {
    let conflict_type: String = row.try_get("conflict_type")?;
    let resolution: String = row.try_get("resolution")?;
    Ok(DataConflict {
        id: row.try_get("id")?,
        merge_id: row.try_get("merge_id")?,
        table_name: QualifiedName::new(
            &row.try_get::<String, _>("table_schema")?,
            &row.try_get::<String, _>("table_name")?,
        ),
        source_branch: row.try_get("source_branch")?,
        target_branch: row.try_get("target_branch")?,
        primary_key_value: row.try_get("primary_key_value")?,
        source_data: json_object(row.try_get("source_data")?),
        target_data: json_object(row.try_get("target_data")?),
        conflict_type: conflict_type.parse()?,
        resolution: resolution.parse()?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
        applied_at: row.try_get("applied_at")?,
    })
}

const BRANCH_COLUMNS: &str = "id, name, parent_branch_id, parent_branch_name, status, branch_type, \
     head_commit_sha, fork_commit_sha, description, metadata, created_by, created_at, \
     merged_by, merged_at, deleted_at";

const CONFLICT_COLUMNS: &str = "id, merge_id, branch_a, branch_b, base_ref, object_type, schema_name, \
     object_name, conflict_type, base_hash, source_hash, target_hash, resolution, resolved_hash, \
     resolved_by, resolved_at, created_at";

const DATA_CONFLICT_COLUMNS: &str = "id, merge_id, table_schema, table_name, source_branch, \
     target_branch, primary_key_value, source_data, target_data, conflict_type, resolution, \
     created_at, resolved_at, applied_at";

// Writes below run on any connection, so a trait call and a batch commit
// share the same SQL.

async fn apply_write(conn: &mut PgConnection, write: StoreWrite) -> VcsResult<()> {
    match write {
        StoreWrite::UpdateBranch(branch) => write_update_branch(conn, &branch).await,
        StoreWrite::SetBranchRef { name, commit_sha } => {
            write_branch_ref(conn, &name, &commit_sha).await
        }
        StoreWrite::InsertMerge(merge) => write_insert_merge(conn, &merge).await,
        StoreWrite::UpdateMerge(merge) => write_update_merge(conn, &merge).await,
        StoreWrite::InsertConflict(conflict) => write_insert_conflict(conn, &conflict).await,
        StoreWrite::UpdateConflict(conflict) => write_update_conflict(conn, &conflict).await,
        StoreWrite::InsertRoutedTable(routed) => write_insert_routed_table(conn, &routed).await,
        StoreWrite::InsertDataBranchTable(record) => {
            write_insert_data_branch_table(conn, &record).await
        }
        StoreWrite::InsertDataConflict(conflict) => {
            write_insert_data_conflict(conn, &conflict).await
        }
        StoreWrite::MarkDataConflictApplied(conflict) => {
            write_mark_data_conflict_applied(conn, &conflict).await
        }
        StoreWrite::MoveRelation { from, to } => write_move_relation(conn, &from, &to).await,
        StoreWrite::CopyRelation { from, to } => {
            write_copy_relation(conn, &from, &to).await.map(|_| ())
        }
        StoreWrite::InsertRowIfAbsent { table, row } => {
            write_insert_row(conn, &table, row, true).await.map(|_| ())
        }
        StoreWrite::UpsertRow { table, row } => write_upsert_row(conn, &table, row).await,
        StoreWrite::DeleteRow { table, key } => {
            write_delete_row(conn, &table, &key).await.map(|_| ())
        }
    }
}

async fn write_update_branch(conn: &mut PgConnection, branch: &Branch) -> VcsResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE vcs_branches SET
            status = $2,
            head_commit_sha = $3,
            description = $4,
            metadata = $5,
            merged_by = $6,
            merged_at = $7,
            deleted_at = $8
        WHERE name = $1
        "#,
    )
    .bind(&branch.name)
    .bind(branch.status.as_str())
    .bind(&branch.head_commit_sha)
    .bind(&branch.description)
    .bind(&branch.metadata)
    .bind(&branch.merged_by)
    .bind(branch.merged_at)
    .bind(branch.deleted_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(VcsError::not_found("branch", branch.name.as_str()));
    }
    Ok(())
}

async fn write_branch_ref(
    conn: &mut PgConnection,
    name: &str,
    target_commit_sha: &str,
) -> VcsResult<()> {
    sqlx::query(
        r#"
        INSERT INTO vcs_refs (kind, name, target_commit_sha, updated_at)
        VALUES ('branch', $1, $2, NOW())
        ON CONFLICT (kind, name) DO UPDATE SET
            target_commit_sha = EXCLUDED.target_commit_sha,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(name)
    .bind(target_commit_sha)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn write_insert_merge(conn: &mut PgConnection, merge: &MergeRecord) -> VcsResult<()> {
    sqlx::query(
        r#"
        INSERT INTO vcs_merges (id, source_branch, target_branch, base_commit_sha, source_commit_sha,
            target_commit_sha, result_commit_sha, status, message, created_by, created_at, completed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(&merge.id)
    .bind(&merge.source_branch)
    .bind(&merge.target_branch)
    .bind(&merge.base_commit_sha)
    .bind(&merge.source_commit_sha)
    .bind(&merge.target_commit_sha)
    .bind(&merge.result_commit_sha)
    .bind(merge.status.as_str())
    .bind(&merge.message)
    .bind(&merge.created_by)
    .bind(merge.created_at)
    .bind(merge.completed_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| unique_violation(e, "merge", &merge.id))?;

    Ok(())
}

async fn write_update_merge(conn: &mut PgConnection, merge: &MergeRecord) -> VcsResult<()> {
    let result = sqlx::query(
        "UPDATE vcs_merges SET status = $2, result_commit_sha = $3, completed_at = $4 WHERE id = $1",
    )
    .bind(&merge.id)
    .bind(merge.status.as_str())
    .bind(&merge.result_commit_sha)
    .bind(merge.completed_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(VcsError::not_found("merge", merge.id.as_str()));
    }
    Ok(())
}

async fn write_insert_conflict(conn: &mut PgConnection, conflict: &SchemaConflict) -> VcsResult<()> {
    let resolution = conflict
        .resolution
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO vcs_conflicts (id, merge_id, branch_a, branch_b, base_ref, object_type, schema_name,
            object_name, conflict_type, base_hash, source_hash, target_hash, resolution, resolved_hash,
            resolved_by, resolved_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#,
    )
    .bind(&conflict.id)
    .bind(&conflict.merge_id)
    .bind(&conflict.branch_a)
    .bind(&conflict.branch_b)
    .bind(&conflict.base_ref)
    .bind(conflict.conflict_object.object_type.as_str())
    .bind(&conflict.conflict_object.schema_name)
    .bind(&conflict.conflict_object.object_name)
    .bind(conflict.conflict_type.as_str())
    .bind(&conflict.base_hash)
    .bind(&conflict.source_hash)
    .bind(&conflict.target_hash)
    .bind(resolution)
    .bind(&conflict.resolved_hash)
    .bind(&conflict.resolved_by)
    .bind(conflict.resolved_at)
    .bind(conflict.created_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn write_update_conflict(conn: &mut PgConnection, conflict: &SchemaConflict) -> VcsResult<()> {
    let resolution = conflict
        .resolution
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    // Only a pending conflict can take a resolution.
    let result = sqlx::query(
        r#"
        UPDATE vcs_conflicts SET resolution = $2, resolved_hash = $3, resolved_by = $4, resolved_at = $5
        WHERE id = $1 AND resolution IS NULL
        "#,
    )
    .bind(&conflict.id)
    .bind(resolution)
    .bind(&conflict.resolved_hash)
    .bind(&conflict.resolved_by)
    .bind(conflict.resolved_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(VcsError::Forbidden(format!(
            "conflict '{}' is missing or already resolved",
            conflict.id
        )));
    }
    Ok(())
}

async fn write_insert_routed_table(conn: &mut PgConnection, routed: &RoutedTable) -> VcsResult<()> {
    let primary_key = routed
        .primary_key
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO vcs_routed_tables (schema_name, table_name, base_schema, base_table, primary_key, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&routed.table.schema)
    .bind(&routed.table.table)
    .bind(&routed.base.schema)
    .bind(&routed.base.table)
    .bind(primary_key)
    .bind(routed.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| unique_violation(e, "routed table", &routed.table.to_string()))?;

    Ok(())
}

async fn write_insert_data_branch_table(
    conn: &mut PgConnection,
    record: &DataBranchTable,
) -> VcsResult<()> {
    sqlx::query(
        r#"
        INSERT INTO vcs_data_branch_tables (branch_name, source_schema, source_table, branch_schema,
            branch_table, uses_cow, rows_copied, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&record.branch_name)
    .bind(&record.source.schema)
    .bind(&record.source.table)
    .bind(&record.branch_table.schema)
    .bind(&record.branch_table.table)
    .bind(record.uses_cow)
    .bind(record.rows_copied as i64)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        unique_violation(
            e,
            "data branch table",
            &format!("{}:{}", record.branch_name, record.source),
        )
    })?;

    Ok(())
}

async fn write_insert_data_conflict(conn: &mut PgConnection, conflict: &DataConflict) -> VcsResult<()> {
    sqlx::query(&format!(
        "INSERT INTO vcs_data_conflicts ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        DATA_CONFLICT_COLUMNS
    ))
    .bind(&conflict.id)
    .bind(&conflict.merge_id)
    .bind(&conflict.table_name.schema)
    .bind(&conflict.table_name.table)
    .bind(&conflict.source_branch)
    .bind(&conflict.target_branch)
    .bind(&conflict.primary_key_value)
    .bind(conflict.source_data.clone().map(serde_json::Value::Object))
    .bind(conflict.target_data.clone().map(serde_json::Value::Object))
    .bind(conflict.conflict_type.as_str())
    .bind(conflict.resolution.as_str())
    .bind(conflict.created_at)
    .bind(conflict.resolved_at)
    .bind(conflict.applied_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        unique_violation(
            e,
            "data conflict",
            &format!("{}:{} {}", conflict.merge_id, conflict.table_name, conflict.primary_key_value),
        )
    })?;

    Ok(())
}

async fn write_mark_data_conflict_applied(
    conn: &mut PgConnection,
    conflict: &DataConflict,
) -> VcsResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE vcs_data_conflicts SET resolution = $2, resolved_at = $3, applied_at = $4
        WHERE id = $1 AND applied_at IS NULL
        "#,
    )
    .bind(&conflict.id)
    .bind(conflict.resolution.as_str())
    .bind(conflict.resolved_at)
    .bind(conflict.applied_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(VcsError::Forbidden(format!(
            "data conflict '{}' is missing or already applied",
            conflict.id
        )));
    }
    Ok(())
}

async fn relation_exists_on(conn: &mut PgConnection, name: &QualifiedName) -> VcsResult<bool> {
    let row = sqlx::query("SELECT to_regclass($1) IS NOT NULL AS found")
        .bind(quoted(name))
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get("found")?)
}

async fn primary_key_on(
    conn: &mut PgConnection,
    name: &QualifiedName,
) -> VcsResult<Option<Vec<String>>> {
    if !relation_exists_on(conn, name).await? {
        return Err(VcsError::not_found("relation", name.to_string()));
    }

    let rows = sqlx::query(
        r#"
        SELECT a.attname::text AS column_name
        FROM pg_index i
        JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY (i.indkey)
        WHERE i.indrelid = to_regclass($1) AND i.indisprimary
        ORDER BY array_position(i.indkey::int2[], a.attnum)
        "#,
    )
    .bind(quoted(name))
    .fetch_all(&mut *conn)
    .await?;

    let columns = rows
        .iter()
        .map(|row| row.try_get::<String, _>("column_name"))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(if columns.is_empty() { None } else { Some(columns) })
}

async fn write_move_relation(
    conn: &mut PgConnection,
    from: &QualifiedName,
    to: &QualifiedName,
) -> VcsResult<()> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&to.schema)))
        .execute(&mut *conn)
        .await?;
    if from.schema != to.schema {
        sqlx::query(&format!(
            "ALTER TABLE {} SET SCHEMA {}",
            quoted(from),
            quote_ident(&to.schema)
        ))
        .execute(&mut *conn)
        .await?;
    }
    if from.table != to.table {
        let moved = QualifiedName::new(&to.schema, &from.table);
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            quoted(&moved),
            quote_ident(&to.table)
        ))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn write_copy_relation(
    conn: &mut PgConnection,
    from: &QualifiedName,
    to: &QualifiedName,
) -> VcsResult<u64> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&to.schema)))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE {} (LIKE {} INCLUDING ALL)",
        quoted(to),
        quoted(from)
    ))
    .execute(&mut *conn)
    .await
    .map_err(|e| unique_violation(e, "relation", &to.to_string()))?;
    let copied = sqlx::query(&format!(
        "INSERT INTO {} SELECT * FROM {}",
        quoted(to),
        quoted(from)
    ))
    .execute(&mut *conn)
    .await?
    .rows_affected();

    Ok(copied)
}

/// Returns false when `if_absent` is set and the key is already taken
async fn write_insert_row(
    conn: &mut PgConnection,
    name: &QualifiedName,
    row: Row,
    if_absent: bool,
) -> VcsResult<bool> {
    let table = quoted(name);
    let on_conflict = if if_absent { " ON CONFLICT DO NOTHING" } else { "" };
    let result = sqlx::query(&format!(
        "INSERT INTO {} SELECT * FROM jsonb_populate_record(NULL::{}, $1){}",
        table, table, on_conflict
    ))
    .bind(serde_json::Value::Object(row))
    .execute(&mut *conn)
    .await
    .map_err(|e| unique_violation(e, "row", &name.to_string()))?;

    Ok(result.rows_affected() > 0)
}

async fn write_upsert_row(conn: &mut PgConnection, name: &QualifiedName, row: Row) -> VcsResult<()> {
    let Some(primary_key) = primary_key_on(conn, name).await? else {
        return Err(VcsError::Unsupported(format!(
            "upsert into {} requires a primary key",
            name
        )));
    };

    let columns = sqlx::query(
        r#"
        SELECT column_name::text AS column_name FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2
        ORDER BY ordinal_position
        "#,
    )
    .bind(&name.schema)
    .bind(&name.table)
    .fetch_all(&mut *conn)
    .await?
    .iter()
    .map(|r| r.try_get::<String, _>("column_name"))
    .collect::<Result<Vec<_>, _>>()?;

    let assignments: Vec<String> = columns
        .iter()
        .filter(|c| !primary_key.contains(c))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();
    let conflict_target = primary_key
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let on_conflict = if assignments.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", assignments.join(", "))
    };

    let table = quoted(name);
    sqlx::query(&format!(
        "INSERT INTO {} SELECT * FROM jsonb_populate_record(NULL::{}, $1) ON CONFLICT ({}) {}",
        table, table, conflict_target, on_conflict
    ))
    .bind(serde_json::Value::Object(row))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn write_delete_row(conn: &mut PgConnection, name: &QualifiedName, key: &Row) -> VcsResult<bool> {
    let result = sqlx::query(&format!(
        "DELETE FROM {} t WHERE to_jsonb(t) @> $1",
        quoted(name)
    ))
    .bind(serde_json::Value::Object(key.clone()))
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

#[async_trait::async_trait]
impl ObjectStore for PostgresStore {
    async fn put_object(&self, kind: ObjectKind, content: Vec<u8>) -> VcsResult<String> {
        let object = StoredObject::new(kind, content);
        let compressed = compress_content(&object.content)?;

        sqlx::query(
            r#"
            INSERT INTO vcs_objects (sha, kind, content, size)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (sha) DO NOTHING
            "#,
        )
        .bind(&object.sha)
        .bind(kind.as_str())
        .bind(compressed)
        .bind(object.size() as i64)
        .execute(&self.pool)
        .await?;

        Ok(object.sha)
    }

    async fn get_object(&self, sha: &str) -> VcsResult<StoredObject> {
        let row = sqlx::query("SELECT sha, kind, content FROM vcs_objects WHERE sha = $1")
            .bind(sha)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Err(VcsError::not_found("object", sha));
        };

        let kind: String = row.try_get("kind")?;
        let content: Vec<u8> = row.try_get("content")?;
        let object = StoredObject {
            sha: row.try_get("sha")?,
            kind: kind.parse()?,
            content: decompress_content(&content)?,
        };

        if !object.verify() {
            return Err(VcsError::Storage(format!(
                "object {} failed hash verification",
                sha
            )));
        }
        Ok(object)
    }

    async fn object_exists(&self, sha: &str) -> VcsResult<bool> {
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM vcs_objects WHERE sha = $1) AS found")
            .bind(sha)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("found")?)
    }

    async fn object_count(&self) -> VcsResult<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM vcs_objects")
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }
}

#[async_trait::async_trait]
impl BranchStore for PostgresStore {
    async fn insert_branch(&self, branch: Branch) -> VcsResult<()> {
        sqlx::query(
            r#"
            INSERT INTO vcs_branches (id, name, parent_branch_id, parent_branch_name, status, branch_type,
                head_commit_sha, fork_commit_sha, description, metadata, created_by, created_at,
                merged_by, merged_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(&branch.id)
        .bind(&branch.name)
        .bind(&branch.parent_branch_id)
        .bind(&branch.parent_branch_name)
        .bind(branch.status.as_str())
        .bind(branch.branch_type.as_str())
        .bind(&branch.head_commit_sha)
        .bind(&branch.fork_commit_sha)
        .bind(&branch.description)
        .bind(&branch.metadata)
        .bind(&branch.created_by)
        .bind(branch.created_at)
        .bind(&branch.merged_by)
        .bind(branch.merged_at)
        .bind(branch.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, "branch", &branch.name))?;

        Ok(())
    }

    async fn get_branch(&self, name: &str) -> VcsResult<Option<Branch>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM vcs_branches WHERE name = $1",
            BRANCH_COLUMNS
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(branch_from_row).transpose()
    }

    async fn update_branch(&self, branch: Branch) -> VcsResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_update_branch(&mut conn, &branch).await
    }

    async fn list_branches(&self) -> VcsResult<Vec<Branch>> {
        let rows = sqlx::query(&format!("SELECT {} FROM vcs_branches", BRANCH_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(branch_from_row).collect()
    }
}

#[async_trait::async_trait]
impl RefStore for PostgresStore {
    async fn get_ref(&self, kind: RefKind, name: &str) -> VcsResult<Option<Ref>> {
        let row = sqlx::query(
            "SELECT kind, name, target_commit_sha, updated_at FROM vcs_refs WHERE kind = $1 AND name = $2",
        )
        .bind(kind.as_str())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(ref_from_row).transpose()
    }

    async fn insert_ref(&self, reference: Ref) -> VcsResult<()> {
        sqlx::query(
            "INSERT INTO vcs_refs (kind, name, target_commit_sha, updated_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(reference.kind.as_str())
        .bind(&reference.name)
        .bind(&reference.target_commit_sha)
        .bind(reference.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, reference.kind.as_str(), &reference.name))?;

        Ok(())
    }

    async fn set_branch_ref(&self, name: &str, target_commit_sha: &str) -> VcsResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_branch_ref(&mut conn, name, target_commit_sha).await
    }

    async fn list_refs(&self, kind: RefKind) -> VcsResult<Vec<Ref>> {
        let rows = sqlx::query(
            "SELECT kind, name, target_commit_sha, updated_at FROM vcs_refs WHERE kind = $1 ORDER BY name",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(ref_from_row).collect()
    }
}

#[async_trait::async_trait]
impl HistoryStore for PostgresStore {
    async fn record_history(&self, entry: ObjectHistoryEntry) -> VcsResult<()> {
        sqlx::query(
            r#"
            INSERT INTO vcs_object_history (branch_name, object_type, schema_name, object_name,
                action, old_hash, new_hash, commit_sha, author, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&entry.branch_name)
        .bind(entry.identity.object_type.as_str())
        .bind(&entry.identity.schema_name)
        .bind(&entry.identity.object_name)
        .bind(entry.action.as_str())
        .bind(&entry.old_hash)
        .bind(&entry.new_hash)
        .bind(&entry.commit_sha)
        .bind(&entry.author)
        .bind(entry.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_history(&self, branch_name: &str) -> VcsResult<Vec<ObjectHistoryEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT branch_name, object_type, schema_name, object_name, action, old_hash, new_hash,
                   commit_sha, author, recorded_at
            FROM vcs_object_history
            WHERE branch_name = $1
            ORDER BY id
            "#,
        )
        .bind(branch_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let action: String = row.try_get("action")?;
                Ok(ObjectHistoryEntry {
                    branch_name: row.try_get("branch_name")?,
                    identity: identity_from_row(row)?,
                    action: serde_json::from_value(serde_json::Value::String(action))?,
                    old_hash: row.try_get("old_hash")?,
                    new_hash: row.try_get("new_hash")?,
                    commit_sha: row.try_get("commit_sha")?,
                    author: row.try_get("author")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }

    async fn record_tracking_error(&self, record: TrackingErrorRecord) -> VcsResult<()> {
        sqlx::query(
            "INSERT INTO vcs_tracking_errors (operation, branch_name, message, recorded_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&record.operation)
        .bind(&record.branch_name)
        .bind(&record.message)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_tracking_errors(&self) -> VcsResult<Vec<TrackingErrorRecord>> {
        let rows = sqlx::query(
            "SELECT operation, branch_name, message, recorded_at FROM vcs_tracking_errors ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(TrackingErrorRecord {
                    operation: row.try_get("operation")?,
                    branch_name: row.try_get("branch_name")?,
                    message: row.try_get("message")?,
                    recorded_at: row.try_get("recorded_at")?,
                })
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl MergeStore for PostgresStore {
    async fn insert_merge(&self, merge: MergeRecord) -> VcsResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_insert_merge(&mut conn, &merge).await
    }

    async fn get_merge(&self, id: &Id) -> VcsResult<Option<MergeRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, source_branch, target_branch, base_commit_sha, source_commit_sha, target_commit_sha,
                   result_commit_sha, status, message, created_by, created_at, completed_at
            FROM vcs_merges WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(merge_from_row).transpose()
    }

    async fn update_merge(&self, merge: MergeRecord) -> VcsResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_update_merge(&mut conn, &merge).await
    }

    async fn insert_conflict(&self, conflict: SchemaConflict) -> VcsResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_insert_conflict(&mut conn, &conflict).await
    }

    async fn get_conflict(&self, id: &Id) -> VcsResult<Option<SchemaConflict>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM vcs_conflicts WHERE id = $1",
            CONFLICT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(conflict_from_row).transpose()
    }

    async fn list_conflicts(&self, merge_id: &Id) -> VcsResult<Vec<SchemaConflict>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM vcs_conflicts WHERE merge_id = $1 ORDER BY created_at, id",
            CONFLICT_COLUMNS
        ))
        .bind(merge_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(conflict_from_row).collect()
    }

    async fn update_conflict(&self, conflict: SchemaConflict) -> VcsResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_update_conflict(&mut conn, &conflict).await
    }
}

#[async_trait::async_trait]
impl DataBranchStore for PostgresStore {
    async fn get_routed_table(&self, table: &QualifiedName) -> VcsResult<Option<RoutedTable>> {
        let row = sqlx::query(
            r#"
            SELECT schema_name, table_name, base_schema, base_table, primary_key, created_at
            FROM vcs_routed_tables WHERE schema_name = $1 AND table_name = $2
            "#,
        )
        .bind(&table.schema)
        .bind(&table.table)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(routed_from_row).transpose()
    }

    async fn insert_routed_table(&self, routed: RoutedTable) -> VcsResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_insert_routed_table(&mut conn, &routed).await
    }

    async fn list_routed_tables(&self) -> VcsResult<Vec<RoutedTable>> {
        let rows = sqlx::query(
            r#"
            SELECT schema_name, table_name, base_schema, base_table, primary_key, created_at
            FROM vcs_routed_tables ORDER BY schema_name, table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(routed_from_row).collect()
    }

    async fn get_data_branch_table(
        &self,
        branch_name: &str,
        source: &QualifiedName,
    ) -> VcsResult<Option<DataBranchTable>> {
        let row = sqlx::query(
            r#"
            SELECT branch_name, source_schema, source_table, branch_schema, branch_table, uses_cow,
                   rows_copied, created_at
            FROM vcs_data_branch_tables
            WHERE branch_name = $1 AND source_schema = $2 AND source_table = $3
            "#,
        )
        .bind(branch_name)
        .bind(&source.schema)
        .bind(&source.table)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(data_branch_table_from_row).transpose()
    }

    async fn insert_data_branch_table(&self, record: DataBranchTable) -> VcsResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_insert_data_branch_table(&mut conn, &record).await
    }

    async fn list_data_branch_tables(&self, branch_name: &str) -> VcsResult<Vec<DataBranchTable>> {
        let rows = sqlx::query(
            r#"
            SELECT branch_name, source_schema, source_table, branch_schema, branch_table, uses_cow,
                   rows_copied, created_at
            FROM vcs_data_branch_tables WHERE branch_name = $1
            ORDER BY source_schema, source_table
            "#,
        )
        .bind(branch_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(data_branch_table_from_row).collect()
    }

    async fn insert_data_conflict(&self, conflict: DataConflict) -> VcsResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_insert_data_conflict(&mut conn, &conflict).await
    }

    async fn get_data_conflict(&self, id: &Id) -> VcsResult<Option<DataConflict>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM vcs_data_conflicts WHERE id = $1",
            DATA_CONFLICT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(data_conflict_from_row).transpose()
    }

    async fn list_data_conflicts(&self, merge_id: &Id) -> VcsResult<Vec<DataConflict>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM vcs_data_conflicts WHERE merge_id = $1 ORDER BY created_at, id",
            DATA_CONFLICT_COLUMNS
        ))
        .bind(merge_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(data_conflict_from_row).collect()
    }

    async fn update_data_conflict(&self, conflict: DataConflict) -> VcsResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE vcs_data_conflicts SET resolution = $2, resolved_at = $3
            WHERE id = $1 AND resolution = 'pending'
            "#,
        )
        .bind(&conflict.id)
        .bind(conflict.resolution.as_str())
        .bind(conflict.resolved_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(VcsError::Forbidden(format!(
                "data conflict '{}' is missing or already resolved",
                conflict.id
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RelationStore for PostgresStore {
    async fn relation_exists(&self, name: &QualifiedName) -> VcsResult<bool> {
        let mut conn = self.pool.acquire().await?;
        relation_exists_on(&mut conn, name).await
    }

    async fn count_rows(&self, name: &QualifiedName) -> VcsResult<u64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS total FROM {}", quoted(name)))
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(total.max(0) as u64)
    }

    async fn primary_key(&self, name: &QualifiedName) -> VcsResult<Option<Vec<String>>> {
        let mut conn = self.pool.acquire().await?;
        primary_key_on(&mut conn, name).await
    }

    async fn move_relation(&self, from: &QualifiedName, to: &QualifiedName) -> VcsResult<()> {
        let mut tx = self.pool.begin().await?;
        write_move_relation(&mut tx, from, to).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn copy_relation(&self, from: &QualifiedName, to: &QualifiedName) -> VcsResult<u64> {
        let mut tx = self.pool.begin().await?;
        let copied = write_copy_relation(&mut tx, from, to).await?;
        tx.commit().await?;
        Ok(copied)
    }

    async fn scan_rows(&self, name: &QualifiedName) -> VcsResult<Vec<Row>> {
        let rows = sqlx::query(&format!("SELECT to_jsonb(t) AS row FROM {} t", quoted(name)))
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let value: serde_json::Value = row.try_get("row")?;
                json_object(Some(value))
                    .ok_or_else(|| VcsError::Storage(format!("row of {} is not an object", name)))
            })
            .collect()
    }

    async fn insert_row(&self, name: &QualifiedName, row: Row) -> VcsResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_insert_row(&mut conn, name, row, false).await.map(|_| ())
    }

    async fn upsert_row(&self, name: &QualifiedName, row: Row) -> VcsResult<()> {
        let mut conn = self.pool.acquire().await?;
        write_upsert_row(&mut conn, name, row).await
    }

    async fn delete_row(&self, name: &QualifiedName, key: &Row) -> VcsResult<bool> {
        let mut conn = self.pool.acquire().await?;
        write_delete_row(&mut conn, name, key).await
    }
}

#[async_trait::async_trait]
impl UnitOfWork for PostgresStore {
    async fn commit(&self, batch: WriteBatch) -> VcsResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let writes = batch.len();
        let mut tx = self.pool.begin().await?;
        for write in batch {
            apply_write(&mut tx, write).await?;
        }
        tx.commit().await?;
        log::debug!("committed {} writes in one transaction", writes);
        Ok(())
    }
}

impl Coordination for PostgresStore {
    fn branch_locks(&self) -> &BranchLocks {
        &self.locks
    }

    fn snapshot_cache(&self) -> &SnapshotCache {
        &self.snapshots
    }
}

impl Store for PostgresStore {}
