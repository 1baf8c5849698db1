use std::collections::BTreeMap;

use chrono::Utc;
use itertools::{EitherOrBoth, Itertools};

use crate::error::{require_non_empty, VcsError, VcsResult, WithWarnings};
use crate::logic::branch_ops::BranchManager;
use crate::model::{
    key_object, row_key, DataBranchTable, DataConflict, DataConflictType, DataMergeSummary,
    DataResolution, Id, QualifiedName, RoutedTable, Row, Session, MAIN_BRANCH,
};
use crate::store::traits::{Store, StoreWrite, WriteBatch};

/// Rows of one relation keyed by their encoded primary key
type KeyedRows = BTreeMap<String, (Vec<serde_json::Value>, Row)>;

/// Copy-on-write data branches behind a single generic routing layer.
///
/// A routed table keeps the `main` rows in `_vcs_base` and one full copy
/// per data branch. Every routed statement resolves its physical relation
/// from the session at call time.
pub struct DataBranching;

impl DataBranching {
    /// Move a table behind the routing layer. Idempotent.
    pub async fn setup_table_routing<S: Store>(
        store: &S,
        table: &QualifiedName,
    ) -> VcsResult<RoutedTable> {
        if let Some(routed) = store.get_routed_table(table).await? {
            return Ok(routed);
        }

        let mut batch = WriteBatch::new();
        let routed = Self::plan_routing(store, table, &mut batch).await?;
        store.commit(batch).await?;

        log::info!("routing enabled for {} (base {})", table, routed.base);
        Ok(routed)
    }

    /// Queue the move of `table` to its base location and its routing record
    async fn plan_routing<S: Store>(
        store: &S,
        table: &QualifiedName,
        batch: &mut WriteBatch,
    ) -> VcsResult<RoutedTable> {
        if !store.relation_exists(table).await? {
            return Err(VcsError::not_found("table", table.to_string()));
        }

        let routed = RoutedTable {
            table: table.clone(),
            base: table.base_location(),
            primary_key: store.primary_key(table).await?,
            created_at: Utc::now(),
        };
        batch
            .push(StoreWrite::MoveRelation {
                from: table.clone(),
                to: routed.base.clone(),
            })
            .push(StoreWrite::InsertRoutedTable(routed.clone()));
        Ok(routed)
    }

    /// Copy each table as seen from `source_branch` into `branch_name`.
    /// Returns how many tables were newly copied; tables the branch already
    /// holds are skipped. Every table is checked before anything moves, and
    /// routing and copies land in one batch.
    pub async fn create_data_branch<S: Store>(
        store: &S,
        branch_name: &str,
        source_branch: &str,
        tables: &[QualifiedName],
    ) -> VcsResult<usize> {
        if branch_name == MAIN_BRANCH {
            return Err(VcsError::Forbidden(format!(
                "'{}' reads the base tables and cannot hold data copies",
                MAIN_BRANCH
            )));
        }
        let _guard = store
            .branch_locks()
            .lock(&[branch_name, source_branch])
            .await;
        BranchManager::get_live_branch(store, branch_name).await?;
        BranchManager::get_live_branch(store, source_branch).await?;

        let mut batch = WriteBatch::new();
        let mut newly_routed = Vec::new();
        let mut copied = 0;
        for table in tables.iter().unique() {
            let (routed, unrouted) = match store.get_routed_table(table).await? {
                Some(routed) => (routed, false),
                None => (Self::plan_routing(store, table, &mut batch).await?, true),
            };
            if unrouted {
                newly_routed.push(table.clone());
            }
            if store.get_data_branch_table(branch_name, table).await?.is_some() {
                log::debug!("{} already branched for '{}'", table, branch_name);
                continue;
            }

            // A table routed in this batch has no branch copies yet
            let source = if unrouted {
                routed.base.clone()
            } else {
                Self::physical_table(store, source_branch, table).await?
            };
            let rows_copied = store
                .count_rows(if unrouted { table } else { &source })
                .await?;
            let destination = table.branch_location(branch_name);
            batch
                .push(StoreWrite::CopyRelation {
                    from: source,
                    to: destination.clone(),
                })
                .push(StoreWrite::InsertDataBranchTable(DataBranchTable {
                    branch_name: branch_name.to_string(),
                    source: table.clone(),
                    branch_table: destination,
                    uses_cow: true,
                    rows_copied,
                    created_at: Utc::now(),
                }));
            copied += 1;
        }

        if !batch.is_empty() {
            store.commit(batch).await?;
        }
        for table in &newly_routed {
            log::info!("routing enabled for {} (base {})", table, table.base_location());
        }
        log::info!(
            "data branch '{}' from '{}': {} table(s) copied",
            branch_name,
            source_branch,
            copied
        );
        Ok(copied)
    }

    /// Set the session's current branch; nothing else changes.
    pub async fn switch_branch<S: Store>(
        store: &S,
        session: &mut Session,
        branch_name: &str,
    ) -> VcsResult<()> {
        let branch = BranchManager::get_live_branch(store, branch_name).await?;
        session.set_branch(&branch.name);
        Ok(())
    }

    /// Physical relation a branch reads and writes for `table`
    pub async fn physical_table<S: Store>(
        store: &S,
        branch_name: &str,
        table: &QualifiedName,
    ) -> VcsResult<QualifiedName> {
        let Some(routed) = store.get_routed_table(table).await? else {
            return Ok(table.clone());
        };
        if branch_name == MAIN_BRANCH {
            return Ok(routed.base);
        }
        match store.get_data_branch_table(branch_name, table).await? {
            Some(record) => Ok(record.branch_table),
            // Branches without a data copy share the base rows
            None => Ok(routed.base),
        }
    }

    pub async fn select_rows<S: Store>(
        store: &S,
        session: &Session,
        table: &QualifiedName,
    ) -> VcsResult<Vec<Row>> {
        let physical = Self::physical_table(store, &session.current_branch, table).await?;
        store.scan_rows(&physical).await
    }

    pub async fn insert_row<S: Store>(
        store: &S,
        session: &Session,
        table: &QualifiedName,
        row: Row,
    ) -> VcsResult<()> {
        let physical = Self::physical_table(store, &session.current_branch, table).await?;
        store.insert_row(&physical, row).await
    }

    /// Overwrite the row with the same primary key; false if there is none
    pub async fn update_row<S: Store>(
        store: &S,
        session: &Session,
        table: &QualifiedName,
        row: Row,
    ) -> VcsResult<bool> {
        let physical = Self::physical_table(store, &session.current_branch, table).await?;
        let Some(primary_key) = store.primary_key(&physical).await? else {
            return Err(VcsError::Unsupported(format!(
                "{} has no primary key to update by",
                table
            )));
        };

        let key = row_key(&row, &primary_key)?;
        let mut exists = false;
        for existing in store.scan_rows(&physical).await? {
            if row_key(&existing, &primary_key)? == key {
                exists = true;
                break;
            }
        }
        if !exists {
            return Ok(false);
        }

        store.upsert_row(&physical, row).await?;
        Ok(true)
    }

    pub async fn delete_row<S: Store>(
        store: &S,
        session: &Session,
        table: &QualifiedName,
        key: &Row,
    ) -> VcsResult<bool> {
        if key.is_empty() {
            return Err(VcsError::NullOrEmptyParameter("key".to_string()));
        }
        let physical = Self::physical_table(store, &session.current_branch, table).await?;
        store.delete_row(&physical, key).await
    }

    /// Full outer join of the two branches' copies on the primary key,
    /// recording one conflict per key whose rows differ. A table can be
    /// checked once per merge id; a repeat is AlreadyExists.
    pub async fn detect_data_conflicts<S: Store>(
        store: &S,
        merge_id: &str,
        table: &QualifiedName,
        source_branch: &str,
        target_branch: &str,
    ) -> VcsResult<WithWarnings<usize>> {
        require_non_empty("merge id", merge_id)?;
        let _guard = store
            .branch_locks()
            .lock(&[source_branch, target_branch])
            .await;
        BranchManager::get_live_branch(store, source_branch).await?;
        BranchManager::get_live_branch(store, target_branch).await?;

        let merge_id_owned = merge_id.to_string();
        if store
            .list_data_conflicts(&merge_id_owned)
            .await?
            .iter()
            .any(|c| &c.table_name == table)
        {
            return Err(VcsError::already_exists(
                "data conflicts",
                format!("{} for {}", table, merge_id),
            ));
        }

        let routed = store
            .get_routed_table(table)
            .await?
            .ok_or_else(|| VcsError::not_found("routed table", table.to_string()))?;
        let Some(primary_key) = routed.primary_key else {
            let warning = VcsError::Unsupported(format!(
                "{} has no primary key; row conflicts were not checked",
                table
            ));
            log::warn!("{}", warning);
            return Ok(WithWarnings::with_warnings(0, vec![warning.to_string()]));
        };

        let source = Self::physical_table(store, source_branch, table).await?;
        let target = Self::physical_table(store, target_branch, table).await?;
        let source_rows = Self::rows_by_key(store.scan_rows(&source).await?, &primary_key)?;
        let target_rows = Self::rows_by_key(store.scan_rows(&target).await?, &primary_key)?;

        let mut conflicts = Vec::new();
        let joined = source_rows
            .into_iter()
            .merge_join_by(target_rows, |(a, _), (b, _)| a.cmp(b));
        for pair in joined {
            let (key, source_data, target_data, conflict_type) = match pair {
                EitherOrBoth::Both((_, (key, s)), (_, (_, t))) => {
                    if s == t {
                        continue;
                    }
                    (key, Some(s), Some(t), DataConflictType::UpdateUpdate)
                }
                EitherOrBoth::Left((_, (key, s))) => {
                    (key, Some(s), None, DataConflictType::UpdateDelete)
                }
                EitherOrBoth::Right((_, (key, t))) => {
                    (key, None, Some(t), DataConflictType::DeleteUpdate)
                }
            };
            conflicts.push(DataConflict::new(
                merge_id,
                table.clone(),
                source_branch,
                target_branch,
                key_object(&primary_key, &key),
                source_data,
                target_data,
                conflict_type,
            ));
        }

        let count = conflicts.len();
        store
            .commit(WriteBatch::from(
                conflicts
                    .into_iter()
                    .map(StoreWrite::InsertDataConflict)
                    .collect::<Vec<_>>(),
            ))
            .await?;

        log::info!(
            "{} row conflict(s) in {} between '{}' and '{}'",
            count,
            table,
            source_branch,
            target_branch
        );
        Ok(WithWarnings::new(count))
    }

    pub async fn list_data_conflicts<S: Store>(
        store: &S,
        merge_id: &Id,
    ) -> VcsResult<Vec<DataConflict>> {
        require_non_empty("merge id", merge_id)?;
        store.list_data_conflicts(merge_id).await
    }

    /// Move one pending row conflict to a resolution
    pub async fn resolve_data_conflict<S: Store>(
        store: &S,
        conflict_id: &Id,
        resolution: DataResolution,
    ) -> VcsResult<DataConflict> {
        require_non_empty("conflict id", conflict_id)?;
        if resolution == DataResolution::Pending {
            return Err(VcsError::invalid(
                "resolution",
                "must be one of source, target, manual",
            ));
        }

        let mut conflict = store
            .get_data_conflict(conflict_id)
            .await?
            .ok_or_else(|| VcsError::not_found("data conflict", conflict_id.as_str()))?;
        if conflict.resolution != DataResolution::Pending {
            return Err(VcsError::Forbidden(format!(
                "data conflict '{}' is already resolved as {}",
                conflict_id,
                conflict.resolution.as_str()
            )));
        }

        conflict.resolution = resolution;
        conflict.resolved_at = Some(Utc::now());
        store.update_data_conflict(conflict.clone()).await?;
        Ok(conflict)
    }

    /// Apply the row conflicts of a data merge to the target's copies.
    ///
    /// Pending conflicts take `strategy`. Then `source` rows overwrite the
    /// target (a source-side delete removes the target row), `target` only
    /// fills rows the target still lacks, and `manual` rows are left alone.
    /// Row writes and conflict updates land in one batch and every applied
    /// conflict is stamped, so applying the same merge again changes nothing.
    pub async fn apply_data_merge<S: Store>(
        store: &S,
        merge_id: &Id,
        source_branch: &str,
        target_branch: &str,
        strategy: DataResolution,
    ) -> VcsResult<DataMergeSummary> {
        require_non_empty("merge id", merge_id)?;
        if strategy == DataResolution::Pending {
            return Err(VcsError::invalid(
                "strategy",
                "must be one of source, target, manual",
            ));
        }

        let _guard = store
            .branch_locks()
            .lock(&[source_branch, target_branch])
            .await;
        BranchManager::get_live_branch(store, source_branch).await?;
        BranchManager::get_live_branch(store, target_branch).await?;

        let conflicts = store.list_data_conflicts(merge_id).await?;
        if let Some(stray) = conflicts
            .iter()
            .find(|c| c.source_branch != source_branch || c.target_branch != target_branch)
        {
            return Err(VcsError::invalid(
                "merge id",
                format!(
                    "conflict '{}' belongs to '{}' -> '{}'",
                    stray.id, stray.source_branch, stray.target_branch
                ),
            ));
        }

        let now = Utc::now();
        let mut summary = DataMergeSummary::default();
        let mut batch = WriteBatch::new();
        let by_table = conflicts
            .into_iter()
            .filter(|c| !c.is_applied())
            .into_group_map_by(|c| c.table_name.clone());
        for (table, table_conflicts) in by_table {
            let primary_key = store
                .get_routed_table(&table)
                .await?
                .and_then(|routed| routed.primary_key)
                .ok_or_else(|| {
                    VcsError::Unsupported(format!("{} has no primary key to merge rows by", table))
                })?;
            let target = Self::physical_table(store, target_branch, &table).await?;
            let present = Self::rows_by_key(store.scan_rows(&target).await?, &primary_key)?;
            summary.tables += 1;

            for mut conflict in table_conflicts {
                if conflict.resolution == DataResolution::Pending {
                    conflict.resolution = strategy;
                    conflict.resolved_at = Some(now);
                }
                let key = conflict
                    .primary_key_value
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                let in_target =
                    present.contains_key(&serde_json::to_string(&row_key(&key, &primary_key)?)?);

                match (conflict.resolution, conflict.source_data.clone()) {
                    (DataResolution::Source, Some(source_row)) => {
                        batch.push(StoreWrite::UpsertRow {
                            table: target.clone(),
                            row: source_row,
                        });
                        summary.rows_upserted += 1;
                    }
                    (DataResolution::Source, None) if in_target => {
                        batch.push(StoreWrite::DeleteRow {
                            table: target.clone(),
                            key,
                        });
                        summary.rows_deleted += 1;
                    }
                    (DataResolution::Target, Some(source_row))
                        if conflict.target_data.is_none() && !in_target =>
                    {
                        batch.push(StoreWrite::InsertRowIfAbsent {
                            table: target.clone(),
                            row: source_row,
                        });
                        summary.rows_inserted += 1;
                    }
                    _ => summary.rows_skipped += 1,
                }

                conflict.applied_at = Some(now);
                batch.push(StoreWrite::MarkDataConflictApplied(conflict));
            }
        }

        if batch.is_empty() {
            log::info!("data merge {} has nothing left to apply", merge_id);
            return Ok(summary);
        }
        store.commit(batch).await?;

        log::info!(
            "data merge {} of '{}' into '{}' applied with {}: {:?}",
            merge_id,
            source_branch,
            target_branch,
            strategy.as_str(),
            summary
        );
        Ok(summary)
    }

    fn rows_by_key(rows: Vec<Row>, primary_key: &[String]) -> VcsResult<KeyedRows> {
        let mut keyed = BTreeMap::new();
        for row in rows {
            let key = row_key(&row, primary_key)?;
            keyed.insert(serde_json::to_string(&key)?, (key, row));
        }
        Ok(keyed)
    }
}
