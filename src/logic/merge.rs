use std::collections::{BTreeSet, HashSet};

use chrono::Utc;

use crate::error::{require_non_empty, VcsError, VcsResult};
use crate::logic::branch_ops::BranchManager;
use crate::logic::objects::ObjectDatabase;
use crate::model::{
    generate_id, Branch, BranchStatus, ConflictType, Id, MergeOutcome, MergeRecord, MergeStatus,
    ObjectIdentity, ResolutionStrategy, ResolveOutcome, SchemaConflict, Tree,
};
use crate::store::traits::{Store, StoreWrite, WriteBatch};

/// Outcome of comparing one object across base, source and target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreeWay {
    /// Merged value; None means the object is absent after the merge
    Take(Option<String>),
    Conflict,
}

/// Three-way merge of branch trees with persisted conflicts
pub struct MergeEngine;

impl MergeEngine {
    /// Apply the three-way rule to one object's hashes (None = absent).
    pub fn three_way(base: Option<&str>, source: Option<&str>, target: Option<&str>) -> ThreeWay {
        if source != target && source != base && target != base {
            return ThreeWay::Conflict;
        }
        // Either both sides agree, or one side kept the base value
        let merged = if target == base { source } else { target };
        ThreeWay::Take(merged.map(str::to_string))
    }

    /// Lowest common ancestor of two commits, None when the histories are
    /// unrelated or either side has no commit.
    pub async fn find_merge_base<S: Store>(
        store: &S,
        source_commit: Option<&str>,
        target_commit: Option<&str>,
    ) -> VcsResult<Option<String>> {
        let (Some(source), Some(target)) = (source_commit, target_commit) else {
            return Ok(None);
        };

        let target_ancestors: HashSet<String> = ObjectDatabase::ancestors(store, target)
            .await?
            .into_iter()
            .collect();

        // Breadth-first order means the first shared commit has no shared
        // descendant closer to the source.
        Ok(ObjectDatabase::ancestors(store, source)
            .await?
            .into_iter()
            .find(|sha| target_ancestors.contains(sha)))
    }

    /// Merge `source` into `target`. Every outcome is persisted as one
    /// batch, so a failed merge leaves no record behind.
    pub async fn merge_branches<S: Store>(
        store: &S,
        source_name: &str,
        target_name: &str,
        message: Option<String>,
        author: &str,
    ) -> VcsResult<MergeOutcome> {
        require_non_empty("source branch", source_name)?;
        require_non_empty("target branch", target_name)?;
        if source_name == target_name {
            return Err(VcsError::Forbidden(format!(
                "cannot merge branch '{}' into itself",
                source_name
            )));
        }

        let _guard = store
            .branch_locks()
            .lock(&[source_name, target_name])
            .await;

        let mut source = BranchManager::get_live_branch(store, source_name).await?;
        let mut target = BranchManager::get_live_branch(store, target_name).await?;
        Self::check_mergeable(&source, &target)?;

        let source_head = source.effective_head().map(str::to_string);
        let target_head = target.effective_head().map(str::to_string);
        let base = Self::find_merge_base(store, source_head.as_deref(), target_head.as_deref()).await?;

        let mut record = MergeRecord::new(
            source_name,
            target_name,
            base.clone(),
            source_head.clone(),
            target_head.clone(),
            message.clone(),
            author,
        );
        let mut batch = WriteBatch::new();

        let already_contained = match (&source_head, &target_head) {
            (None, _) => true,
            (Some(s), Some(t)) => ObjectDatabase::is_ancestor(store, s, t).await?,
            (Some(_), None) => false,
        };

        if already_contained {
            record.complete(MergeStatus::MergeSuccess, target_head.clone());
            batch.push(StoreWrite::InsertMerge(record.clone()));
            Self::mark_source_merged(&mut batch, &mut source, author);
            store.commit(batch).await?;
            log::info!("'{}' is already contained in '{}'", source_name, target_name);
            return Ok(MergeOutcome::MergeSuccess {
                merge_id: record.id,
                result_commit_sha: target_head,
                fast_forward: false,
            });
        }

        if base == target_head {
            let Some(new_head) = source_head else {
                return Err(VcsError::Storage("fast-forward without a source commit".into()));
            };
            Self::move_head(&mut batch, &mut target, &new_head);
            record.complete(MergeStatus::MergeSuccess, Some(new_head.clone()));
            batch.push(StoreWrite::InsertMerge(record.clone()));
            Self::mark_source_merged(&mut batch, &mut source, author);
            store.commit(batch).await?;
            store.snapshot_cache().invalidate_branch(target_name).await;
            log::info!(
                "fast-forwarded '{}' to '{}' at {}",
                target_name,
                source_name,
                new_head
            );
            return Ok(MergeOutcome::MergeSuccess {
                merge_id: record.id,
                result_commit_sha: Some(new_head),
                fast_forward: true,
            });
        }

        let base_tree = ObjectDatabase::tree_at(store, base.as_deref()).await?;
        let source_tree = ObjectDatabase::tree_at(store, source_head.as_deref()).await?;
        let target_tree = ObjectDatabase::tree_at(store, target_head.as_deref()).await?;

        let mut merged = Tree::new();
        let mut conflicts = Vec::new();
        for path in Self::all_paths(&[&base_tree, &source_tree, &target_tree]) {
            let b = base_tree.entries.get(&path).map(String::as_str);
            let s = source_tree.entries.get(&path).map(String::as_str);
            let t = target_tree.entries.get(&path).map(String::as_str);

            match Self::three_way(b, s, t) {
                ThreeWay::Take(Some(sha)) => {
                    merged.entries.insert(path, sha);
                }
                ThreeWay::Take(None) => {}
                ThreeWay::Conflict => {
                    log::debug!("conflict on {} merging '{}' into '{}'", path, source_name, target_name);
                    conflicts.push(SchemaConflict {
                        id: generate_id(),
                        merge_id: record.id.clone(),
                        branch_a: source_name.to_string(),
                        branch_b: target_name.to_string(),
                        base_ref: base.clone(),
                        conflict_object: ObjectIdentity::from_path(&path)?,
                        conflict_type: ConflictType::classify(b, s, t),
                        base_hash: b.map(str::to_string),
                        source_hash: s.map(str::to_string),
                        target_hash: t.map(str::to_string),
                        resolution: None,
                        resolved_hash: None,
                        resolved_by: None,
                        resolved_at: None,
                        created_at: Utc::now(),
                    });
                }
            }
        }

        if !conflicts.is_empty() {
            let count = conflicts.len();
            // The merge row goes first; conflicts reference it
            batch.push(StoreWrite::InsertMerge(record.clone()));
            for conflict in conflicts {
                batch.push(StoreWrite::InsertConflict(conflict));
            }
            source.status = BranchStatus::Conflicted;
            batch.push(StoreWrite::UpdateBranch(source));
            store.commit(batch).await?;
            log::info!(
                "merge of '{}' into '{}' stopped on {} conflict(s)",
                source_name,
                target_name,
                count
            );
            return Ok(MergeOutcome::ConflictsDetected {
                merge_id: record.id,
                conflicts: count,
            });
        }

        let message = message.unwrap_or_else(|| Self::default_message(source_name, target_name));
        let commit_sha =
            Self::write_merge_commit(store, &target, &merged, source_head.as_deref(), author, &message)
                .await?;
        Self::move_head(&mut batch, &mut target, &commit_sha);
        record.complete(MergeStatus::MergeSuccess, Some(commit_sha.clone()));
        batch.push(StoreWrite::InsertMerge(record.clone()));
        Self::mark_source_merged(&mut batch, &mut source, author);
        store.commit(batch).await?;
        store.snapshot_cache().invalidate_branch(target_name).await;

        log::info!(
            "merged '{}' into '{}' as {}",
            source_name,
            target_name,
            commit_sha
        );
        Ok(MergeOutcome::MergeSuccess {
            merge_id: record.id,
            result_commit_sha: Some(commit_sha),
            fast_forward: false,
        })
    }

    /// Record a resolution for one conflict; with `apply` the merge is
    /// materialized as soon as no conflict of it is pending. Resolution and
    /// merge commit land together: if the merge cannot be applied the
    /// conflict stays pending.
    pub async fn resolve_conflict<S: Store>(
        store: &S,
        merge_id: &Id,
        conflict_id: &Id,
        strategy: ResolutionStrategy,
        resolved_by: &str,
        apply: bool,
    ) -> VcsResult<ResolveOutcome> {
        require_non_empty("merge id", merge_id)?;
        require_non_empty("conflict id", conflict_id)?;

        store
            .get_merge(merge_id)
            .await?
            .ok_or_else(|| VcsError::not_found("merge", merge_id.as_str()))?;
        let mut conflict = match store.get_conflict(conflict_id).await? {
            Some(conflict) if &conflict.merge_id == merge_id => conflict,
            _ => return Err(VcsError::not_found("conflict", conflict_id.as_str())),
        };
        if conflict.is_resolved() {
            return Err(VcsError::Forbidden(format!(
                "conflict '{}' is already resolved",
                conflict_id
            )));
        }

        let resolved_hash = match &strategy {
            ResolutionStrategy::TakeSource => conflict.source_hash.clone(),
            ResolutionStrategy::TakeTarget => conflict.target_hash.clone(),
            ResolutionStrategy::TakeBase => conflict.base_hash.clone(),
            ResolutionStrategy::Manual { definition } => {
                require_non_empty("definition", definition)?;
                Some(ObjectDatabase::write_blob(store, definition).await?)
            }
        };

        log::debug!(
            "resolving conflict {} on {} with {}",
            conflict_id,
            conflict.conflict_object,
            strategy.name()
        );
        conflict.resolution = Some(strategy);
        conflict.resolved_hash = resolved_hash;
        conflict.resolved_by = Some(resolved_by.to_string());
        conflict.resolved_at = Some(Utc::now());

        let remaining_conflicts = store
            .list_conflicts(merge_id)
            .await?
            .iter()
            .filter(|c| c.id != conflict.id && !c.is_resolved())
            .count();

        let applied_commit_sha = if apply && remaining_conflicts == 0 {
            match Self::apply_merge(store, merge_id, Some(conflict), resolved_by).await? {
                MergeOutcome::MergeSuccess {
                    result_commit_sha, ..
                } => result_commit_sha,
                MergeOutcome::ConflictsDetected { .. } => None,
            }
        } else {
            store.update_conflict(conflict).await?;
            None
        };

        Ok(ResolveOutcome {
            resolved: true,
            remaining_conflicts,
            applied_commit_sha,
        })
    }

    /// Materialize a merge whose conflicts are all resolved.
    pub async fn apply_resolved_merge<S: Store>(
        store: &S,
        merge_id: &Id,
        author: &str,
    ) -> VcsResult<MergeOutcome> {
        require_non_empty("merge id", merge_id)?;
        Self::apply_merge(store, merge_id, None, author).await
    }

    /// Validate and commit a resolved merge; `resolution` is a conflict
    /// resolution not yet persisted, written in the same batch.
    async fn apply_merge<S: Store>(
        store: &S,
        merge_id: &Id,
        resolution: Option<SchemaConflict>,
        author: &str,
    ) -> VcsResult<MergeOutcome> {
        let branches = store
            .get_merge(merge_id)
            .await?
            .map(|r| (r.source_branch, r.target_branch))
            .ok_or_else(|| VcsError::not_found("merge", merge_id.as_str()))?;
        let _guard = store
            .branch_locks()
            .lock(&[branches.0.as_str(), branches.1.as_str()])
            .await;

        // Re-read under the lock; a concurrent apply may have finished
        let mut record = store
            .get_merge(merge_id)
            .await?
            .ok_or_else(|| VcsError::not_found("merge", merge_id.as_str()))?;
        if record.status != MergeStatus::ConflictsDetected {
            return Err(VcsError::Forbidden(format!(
                "merge '{}' is already {}",
                merge_id,
                record.status.as_str()
            )));
        }

        let mut conflicts = store.list_conflicts(merge_id).await?;
        if let Some(resolved) = &resolution {
            match conflicts.iter_mut().find(|c| c.id == resolved.id) {
                Some(existing) if !existing.is_resolved() => *existing = resolved.clone(),
                _ => {
                    return Err(VcsError::Forbidden(format!(
                        "conflict '{}' is missing or already resolved",
                        resolved.id
                    )))
                }
            }
        }
        let pending = conflicts.iter().filter(|c| !c.is_resolved()).count();
        if pending > 0 {
            return Err(VcsError::Forbidden(format!(
                "merge '{}' still has {} unresolved conflict(s)",
                merge_id, pending
            )));
        }

        let mut source = BranchManager::get_live_branch(store, &record.source_branch).await?;
        let mut target = BranchManager::get_live_branch(store, &record.target_branch).await?;
        Self::check_mergeable(&source, &target)?;
        if source.effective_head() != record.source_commit_sha.as_deref()
            || target.effective_head() != record.target_commit_sha.as_deref()
        {
            return Err(VcsError::Forbidden(format!(
                "branches of merge '{}' moved since conflicts were detected; merge again",
                merge_id
            )));
        }

        let base_tree = ObjectDatabase::tree_at(store, record.base_commit_sha.as_deref()).await?;
        let source_tree = ObjectDatabase::tree_at(store, record.source_commit_sha.as_deref()).await?;
        let target_tree = ObjectDatabase::tree_at(store, record.target_commit_sha.as_deref()).await?;

        let mut merged = Tree::new();
        for path in Self::all_paths(&[&base_tree, &source_tree, &target_tree]) {
            let resolved = match conflicts.iter().find(|c| c.conflict_object.path() == path) {
                Some(conflict) => conflict.resolved_hash.clone(),
                None => match Self::three_way(
                    base_tree.entries.get(&path).map(String::as_str),
                    source_tree.entries.get(&path).map(String::as_str),
                    target_tree.entries.get(&path).map(String::as_str),
                ) {
                    ThreeWay::Take(sha) => sha,
                    // Detected conflicts cover every conflicting path
                    ThreeWay::Conflict => {
                        return Err(VcsError::Storage(format!(
                            "merge '{}' has no conflict record for {}",
                            merge_id, path
                        )))
                    }
                },
            };
            if let Some(sha) = resolved {
                merged.entries.insert(path, sha);
            }
        }

        let message = record
            .message
            .clone()
            .unwrap_or_else(|| Self::default_message(&record.source_branch, &record.target_branch));
        let commit_sha = Self::write_merge_commit(
            store,
            &target,
            &merged,
            record.source_commit_sha.as_deref(),
            author,
            &message,
        )
        .await?;

        let mut batch = WriteBatch::new();
        if let Some(resolved) = resolution {
            batch.push(StoreWrite::UpdateConflict(resolved));
        }
        Self::move_head(&mut batch, &mut target, &commit_sha);
        record.complete(MergeStatus::Resolved, Some(commit_sha.clone()));
        batch.push(StoreWrite::UpdateMerge(record.clone()));
        Self::mark_source_merged(&mut batch, &mut source, author);
        store.commit(batch).await?;
        store.snapshot_cache().invalidate_branch(&target.name).await;

        log::info!(
            "applied resolved merge {} of '{}' into '{}' as {}",
            merge_id,
            record.source_branch,
            record.target_branch,
            commit_sha
        );
        Ok(MergeOutcome::MergeSuccess {
            merge_id: record.id,
            result_commit_sha: Some(commit_sha),
            fast_forward: false,
        })
    }

    pub async fn list_conflicts<S: Store>(
        store: &S,
        merge_id: &Id,
    ) -> VcsResult<Vec<SchemaConflict>> {
        store
            .get_merge(merge_id)
            .await?
            .ok_or_else(|| VcsError::not_found("merge", merge_id.as_str()))?;
        store.list_conflicts(merge_id).await
    }

    fn check_mergeable(source: &Branch, target: &Branch) -> VcsResult<()> {
        if target.status != BranchStatus::Active {
            return Err(VcsError::Forbidden(format!(
                "target branch '{}' is {}",
                target.name,
                target.status.as_str()
            )));
        }
        if !source.can_be_merged() {
            return Err(VcsError::Forbidden(format!(
                "source branch '{}' is {}",
                source.name,
                source.status.as_str()
            )));
        }
        Ok(())
    }

    fn all_paths(trees: &[&Tree]) -> BTreeSet<String> {
        trees
            .iter()
            .flat_map(|tree| tree.entries.keys().cloned())
            .collect()
    }

    fn default_message(source: &str, target: &str) -> String {
        format!("Merge branch '{}' into '{}'", source, target)
    }

    /// Write the merged tree as a commit on top of the target head. Only
    /// content-addressed objects are written here.
    async fn write_merge_commit<S: Store>(
        store: &S,
        target: &Branch,
        merged: &Tree,
        source_head: Option<&str>,
        author: &str,
        message: &str,
    ) -> VcsResult<String> {
        let tree_sha = ObjectDatabase::write_tree(store, merged).await?;
        let parents: Vec<String> = target
            .effective_head()
            .into_iter()
            .chain(source_head)
            .map(str::to_string)
            .collect();
        let commit = ObjectDatabase::write_commit(store, &tree_sha, parents, author, message).await?;
        Ok(commit.sha)
    }

    fn move_head(batch: &mut WriteBatch, branch: &mut Branch, commit_sha: &str) {
        branch.head_commit_sha = Some(commit_sha.to_string());
        batch
            .push(StoreWrite::UpdateBranch(branch.clone()))
            .push(StoreWrite::SetBranchRef {
                name: branch.name.clone(),
                commit_sha: commit_sha.to_string(),
            });
    }

    fn mark_source_merged(batch: &mut WriteBatch, source: &mut Branch, merged_by: &str) {
        if source.is_main() {
            return;
        }
        source.mark_as_merged(merged_by);
        batch.push(StoreWrite::UpdateBranch(source.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewBranch, DEFAULT_MAX_BRANCH_NAME_LENGTH};
    use crate::store::traits::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_three_way_rule() {
        use ThreeWay::*;
        let h = |s: &'static str| Some(s);

        assert_eq!(MergeEngine::three_way(h("h1"), h("h1"), h("h2")), Take(Some("h2".into())));
        assert_eq!(MergeEngine::three_way(h("h1"), h("h2"), h("h1")), Take(Some("h2".into())));
        assert_eq!(MergeEngine::three_way(h("h1"), h("h2"), h("h2")), Take(Some("h2".into())));
        assert_eq!(MergeEngine::three_way(h("h1"), h("h2"), h("h3")), Conflict);

        // Absence participates like any other value
        assert_eq!(MergeEngine::three_way(h("h1"), None, h("h1")), Take(None));
        assert_eq!(MergeEngine::three_way(None, h("h1"), None), Take(Some("h1".into())));
        assert_eq!(MergeEngine::three_way(None, h("h1"), h("h2")), Conflict);
        assert_eq!(MergeEngine::three_way(h("h1"), None, h("h2")), Conflict);
    }

    async fn setup() -> MemoryStore {
        let store = MemoryStore::new();
        BranchManager::bootstrap(&store, "system").await.unwrap();
        store
    }

    async fn track(store: &MemoryStore, branch: &str, name: &str, definition: &str) {
        BranchManager::track_object(store, branch, ObjectIdentity::table("public", name), definition, "alice")
            .await
            .unwrap();
    }

    async fn branch(store: &MemoryStore, name: &str) {
        BranchManager::create_branch(store, NewBranch::new(name), "alice", DEFAULT_MAX_BRANCH_NAME_LENGTH)
            .await
            .unwrap();
    }

    async fn definition(store: &MemoryStore, branch: &str, name: &str) -> Option<String> {
        let (_, tree) = BranchManager::branch_tree(store, branch).await.unwrap();
        match tree.get(&ObjectIdentity::table("public", name)) {
            Some(sha) => Some(ObjectDatabase::read_blob(store, sha).await.unwrap()),
            None => None,
        }
    }

    #[tokio::test]
    async fn test_merge_base_of_diverged_branches() {
        let store = setup().await;
        track(&store, "main", "t", "v1").await;
        let fork = store.get_branch("main").await.unwrap().unwrap().head_commit_sha;
        branch(&store, "feature").await;
        track(&store, "main", "t", "v2").await;
        track(&store, "feature", "u", "u1").await;

        let main = store.get_branch("main").await.unwrap().unwrap();
        let feature = store.get_branch("feature").await.unwrap().unwrap();
        let base = MergeEngine::find_merge_base(&store, feature.effective_head(), main.effective_head())
            .await
            .unwrap();
        assert_eq!(base, fork);
    }

    #[tokio::test]
    async fn test_true_merge_keeps_both_sides() {
        let store = setup().await;
        track(&store, "main", "t", "v1").await;
        branch(&store, "feature").await;
        track(&store, "main", "a", "main-only").await;
        track(&store, "feature", "b", "feature-only").await;

        let outcome = MergeEngine::merge_branches(&store, "feature", "main", None, "alice")
            .await
            .unwrap();
        assert!(outcome.is_success());

        assert_eq!(definition(&store, "main", "a").await.as_deref(), Some("main-only"));
        assert_eq!(definition(&store, "main", "b").await.as_deref(), Some("feature-only"));

        let main = store.get_branch("main").await.unwrap().unwrap();
        let head = ObjectDatabase::read_commit(&store, main.head_commit_sha.as_deref().unwrap())
            .await
            .unwrap();
        assert!(head.is_merge());

        let feature = store.get_branch("feature").await.unwrap().unwrap();
        assert_eq!(feature.status, BranchStatus::Merged);
    }

    #[tokio::test]
    async fn test_merge_gating() {
        let store = setup().await;
        branch(&store, "feature").await;

        let err = MergeEngine::merge_branches(&store, "main", "main", None, "alice").await.unwrap_err();
        assert!(matches!(err, VcsError::Forbidden(_)));

        track(&store, "feature", "t", "v1").await;
        MergeEngine::merge_branches(&store, "feature", "main", None, "alice").await.unwrap();

        // A merged branch cannot be merged again
        let err = MergeEngine::merge_branches(&store, "feature", "main", None, "alice").await.unwrap_err();
        assert!(matches!(err, VcsError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_resolution_with_apply() {
        let store = setup().await;
        track(&store, "main", "t", "v1").await;
        branch(&store, "feature").await;
        track(&store, "main", "t", "v2").await;
        track(&store, "feature", "t", "v3").await;

        let outcome = MergeEngine::merge_branches(&store, "feature", "main", None, "alice")
            .await
            .unwrap();
        let merge_id = outcome.merge_id().to_string();
        let conflicts = MergeEngine::list_conflicts(&store, &merge_id).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::ModifyModify);

        let feature = store.get_branch("feature").await.unwrap().unwrap();
        assert_eq!(feature.status, BranchStatus::Conflicted);

        let outcome = MergeEngine::resolve_conflict(
            &store,
            &merge_id,
            &conflicts[0].id,
            ResolutionStrategy::Manual {
                definition: "v4".into(),
            },
            "bob",
            true,
        )
        .await
        .unwrap();
        assert_eq!(outcome.remaining_conflicts, 0);
        assert!(outcome.applied_commit_sha.is_some());
        assert_eq!(definition(&store, "main", "t").await.as_deref(), Some("v4"));

        let record = store.get_merge(&merge_id).await.unwrap().unwrap();
        assert_eq!(record.status, MergeStatus::Resolved);

        let err = MergeEngine::resolve_conflict(
            &store,
            &merge_id,
            &conflicts[0].id,
            ResolutionStrategy::TakeSource,
            "bob",
            false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VcsError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_stale_resolution_is_rejected() {
        let store = setup().await;
        track(&store, "main", "t", "v1").await;
        branch(&store, "feature").await;
        track(&store, "main", "t", "v2").await;
        track(&store, "feature", "t", "v3").await;

        let outcome = MergeEngine::merge_branches(&store, "feature", "main", None, "alice")
            .await
            .unwrap();
        let merge_id = outcome.merge_id().to_string();
        let conflict = &MergeEngine::list_conflicts(&store, &merge_id).await.unwrap()[0];
        MergeEngine::resolve_conflict(&store, &merge_id, &conflict.id, ResolutionStrategy::TakeTarget, "bob", false)
            .await
            .unwrap();

        track(&store, "main", "other", "x").await;
        let err = MergeEngine::apply_resolved_merge(&store, &merge_id, "bob").await.unwrap_err();
        assert!(matches!(err, VcsError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_stale_resolve_and_apply_keeps_conflict_pending() {
        let store = setup().await;
        track(&store, "main", "t", "v1").await;
        branch(&store, "feature").await;
        track(&store, "main", "t", "v2").await;
        track(&store, "feature", "t", "v3").await;

        let outcome = MergeEngine::merge_branches(&store, "feature", "main", None, "alice")
            .await
            .unwrap();
        let merge_id = outcome.merge_id().to_string();
        let conflict_id = MergeEngine::list_conflicts(&store, &merge_id).await.unwrap()[0].id.clone();

        track(&store, "main", "other", "x").await;
        let err = MergeEngine::resolve_conflict(
            &store,
            &merge_id,
            &conflict_id,
            ResolutionStrategy::TakeSource,
            "bob",
            true,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, VcsError::Forbidden(_)));

        let conflict = store.get_conflict(&conflict_id).await.unwrap().unwrap();
        assert!(conflict.resolution.is_none());
        assert!(!conflict.is_resolved());
        let record = store.get_merge(&merge_id).await.unwrap().unwrap();
        assert_eq!(record.status, MergeStatus::ConflictsDetected);

        // Still resolvable without applying
        let outcome = MergeEngine::resolve_conflict(
            &store,
            &merge_id,
            &conflict_id,
            ResolutionStrategy::TakeSource,
            "bob",
            false,
        )
        .await
        .unwrap();
        assert_eq!(outcome.remaining_conflicts, 0);
        assert!(outcome.applied_commit_sha.is_none());
    }

    #[tokio::test]
    async fn test_conflicted_merge_records_land_together() {
        let store = setup().await;
        track(&store, "main", "t", "v1").await;
        branch(&store, "feature").await;
        track(&store, "main", "t", "v2").await;
        track(&store, "feature", "t", "v3").await;
        track(&store, "main", "u", "u1").await;
        track(&store, "feature", "u", "u2").await;

        let outcome = MergeEngine::merge_branches(&store, "feature", "main", None, "alice")
            .await
            .unwrap();
        let merge_id = outcome.merge_id().to_string();
        let record = store.get_merge(&merge_id).await.unwrap().unwrap();
        assert_eq!(record.status, MergeStatus::ConflictsDetected);
        assert_eq!(store.list_conflicts(&merge_id).await.unwrap().len(), 2);
        let feature = store.get_branch("feature").await.unwrap().unwrap();
        assert_eq!(feature.status, BranchStatus::Conflicted);
    }
}
