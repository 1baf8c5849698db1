use itertools::Itertools;
use std::cmp::Ordering;

use crate::error::{require_non_empty, VcsError, VcsResult, WithWarnings};
use crate::logic::objects::ObjectDatabase;
use crate::model::{
    validate_branch_name, Branch, BranchInfo, BranchMetrics, BranchOrderField, BranchStatus,
    CheckoutResult, Commit, DeleteBranchResult, HistoryAction, ListBranchesOptions, NewBranch,
    ObjectChange, ObjectHistoryEntry, ObjectIdentity, Ref, RefKind, Session, TrackingErrorRecord,
    Tree, MAIN_BRANCH,
};
use crate::store::traits::{Store, StoreWrite, WriteBatch};

/// Branch lifecycle, schema tracking and refs
pub struct BranchManager;

/// One object whose blob changed in a tracked change set
struct TrackedChange {
    identity: ObjectIdentity,
    action: HistoryAction,
    old_hash: Option<String>,
    new_hash: Option<String>,
}

impl BranchManager {
    /// Create the root branch if it does not exist yet
    pub async fn bootstrap<S: Store>(store: &S, created_by: &str) -> VcsResult<Branch> {
        if let Some(main) = store.get_branch(MAIN_BRANCH).await? {
            return Ok(main);
        }

        let main = Branch::new_main_branch(created_by);
        match store.insert_branch(main.clone()).await {
            Ok(()) => {
                log::info!("created root branch '{}'", MAIN_BRANCH);
                Ok(main)
            }
            // Lost a race against another bootstrap
            Err(VcsError::AlreadyExists { .. }) => Self::get_branch(store, MAIN_BRANCH).await,
            Err(e) => Err(e),
        }
    }

    /// Get a branch by name, deleted branches included
    pub async fn get_branch<S: Store>(store: &S, name: &str) -> VcsResult<Branch> {
        require_non_empty("branch name", name)?;
        store
            .get_branch(name)
            .await?
            .ok_or_else(|| VcsError::not_found("branch", name))
    }

    /// Get a branch that has not been deleted
    pub async fn get_live_branch<S: Store>(store: &S, name: &str) -> VcsResult<Branch> {
        let branch = Self::get_branch(store, name).await?;
        if branch.is_deleted() {
            return Err(VcsError::not_found("branch", name));
        }
        Ok(branch)
    }

    pub async fn create_branch<S: Store>(
        store: &S,
        request: NewBranch,
        created_by: &str,
        max_name_length: usize,
    ) -> VcsResult<Branch> {
        validate_branch_name(&request.name, max_name_length)?;
        require_non_empty("parent branch", &request.parent)?;

        let parent = match store.get_branch(&request.parent).await? {
            Some(parent) if parent.status == BranchStatus::Active => parent,
            _ => return Err(VcsError::not_found("active parent branch", request.parent)),
        };

        let branch = Branch::new_from_branch(
            &parent,
            request.name,
            request.branch_type,
            request.description,
            request.metadata,
            created_by,
        );
        store.insert_branch(branch.clone()).await?;

        log::info!(
            "created branch '{}' from '{}' at {}",
            branch.name,
            parent.name,
            branch.fork_commit_sha.as_deref().unwrap_or("<empty>")
        );
        Ok(branch)
    }

    /// Soft delete: flips the status and keeps every history row.
    pub async fn delete_branch<S: Store>(
        store: &S,
        name: &str,
        force: bool,
        deleted_by: &str,
    ) -> VcsResult<DeleteBranchResult> {
        require_non_empty("branch name", name)?;
        if name == MAIN_BRANCH {
            return Err(VcsError::Forbidden(format!(
                "the root branch '{}' cannot be deleted",
                MAIN_BRANCH
            )));
        }

        let _guard = store.branch_locks().lock(&[name]).await;

        let mut branch = Self::get_live_branch(store, name).await?;
        if !force && branch.status != BranchStatus::Merged {
            return Err(VcsError::Forbidden(format!(
                "branch '{}' is {} and must be merged before deletion (use force to override)",
                name,
                branch.status.as_str()
            )));
        }

        let children: Vec<String> = store
            .list_branches()
            .await?
            .into_iter()
            .filter(|b| !b.is_deleted() && b.parent_branch_name.as_deref() == Some(name))
            .map(|b| b.name)
            .collect();
        if !children.is_empty() && !force {
            return Err(VcsError::Dependency(format!(
                "branch '{}' is the parent of {}",
                name,
                children.join(", ")
            )));
        }

        branch.mark_as_deleted(deleted_by);
        let deleted_at = branch.deleted_at.unwrap_or(branch.created_at);
        store.update_branch(branch.clone()).await?;
        store.snapshot_cache().invalidate_branch(name).await;

        log::info!("deleted branch '{}' (force = {})", name, force);
        Ok(DeleteBranchResult {
            success: true,
            message: format!("Branch '{}' deleted", name),
            branch_id: branch.id,
            deleted_at,
        })
    }

    pub async fn list_branches<S: Store>(
        store: &S,
        options: &ListBranchesOptions,
    ) -> VcsResult<Vec<BranchInfo>> {
        let mut branches: Vec<Branch> = store
            .list_branches()
            .await?
            .into_iter()
            .filter(|b| options.include_deleted || !b.is_deleted())
            .filter(|b| options.status.map_or(true, |status| b.status == status))
            .collect();

        branches.sort_by(|a, b| {
            let ordering = match options.order_by.field {
                BranchOrderField::CreatedAt => a.created_at.cmp(&b.created_at),
                BranchOrderField::Name => a.name.cmp(&b.name),
                BranchOrderField::Status => a.status.as_str().cmp(b.status.as_str()),
            };
            let ordering = ordering.then_with(|| a.name.cmp(&b.name));
            if options.order_by.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });

        let mut infos = Vec::with_capacity(branches.len());
        for branch in branches {
            let metrics = Self::branch_metrics(store, &branch).await?;
            infos.push(BranchInfo { branch, metrics });
        }
        Ok(infos)
    }

    async fn branch_metrics<S: Store>(store: &S, branch: &Branch) -> VcsResult<BranchMetrics> {
        let tree = ObjectDatabase::tree_at(store, branch.effective_head()).await?;

        let mut storage_bytes = 0u64;
        for blob_sha in tree.entries.values() {
            storage_bytes += store.get_object(blob_sha).await?.size() as u64;
        }

        let last_modified = match &branch.head_commit_sha {
            Some(sha) => ObjectDatabase::read_commit(store, sha).await?.committed_at,
            None => branch.created_at,
        };

        Ok(BranchMetrics {
            object_count: tree.len(),
            storage_bytes,
            last_modified,
        })
    }

    /// Point the session at an ACTIVE branch
    pub async fn checkout_branch<S: Store>(
        store: &S,
        session: &mut Session,
        name: &str,
    ) -> VcsResult<CheckoutResult> {
        let branch = Self::get_live_branch(store, name).await?;
        if branch.status != BranchStatus::Active {
            return Err(VcsError::Forbidden(format!(
                "branch '{}' is {} and cannot be checked out",
                name,
                branch.status.as_str()
            )));
        }

        let previous_branch = session.set_branch(&branch.name);
        log::debug!(
            "session '{}' switched from '{}' to '{}'",
            session.id,
            previous_branch,
            branch.name
        );
        Ok(CheckoutResult {
            success: true,
            previous_branch,
            current_branch: branch.name,
        })
    }

    /// The branch together with the tree it currently resolves to
    pub async fn branch_tree<S: Store>(store: &S, name: &str) -> VcsResult<(Branch, Tree)> {
        let branch = Self::get_live_branch(store, name).await?;
        let tree = ObjectDatabase::tree_at(store, branch.effective_head()).await?;
        Ok((branch, tree))
    }

    /// Record a set of object changes on a branch as one commit.
    ///
    /// History rows are written after the commit and are best effort: a
    /// failure there is reported as a warning and in the tracking error
    /// table, never as an error of the commit.
    pub async fn apply_changes<S: Store>(
        store: &S,
        branch_name: &str,
        changes: Vec<ObjectChange>,
        author: &str,
        message: &str,
    ) -> VcsResult<WithWarnings<Commit>> {
        require_non_empty("author", author)?;
        let _guard = store.branch_locks().lock(&[branch_name]).await;

        let (mut branch, mut tree) = Self::branch_tree(store, branch_name).await?;
        if !branch.can_accept_changes() {
            return Err(VcsError::Forbidden(format!(
                "branch '{}' is {} and does not accept changes",
                branch_name,
                branch.status.as_str()
            )));
        }

        let original = tree.clone();
        for change in &changes {
            change.identity().validate()?;
            match change {
                ObjectChange::Upsert {
                    identity,
                    definition,
                } => {
                    require_non_empty("definition", definition)?;
                    let blob_sha = ObjectDatabase::write_blob(store, definition).await?;
                    tree.insert(identity, blob_sha);
                }
                ObjectChange::Drop { identity } => {
                    if tree.remove(identity).is_none() {
                        return Err(VcsError::not_found("object", identity.to_string()));
                    }
                }
            }
        }

        let tracked = Self::tracked_changes(&original, &tree);
        if tracked.is_empty() {
            return Err(VcsError::Forbidden(format!(
                "nothing to commit on branch '{}'",
                branch_name
            )));
        }

        let tree_sha = ObjectDatabase::write_tree(store, &tree).await?;
        let parents = branch.effective_head().map(str::to_string).into_iter().collect();
        let commit = ObjectDatabase::write_commit(store, &tree_sha, parents, author, message).await?;

        branch.head_commit_sha = Some(commit.sha.clone());
        let mut batch = WriteBatch::new();
        batch
            .push(StoreWrite::UpdateBranch(branch))
            .push(StoreWrite::SetBranchRef {
                name: branch_name.to_string(),
                commit_sha: commit.sha.clone(),
            });
        store.commit(batch).await?;
        store.snapshot_cache().invalidate_branch(branch_name).await;

        log::info!(
            "committed {} change(s) to '{}' as {}",
            tracked.len(),
            branch_name,
            commit.sha
        );

        let mut result = WithWarnings::new(commit);
        for change in tracked {
            let entry = ObjectHistoryEntry {
                branch_name: branch_name.to_string(),
                identity: change.identity,
                action: change.action,
                old_hash: change.old_hash,
                new_hash: change.new_hash,
                commit_sha: result.value.sha.clone(),
                author: author.to_string(),
                recorded_at: result.value.committed_at,
            };
            if let Err(e) = store.record_history(entry).await {
                let message = format!("history not recorded: {}", e);
                log::warn!("branch '{}': {}", branch_name, message);
                Self::record_tracking_error(store, "apply_changes", Some(branch_name), &message)
                    .await;
                result.warn(message);
            }
        }

        Ok(result)
    }

    pub async fn track_object<S: Store>(
        store: &S,
        branch_name: &str,
        identity: ObjectIdentity,
        definition: &str,
        author: &str,
    ) -> VcsResult<WithWarnings<Commit>> {
        let message = format!("Track {}", identity);
        Self::apply_changes(
            store,
            branch_name,
            vec![ObjectChange::upsert(identity, definition)],
            author,
            &message,
        )
        .await
    }

    pub async fn drop_object<S: Store>(
        store: &S,
        branch_name: &str,
        identity: ObjectIdentity,
        author: &str,
    ) -> VcsResult<WithWarnings<Commit>> {
        let message = format!("Drop {}", identity);
        Self::apply_changes(
            store,
            branch_name,
            vec![ObjectChange::Drop { identity }],
            author,
            &message,
        )
        .await
    }

    async fn record_tracking_error<S: Store>(
        store: &S,
        operation: &str,
        branch_name: Option<&str>,
        message: &str,
    ) {
        let record = TrackingErrorRecord::new(operation, branch_name, message);
        if let Err(e) = store.record_tracking_error(record).await {
            log::warn!("tracking error could not be recorded: {}", e);
        }
    }

    fn tracked_changes(before: &Tree, after: &Tree) -> Vec<TrackedChange> {
        let mut changes = Vec::new();
        for path in before.entries.keys().chain(after.entries.keys()).unique() {
            let old_hash = before.entries.get(path).cloned();
            let new_hash = after.entries.get(path).cloned();
            let action = match (&old_hash, &new_hash) {
                (None, Some(_)) => HistoryAction::Create,
                (Some(_), None) => HistoryAction::Drop,
                (Some(old), Some(new)) if old != new => HistoryAction::Alter,
                _ => continue,
            };
            // Paths in a tree were built from identities
            let Ok(identity) = ObjectIdentity::from_path(path) else {
                continue;
            };
            changes.push(TrackedChange {
                identity,
                action,
                old_hash,
                new_hash,
            });
        }
        changes.sort_by(|a, b| a.identity.cmp(&b.identity));
        changes
    }

    /// First-parent history of a branch, newest first
    pub async fn get_commit_log<S: Store>(
        store: &S,
        branch_name: &str,
        limit: Option<usize>,
    ) -> VcsResult<Vec<Commit>> {
        let branch = Self::get_branch(store, branch_name).await?;
        let limit = limit.unwrap_or(usize::MAX);

        let mut log = Vec::new();
        let mut next = branch.effective_head().map(str::to_string);
        while let Some(sha) = next {
            if log.len() >= limit {
                break;
            }
            let commit = ObjectDatabase::read_commit(store, &sha).await?;
            next = commit.parent_shas.first().cloned();
            log.push(commit);
        }
        Ok(log)
    }

    /// Create an immutable tag pointing at a commit
    pub async fn create_tag<S: Store>(store: &S, name: &str, commit_sha: &str) -> VcsResult<Ref> {
        validate_branch_name(name, usize::MAX).map_err(|e| match e {
            VcsError::InvalidFormat { reason, .. } => VcsError::invalid("tag name", reason),
            other => other,
        })?;
        require_non_empty("commit sha", commit_sha)?;
        ObjectDatabase::read_commit(store, commit_sha).await?;

        let tag = Ref::new(RefKind::Tag, name, commit_sha);
        store.insert_ref(tag.clone()).await?;
        log::info!("tagged {} as '{}'", commit_sha, name);
        Ok(tag)
    }

    pub async fn list_refs<S: Store>(store: &S, kind: RefKind) -> VcsResult<Vec<Ref>> {
        let mut refs = store.list_refs(kind).await?;
        refs.sort_by(|a, b| match a.name.cmp(&b.name) {
            Ordering::Equal => a.updated_at.cmp(&b.updated_at),
            other => other,
        });
        Ok(refs)
    }
}
