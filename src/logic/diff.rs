use itertools::{EitherOrBoth, Itertools};

use crate::error::VcsResult;
use crate::logic::branch_ops::BranchManager;
use crate::logic::objects::ObjectDatabase;
use crate::model::{
    CategorizedChange, ChangeCategory, ChangeType, DiffDocument, DiffSummary, ObjectType,
    SchemaChange, SchemaSnapshot, SnapshotEntry,
};
use crate::store::traits::Store;

/// Snapshot comparison and change categorization
pub struct SchemaDiff;

impl SchemaDiff {
    /// Every object of a branch's effective head, cached per (branch, commit)
    pub async fn get_schema_snapshot<S: Store>(store: &S, branch_name: &str) -> VcsResult<SchemaSnapshot> {
        let branch = BranchManager::get_live_branch(store, branch_name).await?;
        let commit_sha = branch.effective_head().map(str::to_string);

        let cache = store.snapshot_cache();
        if let Some(snapshot) = cache.get(branch_name, commit_sha.as_deref()).await {
            log::debug!("snapshot cache hit for '{}'", branch_name);
            return Ok(snapshot);
        }

        let tree = ObjectDatabase::tree_at(store, commit_sha.as_deref()).await?;
        let mut snapshot = SchemaSnapshot::empty(branch_name);
        snapshot.commit_sha = commit_sha;
        for (identity, blob_sha) in tree.identities()? {
            let definition = ObjectDatabase::read_blob(store, &blob_sha).await?;
            snapshot.objects.insert(
                identity.clone(),
                SnapshotEntry {
                    identity,
                    content_hash: blob_sha,
                    definition,
                },
            );
        }

        cache.clear_expired().await;
        cache.put(snapshot.clone()).await;
        Ok(snapshot)
    }

    /// Changes that turn branch `a` into branch `b`
    pub async fn compare_schemas<S: Store>(store: &S, a: &str, b: &str) -> VcsResult<DiffDocument> {
        let from = Self::get_schema_snapshot(store, a).await?;
        let to = Self::get_schema_snapshot(store, b).await?;
        Ok(Self::compare_snapshots(&from, &to))
    }

    pub fn compare_snapshots(from: &SchemaSnapshot, to: &SchemaSnapshot) -> DiffDocument {
        let changes: Vec<SchemaChange> = from
            .objects
            .iter()
            .merge_join_by(to.objects.iter(), |(a, _), (b, _)| a.cmp(b))
            .filter_map(|pair| match pair {
                EitherOrBoth::Left((identity, old)) => Some(SchemaChange {
                    identity: identity.clone(),
                    change_type: ChangeType::Removed,
                    old_hash: Some(old.content_hash.clone()),
                    new_hash: None,
                    old_definition: Some(old.definition.clone()),
                    new_definition: None,
                }),
                EitherOrBoth::Right((identity, new)) => Some(SchemaChange {
                    identity: identity.clone(),
                    change_type: ChangeType::Added,
                    old_hash: None,
                    new_hash: Some(new.content_hash.clone()),
                    old_definition: None,
                    new_definition: Some(new.definition.clone()),
                }),
                EitherOrBoth::Both((identity, old), (_, new)) => {
                    (old.content_hash != new.content_hash).then(|| SchemaChange {
                        identity: identity.clone(),
                        change_type: ChangeType::Modified,
                        old_hash: Some(old.content_hash.clone()),
                        new_hash: Some(new.content_hash.clone()),
                        old_definition: Some(old.definition.clone()),
                        new_definition: Some(new.definition.clone()),
                    })
                }
            })
            .collect();

        let summary = DiffSummary::from_changes(&changes);
        DiffDocument {
            from_branch: from.branch.clone(),
            to_branch: to.branch.clone(),
            from_commit: from.commit_sha.clone(),
            to_commit: to.commit_sha.clone(),
            changes,
            summary,
        }
    }

    /// Rule table over (object type, change type) with substring heuristics
    /// on the definition text. A heuristic, not DDL analysis.
    pub fn categorize_change(
        object_type: ObjectType,
        change_type: ChangeType,
        old_definition: Option<&str>,
        new_definition: Option<&str>,
    ) -> CategorizedChange {
        let old = old_definition.unwrap_or_default().to_ascii_lowercase();
        let new = new_definition.unwrap_or_default().to_ascii_lowercase();

        let (category, description) = match (object_type, change_type) {
            (ObjectType::Index, _) => {
                if old.contains("unique") || new.contains("unique") {
                    (ChangeCategory::Risky, "unique index change can reject existing rows")
                } else {
                    (ChangeCategory::Optional, "index change affects performance only")
                }
            }
            (ObjectType::Trigger, _) => (ChangeCategory::Risky, "trigger change alters write behavior"),

            (ObjectType::Table, ChangeType::Added) => (ChangeCategory::Compatible, "new table"),
            (ObjectType::Table, ChangeType::Removed) => (ChangeCategory::Breaking, "table dropped"),
            (ObjectType::Table, ChangeType::Modified) => {
                if new.matches("not null").count() > old.matches("not null").count() {
                    (ChangeCategory::Breaking, "adds NOT NULL constraint")
                } else if new.matches("not null").count() < old.matches("not null").count() {
                    (ChangeCategory::Risky, "drops NOT NULL constraint, column becomes nullable")
                } else if constraint_count(&new) < constraint_count(&old) {
                    (ChangeCategory::Risky, "drops a constraint")
                } else {
                    (ChangeCategory::Risky, "table definition changed")
                }
            }

            (ObjectType::Function, ChangeType::Added) => (ChangeCategory::Compatible, "new function"),
            (ObjectType::Function, ChangeType::Removed) => (ChangeCategory::Breaking, "function dropped"),
            (ObjectType::Function, ChangeType::Modified) => {
                if signature(&old) != signature(&new) {
                    (ChangeCategory::Breaking, "function signature changed")
                } else {
                    (ChangeCategory::Compatible, "function body changed")
                }
            }

            (ObjectType::Type, ChangeType::Added) => (ChangeCategory::Compatible, "new type"),
            (ObjectType::Type, _) => (ChangeCategory::Breaking, "type changed or dropped"),

            (_, ChangeType::Added) => (ChangeCategory::Compatible, "new object"),
            (_, ChangeType::Modified) => (ChangeCategory::Risky, "definition changed"),
            (_, ChangeType::Removed) => (ChangeCategory::Breaking, "object dropped"),
        };

        CategorizedChange {
            category,
            description: format!("{} {}: {}", object_type, change_type.as_str(), description),
        }
    }
}

fn constraint_count(definition: &str) -> usize {
    ["constraint", "primary key", "unique", "references", "check"]
        .iter()
        .map(|keyword| definition.matches(keyword).count())
        .sum()
}

/// Normalized text up to the closing parenthesis of the argument list
fn signature(definition: &str) -> String {
    let head = match definition.find(')') {
        Some(end) => &definition[..=end],
        None => definition,
    };
    head.split_whitespace().join(" ")
}
