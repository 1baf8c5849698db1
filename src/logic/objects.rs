use std::collections::{HashSet, VecDeque};

use chrono::Utc;

use crate::error::{VcsError, VcsResult};
use crate::model::{Commit, CommitContent, ObjectKind, StoredObject, Tree};
use crate::store::traits::Store;

/// Typed access to blobs, trees and commits on top of the raw object store
pub struct ObjectDatabase;

impl ObjectDatabase {
    pub async fn write_blob<S: Store>(store: &S, definition: &str) -> VcsResult<String> {
        store
            .put_object(ObjectKind::Blob, definition.as_bytes().to_vec())
            .await
    }

    pub async fn read_blob<S: Store>(store: &S, sha: &str) -> VcsResult<String> {
        let object = Self::read_kind(store, sha, ObjectKind::Blob).await?;
        Ok(object.content_str()?.to_string())
    }

    pub async fn write_tree<S: Store>(store: &S, tree: &Tree) -> VcsResult<String> {
        store.put_object(ObjectKind::Tree, tree.to_content()?).await
    }

    pub async fn read_tree<S: Store>(store: &S, sha: &str) -> VcsResult<Tree> {
        let object = Self::read_kind(store, sha, ObjectKind::Tree).await?;
        Tree::from_content(&object.content)
    }

    /// Tree of a commit, or the empty tree when there is no commit yet
    pub async fn tree_at<S: Store>(store: &S, commit_sha: Option<&str>) -> VcsResult<Tree> {
        match commit_sha {
            Some(sha) => {
                let commit = Self::read_commit(store, sha).await?;
                Self::read_tree(store, &commit.tree_sha).await
            }
            None => Ok(Tree::new()),
        }
    }

    /// Write a commit object. The tree and every parent must already exist.
    pub async fn write_commit<S: Store>(
        store: &S,
        tree_sha: &str,
        parent_shas: Vec<String>,
        author: &str,
        message: &str,
    ) -> VcsResult<Commit> {
        Self::read_kind(store, tree_sha, ObjectKind::Tree).await?;
        for parent in &parent_shas {
            Self::read_kind(store, parent, ObjectKind::Commit).await?;
        }

        let content = CommitContent {
            tree_sha: tree_sha.to_string(),
            parent_shas,
            author: author.to_string(),
            message: message.to_string(),
            committed_at: Utc::now(),
        };
        let sha = store
            .put_object(ObjectKind::Commit, content.to_content()?)
            .await?;

        Ok(Commit::from_content(sha, content))
    }

    pub async fn read_commit<S: Store>(store: &S, sha: &str) -> VcsResult<Commit> {
        let object = Self::read_kind(store, sha, ObjectKind::Commit).await?;
        let content = CommitContent::from_content(&object.content)?;
        Ok(Commit::from_content(object.sha, content))
    }

    /// Every commit reachable from `sha` (itself included), breadth first
    /// over all parents. Earlier entries are never further from `sha` than
    /// later ones.
    pub async fn ancestors<S: Store>(store: &S, sha: &str) -> VcsResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([sha.to_string()]);

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            let commit = Self::read_commit(store, &current).await?;
            order.push(current);
            queue.extend(commit.parent_shas);
        }

        Ok(order)
    }

    pub async fn is_ancestor<S: Store>(
        store: &S,
        ancestor: &str,
        descendant: &str,
    ) -> VcsResult<bool> {
        Ok(Self::ancestors(store, descendant)
            .await?
            .iter()
            .any(|sha| sha == ancestor))
    }

    async fn read_kind<S: Store>(
        store: &S,
        sha: &str,
        expected: ObjectKind,
    ) -> VcsResult<StoredObject> {
        let object = store.get_object(sha).await?;
        if object.kind != expected {
            return Err(VcsError::invalid(
                "object kind",
                format!(
                    "{} is a {}, expected a {}",
                    sha,
                    object.kind.as_str(),
                    expected.as_str()
                ),
            ));
        }
        Ok(object)
    }
}
