use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{VcsError, VcsResult};
use crate::model::ObjectIdentity;

/// Kind of content-addressed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = VcsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(VcsError::invalid(
                "object kind",
                format!("unknown object kind '{}'", other),
            )),
        }
    }
}

/// An immutable object as held by the object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObject {
    /// SHA-256 of the kind header and content
    pub sha: String,
    pub kind: ObjectKind,
    pub content: Vec<u8>,
}

impl StoredObject {
    pub fn new(kind: ObjectKind, content: Vec<u8>) -> Self {
        let sha = Self::calculate_hash(kind, &content);
        Self { sha, kind, content }
    }

    /// `sha256("<kind> <len>\0" || content)`, hex encoded
    pub fn calculate_hash(kind: ObjectKind, content: &[u8]) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(format!("{} {}\0", kind, content.len()));
        hasher.update(content);

        hex::encode(hasher.finalize())
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn content_str(&self) -> VcsResult<&str> {
        std::str::from_utf8(&self.content)
            .map_err(|e| VcsError::Storage(format!("object {} is not UTF-8: {}", self.sha, e)))
    }

    /// Recompute the hash and compare with the stored sha.
    pub fn verify(&self) -> bool {
        Self::calculate_hash(self.kind, &self.content) == self.sha
    }
}

/// Compress object content using gzip
pub fn compress_content(data: &[u8]) -> VcsResult<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress object content, passing through data that is not gzip
pub fn decompress_content(data: &[u8]) -> VcsResult<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// A schema snapshot: object path -> blob sha. Paths are unique by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: BTreeMap<String, String>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &ObjectIdentity) -> Option<&String> {
        self.entries.get(&identity.path())
    }

    pub fn insert(&mut self, identity: &ObjectIdentity, blob_sha: String) -> Option<String> {
        self.entries.insert(identity.path(), blob_sha)
    }

    pub fn remove(&mut self, identity: &ObjectIdentity) -> Option<String> {
        self.entries.remove(&identity.path())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries keyed by parsed identity.
    pub fn identities(&self) -> VcsResult<BTreeMap<ObjectIdentity, String>> {
        self.entries
            .iter()
            .map(|(path, sha)| Ok((ObjectIdentity::from_path(path)?, sha.clone())))
            .collect()
    }

    /// Canonical serialization; `BTreeMap` keeps the key order stable.
    pub fn to_content(&self) -> VcsResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.entries)?)
    }

    pub fn from_content(content: &[u8]) -> VcsResult<Self> {
        Ok(Self {
            entries: serde_json::from_slice(content)?,
        })
    }
}

/// Hashed fields of a commit, serialized in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitContent {
    pub tree_sha: String,
    pub parent_shas: Vec<String>,
    pub author: String,
    pub message: String,
    pub committed_at: DateTime<Utc>,
}

/// A commit: a tree plus its history. The sha covers every field, so
/// rewriting history changes every descendant sha.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub tree_sha: String,
    /// Empty for a root commit, one for a normal commit, two or more for a merge
    pub parent_shas: Vec<String>,
    pub author: String,
    pub message: String,
    pub committed_at: DateTime<Utc>,
}

impl Commit {
    pub fn from_content(sha: String, content: CommitContent) -> Self {
        Self {
            sha,
            tree_sha: content.tree_sha,
            parent_shas: content.parent_shas,
            author: content.author,
            message: content.message,
            committed_at: content.committed_at,
        }
    }

    pub fn content(&self) -> CommitContent {
        CommitContent {
            tree_sha: self.tree_sha.clone(),
            parent_shas: self.parent_shas.clone(),
            author: self.author.clone(),
            message: self.message.clone(),
            committed_at: self.committed_at,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_shas.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parent_shas.len() >= 2
    }
}

impl CommitContent {
    pub fn to_content(&self) -> VcsResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_content(content: &[u8]) -> VcsResult<Self> {
        Ok(serde_json::from_slice(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_content_hashes_identically() {
        let a = StoredObject::new(ObjectKind::Blob, b"CREATE TABLE t (id int)".to_vec());
        let b = StoredObject::new(ObjectKind::Blob, b"CREATE TABLE t (id int)".to_vec());
        assert_eq!(a.sha, b.sha);
        assert_eq!(a.sha.len(), 64);
        assert!(a.verify());
    }

    #[test]
    fn test_kind_is_part_of_the_hash() {
        let blob = StoredObject::new(ObjectKind::Blob, b"{}".to_vec());
        let tree = StoredObject::new(ObjectKind::Tree, b"{}".to_vec());
        assert_ne!(blob.sha, tree.sha);
    }

    #[test]
    fn test_tampered_object_fails_verification() {
        let mut object = StoredObject::new(ObjectKind::Blob, b"original".to_vec());
        object.content = b"tampered".to_vec();
        assert!(!object.verify());
    }

    #[test]
    fn test_compression_passes_through_plain_data() {
        let data = b"CREATE VIEW v AS SELECT 1".repeat(20);
        let compressed = compress_content(&data).unwrap();
        assert_ne!(compressed, data);
        assert_eq!(decompress_content(&compressed).unwrap(), data);
        assert_eq!(decompress_content(b"plain").unwrap(), b"plain".to_vec());
    }

    #[test]
    fn test_tree_serialization_is_order_independent() {
        let orders = ObjectIdentity::table("public", "orders");
        let users = ObjectIdentity::table("public", "users");

        let mut a = Tree::new();
        a.insert(&orders, "1".into());
        a.insert(&users, "2".into());

        let mut b = Tree::new();
        b.insert(&users, "2".into());
        b.insert(&orders, "1".into());

        assert_eq!(a.to_content().unwrap(), b.to_content().unwrap());
        assert_eq!(Tree::from_content(&a.to_content().unwrap()).unwrap(), a);
    }
}
