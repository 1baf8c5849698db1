use crate::model::SchemaSnapshot;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Cache entry for a schema snapshot
#[derive(Clone, Debug)]
struct CacheEntry {
    snapshot: SchemaSnapshot,
    last_accessed: Instant,
}

/// Snapshot key: branch name plus the commit it resolved to. A new commit on
/// the branch yields a new key, so stale entries are never served.
type SnapshotKey = (String, Option<String>);

/// In-memory cache for schema snapshots with TTL
#[derive(Debug)]
pub struct SnapshotCache {
    entries: Arc<RwLock<HashMap<SnapshotKey, CacheEntry>>>,
    ttl: Duration,
}

impl SnapshotCache {
    /// Create a new cache with a 5-minute TTL
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(300))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Get a snapshot from cache if present and not expired
    pub async fn get(&self, branch: &str, commit_sha: Option<&str>) -> Option<SchemaSnapshot> {
        let mut entries = self.entries.write().await;
        let key = (branch.to_string(), commit_sha.map(str::to_string));

        if let Some(entry) = entries.get_mut(&key) {
            if entry.last_accessed.elapsed() > self.ttl {
                entries.remove(&key);
                return None;
            }

            entry.last_accessed = Instant::now();
            Some(entry.snapshot.clone())
        } else {
            None
        }
    }

    pub async fn put(&self, snapshot: SchemaSnapshot) {
        let mut entries = self.entries.write().await;
        let key = (snapshot.branch.clone(), snapshot.commit_sha.clone());
        entries.insert(
            key,
            CacheEntry {
                snapshot,
                last_accessed: Instant::now(),
            },
        );
    }

    /// Drop every cached snapshot of a branch
    pub async fn invalidate_branch(&self, branch: &str) {
        let mut entries = self.entries.write().await;
        entries.retain(|(name, _), _| name != branch);
    }

    pub async fn clear_expired(&self) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.last_accessed.elapsed() <= ttl);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}
