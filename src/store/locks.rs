use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-branch async locks held across merge and delete.
#[derive(Debug, Default)]
pub struct BranchLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Guards for a set of branches, released on drop.
#[derive(Debug)]
pub struct BranchGuard {
    _guards: Vec<OwnedMutexGuard<()>>,
    branches: Vec<String>,
}

impl BranchGuard {
    pub fn branches(&self) -> &[String] {
        &self.branches
    }
}

impl BranchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every named branch. Names are sorted and deduplicated so two
    /// callers locking the same pair never wait on each other in a cycle.
    pub async fn lock(&self, names: &[&str]) -> BranchGuard {
        let mut branches: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        branches.sort();
        branches.dedup();

        let mutexes: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = self.locks.lock();
            branches
                .iter()
                .map(|name| locks.entry(name.clone()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }

        BranchGuard {
            _guards: guards,
            branches,
        }
    }
}
