use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::models::{FileIdentity, FrameMetrics};

/// Cached analysis of one file, valid only for the exact identity it was
/// computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub identity: FileIdentity,
    pub metrics: FrameMetrics,
}

/// In-memory memo of frame metrics keyed by file identity. Cloning shares
/// the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MetricsCache {
    entries: Arc<RwLock<HashMap<PathBuf, CacheEntry>>>,
}

impl MetricsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached metrics for `identity`. A stale entry for the same path (size or
    /// modification time changed) is evicted and `None` returned.
    pub fn lookup(&self, identity: &FileIdentity) -> Option<FrameMetrics> {
        {
            let entries = self.entries.read().ok()?;
            match entries.get(&identity.path) {
                None => return None,
                Some(entry) if entry.identity == *identity => return Some(entry.metrics.clone()),
                Some(_) => {}
            }
        }

        if let Ok(mut entries) = self.entries.write() {
            if entries
                .get(&identity.path)
                .is_some_and(|entry| entry.identity != *identity)
            {
                debug!("🗑️ Evicting stale cache entry for {:?}", identity.path);
                entries.remove(&identity.path);
            }
        }
        None
    }

    /// Store metrics for `identity`, replacing any entry for the same path.
    pub fn store(&self, identity: FileIdentity, metrics: FrameMetrics) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(identity.path.clone(), CacheEntry { identity, metrics });
        }
    }

    /// Drop entries whose file no longer exists. Returns how many were removed.
    pub fn prune_missing(&self) -> usize {
        let Ok(mut entries) = self.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|path, _| path.is_file());
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Snapshot of all entries, sorted by path.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut snapshot: Vec<CacheEntry> = self
            .entries
            .read()
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default();
        snapshot.sort_by(|a, b| a.identity.path.cmp(&b.identity.path));
        snapshot
    }

    /// Insert previously saved entries. Staleness is checked at lookup time.
    pub fn restore(&self, saved: impl IntoIterator<Item = CacheEntry>) {
        if let Ok(mut entries) = self.entries.write() {
            for entry in saved {
                entries.insert(entry.identity.path.clone(), entry);
            }
        }
    }
}
