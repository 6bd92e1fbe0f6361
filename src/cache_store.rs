use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};

use crate::cache::{CacheEntry, MetricsCache};
use crate::models::{FileIdentity, FrameMetrics};

/// SQLite persistence for the metrics cache. Rows hold the file identity and
/// the metric record as JSON; staleness is decided by the in-memory cache.
pub struct CacheStore<'a> {
    conn: &'a Connection,
}

/// Open (creating if needed) a cache database file.
pub fn open_connection(path: &Path) -> Result<Connection> {
    Connection::open(path)
        .with_context(|| format!("Failed to open cache database: {}", path.display()))
}

impl<'a> CacheStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        CacheStore { conn }
    }

    pub fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS frame_metrics (
                    path TEXT PRIMARY KEY,
                    file_size INTEGER NOT NULL,
                    modified_ns INTEGER NOT NULL,
                    metrics_json TEXT NOT NULL,
                    saved_at INTEGER NOT NULL
                );",
            )
            .context("Failed to create cache schema")?;
        Ok(())
    }

    /// Replace the stored entries with the current cache contents.
    pub fn save(&self, cache: &MetricsCache) -> Result<usize> {
        let entries = cache.entries();
        let saved_at = chrono::Utc::now().timestamp();
        let tx = self.conn.unchecked_transaction()?;

        tx.execute("DELETE FROM frame_metrics", [])?;
        for entry in &entries {
            let json = serde_json::to_string(&entry.metrics)
                .context("Failed to serialize frame metrics")?;
            tx.execute(
                "INSERT INTO frame_metrics (path, file_size, modified_ns, metrics_json, saved_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    entry.identity.path.to_string_lossy().to_string(),
                    entry.identity.size as i64,
                    entry.identity.modified_ns as i64,
                    json,
                    saved_at
                ],
            )?;
        }

        tx.commit()?;
        tracing::debug!("💾 Saved {} cache entries", entries.len());
        Ok(entries.len())
    }

    pub fn load(&self) -> Result<Vec<CacheEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT path, file_size, modified_ns, metrics_json
             FROM frame_metrics
             ORDER BY path",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut entries = Vec::with_capacity(rows.len());
        for (path, size, modified_ns, json) in rows {
            let metrics: FrameMetrics = match serde_json::from_str(&json) {
                Ok(metrics) => metrics,
                Err(e) => {
                    tracing::warn!("⚠️ Dropping unreadable cache row for {}: {}", path, e);
                    continue;
                }
            };
            entries.push(CacheEntry {
                identity: FileIdentity {
                    path: PathBuf::from(path),
                    size: size as u64,
                    modified_ns: modified_ns as u64,
                },
                metrics,
            });
        }
        Ok(entries)
    }

    /// Load every stored entry into `cache`.
    pub fn load_into(&self, cache: &MetricsCache) -> Result<usize> {
        let entries = self.load()?;
        let count = entries.len();
        cache.restore(entries);
        tracing::debug!("💾 Restored {} cache entries", count);
        Ok(count)
    }
}
