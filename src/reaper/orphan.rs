//! Orphan Reaper (C5): reconciles the object backend against the
//! metadata store, deleting backend keys with no corresponding record
//! once they clear a grace window (spec §4.5).
//!
//! The grace window exists because, between the backend `put` and the
//! metadata `save` in the upload pipeline (§4.3.1 steps 5-7), an object
//! briefly exists with no record. A reaper running in that window would
//! delete a valid in-flight upload; skipping objects younger than the
//! grace window avoids the race.

use super::SharedStats;
use crate::backend::ObjectBackend;
use crate::metastore::MetadataStore;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub deleted: u64,
    pub bytes_reclaimed_unknown: bool,
}

pub struct OrphanReaper {
    backend: Arc<dyn ObjectBackend>,
    metastore: Arc<dyn MetadataStore>,
    stats: SharedStats,
    grace: ChronoDuration,
}

impl OrphanReaper {
    pub fn new(backend: Arc<dyn ObjectBackend>, metastore: Arc<dyn MetadataStore>, stats: SharedStats, grace_secs: i64) -> Self {
        Self { backend, metastore, stats, grace: ChronoDuration::seconds(grace_secs) }
    }

    /// Spawn the interval-scheduled background loop. Runs until
    /// `shutdown` fires, completing any in-flight run first.
    pub fn spawn(self: Arc<Self>, interval_secs: u64, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        info!("orphan reaper shutting down");
                        break;
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
                let outcome = self.run_once().await;
                debug!(deleted = outcome.deleted, "orphan reaper tick complete");
            }
        })
    }

    /// Run a single reconciliation pass: enumerate backend keys, delete
    /// those absent from the metadata store that are older than the
    /// grace window.
    pub async fn run_once(&self) -> RunOutcome {
        let start = std::time::Instant::now();
        let mut outcome = RunOutcome::default();

        // Step 1: snapshot S_meta = { filePath : id in AllIds() }. We only
        // need the set of known file paths, so we resolve each id's
        // current record rather than re-deriving filePath from the id.
        let ids = match self.metastore.all_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!("orphan reaper could not enumerate metadata ids: {err}");
                return outcome;
            }
        };
        let mut known_paths: HashSet<String> = HashSet::with_capacity(ids.len());
        for id in ids {
            match self.metastore.get(id).await {
                Ok(Some(record)) => {
                    known_paths.insert(record.file_path);
                }
                Ok(None) => {}
                Err(err) => warn!(id = %id, "orphan reaper failed to load record: {err}"),
            }
        }

        // Step 2: enumerate backend keys.
        let keys = match self.backend.list_keys().await {
            Ok(keys) => keys,
            Err(err) => {
                warn!("orphan reaper could not enumerate backend keys: {err}");
                return outcome;
            }
        };

        let now = Utc::now();
        let mut deleted = 0u64;
        for entry in keys {
            if known_paths.contains(&entry.key) {
                continue;
            }
            // Step 3: grace window — an object younger than the grace
            // window may be an in-flight upload whose record is not yet
            // committed.
            if now - entry.modified_at < self.grace {
                continue;
            }
            // Step 4: delete the older orphan.
            match self.backend.delete(&entry.key).await {
                Ok(()) => deleted += 1,
                Err(err) => warn!(key = %entry.key, "orphan reaper failed to delete orphan: {err}"),
            }
        }

        outcome.deleted = deleted;
        let mut stats = self.stats.lock().await;
        stats.record_run(deleted, 0, start.elapsed().as_secs_f64() * 1000.0, now);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FsBackend;
    use bytes::Bytes;
    use futures::stream;

    fn body(data: &'static [u8]) -> crate::backend::ByteStream {
        Box::pin(stream::iter(vec![Ok(Bytes::from_static(data))]))
    }

    #[tokio::test]
    async fn deletes_old_orphan_not_in_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn ObjectBackend> = Arc::new(FsBackend::new(dir.path()).await.unwrap());
        backend.put("2026-07/orphan.txt", body(b"orphan")).await.unwrap();

        let metastore: Arc<dyn MetadataStore> = Arc::new(crate::metastore::JsonFileStore::new(dir.path()));
        metastore.init().await.unwrap();

        let stats = super::super::shared_stats();
        // grace window of 0 so the freshly-written orphan is immediately eligible.
        let reaper = OrphanReaper::new(backend.clone(), metastore, stats, -1);
        let outcome = reaper.run_once().await;
        assert_eq!(outcome.deleted, 1);
        assert!(backend.get("2026-07/orphan.txt").await.is_err());
    }

    #[tokio::test]
    async fn skips_orphan_within_grace_window() {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn ObjectBackend> = Arc::new(FsBackend::new(dir.path()).await.unwrap());
        backend.put("2026-07/fresh.txt", body(b"fresh")).await.unwrap();

        let metastore: Arc<dyn MetadataStore> = Arc::new(crate::metastore::JsonFileStore::new(dir.path()));
        metastore.init().await.unwrap();

        let stats = super::super::shared_stats();
        let reaper = OrphanReaper::new(backend.clone(), metastore, stats, 60);
        let outcome = reaper.run_once().await;
        assert_eq!(outcome.deleted, 0);
        assert!(backend.get("2026-07/fresh.txt").await.is_ok());
    }
}
