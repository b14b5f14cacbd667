//! Expiry Reaper (C4): periodic scan for records past `expires_at`,
//! deleted in bounded batches via the storage engine.
//!
//! Scheduled by a cron expression (spec §6.4 `CLEANUP_CRON`, default every
//! 10 minutes); on-demand runs (with `dry_run`/`batch_size`/`older_than`)
//! are exposed for the HTTP surface or an operator task.

use super::SharedStats;
use crate::engine::StorageEngine;
use crate::metastore::SearchFilter;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Hard ceiling on pages consumed per tick, regardless of `batch_size`,
/// so a single tick cannot monopolize the reaper (spec §4.4 step 3).
const HARD_PAGE_CEILING: usize = 10_000;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub batch_size: Option<usize>,
    pub older_than: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub deleted: u64,
    pub bytes_freed: u64,
    pub errors: u64,
}

pub struct ExpiryReaper {
    engine: Arc<StorageEngine>,
    stats: SharedStats,
    default_batch_size: usize,
}

impl ExpiryReaper {
    pub fn new(engine: Arc<StorageEngine>, stats: SharedStats, default_batch_size: usize) -> Self {
        Self { engine, stats, default_batch_size }
    }

    /// Spawn the cron-scheduled background loop. Runs until `shutdown`
    /// fires, completing any in-flight tick first (spec §5, shutdown
    /// semantics).
    pub fn spawn(self: Arc<Self>, cron_expr: &str, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let schedule = match Schedule::from_str(cron_expr) {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!("invalid CLEANUP_CRON `{cron_expr}`, falling back to every 10 minutes: {err}");
                Schedule::from_str("0 */10 * * * *").expect("fallback cron expression is valid")
            }
        };

        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!("expiry reaper schedule produced no further fire times, stopping");
                    break;
                };
                let delay = (next - Utc::now()).to_std().unwrap_or(Duration::from_secs(1));
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        info!("expiry reaper shutting down");
                        break;
                    }
                }
                if *shutdown.borrow() {
                    break;
                }
                let outcome = self.run_once(RunOptions::default()).await;
                debug!(deleted = outcome.deleted, errors = outcome.errors, "expiry reaper tick complete");
            }
        })
    }

    /// Run a single reaping pass, honoring `options`. Returns the
    /// accumulated counters for this run without mutating `ReaperStats`
    /// when `dry_run` is set.
    pub async fn run_once(&self, options: RunOptions) -> RunOutcome {
        let start = std::time::Instant::now();
        let batch_size = options.batch_size.unwrap_or(self.default_batch_size);
        let mut outcome = RunOutcome::default();
        let mut offset = 0usize;
        let mut pages = 0usize;

        loop {
            let filter = if let Some(older_than) = options.older_than {
                SearchFilter { uploaded_before: Some(older_than), include_expired: true, ..Default::default() }
            } else {
                SearchFilter { expired_only: true, ..Default::default() }
            };

            let page = match self.engine.search_files(filter, batch_size, offset).await {
                Ok(page) => page,
                Err(err) => {
                    warn!("expiry reaper search failed: {err}");
                    break;
                }
            };

            let returned = page.records.len();
            for record in page.records {
                if options.dry_run {
                    outcome.deleted += 1;
                    outcome.bytes_freed += record.size;
                    continue;
                }
                match self.engine.delete_file(record.id).await {
                    Ok(deleted) => {
                        outcome.deleted += 1;
                        outcome.bytes_freed += deleted.size;
                    }
                    Err(err) => {
                        outcome.errors += 1;
                        warn!(id = %record.id, "expiry reaper failed to delete record: {err}");
                    }
                }
            }

            pages += 1;
            if returned < batch_size || pages >= HARD_PAGE_CEILING / batch_size.max(1) {
                break;
            }
            if options.dry_run {
                // Nothing was deleted, so the result set didn't shrink —
                // advance normally to make progress across pages.
                offset += returned;
            } else {
                // Deleting shrinks the matching set from under us (for
                // either filter); re-querying from offset 0 each page
                // avoids skipping records that shifted into earlier pages.
                offset = 0;
            }
        }

        if !options.dry_run {
            let mut stats = self.stats.lock().await;
            stats.record_run(outcome.deleted, outcome.bytes_freed, start.elapsed().as_secs_f64() * 1000.0, Utc::now());
        }
        outcome
    }

    pub fn stats_handle(&self) -> SharedStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FsBackend;
    use crate::engine::UploadInput;
    use crate::metastore::JsonFileStore;
    use crate::metastore::MetadataStore;
    use crate::models::StorageConfig;
    use bytes::Bytes;
    use futures::stream;
    use std::collections::HashMap;

    async fn test_engine(dir: &std::path::Path) -> Arc<StorageEngine> {
        let backend = Arc::new(FsBackend::new(dir).await.unwrap());
        let metastore = Arc::new(JsonFileStore::new(dir));
        metastore.init().await.unwrap();
        let config = StorageConfig {
            base_path: dir.to_string_lossy().to_string(),
            max_file_size: 1024 * 1024,
            min_ttl_secs: 1,
            max_ttl_secs: 100_000,
            allowed_mime_types: vec![],
            enable_deduplication: true,
        };
        Arc::new(StorageEngine::new(backend, metastore, config))
    }

    fn body(data: &'static [u8]) -> impl futures::Stream<Item = std::io::Result<Bytes>> + Send + Unpin + 'static {
        stream::iter(vec![Ok(Bytes::from_static(data))])
    }

    #[tokio::test]
    async fn reaps_expired_records_in_a_batch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path()).await;
        let record = engine
            .save_file(UploadInput {
                stream: body(b"short lived"),
                original_name: "f.txt".into(),
                declared_mime: "text/plain".into(),
                ttl: 1,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(2)).await;

        let stats = super::super::shared_stats();
        let reaper = ExpiryReaper::new(engine.clone(), stats, 100);
        let outcome = reaper.run_once(RunOptions::default()).await;
        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.bytes_freed, record.size);
        assert!(matches!(
            engine.get_file_info(record.id).await,
            Err(crate::engine::EngineError::NotFound)
        ));
    }

    #[tokio::test]
    async fn dry_run_counts_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path()).await;
        let record = engine
            .save_file(UploadInput {
                stream: body(b"short lived"),
                original_name: "f.txt".into(),
                declared_mime: "text/plain".into(),
                ttl: 1,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(2)).await;

        let stats = super::super::shared_stats();
        let reaper = ExpiryReaper::new(engine.clone(), stats, 100);
        let outcome = reaper.run_once(RunOptions { dry_run: true, ..Default::default() }).await;
        assert_eq!(outcome.deleted, 1);
        // Record still present: dry run never deletes.
        assert!(engine.get_file_info(record.id).await.is_err()); // EXPIRED, not NOT_FOUND
        assert!(matches!(engine.get_file_info(record.id).await, Err(crate::engine::EngineError::Expired)));
    }

    /// Spec §4.4: the on-demand `olderThan` sweep selects by upload time
    /// alone, so a record that is both old and already expired must still
    /// be reaped, not silently skipped by the implicit "hide expired"
    /// behavior of a normal search.
    #[tokio::test]
    async fn older_than_sweep_reaps_already_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path()).await;
        let record = engine
            .save_file(UploadInput {
                stream: body(b"short lived"),
                original_name: "f.txt".into(),
                declared_mime: "text/plain".into(),
                ttl: 1,
                metadata: HashMap::new(),
            })
            .await
            .unwrap();

        tokio::time::pause();
        tokio::time::advance(Duration::from_secs(2)).await;

        let stats = super::super::shared_stats();
        let reaper = ExpiryReaper::new(engine.clone(), stats, 100);
        let outcome = reaper
            .run_once(RunOptions { older_than: Some(Utc::now()), ..Default::default() })
            .await;
        assert_eq!(outcome.deleted, 1);
        assert!(matches!(
            engine.get_file_info(record.id).await,
            Err(crate::engine::EngineError::NotFound)
        ));
    }
}
