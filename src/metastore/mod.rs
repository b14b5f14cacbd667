//! Metadata store trait and implementations.
//!
//! The authoritative index of [`FileRecord`]s, keyed by file id, with
//! secondary lookups by content hash and pagination/filtering for search.

pub mod json_file;
#[cfg(feature = "redis-store")]
pub mod kv;

use crate::models::{FileRecord, FileStats};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

pub use json_file::JsonFileStore;
#[cfg(feature = "redis-store")]
pub use kv::KvStore;

#[derive(Debug, Error)]
pub enum MetaStoreError {
    #[error("metadata write failed: {0}")]
    WriteFailed(String),
    #[error("metadata read failed: {0}")]
    ReadFailed(String),
}

pub type MetaResult<T> = Result<T, MetaStoreError>;

/// Filter accepted by [`MetadataStore::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub mime_type: Option<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
    pub uploaded_after: Option<DateTime<Utc>>,
    pub uploaded_before: Option<DateTime<Utc>>,
    /// When true, only records whose `expires_at <= now` are returned (and
    /// ordering/limits still apply).
    pub expired_only: bool,
    /// When true, records already past `expires_at` are not hidden from a
    /// non-`expired_only` search. Set by the Expiry Reaper's on-demand
    /// `olderThan` mode (spec §4.4), which selects purely by upload time —
    /// an already-expired record that is also old must still match, or the
    /// sweep would silently skip the common case it exists to handle.
    pub include_expired: bool,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub records: Vec<FileRecord>,
    pub total: u64,
}

/// Record-oriented index capability set the storage engine depends on.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Create the backing store if absent, validate existing state.
    async fn init(&self) -> MetaResult<()>;

    /// Idempotent upsert of a full record.
    async fn save(&self, record: &FileRecord) -> MetaResult<()>;

    /// Single-id lookup.
    async fn get(&self, id: Uuid) -> MetaResult<Option<FileRecord>>;

    /// Idempotent removal.
    async fn delete(&self, id: Uuid) -> MetaResult<()>;

    /// Secondary index lookup over content hash.
    async fn find_by_hash(&self, hash: &str) -> MetaResult<Option<FileRecord>>;

    /// Filtered, paginated search ordered by `uploaded_at` descending.
    async fn search(&self, filter: &SearchFilter, limit: usize, offset: usize) -> MetaResult<SearchResult>;

    /// Every id currently in the store, for the orphan reaper's
    /// reconciliation pass.
    async fn all_ids(&self) -> MetaResult<Vec<Uuid>>;

    /// Aggregate counters.
    async fn stats(&self) -> MetaResult<FileStats>;

    /// Cheap liveness probe.
    async fn healthy(&self) -> bool;
}
