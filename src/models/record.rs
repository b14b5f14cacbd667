//! Core data model for the temporary file cache.
//!
//! These types represent the logical structure of a stored file and the
//! process-wide configuration the storage engine is built with. They map
//! cleanly to both JSON-file and KV metadata store representations and
//! serialize naturally for the HTTP surface via `serde`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A single scalar (or array-of-string) value in a [`FileRecord`]'s free-form
/// metadata map.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MetadataValue {
    String(String),
    Number(f64),
    Bool(bool),
    StringArray(Vec<String>),
    Null,
}

/// Upper bounds enforced on [`FileRecord::metadata`] per the storage
/// configuration's documented constraints.
pub const METADATA_MAX_ENTRIES: usize = 50;
pub const METADATA_MAX_KEY_LEN: usize = 100;

/// Upper bound on `FileRecord::original_name`, in Unicode scalar values.
pub const ORIGINAL_NAME_MAX_LEN: usize = 255;

/// The authoritative per-file entity held by the metadata store.
///
/// Mutated only by the storage engine; deletion is the only mutation other
/// than creation — records are never updated in place.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileRecord {
    /// Opaque identifier, unique and immutable once assigned.
    pub id: Uuid,

    /// Caller-supplied filename, preserved verbatim (sanitized only for
    /// display, never for lookup).
    pub original_name: String,

    /// Backend-friendly derivation of `original_name` + content hash.
    pub stored_name: String,

    /// Detected or declared content type.
    pub mime_type: String,

    /// Byte count of stored content.
    pub size: u64,

    /// SHA-256 of content, lowercase hex (64 chars).
    pub hash: String,

    /// UTC timestamp of successful record creation.
    pub uploaded_at: DateTime<Utc>,

    /// Requested lifetime in seconds.
    pub ttl: u64,

    /// `uploaded_at + ttl`, stored for index use even though derivable.
    pub expires_at: DateTime<Utc>,

    /// Backend key (object-store key or absolute local path). Opaque to
    /// callers outside the engine.
    pub file_path: String,

    /// Free-form caller metadata.
    pub metadata: HashMap<String, MetadataValue>,
}

impl FileRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Process-wide, immutable-post-init configuration for the storage engine.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub base_path: String,
    pub max_file_size: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    /// Empty means "permit all".
    pub allowed_mime_types: Vec<String>,
    pub enable_deduplication: bool,
}

impl StorageConfig {
    pub fn ttl_in_range(&self, ttl: u64) -> bool {
        ttl >= self.min_ttl_secs && ttl <= self.max_ttl_secs
    }

    pub fn mime_allowed(&self, mime: &str) -> bool {
        self.allowed_mime_types.is_empty() || self.allowed_mime_types.iter().any(|m| m == mime)
    }
}

/// In-process, per-reaper counters. Lost on restart by design — these are
/// observability aids, not durable state.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ReaperStats {
    pub total_runs: u64,
    pub total_deleted: u64,
    pub total_bytes_reclaimed: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub average_duration_ms: f64,
}

impl ReaperStats {
    /// Fold one run's outcome into the running averages.
    pub fn record_run(&mut self, deleted: u64, bytes_reclaimed: u64, duration_ms: f64, at: DateTime<Utc>) {
        let prev_total = self.total_runs;
        self.total_runs += 1;
        self.total_deleted += deleted;
        self.total_bytes_reclaimed += bytes_reclaimed;
        self.last_run = Some(at);
        self.average_duration_ms =
            (self.average_duration_ms * prev_total as f64 + duration_ms) / self.total_runs as f64;
    }
}

/// Aggregate statistics surfaced by `GetStats`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct FileStats {
    #[serde(rename = "totalFiles")]
    pub total_files: u64,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
    #[serde(rename = "filesByMime")]
    pub files_by_mime: HashMap<String, u64>,
    #[serde(rename = "filesByDate")]
    pub files_by_date: HashMap<String, u64>,
}

/// Liveness summary surfaced by `GetHealth`.
#[derive(Clone, Debug, Serialize)]
pub struct StorageHealth {
    #[serde(rename = "backendHealthy")]
    pub backend_healthy: bool,
    #[serde(rename = "metadataHealthy")]
    pub metadata_healthy: bool,
}

impl StorageHealth {
    pub fn healthy(&self) -> bool {
        self.backend_healthy && self.metadata_healthy
    }
}
