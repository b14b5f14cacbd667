//! Storage engine — the orchestrator.
//!
//! Owns admission, the streaming upload pipeline (hash + MIME sniff + size
//! enforcement + optional deduplication), the two-phase commit (object
//! then metadata), and read/delete/search dispatch. Generalizes the
//! teacher's `StorageService::upload_object_stream` tee-while-streaming
//! pattern to the full pipeline in spec §4.3.1.

pub mod policy;

use crate::backend::{BackendError, ByteStream, ObjectBackend, ReadStream};
use crate::metastore::{MetaStoreError, MetadataStore, SearchFilter, SearchResult};
use crate::models::{FileRecord, FileStats, MetadataValue, StorageConfig, StorageHealth};
use bytes::Bytes;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// First-chunk budget retained in memory for MIME sniffing.
const SNIFF_BUDGET: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("expired")]
    Expired,
    #[error("upload exceeded maximum file size")]
    SizeExceeded,
    #[error("content type `{0}` is not allowed")]
    MimeNotAllowed(String),
    #[error("backend write failed: {0}")]
    BackendWriteFailed(String),
    #[error("backend read failed: {0}")]
    BackendReadFailed(String),
    #[error("object missing on backend")]
    BackendMissing,
    #[error("metadata write failed: {0}")]
    MetadataWriteFailed(String),
    #[error("metadata read failed: {0}")]
    MetadataReadFailed(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<MetaStoreError> for EngineError {
    fn from(err: MetaStoreError) -> Self {
        match err {
            MetaStoreError::WriteFailed(msg) => EngineError::MetadataWriteFailed(msg),
            MetaStoreError::ReadFailed(msg) => EngineError::MetadataReadFailed(msg),
        }
    }
}

/// Parameters for a single upload, consumed by [`StorageEngine::save_file`].
pub struct UploadInput<S> {
    pub stream: S,
    pub original_name: String,
    pub declared_mime: String,
    pub ttl: u64,
    pub metadata: HashMap<String, MetadataValue>,
}

pub struct StorageEngine {
    backend: Arc<dyn ObjectBackend>,
    metastore: Arc<dyn MetadataStore>,
    config: StorageConfig,
}

impl StorageEngine {
    pub fn new(backend: Arc<dyn ObjectBackend>, metastore: Arc<dyn MetadataStore>, config: StorageConfig) -> Self {
        Self { backend, metastore, config }
    }

    /// The 8-step upload pipeline of spec §4.3.1.
    pub async fn save_file<S>(&self, input: UploadInput<S>) -> EngineResult<FileRecord>
    where
        S: futures::Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
    {
        // 1. Admission.
        if !self.config.ttl_in_range(input.ttl) {
            return Err(EngineError::Validation(format!(
                "ttl {} outside allowed range [{}, {}]",
                input.ttl, self.config.min_ttl_secs, self.config.max_ttl_secs
            )));
        }
        if input.original_name.chars().count() > crate::models::record::ORIGINAL_NAME_MAX_LEN {
            return Err(EngineError::Validation("original_name exceeds 255 characters".into()));
        }
        if input.metadata.len() > crate::models::record::METADATA_MAX_ENTRIES {
            return Err(EngineError::Validation("too many metadata entries".into()));
        }
        for key in input.metadata.keys() {
            if key.len() > crate::models::record::METADATA_MAX_KEY_LEN {
                return Err(EngineError::Validation(format!("metadata key `{key}` exceeds length limit")));
            }
        }
        let id = Uuid::new_v4();

        // 2. Tentative key allocation: key carries only the id, per spec
        // §4.3.1 option (b). The "pretty" stored name is computed from the
        // hash after streaming completes and lives only in the record.
        let now = Utc::now();
        let key = policy::join_key(&[&policy::date_prefix(now), &id.to_string()]);

        // Buffer up to SNIFF_BUDGET bytes before ever writing to the
        // backend so a disallowed MIME type is rejected without creating
        // any backend object.
        let (prefix, mut remainder) = Self::buffer_prefix(input.stream).await?;

        let sniffed = infer::get(&prefix).map(|t| t.mime_type().to_string());
        let mime_type = sniffed.unwrap_or(input.declared_mime);
        if !self.config.mime_allowed(&mime_type) {
            return Err(EngineError::MimeNotAllowed(mime_type));
        }

        // 3. Streaming consume: tee hash + counter + backend sink.
        let hasher = Arc::new(std::sync::Mutex::new(Sha256::new()));
        let counter = Arc::new(AtomicU64::new(0));
        let size_exceeded = Arc::new(AtomicBool::new(false));
        let max_size = self.config.max_file_size;

        let wrapped =
            Self::tee_stream(prefix, remainder.take(), hasher.clone(), counter.clone(), size_exceeded.clone(), max_size);

        match self.backend.put(&key, wrapped).await {
            Ok(()) => {}
            Err(err) => {
                return Err(if size_exceeded.load(Ordering::SeqCst) {
                    EngineError::SizeExceeded
                } else {
                    EngineError::BackendWriteFailed(err.to_string())
                });
            }
        }

        let size = counter.load(Ordering::SeqCst);
        let hash = {
            let guard = hasher.lock().expect("hasher mutex poisoned");
            format!("{:x}", guard.clone().finalize())
        };

        // Zero-byte input is rejected at commit time, since stream length
        // is unknown until it ends.
        if size == 0 {
            let _ = self.backend.delete(&key).await;
            return Err(EngineError::Validation("empty upload".into()));
        }

        // 6. Deduplication.
        if self.config.enable_deduplication {
            if let Some(existing) = self.metastore.find_by_hash(&hash).await? {
                if !existing.is_expired(Utc::now()) {
                    match self.backend.open_read(&existing.file_path).await {
                        Ok(_) => {
                            // Existing object is reachable: this upload is a
                            // true duplicate. Discard what we just wrote.
                            let _ = self.backend.delete(&key).await;
                            debug!(id = %existing.id, "upload deduplicated against existing record");
                            return Ok(existing);
                        }
                        Err(BackendError::NotFound(_)) => {
                            // Stale record, dangling object-less gap: not a
                            // real duplicate. Fall through and commit fresh.
                            warn!(id = %existing.id, "hash matched a record with no reachable object; committing new record");
                        }
                        Err(err) => return Err(EngineError::BackendReadFailed(err.to_string())),
                    }
                }
            }
        }

        // 7. Record commit.
        let stored_name = policy::safe_stored_name(&input.original_name, &hash);
        let record = FileRecord {
            id,
            original_name: input.original_name,
            stored_name,
            mime_type,
            size,
            hash,
            uploaded_at: now,
            ttl: input.ttl,
            expires_at: now + chrono::Duration::seconds(input.ttl as i64),
            file_path: key.clone(),
            metadata: input.metadata,
        };

        if let Err(err) = self.metastore.save(&record).await {
            let _ = self.backend.delete(&key).await;
            return Err(err.into());
        }

        info!(id = %record.id, size = record.size, mime = %record.mime_type, "upload committed");
        Ok(record)
    }

    pub async fn get_file_info(&self, id: Uuid) -> EngineResult<FileRecord> {
        let record = self.metastore.get(id).await?.ok_or(EngineError::NotFound)?;
        if record.is_expired(Utc::now()) {
            return Err(EngineError::Expired);
        }
        Ok(record)
    }

    pub async fn read_file(&self, id: Uuid) -> EngineResult<Vec<u8>> {
        let record = self.get_file_info(id).await?;
        match self.backend.get(&record.file_path).await {
            Ok(bytes) => Ok(bytes),
            Err(BackendError::NotFound(_)) => Err(EngineError::BackendMissing),
            Err(err) => Err(EngineError::BackendReadFailed(err.to_string())),
        }
    }

    pub async fn open_read_stream(&self, id: Uuid) -> EngineResult<ReadStream> {
        let record = self.get_file_info(id).await?;
        match self.backend.open_read(&record.file_path).await {
            Ok(stream) => Ok(stream),
            Err(BackendError::NotFound(_)) => Err(EngineError::BackendMissing),
            Err(err) => Err(EngineError::BackendReadFailed(err.to_string())),
        }
    }

    pub async fn delete_file(&self, id: Uuid) -> EngineResult<FileRecord> {
        let record = self.metastore.get(id).await?.ok_or(EngineError::NotFound)?;
        match self.backend.delete(&record.file_path).await {
            Ok(()) => {}
            Err(err) => return Err(EngineError::BackendWriteFailed(err.to_string())),
        }
        self.metastore.delete(id).await?;
        Ok(record)
    }

    pub async fn search_files(&self, filter: SearchFilter, limit: usize, offset: usize) -> EngineResult<SearchResult> {
        Ok(self.metastore.search(&filter, limit, offset).await?)
    }

    pub async fn get_stats(&self) -> EngineResult<FileStats> {
        Ok(self.metastore.stats().await?)
    }

    pub async fn get_health(&self) -> StorageHealth {
        StorageHealth {
            backend_healthy: self.backend.healthy().await,
            metadata_healthy: self.metastore.healthy().await,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn ObjectBackend> {
        &self.backend
    }

    pub fn metastore(&self) -> &Arc<dyn MetadataStore> {
        &self.metastore
    }

    /// Pull chunks off `stream` until at least [`SNIFF_BUDGET`] bytes have
    /// accumulated (or the stream ends), returning the buffered prefix
    /// chunks and whatever stream remains.
    async fn buffer_prefix<S>(mut stream: S) -> EngineResult<(Vec<Bytes>, Option<S>)>
    where
        S: futures::Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
    {
        use futures::StreamExt;
        let mut chunks = Vec::new();
        let mut total = 0usize;
        loop {
            if total >= SNIFF_BUDGET {
                break;
            }
            match stream.next().await {
                Some(Ok(chunk)) => {
                    total += chunk.len();
                    chunks.push(chunk);
                }
                Some(Err(err)) => return Err(EngineError::Internal(err.to_string())),
                None => return Ok((chunks, None)),
            }
        }
        Ok((chunks, Some(stream)))
    }

    /// Wrap the buffered prefix plus the remaining stream in a single
    /// stream that updates `hasher`/`counter` per chunk and enforces
    /// `max_size`, signalling `size_exceeded` before ending the stream
    /// with an error so the backend sink aborts cleanly.
    fn tee_stream<S>(
        prefix: Vec<Bytes>,
        remainder: Option<S>,
        hasher: Arc<std::sync::Mutex<Sha256>>,
        counter: Arc<AtomicU64>,
        size_exceeded: Arc<AtomicBool>,
        max_size: u64,
    ) -> ByteStream
    where
        S: futures::Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
    {
        use futures::StreamExt;
        let prefix_stream = futures::stream::iter(prefix.into_iter().map(Ok));
        let tail: ByteStream = match remainder {
            Some(rest) => Box::pin(rest),
            None => Box::pin(futures::stream::empty()),
        };
        let combined = prefix_stream.chain(tail);

        Box::pin(combined.map(move |item| match item {
            Ok(chunk) => {
                let new_total = counter.fetch_add(chunk.len() as u64, Ordering::SeqCst) + chunk.len() as u64;
                if new_total > max_size {
                    size_exceeded.store(true, Ordering::SeqCst);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "upload exceeded maximum file size"));
                }
                hasher.lock().expect("hasher mutex poisoned").update(&chunk);
                Ok(chunk)
            }
            Err(err) => Err(err),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FsBackend;
    use crate::metastore::JsonFileStore;
    use futures::stream;

    fn default_config(dir: &std::path::Path) -> StorageConfig {
        StorageConfig {
            base_path: dir.to_string_lossy().to_string(),
            max_file_size: 1024 * 1024,
            min_ttl_secs: 60,
            max_ttl_secs: 10_080 * 60,
            allowed_mime_types: vec![],
            enable_deduplication: true,
        }
    }

    async fn test_engine(dir: &std::path::Path, config: StorageConfig) -> StorageEngine {
        let backend = Arc::new(FsBackend::new(dir).await.unwrap());
        let metastore = Arc::new(JsonFileStore::new(dir));
        metastore.init().await.unwrap();
        StorageEngine::new(backend, metastore, config)
    }

    fn body(data: &'static [u8]) -> impl futures::Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static {
        stream::iter(vec![Ok(Bytes::from_static(data))])
    }

    fn chunked(chunks: Vec<&'static [u8]>) -> impl futures::Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    fn upload(stream: impl futures::Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static, name: &str, mime: &str, ttl: u64) -> UploadInput<impl futures::Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static> {
        UploadInput {
            stream,
            original_name: name.to_string(),
            declared_mime: mime.to_string(),
            ttl,
            metadata: HashMap::new(),
        }
    }

    /// Spec §8 end-to-end scenario 1: upload "hello world", size/mime/hash/
    /// expiry/storedName all match the spec's worked example.
    #[tokio::test]
    async fn upload_matches_hello_world_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path(), default_config(dir.path())).await;

        let before = Utc::now();
        let record = engine
            .save_file(upload(body(b"hello world"), "greeting.txt", "text/plain", 3600))
            .await
            .unwrap();

        assert_eq!(record.size, 11);
        assert_eq!(record.mime_type, "text/plain");
        assert_eq!(record.hash, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
        assert!(record.expires_at >= before + chrono::Duration::seconds(3600));
        assert!(record.stored_name.starts_with("greeting_"));
        assert!(record.stored_name.ends_with(".txt"));

        let bytes = engine.read_file(record.id).await.unwrap();
        assert_eq!(bytes, b"hello world");
    }

    /// Spec §8 invariant: `sha256(ReadFile(id)) == record.hash`, for
    /// arbitrary (non-ASCII) content too.
    #[tokio::test]
    async fn read_file_bytes_hash_to_record_hash() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path(), default_config(dir.path())).await;
        let record = engine
            .save_file(upload(body(b"\x00\x01binary\xffpayload"), "blob.bin", "application/octet-stream", 120))
            .await
            .unwrap();

        let bytes = engine.read_file(record.id).await.unwrap();
        let digest = format!("{:x}", Sha256::digest(&bytes));
        assert_eq!(digest, record.hash);
        assert_eq!(bytes.len() as u64, record.size);
    }

    /// Spec §8 round-trip: two uploads of identical bytes with dedup
    /// enabled return the same id and leave exactly one backend object.
    #[tokio::test]
    async fn duplicate_upload_dedups_to_same_record() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path(), default_config(dir.path())).await;

        let first = engine
            .save_file(upload(body(b"hello world"), "greeting.txt", "text/plain", 3600))
            .await
            .unwrap();
        let second = engine
            .save_file(upload(body(b"hello world"), "other.txt", "text/plain", 3600))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.hash, second.hash);
        let keys = engine.backend().list_keys().await.unwrap();
        assert_eq!(keys.len(), 1);
    }

    /// Without dedup, two identical uploads are two distinct records and
    /// two distinct backend objects (spec §9 dedup-disabled behavior).
    #[tokio::test]
    async fn duplicate_upload_without_dedup_creates_two_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config(dir.path());
        config.enable_deduplication = false;
        let engine = test_engine(dir.path(), config).await;

        let first = engine
            .save_file(upload(body(b"hello world"), "a.txt", "text/plain", 3600))
            .await
            .unwrap();
        let second = engine
            .save_file(upload(body(b"hello world"), "b.txt", "text/plain", 3600))
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        let keys = engine.backend().list_keys().await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    /// Spec §8 boundary: ttl below the configured minimum fails admission;
    /// ttl at the minimum succeeds.
    #[tokio::test]
    async fn ttl_boundary_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path(), default_config(dir.path())).await;

        let err = engine
            .save_file(upload(body(b"x"), "a.txt", "text/plain", 59))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let ok = engine.save_file(upload(body(b"hi"), "a.txt", "text/plain", 60)).await;
        assert!(ok.is_ok());
    }

    /// Spec §3: `originalName` is bounded at 255 chars; a longer name is
    /// rejected at admission, before any backend object is written.
    #[tokio::test]
    async fn original_name_over_255_chars_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path(), default_config(dir.path())).await;
        let long_name = "a".repeat(256);

        let err = engine
            .save_file(upload(body(b"hi"), &long_name, "text/plain", 3600))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(engine.backend().list_keys().await.unwrap().is_empty());
    }

    /// Spec §8 boundary: empty input is rejected at admission, and no
    /// object or record is left behind.
    #[tokio::test]
    async fn empty_upload_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path(), default_config(dir.path())).await;

        let err = engine.save_file(upload(body(b""), "empty.txt", "text/plain", 3600)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(engine.backend().list_keys().await.unwrap().is_empty());
    }

    /// Spec §8 boundary + §4.3.1 edge case: an upload exceeding
    /// `max_file_size` mid-stream fails with `SizeExceeded` and leaves no
    /// reachable object.
    #[tokio::test]
    async fn oversized_upload_is_rejected_and_leaves_no_object() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config(dir.path());
        config.max_file_size = 100;
        let engine = test_engine(dir.path(), config).await;

        let chunks = vec![&[0u8; 50][..], &[0u8; 50][..], &[0u8; 50][..]];
        let err = engine
            .save_file(upload(chunked(chunks), "big.bin", "application/octet-stream", 3600))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SizeExceeded));
        assert!(engine.backend().list_keys().await.unwrap().is_empty());
        assert!(engine.metastore().all_ids().await.unwrap().is_empty());
    }

    /// Spec §4.3.1 step 4: a final mime type outside `allowedMimeTypes`
    /// aborts before any backend object is written.
    #[tokio::test]
    async fn disallowed_mime_type_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = default_config(dir.path());
        config.allowed_mime_types = vec!["application/pdf".to_string()];
        let engine = test_engine(dir.path(), config).await;

        let err = engine
            .save_file(upload(body(b"plain text content"), "a.txt", "text/plain", 3600))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MimeNotAllowed(_)));
        assert!(engine.backend().list_keys().await.unwrap().is_empty());
    }

    /// Spec §8 invariants: after a successful delete, `GetFileInfo`
    /// returns `NotFound`, a second delete also returns `NotFound`, and no
    /// backend object remains.
    #[tokio::test]
    async fn delete_is_idempotent_and_removes_backend_object() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path(), default_config(dir.path())).await;
        let record = engine.save_file(upload(body(b"gone soon"), "a.txt", "text/plain", 3600)).await.unwrap();

        let deleted = engine.delete_file(record.id).await.unwrap();
        assert_eq!(deleted.id, record.id);
        assert!(matches!(engine.get_file_info(record.id).await, Err(EngineError::NotFound)));
        assert!(matches!(engine.delete_file(record.id).await, Err(EngineError::NotFound)));
        assert!(engine.backend().list_keys().await.unwrap().is_empty());
    }

    /// Spec §8 scenario 5: an out-of-band backend delete surfaces
    /// `BackendMissing` on read, while `GetFileInfo` still resolves the
    /// record (only the Expiry Reaper or an explicit delete removes it).
    #[tokio::test]
    async fn backend_missing_is_distinct_from_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path(), default_config(dir.path())).await;
        let record = engine.save_file(upload(body(b"will vanish"), "a.txt", "text/plain", 3600)).await.unwrap();

        engine.backend().delete(&record.file_path).await.unwrap();

        assert!(matches!(engine.read_file(record.id).await, Err(EngineError::BackendMissing)));
        assert!(engine.get_file_info(record.id).await.is_ok());
    }

    /// Spec §8 invariant: `GetStats().totalSize`/`totalFiles` equal the sum
    /// and count of live records, verified under concurrent uploads of
    /// distinct content (spec §8 scenario 6, reduced in scale).
    #[tokio::test]
    async fn concurrent_distinct_uploads_all_land_and_stats_match() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(test_engine(dir.path(), default_config(dir.path())).await);

        let uploads = (0..20).map(|i| {
            let engine = engine.clone();
            async move {
                let data: Vec<u8> = format!("distinct payload number {i}").into_bytes();
                let stream = stream::iter(vec![Ok::<_, io::Error>(Bytes::from(data.clone()))]);
                let record = engine
                    .save_file(UploadInput {
                        stream,
                        original_name: format!("file-{i}.txt"),
                        declared_mime: "text/plain".to_string(),
                        ttl: 3600,
                        metadata: HashMap::new(),
                    })
                    .await
                    .unwrap();
                (record.id, data.len() as u64)
            }
        });

        let results = futures::future::join_all(uploads).await;
        let ids: std::collections::HashSet<_> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids.len(), 20);

        let total_size_expected: u64 = results.iter().map(|(_, size)| size).sum();
        let keys = engine.backend().list_keys().await.unwrap();
        assert_eq!(keys.len(), 20);

        let stats = engine.get_stats().await.unwrap();
        assert_eq!(stats.total_files, 20);
        assert_eq!(stats.total_size, total_size_expected);
    }

    /// Search delegates straight to the metadata store (spec §4.3.4),
    /// paginating and filtering by mime type.
    #[tokio::test]
    async fn search_filters_by_mime_and_paginates() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path(), default_config(dir.path())).await;
        for i in 0..3 {
            engine
                .save_file(upload(body(b"text body"), &format!("t{i}.txt"), "text/plain", 3600))
                .await
                .unwrap();
        }
        engine.save_file(upload(body(b"\x89PNG\r\n"), "p.png", "image/png", 3600)).await.unwrap();

        let filter = SearchFilter { mime_type: Some("text/plain".to_string()), ..Default::default() };
        let page = engine.search_files(filter.clone(), 2, 0).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.records.len(), 2);

        let page2 = engine.search_files(filter, 2, 2).await.unwrap();
        assert_eq!(page2.records.len(), 1);
    }
}

