//! JSON-file backed metadata store.
//!
//! All mutations go through a single in-process mutex guarding a
//! read-modify-write-rename sequence: the in-memory document is mutated,
//! serialized to `data.json.tmp.<unique>`, then renamed onto `data.json`.
//! Rename on the same filesystem is atomic, so a concurrent reader of the
//! file on disk never observes a torn document; within this process, the
//! mutex additionally prevents lost updates between concurrent writers.

use super::{MetaResult, MetaStoreError, MetadataStore, SearchFilter, SearchResult};
use crate::models::{FileRecord, FileStats};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Default, Clone)]
struct Document {
    records: HashMap<Uuid, FileRecord>,
}

pub struct JsonFileStore {
    doc_path: PathBuf,
    state: Mutex<Document>,
}

impl JsonFileStore {
    /// Construct without touching disk; call `init()` before use.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            doc_path: base_path.into().join("data.json"),
            state: Mutex::new(Document::default()),
        }
    }

    async fn persist(&self, doc: &Document) -> MetaResult<()> {
        let serialized = serde_json::to_vec_pretty(doc)
            .map_err(|err| MetaStoreError::WriteFailed(err.to_string()))?;
        let tmp_path = self.doc_path.with_extension(format!("json.tmp.{}", Uuid::new_v4()));
        fs::write(&tmp_path, &serialized)
            .await
            .map_err(|err| MetaStoreError::WriteFailed(err.to_string()))?;
        fs::rename(&tmp_path, &self.doc_path)
            .await
            .map_err(|err| MetaStoreError::WriteFailed(err.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonFileStore {
    async fn init(&self) -> MetaResult<()> {
        if let Some(parent) = self.doc_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| MetaStoreError::WriteFailed(err.to_string()))?;
        }
        let raw = match fs::read(&self.doc_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let mut state = self.state.lock().await;
                *state = Document::default();
                drop(state);
                return self.persist(&Document::default()).await;
            }
            Err(err) => return Err(MetaStoreError::ReadFailed(err.to_string())),
        };

        let doc: Document = match serde_json::from_slice(&raw) {
            Ok(doc) => doc,
            Err(err) => {
                warn!("corrupted metadata document, archiving and reinitializing: {}", err);
                let archive_path = self.doc_path.with_extension(format!(
                    "json.corrupt.{}",
                    Utc::now().format("%Y%m%dT%H%M%S")
                ));
                let _ = fs::rename(&self.doc_path, &archive_path).await;
                Document::default()
            }
        };

        let mut state = self.state.lock().await;
        *state = doc.clone();
        drop(state);
        self.persist(&doc).await
    }

    async fn save(&self, record: &FileRecord) -> MetaResult<()> {
        let mut state = self.state.lock().await;
        state.records.insert(record.id, record.clone());
        self.persist(&state).await
    }

    async fn get(&self, id: Uuid) -> MetaResult<Option<FileRecord>> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> MetaResult<()> {
        let mut state = self.state.lock().await;
        if state.records.remove(&id).is_some() {
            self.persist(&state).await?;
        } else {
            debug!("delete of absent id {} is a no-op", id);
        }
        Ok(())
    }

    async fn find_by_hash(&self, hash: &str) -> MetaResult<Option<FileRecord>> {
        let state = self.state.lock().await;
        Ok(state.records.values().find(|r| r.hash == hash).cloned())
    }

    async fn search(&self, filter: &SearchFilter, limit: usize, offset: usize) -> MetaResult<SearchResult> {
        let state = self.state.lock().await;
        let now = Utc::now();
        let mut matched: Vec<FileRecord> = state
            .records
            .values()
            .filter(|r| {
                if filter.expired_only && !r.is_expired(now) {
                    return false;
                }
                if !filter.expired_only && !filter.include_expired && r.is_expired(now) {
                    return false;
                }
                if let Some(mime) = &filter.mime_type {
                    if &r.mime_type != mime {
                        return false;
                    }
                }
                if let Some(min) = filter.min_size {
                    if r.size < min {
                        return false;
                    }
                }
                if let Some(max) = filter.max_size {
                    if r.size > max {
                        return false;
                    }
                }
                if let Some(after) = filter.uploaded_after {
                    if r.uploaded_at < after {
                        return false;
                    }
                }
                if let Some(before) = filter.uploaded_before {
                    if r.uploaded_at > before {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        let total = matched.len() as u64;
        let page = matched.into_iter().skip(offset).take(limit).collect();
        Ok(SearchResult { records: page, total })
    }

    async fn all_ids(&self) -> MetaResult<Vec<Uuid>> {
        let state = self.state.lock().await;
        Ok(state.records.keys().copied().collect())
    }

    async fn stats(&self) -> MetaResult<FileStats> {
        let state = self.state.lock().await;
        let now = Utc::now();
        let mut stats = FileStats::default();
        for record in state.records.values() {
            if record.is_expired(now) {
                continue;
            }
            stats.total_files += 1;
            stats.total_size += record.size;
            *stats.files_by_mime.entry(record.mime_type.clone()).or_insert(0) += 1;
            let date_key = record.uploaded_at.format("%Y-%m-%d").to_string();
            *stats.files_by_date.entry(date_key).or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn healthy(&self) -> bool {
        self.doc_path
            .parent()
            .map(|p| p.exists())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MetadataValue;
    use std::collections::HashMap as StdHashMap;

    fn sample_record(id: Uuid, hash: &str, uploaded_at: chrono::DateTime<Utc>, ttl_secs: i64) -> FileRecord {
        FileRecord {
            id,
            original_name: "greeting.txt".into(),
            stored_name: "greeting_abcd1234.txt".into(),
            mime_type: "text/plain".into(),
            size: 11,
            hash: hash.into(),
            uploaded_at,
            ttl: ttl_secs as u64,
            expires_at: uploaded_at + chrono::Duration::seconds(ttl_secs),
            file_path: format!("2026-07/{id}.txt"),
            metadata: StdHashMap::<String, MetadataValue>::new(),
        }
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.init().await.unwrap();
        let id = Uuid::new_v4();
        let record = sample_record(id, "deadbeef", Utc::now(), 3600);
        store.save(&record).await.unwrap();
        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.hash, "deadbeef");
    }

    #[tokio::test]
    async fn find_by_hash_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.init().await.unwrap();
        let id = Uuid::new_v4();
        let record = sample_record(id, "cafebabe", Utc::now(), 3600);
        store.save(&record).await.unwrap();
        let found = store.find_by_hash("cafebabe").await.unwrap().unwrap();
        assert_eq!(found.id, id);
    }

    #[tokio::test]
    async fn delete_then_get_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.init().await.unwrap();
        let id = Uuid::new_v4();
        let record = sample_record(id, "facefeed", Utc::now(), 3600);
        store.save(&record).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(store.get(id).await.unwrap().is_none());
        // Second delete is a no-op, not an error.
        store.delete(id).await.unwrap();
    }

    #[tokio::test]
    async fn search_expired_only_filters_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        store.init().await.unwrap();
        let live = sample_record(Uuid::new_v4(), "live", Utc::now(), 3600);
        let expired = sample_record(Uuid::new_v4(), "expired", Utc::now() - chrono::Duration::seconds(120), 60);
        store.save(&live).await.unwrap();
        store.save(&expired).await.unwrap();

        let result = store
            .search(&SearchFilter { expired_only: true, ..Default::default() }, 100, 0)
            .await
            .unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].hash, "expired");
    }

    #[tokio::test]
    async fn corrupted_document_reinitializes_empty() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("data.json"), b"{not json").await.unwrap();
        let store = JsonFileStore::new(dir.path());
        store.init().await.unwrap();
        assert!(store.all_ids().await.unwrap().is_empty());
    }
}
