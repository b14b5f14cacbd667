//! Redis-backed metadata store (feature = "redis-store").
//!
//! Key layout, exactly as specified:
//! - `file:<id>`            -> serialized [`FileRecord`] (canonical storage)
//! - `hash:<hex>`            -> id, for `find_by_hash`
//! - sorted set `expiry`     scored by `expires_at` epoch -> id
//! - sorted set `uploaded`   scored by `uploaded_at` epoch -> id
//! - `stats:total_files` / `stats:total_size` aggregate counters
//!
//! `save` and `delete` are each a single pipelined, atomic multi-command
//! write so the canonical record and every index entry move together.

use super::{MetaResult, MetaStoreError, MetadataStore, SearchFilter, SearchResult};
use crate::models::{FileRecord, FileStats};
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use uuid::Uuid;

pub struct KvStore {
    client: redis::Client,
}

impl KvStore {
    pub fn new(redis_url: &str) -> MetaResult<Self> {
        let client = redis::Client::open(redis_url).map_err(|err| MetaStoreError::WriteFailed(err.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> MetaResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| MetaStoreError::ReadFailed(err.to_string()))
    }

    fn file_key(id: Uuid) -> String {
        format!("file:{id}")
    }

    fn hash_key(hash: &str) -> String {
        format!("hash:{hash}")
    }
}

#[async_trait]
impl MetadataStore for KvStore {
    async fn init(&self) -> MetaResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|err| MetaStoreError::ReadFailed(err.to_string()))?;
        Ok(())
    }

    async fn save(&self, record: &FileRecord) -> MetaResult<()> {
        let mut conn = self.conn().await?;
        let serialized = serde_json::to_string(record).map_err(|err| MetaStoreError::WriteFailed(err.to_string()))?;

        // Remove this id's old index entries in case of a stored-name/hash
        // change across an upsert (never happens in practice today, since
        // records are write-once, but keeps `save` genuinely idempotent).
        let previous: Option<String> = conn
            .get(Self::file_key(record.id))
            .await
            .map_err(|err| MetaStoreError::ReadFailed(err.to_string()))?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(raw) = previous {
            if let Ok(prev) = serde_json::from_str::<FileRecord>(&raw) {
                pipe.del(Self::hash_key(&prev.hash)).ignore();
            }
        }
        pipe.set(Self::file_key(record.id), serialized).ignore();
        pipe.set(Self::hash_key(&record.hash), record.id.to_string()).ignore();
        pipe.zadd("expiry", record.id.to_string(), record.expires_at.timestamp()).ignore();
        pipe.zadd("uploaded", record.id.to_string(), record.uploaded_at.timestamp()).ignore();
        pipe.incr("stats:total_files", 1i64).ignore();
        pipe.incr("stats:total_size", record.size as i64).ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|err| MetaStoreError::WriteFailed(err.to_string()))?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> MetaResult<Option<FileRecord>> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(Self::file_key(id))
            .await
            .map_err(|err| MetaStoreError::ReadFailed(err.to_string()))?;
        match raw {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).map_err(|err| MetaStoreError::ReadFailed(err.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: Uuid) -> MetaResult<()> {
        let Some(record) = self.get(id).await? else {
            return Ok(());
        };
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(Self::file_key(id)).ignore();
        pipe.del(Self::hash_key(&record.hash)).ignore();
        pipe.zrem("expiry", id.to_string()).ignore();
        pipe.zrem("uploaded", id.to_string()).ignore();
        pipe.decr("stats:total_files", 1i64).ignore();
        pipe.decr("stats:total_size", record.size as i64).ignore();
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|err| MetaStoreError::WriteFailed(err.to_string()))?;
        Ok(())
    }

    async fn find_by_hash(&self, hash: &str) -> MetaResult<Option<FileRecord>> {
        let mut conn = self.conn().await?;
        let id: Option<String> = conn
            .get(Self::hash_key(hash))
            .await
            .map_err(|err| MetaStoreError::ReadFailed(err.to_string()))?;
        match id.and_then(|s| Uuid::parse_str(&s).ok()) {
            Some(id) => self.get(id).await,
            None => Ok(None),
        }
    }

    async fn search(&self, filter: &SearchFilter, limit: usize, offset: usize) -> MetaResult<SearchResult> {
        // `uploaded` is the ordering index; walk it newest-first and apply
        // the remaining filters in process, same as the JSON-file store.
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .zrevrange("uploaded", 0, -1)
            .await
            .map_err(|err| MetaStoreError::ReadFailed(err.to_string()))?;

        let now = Utc::now();
        let mut matched = Vec::new();
        for id_str in ids {
            let Ok(id) = Uuid::parse_str(&id_str) else { continue };
            let Some(record) = self.get(id).await? else { continue };
            if filter.expired_only && !record.is_expired(now) {
                continue;
            }
            if !filter.expired_only && !filter.include_expired && record.is_expired(now) {
                continue;
            }
            if let Some(mime) = &filter.mime_type {
                if &record.mime_type != mime {
                    continue;
                }
            }
            if let Some(min) = filter.min_size {
                if record.size < min {
                    continue;
                }
            }
            if let Some(max) = filter.max_size {
                if record.size > max {
                    continue;
                }
            }
            if let Some(after) = filter.uploaded_after {
                if record.uploaded_at < after {
                    continue;
                }
            }
            if let Some(before) = filter.uploaded_before {
                if record.uploaded_at > before {
                    continue;
                }
            }
            matched.push(record);
        }

        let total = matched.len() as u64;
        let page = matched.into_iter().skip(offset).take(limit).collect();
        Ok(SearchResult { records: page, total })
    }

    async fn all_ids(&self) -> MetaResult<Vec<Uuid>> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .zrange("uploaded", 0, -1)
            .await
            .map_err(|err| MetaStoreError::ReadFailed(err.to_string()))?;
        Ok(ids.into_iter().filter_map(|s| Uuid::parse_str(&s).ok()).collect())
    }

    async fn stats(&self) -> MetaResult<FileStats> {
        // Only the scalar counters come from Redis directly; the by-mime
        // and by-date breakdowns require a full scan, same cost as the
        // JSON-file store pays in memory.
        let ids = self.all_ids().await?;
        let now = Utc::now();
        let mut stats = FileStats::default();
        for id in ids {
            let Some(record) = self.get(id).await? else { continue };
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
        self.conn().await.is_ok()
    }
}
