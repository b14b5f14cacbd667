//! Filesystem object backend.
//!
//! Objects live at `base_path/<key>`. Writes go to a sibling `.tmp` file
//! under `base_path/temp/`, get fsynced, then get renamed into place —
//! rename within one filesystem is atomic, so a reader never observes a
//! partially-written object.

use super::{BackendError, BackendKeyInfo, BackendResult, ByteStream, ObjectBackend, ReadStream};
use async_trait::async_trait;
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Name reserved for in-flight write staging; never treated as a stored
/// object by `list_keys`.
const TEMP_DIR: &str = "temp";
/// Name reserved for the JSON-file metadata store's document, skipped by
/// `list_keys` when both stores share `base_path`.
const METADATA_DOC: &str = "data.json";

pub struct FsBackend {
    base_path: PathBuf,
}

impl FsBackend {
    pub async fn new(base_path: impl Into<PathBuf>) -> BackendResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;
        fs::create_dir_all(base_path.join(TEMP_DIR)).await?;
        Ok(Self { base_path })
    }

    fn resolve(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    async fn walk(dir: PathBuf, base: PathBuf, out: &mut Vec<BackendKeyInfo>) -> BackendResult<()> {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if path.file_name().and_then(|n| n.to_str()) == Some(TEMP_DIR) && path.parent() == Some(&base) {
                    continue;
                }
                Box::pin(Self::walk(path, base.clone(), out)).await?;
                continue;
            }
            let rel = path.strip_prefix(&base).unwrap_or(&path);
            let rel_str = rel.to_string_lossy().replace('\\', "/");
            if rel_str == METADATA_DOC || rel_str.starts_with(&format!("{METADATA_DOC}.tmp")) {
                continue;
            }
            let meta = entry.metadata().await?;
            let modified_at = meta
                .modified()
                .ok()
                .map(chrono::DateTime::<chrono::Utc>::from)
                .unwrap_or_else(chrono::Utc::now);
            out.push(BackendKeyInfo { key: rel_str, modified_at });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for FsBackend {
    async fn put(&self, key: &str, mut stream: ByteStream) -> BackendResult<()> {
        let final_path = self.resolve(key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.base_path.join(TEMP_DIR).join(format!("{}.tmp", Uuid::new_v4()));

        let mut file = fs::File::create(&tmp_path).await?;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BackendError::WriteFailed(err.to_string()));
                }
            };
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BackendError::WriteFailed(err.to_string()));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::WriteFailed(err.to_string()));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::WriteFailed(err.to_string()));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, &final_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BackendError::WriteFailed(err.to_string()));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> BackendResult<Vec<u8>> {
        let path = self.resolve(key);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(BackendError::NotFound(key.to_string())),
            Err(err) => Err(BackendError::ReadFailed(err.to_string())),
        }
    }

    async fn open_read(&self, key: &str) -> BackendResult<ReadStream> {
        let path = self.resolve(key);
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(BackendError::NotFound(key.to_string())),
            Err(err) => Err(BackendError::ReadFailed(err.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        let path = self.resolve(key);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        // Best-effort prune of now-empty parent directories, up to base_path.
        if let Some(parent) = path.parent() {
            let mut current = parent.to_path_buf();
            while current.starts_with(&self.base_path) && current != self.base_path {
                match fs::remove_dir(&current).await {
                    Ok(()) => match current.parent() {
                        Some(p) => current = p.to_path_buf(),
                        None => break,
                    },
                    Err(_) => break,
                }
            }
        }
        Ok(())
    }

    async fn list_keys(&self) -> BackendResult<Vec<BackendKeyInfo>> {
        let mut out = Vec::new();
        Self::walk(self.base_path.clone(), self.base_path.clone(), &mut out).await?;
        Ok(out)
    }

    async fn healthy(&self) -> bool {
        matches!(fs::metadata(&self.base_path).await, Ok(meta) if meta.is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;

    fn body(data: &'static [u8]) -> ByteStream {
        Box::pin(stream::iter(vec![Ok(Bytes::from_static(data))]))
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path()).await.unwrap();
        backend.put("2026-07/a.txt", body(b"hello world")).await.unwrap();
        let bytes = backend.get("2026-07/a.txt").await.unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path()).await.unwrap();
        backend.put("a.txt", body(b"x")).await.unwrap();
        backend.delete("a.txt").await.unwrap();
        backend.delete("a.txt").await.unwrap();
        assert!(matches!(backend.get("a.txt").await, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_keys_skips_temp_and_metadata_doc() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path()).await.unwrap();
        backend.put("2026-07/a.txt", body(b"hello")).await.unwrap();
        tokio::fs::write(dir.path().join(METADATA_DOC), b"{}").await.unwrap();
        let keys: Vec<_> = backend.list_keys().await.unwrap().into_iter().map(|k| k.key).collect();
        assert_eq!(keys, vec!["2026-07/a.txt".to_string()]);
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_object() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path()).await.unwrap();
        let bad: ByteStream = Box::pin(stream::iter(vec![Err(std::io::Error::other("boom"))]));
        let err = backend.put("a.txt", bad).await;
        assert!(err.is_err());
        assert!(matches!(backend.get("a.txt").await, Err(BackendError::NotFound(_))));
    }
}
