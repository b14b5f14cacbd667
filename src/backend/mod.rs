//! Object backend trait and implementations.
//!
//! Defines the unified interface the storage engine uses for byte-level
//! persistence, independent of which concrete backend (local filesystem or
//! S3-compatible) is configured at startup.

pub mod fs;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::io;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncRead;

pub use fs::FsBackend;
#[cfg(feature = "s3")]
pub use s3::S3Backend;

pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;
pub type ReadStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object not found at key `{0}`")]
    NotFound(String),
    #[error("backend write failed: {0}")]
    WriteFailed(String),
    #[error("backend read failed: {0}")]
    ReadFailed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Metadata about a single backend key, used by the orphan reaper to judge
/// whether an unreferenced object is old enough to be worth deleting.
#[derive(Debug, Clone)]
pub struct BackendKeyInfo {
    pub key: String,
    pub modified_at: chrono::DateTime<chrono::Utc>,
}

/// Byte-level persistence capability set the storage engine depends on.
///
/// Implementations must guarantee `put` is atomic: either the full object is
/// readable after it returns, or no object exists at `key`.
#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Consume `stream` to completion and store it under `key`.
    async fn put(&self, key: &str, stream: ByteStream) -> BackendResult<()>;

    /// Whole-buffer read, for small consumers.
    async fn get(&self, key: &str) -> BackendResult<Vec<u8>>;

    /// Lazy read; caller is responsible for driving the stream to
    /// completion (or dropping it, which releases any underlying handle).
    async fn open_read(&self, key: &str) -> BackendResult<ReadStream>;

    /// Idempotent delete; an absent key is not an error.
    async fn delete(&self, key: &str) -> BackendResult<()>;

    /// Enumerate every key currently stored, with the store's recorded
    /// modification time for each. Ordering is unspecified.
    async fn list_keys(&self) -> BackendResult<Vec<BackendKeyInfo>>;

    /// Cheap liveness probe.
    async fn healthy(&self) -> bool;
}
