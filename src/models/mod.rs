//! Core data model for the temporary file cache service.
//!
//! These entities represent the logical structure of a stored file and the
//! process-wide configuration the storage engine is built with. They
//! serialize naturally as JSON via `serde` for both the JSON-file metadata
//! store and the HTTP surface.

pub mod record;

pub use record::{FileRecord, FileStats, MetadataValue, ReaperStats, StorageConfig, StorageHealth};
