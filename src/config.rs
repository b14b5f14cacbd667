//! Centralized application configuration.
//!
//! Combines environment variables and CLI arguments (teacher's
//! env+CLI merge pattern), extended to cover every key in spec §6.4.

use crate::models::StorageConfig;
use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Backend/store selection. Defaults to the dependency-free pairing
/// (filesystem + JSON-file) so the crate runs with zero external services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Filesystem,
    #[cfg(feature = "s3")]
    S3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaStoreKind {
    JsonFile,
    #[cfg(feature = "redis-store")]
    Redis,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Temporary file cache storage engine")]
pub struct Args {
    /// Host to bind to (overrides HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects and the JSON metadata document are stored
    /// (overrides STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,
}

/// Process-wide application configuration, assembled once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,

    pub storage: StorageConfig,

    pub backend: BackendKind,
    pub metastore: MetaStoreKind,

    /// `s3://bucket` or redis URL, depending on the selected backend/store.
    pub s3_bucket: Option<String>,
    pub redis_url: Option<String>,

    pub cleanup_cron: String,
    pub cleanup_batch_size: usize,
    pub orphan_grace_secs: i64,
    pub orphan_interval_secs: u64,

    pub auth_enabled: bool,
    pub auth_token: Option<String>,

    pub api_base: String,
    pub api_version: String,

    /// `TZ` (spec §6.4): accepted and carried for display purposes only.
    /// Storage always computes and persists timestamps in UTC regardless
    /// of this value — advisory, like `allowDuplicate` on the upload
    /// handler, never silently dropped.
    pub display_timezone: String,
}

const DEFAULT_MIN_TTL_SECS: u64 = 60;
const DEFAULT_MAX_BATCH_CEILING: usize = 10_000;

impl AppConfig {
    /// Parse environment variables + CLI args into an `AppConfig`.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        let host = args.host.unwrap_or_else(|| env_or("HOST", "0.0.0.0"));
        let port = match args.port {
            Some(port) => port,
            None => env_parsed("PORT", 3000u16)?,
        };
        let storage_dir = match args.storage_dir {
            Some(dir) => dir,
            None => env_string_required("STORAGE_DIR")?,
        };

        let max_file_size_mb: u64 = env_parsed("MAX_FILE_SIZE_MB", 100u64)?;
        let max_ttl_min: u64 = env_parsed("MAX_TTL_MIN", 10_080u64)?;
        let allowed_mime_types = parse_mime_list(&env_or("ALLOWED_MIME_TYPES", "[]"))?;
        let enable_deduplication: bool = env_parsed("ENABLE_DEDUPLICATION", true)?;

        let cleanup_cron = env_or("CLEANUP_CRON", "0 */10 * * * *");
        let cleanup_batch_size: usize = env_parsed("CLEANUP_BATCH_SIZE", 100usize)?;

        let auth_enabled: bool = env_parsed("AUTH_ENABLED", true)?;
        let auth_token = env::var("AUTH_TOKEN").ok();
        if auth_enabled && auth_token.is_none() {
            anyhow::bail!("AUTH_TOKEN is required when AUTH_ENABLED is true");
        }

        let storage = StorageConfig {
            base_path: storage_dir,
            max_file_size: max_file_size_mb * 1024 * 1024,
            min_ttl_secs: DEFAULT_MIN_TTL_SECS,
            max_ttl_secs: max_ttl_min * 60,
            allowed_mime_types,
            enable_deduplication,
        };

        let backend = match env_or("OBJECT_BACKEND", "filesystem").as_str() {
            "filesystem" => BackendKind::Filesystem,
            #[cfg(feature = "s3")]
            "s3" => BackendKind::S3,
            other => anyhow::bail!("unknown OBJECT_BACKEND `{other}`"),
        };
        let metastore = match env_or("METADATA_STORE", "json").as_str() {
            "json" => MetaStoreKind::JsonFile,
            #[cfg(feature = "redis-store")]
            "redis" => MetaStoreKind::Redis,
            other => anyhow::bail!("unknown METADATA_STORE `{other}`"),
        };

        Ok(Self {
            host,
            port,
            storage,
            backend,
            metastore,
            s3_bucket: env::var("S3_BUCKET").ok(),
            redis_url: env::var("REDIS_URL").ok(),
            cleanup_cron,
            cleanup_batch_size: cleanup_batch_size.min(DEFAULT_MAX_BATCH_CEILING),
            orphan_grace_secs: env_parsed("ORPHAN_GRACE_SECS", 60i64)?,
            orphan_interval_secs: env_parsed("ORPHAN_INTERVAL_SECS", 300u64)?,
            auth_enabled,
            auth_token,
            api_base: env_or("API_BASE", "api"),
            api_version: env_or("API_VERSION", "v1"),
            display_timezone: env_or("TZ", "UTC"),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn api_prefix(&self) -> String {
        format!("/{}/{}", self.api_base, self.api_version)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_string_required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{key} is required"))
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("parsing {key} value `{value}`: {err}")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {key}")),
    }
}

/// `ALLOWED_MIME_TYPES` is a JSON array of strings; an empty array (or
/// unset) means "permit all".
fn parse_mime_list(raw: &str) -> Result<Vec<String>> {
    let parsed: Vec<String> =
        serde_json::from_str(raw).with_context(|| format!("parsing ALLOWED_MIME_TYPES `{raw}` as a JSON array"))?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mime_list_empty_permits_all() {
        assert_eq!(parse_mime_list("[]").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn parse_mime_list_rejects_non_json() {
        assert!(parse_mime_list("not json").is_err());
    }
}
