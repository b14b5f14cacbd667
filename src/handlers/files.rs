//! HTTP handlers for the `/files` resource (spec §6.2).
//!
//! Streams upload/download bodies to avoid buffering whole files in
//! memory and delegates every storage concern to `StorageEngine`,
//! generalizing the teacher's `object_handlers.rs` S3-object routes to
//! this crate's flat file resource.

use crate::engine::{EngineError, StorageEngine, UploadInput};
use crate::errors::AppError;
use crate::metastore::SearchFilter;
use crate::models::{FileRecord, MetadataValue};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Chunks buffered between the multipart field reader and the storage
/// engine's consuming side, bounding memory for a fast-producer/
/// slow-backend mismatch (spec §5 backpressure).
const UPLOAD_CHANNEL_CAPACITY: usize = 16;

/// Query params accepted by `GET /files`.
#[derive(Debug, Deserialize, Default)]
pub struct SearchQuery {
    #[serde(rename = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(rename = "minSize")]
    pub min_size: Option<u64>,
    #[serde(rename = "maxSize")]
    pub max_size: Option<u64>,
    #[serde(rename = "uploadedAfter")]
    pub uploaded_after: Option<DateTime<Utc>>,
    #[serde(rename = "uploadedBefore")]
    pub uploaded_before: Option<DateTime<Utc>>,
    #[serde(rename = "expiredOnly", default)]
    pub expired_only: bool,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

const DEFAULT_SEARCH_LIMIT: usize = 50;
const MAX_SEARCH_LIMIT: usize = 1000;

#[derive(Debug, Serialize)]
pub struct FileRecordView {
    pub id: Uuid,
    #[serde(rename = "originalName")]
    pub original_name: String,
    #[serde(rename = "storedName")]
    pub stored_name: String,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub size: u64,
    pub hash: String,
    #[serde(rename = "uploadedAt")]
    pub uploaded_at: DateTime<Utc>,
    pub ttl: u64,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    pub metadata: HashMap<String, MetadataValue>,
}

impl From<FileRecord> for FileRecordView {
    fn from(r: FileRecord) -> Self {
        Self {
            id: r.id,
            original_name: r.original_name,
            stored_name: r.stored_name,
            mime_type: r.mime_type,
            size: r.size,
            hash: r.hash,
            uploaded_at: r.uploaded_at,
            ttl: r.ttl,
            expires_at: r.expires_at,
            metadata: r.metadata,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub records: Vec<FileRecordView>,
    pub total: u64,
    pub limit: usize,
    pub offset: usize,
}

/// `POST /files` — multipart upload. Fields: `file` (required), `ttl`
/// (seconds), `metadata` (JSON object), `allowDuplicate` (bool).
///
/// `allowDuplicate` is accepted for API compatibility but is advisory
/// only (spec §9 Open Question): dedup is governed solely by
/// `StorageConfig.enable_deduplication`, never by this per-request flag.
///
/// Non-`file` fields must arrive before `file` in the multipart body:
/// `multer` (axum's multipart parser) consumes the body sequentially, so
/// once the `file` field's stream is being read there is no way to go
/// back for trailing fields. This matches every common multipart client's
/// convention of sending plain fields before the binary payload.
pub async fn upload(
    State(engine): State<Arc<StorageEngine>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut ttl: Option<u64> = None;
    let mut metadata: HashMap<String, MetadataValue> = HashMap::new();

    let file_field = loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| AppError::validation(format!("invalid multipart body: {err}")))?
            .ok_or_else(|| AppError::validation("missing `file` field"))?;

        match field.name().unwrap_or("") {
            "file" => break field,
            "ttl" => {
                let text = field.text().await.map_err(|err| AppError::validation(err.to_string()))?;
                ttl = Some(text.trim().parse::<u64>().map_err(|_| AppError::validation("ttl must be an integer"))?);
            }
            "metadata" => {
                let text = field.text().await.map_err(|err| AppError::validation(err.to_string()))?;
                if !text.trim().is_empty() {
                    metadata = serde_json::from_str(&text)
                        .map_err(|err| AppError::validation(format!("metadata must be a JSON object: {err}")))?;
                }
            }
            // Advisory only; see doc comment above.
            "allowDuplicate" => {
                let _ = field.text().await;
            }
            _ => {
                let _ = field.bytes().await;
            }
        }
    };

    let original_name = file_field.file_name().map(|n| n.to_string()).unwrap_or_else(|| "upload".to_string());
    let declared_mime = file_field.content_type().map(|c| c.to_string()).unwrap_or_else(|| "application/octet-stream".to_string());
    let ttl = ttl.ok_or_else(|| AppError::validation("missing `ttl` field"))?;

    // `file_field` borrows `multipart` and so cannot cross the `'static`
    // bound `StorageEngine::save_file` needs for its backend sink. Pump it
    // into a channel-backed stream that owns its buffered chunks instead;
    // both sides run concurrently in this same task (no `tokio::spawn`,
    // so the borrow never needs to outlive this function).
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(UPLOAD_CHANNEL_CAPACITY);
    let pump = async move {
        let mut field = file_field;
        loop {
            match field.next().await {
                Some(Ok(chunk)) => {
                    if tx.send(Ok(chunk)).await.is_err() {
                        break;
                    }
                }
                Some(Err(err)) => {
                    let _ = tx.send(Err(io::Error::other(err.to_string()))).await;
                    break;
                }
                None => break,
            }
        }
    };
    let stream = ReceiverStream::new(rx);

    let (result, ()) = tokio::join!(
        engine.save_file(UploadInput { stream, original_name, declared_mime, ttl, metadata }),
        pump
    );
    let record = result?;

    Ok((StatusCode::CREATED, Json(FileRecordView::from(record))))
}

/// `GET /files` — search/list.
pub async fn list(
    State(engine): State<Arc<StorageEngine>>,
    Query(q): Query<SearchQuery>,
) -> Result<impl IntoResponse, AppError> {
    let filter = SearchFilter {
        mime_type: q.mime_type,
        min_size: q.min_size,
        max_size: q.max_size,
        uploaded_after: q.uploaded_after,
        uploaded_before: q.uploaded_before,
        expired_only: q.expired_only,
    };
    let limit = q.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).min(MAX_SEARCH_LIMIT);
    let offset = q.offset.unwrap_or(0);

    let result = engine.search_files(filter, limit, offset).await?;
    Ok(Json(SearchResponse {
        records: result.records.into_iter().map(FileRecordView::from).collect(),
        total: result.total,
        limit,
        offset,
    }))
}

/// `GET /files/stats`
pub async fn stats(State(engine): State<Arc<StorageEngine>>) -> Result<impl IntoResponse, AppError> {
    Ok(Json(engine.get_stats().await?))
}

/// `GET /files/{id}`
pub async fn info(
    State(engine): State<Arc<StorageEngine>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let record = engine.get_file_info(id).await?;
    Ok(Json(FileRecordView::from(record)))
}

/// `GET /files/{id}/exists`
pub async fn exists(
    State(engine): State<Arc<StorageEngine>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let exists = match engine.get_file_info(id).await {
        Ok(_) => true,
        Err(EngineError::NotFound) | Err(EngineError::Expired) => false,
        Err(err) => return Err(err.into()),
    };
    Ok(Json(serde_json::json!({ "exists": exists })))
}

/// `GET /files/{id}/download` — streams content with a
/// `Content-Disposition: attachment` header.
pub async fn download(
    State(engine): State<Arc<StorageEngine>>,
    Path(id): Path<Uuid>,
) -> Result<Response, AppError> {
    let record = engine.get_file_info(id).await?;
    let stream = engine.open_read_stream(id).await?;
    let body = Body::from_stream(ReaderStream::new(stream));

    let disposition = format!(
        "attachment; filename=\"{}\"",
        record.original_name.replace('"', "")
    );

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_str(&record.mime_type)
            .unwrap_or_else(|_| header::HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        header::HeaderValue::from_str(&record.size.to_string()).unwrap_or_else(|_| header::HeaderValue::from_static("0")),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        header::HeaderValue::from_str(&disposition).unwrap_or_else(|_| header::HeaderValue::from_static("attachment")),
    );
    Ok(response)
}

/// `DELETE /files/{id}`
pub async fn delete(
    State(engine): State<Arc<StorageEngine>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let record = engine.delete_file(id).await?;
    Ok(Json(FileRecordView::from(record)))
}
