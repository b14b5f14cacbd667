//! S3-compatible object backend (feature = "s3").
//!
//! Uses a single multipart upload per `put` so the backend never needs to
//! know the stream length up front. Deletes are single-object deletes;
//! `list_keys` paginates through `ListObjectsV2`.

use super::{BackendError, BackendKeyInfo, BackendResult, ByteStream, ObjectBackend, ReadStream};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream as AwsByteStream;
use aws_sdk_s3::Client;
use futures::StreamExt;
use tokio_util::io::StreamReader;

/// Parts below this size are batched into one buffer before upload; AWS
/// requires every part but the last to be at least 5 MiB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    pub async fn new(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        let client = Client::new(&config);
        Self { client, bucket: bucket.into() }
    }

    pub fn with_client(client: Client, bucket: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into() }
    }

    async fn abort(&self, key: &str, upload_id: &str) {
        let _ = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        bytes: Vec<u8>,
    ) -> BackendResult<aws_sdk_s3::types::CompletedPart> {
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(AwsByteStream::from(bytes))
            .send()
            .await
            .map_err(|err| BackendError::WriteFailed(err.to_string()))?;
        Ok(aws_sdk_s3::types::CompletedPart::builder()
            .part_number(part_number)
            .set_e_tag(resp.e_tag().map(|s| s.to_string()))
            .build())
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn put(&self, key: &str, mut stream: ByteStream) -> BackendResult<()> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| BackendError::WriteFailed(err.to_string()))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| BackendError::WriteFailed("missing upload id".into()))?
            .to_string();

        let mut completed = Vec::new();
        let mut buffer: Vec<u8> = Vec::new();
        let mut part_number = 1i32;

        loop {
            match stream.next().await {
                Some(Ok(chunk)) => {
                    buffer.extend_from_slice(&chunk);
                    if buffer.len() >= MIN_PART_SIZE {
                        let bytes = std::mem::take(&mut buffer);
                        match self.upload_part(key, &upload_id, part_number, bytes).await {
                            Ok(part) => {
                                completed.push(part);
                                part_number += 1;
                            }
                            Err(err) => {
                                self.abort(key, &upload_id).await;
                                return Err(err);
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    self.abort(key, &upload_id).await;
                    return Err(BackendError::WriteFailed(err.to_string()));
                }
                None => break,
            }
        }

        // Flush the trailing partial part, even if it's the only part and
        // smaller than MIN_PART_SIZE (a single-part upload has no minimum).
        if !buffer.is_empty() || completed.is_empty() {
            match self.upload_part(key, &upload_id, part_number, buffer).await {
                Ok(part) => completed.push(part),
                Err(err) => {
                    self.abort(key, &upload_id).await;
                    return Err(err);
                }
            }
        }

        let complete = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(complete)
            .send()
            .await
            .map_err(|err| BackendError::WriteFailed(err.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> BackendResult<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify_get_err(key, err))?;
        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|err| BackendError::ReadFailed(err.to_string()))?
            .into_bytes();
        Ok(bytes.to_vec())
    }

    async fn open_read(&self, key: &str) -> BackendResult<ReadStream> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| classify_get_err(key, err))?;
        let stream = resp.body.map(|r| r.map_err(std::io::Error::other));
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn delete(&self, key: &str) -> BackendResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| BackendError::WriteFailed(err.to_string()))?;
        Ok(())
    }

    async fn list_keys(&self) -> BackendResult<Vec<BackendKeyInfo>> {
        let mut out = Vec::new();
        let mut continuation = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(token) = continuation.clone() {
                req = req.continuation_token(token);
            }
            let resp = req.send().await.map_err(|err| BackendError::ReadFailed(err.to_string()))?;
            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    let modified_at = obj
                        .last_modified()
                        .and_then(|dt| chrono::DateTime::from_timestamp(dt.secs(), 0))
                        .unwrap_or_else(chrono::Utc::now);
                    out.push(BackendKeyInfo { key: key.to_string(), modified_at });
                }
            }
            if resp.is_truncated().unwrap_or(false) {
                continuation = resp.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }
        Ok(out)
    }

    async fn healthy(&self) -> bool {
        self.client.head_bucket().bucket(&self.bucket).send().await.is_ok()
    }
}

fn classify_get_err(
    key: &str,
    err: aws_sdk_s3::error::SdkError<impl std::error::Error + 'static>,
) -> BackendError {
    if err.to_string().contains("NoSuchKey") {
        BackendError::NotFound(key.to_string())
    } else {
        BackendError::ReadFailed(err.to_string())
    }
}
