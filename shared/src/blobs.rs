use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use base64::Engine;

use crate::error::ApiError;
use crate::types::UploadFile;

#[derive(Debug, thiserror::Error)]
#[error("blob storage error: {0}")]
pub struct BlobError(pub String);

impl From<BlobError> for ApiError {
    fn from(e: BlobError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// Where an uploaded file ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub key: String,
    pub url: String,
}

pub trait BlobStore: Send + Sync {
    fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> impl Future<Output = Result<StoredBlob, BlobError>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = Result<(), BlobError>> + Send;
}

/// A decoded upload, ready for the blob store.
#[derive(Debug, Clone)]
pub struct DecodedUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Decode every upload up front so a bad payload is rejected before
/// anything is written.
pub fn decode_uploads(files: &[UploadFile]) -> Result<Vec<DecodedUpload>, ApiError> {
    files
        .iter()
        .map(|file| {
            if file.file_name.trim().is_empty() {
                return Err(ApiError::validation("Each file needs a file_name"));
            }
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(file.file_data.trim())
                .map_err(|e| {
                    ApiError::validation(format!(
                        "File {} is not valid base64: {}",
                        file.file_name, e
                    ))
                })?;
            Ok(DecodedUpload {
                file_name: file.file_name.clone(),
                content_type: file.content_type.clone(),
                bytes,
            })
        })
        .collect()
}

/// Object key for a record attachment: `health_records/{record_id}/{file_id}.{ext}`.
pub fn file_key(record_id: &str, file_id: &str, file_name: &str) -> String {
    match file_name.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => {
            format!("health_records/{}/{}.{}", record_id, file_id, ext)
        }
        _ => format!("health_records/{}/{}", record_id, file_id),
    }
}

#[derive(Clone)]
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: S3Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<StoredBlob, BlobError> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| BlobError(format!("Failed to upload to S3: {:?}", e)))?;

        tracing::info!("Uploaded {} ({} bytes)", key, size);
        Ok(StoredBlob {
            key: key.to_string(),
            url: format!("https://{}.s3.amazonaws.com/{}", self.bucket, key),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BlobError(format!("Failed to delete from S3: {:?}", e)))?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts_after: Mutex<Option<usize>>,
    fail_deletes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `count` more uploads, then reject every upload after that.
    pub fn fail_puts_after(&self, count: Option<usize>) {
        *self.fail_puts_after.lock().unwrap_or_else(|p| p.into_inner()) = count;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(key)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<StoredBlob, BlobError> {
        {
            let mut budget = self.fail_puts_after.lock().unwrap_or_else(|p| p.into_inner());
            match budget.as_mut() {
                Some(0) => return Err(BlobError(format!("upload of {} rejected", key))),
                Some(left) => *left -= 1,
                None => {}
            }
        }
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key.to_string(), bytes);
        Ok(StoredBlob {
            key: key.to_string(),
            url: format!("memory://{}", key),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(BlobError(format!("delete of {} rejected", key)));
        }
        self.objects
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
        Ok(())
    }
}
