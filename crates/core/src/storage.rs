use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use futures::Stream;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::config::Settings;
use crate::{Error, Result};

/// Part size for multipart uploads. Tuning knob, not a correctness knob.
pub const UPLOAD_PART_BYTES: u64 = 8 * 1024 * 1024;
/// Number of parts in flight at once.
pub const UPLOAD_PART_CONCURRENCY: usize = 4;

const LIST_PAGE_SIZE: i32 = 1000;

pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<i64>,
    pub etag: Option<String>,
}

/// A streamed download: the body is consumed chunk by chunk, never
/// buffered whole.
pub struct ObjectDownload {
    pub stream: Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>,
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for ObjectDownload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDownload")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Object-storage collaborator: multipart streamed upload of a local
/// file with progress events, plus listing and streamed fetch by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    fn region(&self) -> &str;

    /// Uploads `path` under `key` and returns the storage integrity tag.
    /// `progress` receives cumulative percent, at least once on
    /// completion; intermediate values may be coalesced.
    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        metadata: &HashMap<String, String>,
        progress: ProgressFn<'_>,
    ) -> Result<Option<String>>;

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn download(&self, key: &str) -> Result<ObjectDownload>;
}

pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    region: String,
}

impl S3ObjectStore {
    pub async fn new(settings: &Settings) -> Self {
        let credentials = Credentials::new(
            &settings.access_key_id,
            &settings.secret_access_key,
            None,
            None,
            "packrat",
        );
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        Self {
            client: S3Client::new(&sdk_config),
            bucket: settings.bucket.clone(),
            region: settings.region.clone(),
        }
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        path: &Path,
        part_number: i32,
        offset: u64,
        length: u64,
    ) -> Result<CompletedPart> {
        let mut file = tokio::fs::File::open(path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer).await?;

        let out = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(buffer))
            .send()
            .await
            .map_err(|e| Error::Upload {
                message: format!("part {part_number}: {}", DisplayErrorContext(&e)),
            })?;

        Ok(CompletedPart::builder()
            .set_e_tag(out.e_tag().map(|s| s.to_string()))
            .part_number(part_number)
            .build())
    }

    async fn upload_multipart(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        metadata: &HashMap<String, String>,
        total_bytes: u64,
        progress: ProgressFn<'_>,
    ) -> Result<Option<String>> {
        let mut create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type);
        for (k, v) in metadata {
            create = create.metadata(k, v);
        }
        let created = create.send().await.map_err(|e| Error::Upload {
            message: format!("create multipart: {}", DisplayErrorContext(&e)),
        })?;
        let upload_id = created.upload_id().ok_or_else(|| Error::Upload {
            message: "create multipart returned no upload id".to_string(),
        })?;

        let mut parts: Vec<(i32, u64, u64)> = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;
        while offset < total_bytes {
            let length = UPLOAD_PART_BYTES.min(total_bytes - offset);
            parts.push((part_number, offset, length));
            offset += length;
            part_number += 1;
        }

        let done_bytes = AtomicU64::new(0);
        let results: Vec<Result<CompletedPart>> = stream::iter(parts)
            .map(|(number, offset, length)| {
                let done_bytes = &done_bytes;
                async move {
                    let completed = self
                        .upload_part(key, upload_id, path, number, offset, length)
                        .await?;
                    let done = done_bytes.fetch_add(length, Ordering::Relaxed) + length;
                    let percent = (done * 100 / total_bytes) as u8;
                    progress(percent);
                    debug!(
                        event = "upload.part_done",
                        key,
                        part_number = number,
                        part_bytes = length,
                        percent,
                        "upload.part_done"
                    );
                    Ok(completed)
                }
            })
            .buffer_unordered(UPLOAD_PART_CONCURRENCY)
            .collect()
            .await;

        let mut completed: Vec<CompletedPart> = Vec::with_capacity(results.len());
        for res in results {
            match res {
                Ok(part) => completed.push(part),
                Err(e) => {
                    // Leave no half-finished multipart state behind; the
                    // original error is what the caller sees.
                    let _ = self
                        .client
                        .abort_multipart_upload()
                        .bucket(&self.bucket)
                        .key(key)
                        .upload_id(upload_id)
                        .send()
                        .await;
                    return Err(e);
                }
            }
        }
        completed.sort_by_key(|p| p.part_number());

        let out = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| Error::Upload {
                message: format!("complete multipart: {}", DisplayErrorContext(&e)),
            })?;

        Ok(out.e_tag().map(|s| s.to_string()))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        metadata: &HashMap<String, String>,
        progress: ProgressFn<'_>,
    ) -> Result<Option<String>> {
        let total_bytes = tokio::fs::metadata(path).await?.len();

        // Small archives skip multipart entirely.
        let etag = if total_bytes <= UPLOAD_PART_BYTES {
            let body = ByteStream::from_path(path).await.map_err(|e| Error::Upload {
                message: format!("open archive for upload: {e}"),
            })?;
            let mut put = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type(content_type)
                .body(body);
            for (k, v) in metadata {
                put = put.metadata(k, v);
            }
            let out = put.send().await.map_err(|e| Error::Upload {
                message: format!("put object: {}", DisplayErrorContext(&e)),
            })?;
            progress(100);
            out.e_tag().map(|s| s.to_string())
        } else {
            self.upload_multipart(key, path, content_type, metadata, total_bytes, progress)
                .await?
        };

        debug!(event = "upload.finished", key, bytes = total_bytes, "upload.finished");
        Ok(etag)
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .max_keys(LIST_PAGE_SIZE);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| Error::Storage {
                message: format!("list objects: {}", DisplayErrorContext(&e)),
            })?;

            for obj in response.contents() {
                objects.push(ObjectInfo {
                    key: obj.key().unwrap_or_default().to_string(),
                    size: obj.size().map(|s| s as u64).unwrap_or(0),
                    last_modified: obj
                        .last_modified()
                        .and_then(|dt| dt.to_millis().ok())
                        .map(|ms| ms / 1000),
                    etag: obj.e_tag().map(|s| s.to_string()),
                });
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(|s| s.to_string());
            } else {
                break;
            }
        }

        Ok(objects)
    }

    async fn download(&self, key: &str) -> Result<ObjectDownload> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    Error::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    Error::Storage {
                        message: format!("get object: {service_err}"),
                    }
                }
            })?;

        let content_length = response.content_length().map(|l| l as u64);
        let reader = response.body.into_async_read();
        let stream = tokio_util::io::ReaderStream::new(reader);

        Ok(ObjectDownload {
            stream: Box::pin(stream),
            content_length,
        })
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
    metadata: HashMap<String, String>,
}

/// In-process test double with an invocation counter, so tests can assert
/// the store was or was not reached.
#[derive(Debug, Default)]
pub struct MemObjectStore {
    pub uploaded: AtomicUsize,
    pub fail_upload: bool,
    inner: Mutex<HashMap<String, StoredObject>>,
}

impl MemObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_upload: true,
            ..Self::default()
        }
    }

    pub fn object_bytes(&self, key: &str) -> Option<Vec<u8>> {
        let guard = self.inner.lock().expect("mem store lock poisoned");
        guard.get(key).map(|o| o.bytes.clone())
    }

    pub fn object_metadata(&self, key: &str) -> Option<HashMap<String, String>> {
        let guard = self.inner.lock().expect("mem store lock poisoned");
        guard.get(key).map(|o| o.metadata.clone())
    }

    pub fn object_content_type(&self, key: &str) -> Option<String> {
        let guard = self.inner.lock().expect("mem store lock poisoned");
        guard.get(key).map(|o| o.content_type.clone())
    }

    pub fn insert(&self, key: &str, bytes: &[u8]) {
        let mut guard = self.inner.lock().expect("mem store lock poisoned");
        guard.insert(
            key.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: "application/octet-stream".to_string(),
                metadata: HashMap::new(),
            },
        );
    }
}

#[async_trait]
impl ObjectStore for MemObjectStore {
    fn bucket(&self) -> &str {
        "test-bucket"
    }

    fn region(&self) -> &str {
        "test-region"
    }

    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
        metadata: &HashMap<String, String>,
        progress: ProgressFn<'_>,
    ) -> Result<Option<String>> {
        if self.fail_upload {
            return Err(Error::Upload {
                message: "upload rejected".to_string(),
            });
        }
        let bytes = tokio::fs::read(path).await?;
        progress(50);
        let etag = format!("\"mem-{}\"", bytes.len());
        let mut guard = self.inner.lock().expect("mem store lock poisoned");
        guard.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );
        drop(guard);
        self.uploaded.fetch_add(1, Ordering::Relaxed);
        progress(100);
        Ok(Some(etag))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let guard = self.inner.lock().expect("mem store lock poisoned");
        let mut out: Vec<ObjectInfo> = guard
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, obj)| ObjectInfo {
                key: key.clone(),
                size: obj.bytes.len() as u64,
                last_modified: None,
                etag: Some(format!("\"mem-{}\"", obj.bytes.len())),
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    async fn download(&self, key: &str) -> Result<ObjectDownload> {
        let bytes = self.object_bytes(key).ok_or_else(|| Error::NotFound {
            key: key.to_string(),
        })?;
        let len = bytes.len() as u64;
        let stream = stream::once(async move { Ok::<_, std::io::Error>(Bytes::from(bytes)) });
        Ok(ObjectDownload {
            stream: Box::pin(stream),
            content_length: Some(len),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_impls_satisfy_the_trait() {
        fn assert_object_store<T: ObjectStore>() {}
        assert_object_store::<S3ObjectStore>();
        assert_object_store::<MemObjectStore>();
    }

    #[tokio::test]
    async fn mem_store_download_of_missing_key_is_not_found() {
        let store = MemObjectStore::new();
        let err = store.download("missing.tar.gz").await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn mem_store_lists_by_prefix() {
        let store = MemObjectStore::new();
        store.insert("a-2025-01-01-prod-p1.tar.gz", b"one");
        store.insert("b-2025-01-02-prod-p2.tar.gz", b"two");
        store.insert("unrelated.txt", b"three");

        let all = store.list_objects("").await.unwrap();
        assert_eq!(all.len(), 3);
        let only_a = store.list_objects("a-").await.unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].size, 3);
    }
}
