use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;

use storage_driver::{
    Checksum, Driver, Metadata, PartReceipt, Payload, Reader, StorageError, StorageErrorKind,
    UploadHandle, Writer,
};

const ENGINE: &str = "memory";

#[derive(Debug, Clone)]
struct MemoryObject {
    created: DateTime<Utc>,
    checksum: Checksum,
    data: Bytes,
}

impl From<Bytes> for MemoryObject {
    fn from(data: Bytes) -> Self {
        Self {
            created: Utc::now(),
            checksum: Checksum::sha256(&data),
            data,
        }
    }
}

impl From<&MemoryObject> for Metadata {
    fn from(value: &MemoryObject) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
            checksum: Some(value.checksum.clone()),
        }
    }
}

#[derive(Debug)]
struct MemoryUpload {
    bucket: String,
    key: Utf8PathBuf,
    parts: BTreeMap<u32, (String, Bytes)>,
}

/// Storage driver that stores objects in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, HashMap<Utf8PathBuf, MemoryObject>>>,
    uploads: RwLock<HashMap<UploadHandle, MemoryUpload>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance. Buckets are created on first write.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given (empty) buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
            uploads: Default::default(),
        }
    }

    /// Number of multipart uploads which have been started but neither completed nor aborted.
    pub async fn pending_uploads(&self) -> usize {
        self.uploads.read().await.len()
    }

    /// Whether an object exists at `remote`.
    pub async fn contains(&self, bucket: &str, remote: &Utf8Path) -> bool {
        self.buckets
            .read()
            .await
            .get(bucket)
            .is_some_and(|objects| objects.contains_key(remote))
    }

    async fn object(&self, bucket: &str, remote: &Utf8Path) -> Result<MemoryObject, StorageError> {
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(remote))
            .cloned()
            .ok_or_else(|| StorageError::not_found(ENGINE, bucket, remote.as_str()))
    }

    async fn insert(&self, bucket: &str, remote: &Utf8Path, object: MemoryObject) {
        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(remote.to_owned(), object);
    }
}

fn unknown_upload(bucket: &str, remote: &Utf8Path, handle: &UploadHandle) -> StorageError {
    StorageError::builder(
        ENGINE,
        StorageErrorKind::NotFound,
        format!("no such multipart upload: {handle}"),
    )
    .bucket(bucket)
    .key(remote.as_str())
    .build()
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        Ok((&self.object(bucket, remote).await?).into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        if let Some(objects) = buckets.get_mut(bucket) {
            objects.remove(remote);
        }
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<Checksum, StorageError> {
        let mut buf = Vec::new();
        local
            .read_to_end(&mut buf)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        let object = MemoryObject::from(Bytes::from(buf));
        let checksum = object.checksum.clone();
        self.insert(bucket, remote, object).await;
        Ok(checksum)
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError> {
        let object = self.object(bucket, remote).await?;

        local
            .write_all(&object.data)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        Ok((&object).into())
    }

    async fn copy(
        &self,
        bucket: &str,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        let mut object = self.object(bucket, source).await?;
        object.created = Utc::now();
        self.insert(bucket, destination, object).await;
        Ok(())
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadHandle, StorageError> {
        let handle = UploadHandle::new(uuid::Uuid::new_v4().simple().to_string());
        self.uploads.write().await.insert(
            handle.clone(),
            MemoryUpload {
                bucket: bucket.to_owned(),
                key: remote.to_owned(),
                parts: BTreeMap::new(),
            },
        );
        Ok(handle)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        handle: &UploadHandle,
        part_number: u32,
        payload: &Payload,
        is_last: bool,
    ) -> Result<PartReceipt, StorageError> {
        tracing::trace!(%handle, %part_number, %is_last, "memory part upload");
        let data = payload
            .to_bytes()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        let checksum = Checksum::sha256(&data);
        let etag = format!("\"{}\"", checksum.as_base64());

        let mut uploads = self.uploads.write().await;
        let upload = uploads
            .get_mut(handle)
            .filter(|upload| upload.bucket == bucket && upload.key == remote)
            .ok_or_else(|| unknown_upload(bucket, remote, handle))?;

        let size = data.len() as u64;
        upload.parts.insert(part_number, (etag.clone(), data));

        Ok(PartReceipt {
            part_number,
            etag,
            checksum: Some(checksum),
            size,
        })
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        handle: &UploadHandle,
        parts: &[PartReceipt],
    ) -> Result<(), StorageError> {
        let mut uploads = self.uploads.write().await;
        let upload = uploads
            .get(handle)
            .filter(|upload| upload.bucket == bucket && upload.key == remote)
            .ok_or_else(|| unknown_upload(bucket, remote, handle))?;

        if parts.is_empty() {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                "a multipart upload must contain at least one part",
            )
            .bucket(bucket)
            .key(remote.as_str())
            .build());
        }

        let mut assembled = Vec::new();
        let mut previous = 0;
        for receipt in parts {
            if receipt.part_number <= previous {
                return Err(StorageError::builder(
                    ENGINE,
                    StorageErrorKind::InvalidRequest,
                    format!("part {} is out of order", receipt.part_number),
                )
                .bucket(bucket)
                .key(remote.as_str())
                .build());
            }
            previous = receipt.part_number;

            match upload.parts.get(&receipt.part_number) {
                Some((etag, data)) if *etag == receipt.etag => assembled.extend_from_slice(data),
                _ => {
                    return Err(StorageError::builder(
                        ENGINE,
                        StorageErrorKind::InvalidRequest,
                        format!("part {} does not match an uploaded part", receipt.part_number),
                    )
                    .bucket(bucket)
                    .key(remote.as_str())
                    .build());
                }
            }
        }

        uploads.remove(handle);
        drop(uploads);

        self.insert(bucket, remote, Bytes::from(assembled).into())
            .await;
        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        handle: &UploadHandle,
    ) -> Result<(), StorageError> {
        if self.uploads.write().await.remove(handle).is_none() {
            tracing::trace!(%bucket, %remote, %handle, "abort of unknown upload");
        }
        Ok(())
    }
}
