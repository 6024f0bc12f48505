use std::{fmt, ops::Deref, sync::Arc, time::Duration};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use http::Uri;
use tokio::io;

use crate::checksum::Checksum;
use crate::error::{StorageError, StorageErrorKind};
use crate::multipart::{PartReceipt, Payload, UploadHandle};

/// A reader stream for object contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for object contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// Object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// The creation timestamp of the object.
    pub created: DateTime<Utc>,

    /// SHA-256 checksum of the object, when the backend tracks one.
    pub checksum: Option<Checksum>,
}

/// A storage driver, which provides the ability to interact with an object store.
///
/// Keys are `/` separated paths within a bucket. Multipart uploads are staged
/// against the key they will eventually be completed at.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// The Uri scheme of the driver.
    fn scheme(&self) -> &str;

    /// Get the metadata for an object, by key.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Download an object into a writer stream, returning its metadata.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError>;

    /// Upload an object in one shot, using a reader stream to provide the contents.
    ///
    /// Returns the checksum of the stored object.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<Checksum, StorageError>;

    /// Delete an object, by key.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Copy an object to a new key within the same bucket.
    async fn copy(
        &self,
        bucket: &str,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError>;

    /// Move an object to a new key within the same bucket.
    async fn rename(
        &self,
        bucket: &str,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%source, %destination, "rename via copy and delete");
        self.copy(bucket, source, destination).await?;
        self.delete(bucket, source).await
    }

    /// Create a time-limited URL which grants direct read access to an object.
    async fn presign(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        let _ = expires_in;
        Err(StorageError::builder(
            self.name(),
            StorageErrorKind::Unsupported,
            "presigned urls are not supported by this driver",
        )
        .bucket(bucket)
        .key(remote.as_str())
        .build())
    }

    /// Begin a multipart upload which will be completed at `remote`.
    async fn create_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadHandle, StorageError>;

    /// Upload a single numbered part of a multipart upload.
    ///
    /// `is_last` marks the final part, which some backends allow to be smaller
    /// than their minimum part size.
    async fn upload_part(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        handle: &UploadHandle,
        part_number: u32,
        payload: &Payload,
        is_last: bool,
    ) -> Result<PartReceipt, StorageError>;

    /// Combine previously uploaded parts, in part-number order, into the object at `remote`.
    async fn complete_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        handle: &UploadHandle,
        parts: &[PartReceipt],
    ) -> Result<(), StorageError>;

    /// Release any backend resources held by an incomplete multipart upload.
    ///
    /// Aborting an unknown or already finished upload is not an error.
    async fn abort_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        handle: &UploadHandle,
    ) -> Result<(), StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    fn scheme(&self) -> &str {
        self.deref().scheme()
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError> {
        self.deref().download(bucket, remote, writer).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<Checksum, StorageError> {
        self.deref().upload(bucket, remote, reader).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn copy(
        &self,
        bucket: &str,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.deref().copy(bucket, source, destination).await
    }

    async fn rename(
        &self,
        bucket: &str,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.deref().rename(bucket, source, destination).await
    }

    async fn presign(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        self.deref().presign(bucket, remote, expires_in).await
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadHandle, StorageError> {
        self.deref().create_multipart(bucket, remote).await
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
        self.deref()
            .upload_part(bucket, remote, handle, part_number, payload, is_last)
            .await
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        handle: &UploadHandle,
        parts: &[PartReceipt],
    ) -> Result<(), StorageError> {
        self.deref()
            .complete_multipart(bucket, remote, handle, parts)
            .await
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        handle: &UploadHandle,
    ) -> Result<(), StorageError> {
        self.deref().abort_multipart(bucket, remote, handle).await
    }
}
