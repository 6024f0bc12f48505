//! # Storage backends
//!
//! Configuration and unification for the object-store backends.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use http::Uri;
use serde::Deserialize;
use tokio::io;

#[cfg(feature = "local")]
pub(crate) mod local;

pub(crate) mod memory;

#[cfg(feature = "s3")]
pub(crate) mod s3;

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "s3")]
#[doc(inline)]
pub use s3::{S3Config, S3Driver};

#[doc(inline)]
pub use storage_driver::{
    Checksum, Driver, Metadata, PartReceipt, Payload, Reader, Sha256Writer, StorageError,
    StorageErrorKind, UploadHandle, Writer,
};

/// Which backend to store objects in.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StorageConfig {
    /// Keep everything in process memory.
    #[default]
    Memory,

    /// Store objects as files below a root directory.
    #[cfg(feature = "local")]
    Local {
        /// Root directory for all buckets.
        path: Utf8PathBuf,
    },

    /// Store objects in an S3 compatible service.
    #[cfg(feature = "s3")]
    S3(S3Config),
}

impl StorageConfig {
    /// Construct the configured driver.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Storage, StorageError> {
        let client: Storage = match self {
            StorageConfig::Memory => MemoryStorage::new().into(),
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => LocalDriver::new(path).into(),
            #[cfg(feature = "s3")]
            StorageConfig::S3(config) => config.client().await?.into(),
        };
        Ok(client)
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A cheaply cloneable handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// Share an already reference counted driver, e.g. one a test keeps a handle to.
    pub fn from_arc<D: Driver + Send + Sync + 'static>(driver: Arc<D>) -> Self {
        Self { driver }
    }

    /// The name of the underlying driver.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle scoped to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }
}

/// A storage handle bound to one bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket all operations address.
    pub bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// The name of the underlying driver.
    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Size, creation time and checksum of an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    /// Stream an object into `writer`.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<Metadata, StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {}/{remote}", self.bucket);
        self.driver.download(&self.bucket, remote, writer).await
    }

    /// Download a whole object into memory.
    pub async fn read(&self, remote: &Utf8Path) -> Result<(Vec<u8>, Metadata), StorageError> {
        let mut data = Vec::new();
        let metadata = self.download(remote, &mut data).await?;
        Ok((data, metadata))
    }

    /// Store the contents of `reader` at `remote`.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn upload<'d, R>(
        &'d self,
        remote: &Utf8Path,
        reader: &mut R,
    ) -> Result<Checksum, StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {}/{remote}", self.bucket);
        self.driver.upload(&self.bucket, remote, reader).await
    }

    /// Upload an in-memory object.
    pub async fn write(&self, remote: &Utf8Path, data: &[u8]) -> Result<Checksum, StorageError> {
        let mut reader = io::BufReader::new(data);
        self.upload(remote, &mut reader).await
    }

    /// Remove an object. Deleting a missing object is not an error.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn delete(&self, remote: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, remote).await
    }

    /// Copy an object within the bucket.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn copy(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.driver.copy(&self.bucket, source, destination).await
    }

    /// Move an object within the bucket.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn rename(
        &self,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.driver.rename(&self.bucket, source, destination).await
    }

    /// A time-limited URL for reading `remote` directly from the backend.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn presign(
        &self,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        self.driver.presign(&self.bucket, remote, expires_in).await
    }

    /// Start a multipart upload which will complete at `remote`.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn create_multipart(&self, remote: &Utf8Path) -> Result<UploadHandle, StorageError> {
        self.driver.create_multipart(&self.bucket, remote).await
    }

    /// Upload one numbered part.
    #[tracing::instrument(skip(self, payload), fields(driver=self.driver.name(), bucket=self.bucket, size=payload.len()))]
    pub async fn upload_part(
        &self,
        remote: &Utf8Path,
        handle: &UploadHandle,
        part_number: u32,
        payload: &Payload,
        is_last: bool,
    ) -> Result<PartReceipt, StorageError> {
        self.driver
            .upload_part(&self.bucket, remote, handle, part_number, payload, is_last)
            .await
    }

    /// Assemble the given parts into the object at `remote`.
    #[tracing::instrument(skip(self, parts), fields(driver=self.driver.name(), bucket=self.bucket, parts=parts.len()))]
    pub async fn complete_multipart(
        &self,
        remote: &Utf8Path,
        handle: &UploadHandle,
        parts: &[PartReceipt],
    ) -> Result<(), StorageError> {
        self.driver
            .complete_multipart(&self.bucket, remote, handle, parts)
            .await
    }

    /// Release a multipart upload. Unknown handles are ignored.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn abort_multipart(
        &self,
        remote: &Utf8Path,
        handle: &UploadHandle,
    ) -> Result<(), StorageError> {
        self.driver
            .abort_multipart(&self.bucket, remote, handle)
            .await
    }
}
