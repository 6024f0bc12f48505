use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use chrono::Utc;
use eyre::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use storage_driver::{
    Checksum, Driver, Metadata, PartReceipt, Payload, Reader, Sha256Writer, StorageError,
    StorageErrorKind, UploadHandle, Writer,
};

const ENGINE: &str = "local";
const TARGET: &str = "target";

/// Storage driver which keeps objects as files below a root directory.
///
/// Objects live at `{root}/{bucket}/b/{key}`. Multipart uploads stage their
/// parts at `{root}/{bucket}/m/{handle}/` until they are completed.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`. Directories are created on demand.
    pub fn new<P: Into<Utf8PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let relative = remote
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)));
        if !relative || remote.as_str().is_empty() {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                "keys must be relative paths without `..` components",
            )
            .bucket(bucket)
            .key(remote.as_str())
            .build());
        }

        let mut path = self.root.join(bucket);
        path.push("b");
        path.push(remote);
        Ok(path)
    }

    fn staging(&self, bucket: &str, handle: &UploadHandle) -> Result<Utf8PathBuf, StorageError> {
        if !handle.as_str().chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::NotFound,
                format!("no such multipart upload: {handle}"),
            )
            .bucket(bucket)
            .build());
        }

        let mut path = self.root.join(bucket);
        path.push("m");
        path.push(handle.as_str());
        Ok(path)
    }

    fn fail(bucket: &str, remote: &Utf8Path, err: eyre::Report) -> StorageError {
        let kind = match err.downcast_ref::<std::io::Error>().map(|err| err.kind()) {
            Some(std::io::ErrorKind::NotFound) => StorageErrorKind::NotFound,
            Some(std::io::ErrorKind::PermissionDenied) => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        StorageError::builder(ENGINE, kind, err)
            .bucket(bucket)
            .key(remote.as_str())
            .build()
    }

    /// Check that a staged upload exists and targets `remote`.
    async fn check_target(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        staging: &Utf8Path,
        handle: &UploadHandle,
    ) -> Result<(), StorageError> {
        let target = tokio::fs::read_to_string(staging.join(TARGET)).await;
        match target {
            Ok(target) if target == remote.as_str() => Ok(()),
            Ok(_) | Err(_) => Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::NotFound,
                format!("no such multipart upload: {handle}"),
            )
            .bucket(bucket)
            .key(remote.as_str())
            .build()),
        }
    }

    /// Stream `reader` into a file next to `path`, then move it into place.
    async fn write_file(
        &self,
        path: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> eyre::Result<(Checksum, u64)> {
        let parent = path.parent().ok_or_else(|| eyre::eyre!("key has no parent"))?;
        tokio::fs::create_dir_all(parent)
            .await
            .wrap_err("create_dir_all")?;

        let partial = parent.join(format!(
            ".{}.{}",
            path.file_name().unwrap_or("object"),
            uuid::Uuid::new_v4().simple()
        ));
        let file = tokio::fs::File::create(&partial)
            .await
            .wrap_err("local: create partial file")?;

        let mut writer = Sha256Writer::new(tokio::io::BufWriter::new(file));
        let copied = tokio::io::copy_buf(reader, &mut writer).await;
        if let Err(err) = copied {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err).wrap_err("copy");
        }
        writer.shutdown().await.wrap_err("shutdown writer")?;

        let (_, checksum, size) = writer.finish();
        tokio::fs::rename(&partial, path)
            .await
            .wrap_err("move partial file into place")?;
        Ok((checksum, size))
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "file"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .wrap_err("local driver: metadata")
            .map_err(|err| Self::fail(bucket, remote, err))?;

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(Into::into)
            .unwrap_or_else(|_| Utc::now());

        Ok(Metadata {
            size: metadata.len(),
            created,
            checksum: None,
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::fail(
                bucket,
                remote,
                eyre::Report::new(err).wrap_err("remove_file"),
            )),
        }
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<Checksum, StorageError> {
        let path = self.path(bucket, remote)?;
        let (checksum, size) = self
            .write_file(&path, local)
            .await
            .map_err(|err| Self::fail(bucket, remote, err))?;
        tracing::trace!(%remote, %size, "wrote local object");
        Ok(checksum)
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError> {
        let mut metadata = self.metadata(bucket, remote).await?;
        let path = self.path(bucket, remote)?;

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .context("open remote file")
                .map_err(|err| Self::fail(bucket, remote, err))?,
        );

        let mut writer = Sha256Writer::new(local);
        tokio::io::copy_buf(&mut reader, &mut writer)
            .await
            .context("copy")
            .map_err(|err| Self::fail(bucket, remote, err))?;

        writer
            .flush()
            .await
            .context("flush writer")
            .map_err(|err| Self::fail(bucket, remote, err))?;

        let (_, checksum, size) = writer.finish();
        metadata.size = size;
        metadata.checksum = Some(checksum);
        Ok(metadata)
    }

    async fn copy(
        &self,
        bucket: &str,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        let from = self.path(bucket, source)?;
        let to = self.path(bucket, destination)?;

        let file = tokio::fs::File::open(&from)
            .await
            .context("open source file")
            .map_err(|err| Self::fail(bucket, source, err))?;
        let mut reader = tokio::io::BufReader::new(file);

        self.write_file(&to, &mut reader)
            .await
            .map_err(|err| Self::fail(bucket, destination, err))?;
        Ok(())
    }

    async fn rename(
        &self,
        bucket: &str,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        let from = self.path(bucket, source)?;
        let to = self.path(bucket, destination)?;

        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create_dir_all")
                .map_err(|err| Self::fail(bucket, destination, err))?;
        }

        tokio::fs::rename(&from, &to)
            .await
            .context("rename")
            .map_err(|err| Self::fail(bucket, source, err))
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadHandle, StorageError> {
        // Validate the key up front so completion cannot fail on it later.
        self.path(bucket, remote)?;

        let handle = UploadHandle::new(uuid::Uuid::new_v4().simple().to_string());
        let staging = self.staging(bucket, &handle)?;

        tokio::fs::create_dir_all(&staging)
            .await
            .context("create staging directory")
            .map_err(|err| Self::fail(bucket, remote, err))?;
        tokio::fs::write(staging.join(TARGET), remote.as_str())
            .await
            .context("write staging target")
            .map_err(|err| Self::fail(bucket, remote, err))?;

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
        let staging = self.staging(bucket, handle)?;
        self.check_target(bucket, remote, &staging, handle).await?;
        tracing::trace!(%handle, %part_number, %is_last, "staging local part");

        let mut reader = payload
            .reader()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        let (checksum, size) = self
            .write_file(&staging.join(format!("{part_number:010}")), &mut reader)
            .await
            .map_err(|err| Self::fail(bucket, remote, err))?;

        Ok(PartReceipt {
            part_number,
            etag: format!("\"{}\"", checksum.as_base64()),
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
        let staging = self.staging(bucket, handle)?;
        self.check_target(bucket, remote, &staging, handle).await?;

        let invalid = |message: String| {
            StorageError::builder(ENGINE, StorageErrorKind::InvalidRequest, message)
                .bucket(bucket)
                .key(remote.as_str())
                .build()
        };

        if parts.is_empty() {
            return Err(invalid(
                "a multipart upload must contain at least one part".into(),
            ));
        }

        let mut assembled = Vec::new();
        let mut previous = 0;
        for receipt in parts {
            if receipt.part_number <= previous {
                return Err(invalid(format!("part {} is out of order", receipt.part_number)));
            }
            previous = receipt.part_number;

            let mut part = Vec::new();
            tokio::fs::File::open(staging.join(format!("{:010}", receipt.part_number)))
                .await
                .map_err(|_| invalid(format!("part {} was never uploaded", receipt.part_number)))?
                .read_to_end(&mut part)
                .await
                .map_err(|err| StorageError::io(ENGINE, err))?;

            let etag = format!("\"{}\"", Checksum::sha256(&part).as_base64());
            if etag != receipt.etag {
                return Err(invalid(format!(
                    "part {} does not match an uploaded part",
                    receipt.part_number
                )));
            }
            assembled.extend_from_slice(&part);
        }

        let path = self.path(bucket, remote)?;
        let mut reader = assembled.as_slice();
        self.write_file(&path, &mut reader)
            .await
            .map_err(|err| Self::fail(bucket, remote, err))?;

        if let Err(error) = tokio::fs::remove_dir_all(&staging).await {
            tracing::warn!(%handle, %error, "unable to clean up staged parts");
        }
        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        handle: &UploadHandle,
    ) -> Result<(), StorageError> {
        let Ok(staging) = self.staging(bucket, handle) else {
            return Ok(());
        };

        match tokio::fs::remove_dir_all(&staging).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::fail(
                bucket,
                remote,
                eyre::Report::new(err).wrap_err("remove staging directory"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> (tempfile::TempDir, LocalDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, LocalDriver::new(root))
    }

    #[tokio::test]
    async fn upload_and_download() {
        let (_dir, driver) = driver();
        let key = Utf8Path::new("library/ubuntu/abc");

        let mut reader = &b"hello"[..];
        let checksum = driver.upload("bucket", key, &mut reader).await.unwrap();
        assert_eq!(checksum, Checksum::sha256(b"hello"));

        let mut data = Vec::new();
        let metadata = driver.download("bucket", key, &mut data).await.unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(metadata.size, 5);
        assert_eq!(metadata.checksum, Some(checksum));
    }

    #[tokio::test]
    async fn escaping_keys_are_rejected() {
        let (_dir, driver) = driver();
        let error = driver
            .metadata("bucket", Utf8Path::new("../outside"))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let (_dir, driver) = driver();
        let error = driver
            .metadata("bucket", Utf8Path::new("nope"))
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn multipart_upload_completes() {
        let (dir, driver) = driver();
        let key = Utf8Path::new("uploads/1234");

        let handle = driver.create_multipart("bucket", key).await.unwrap();
        let first = driver
            .upload_part("bucket", key, &handle, 1, &Payload::from(&b"hel"[..]), false)
            .await
            .unwrap();
        let second = driver
            .upload_part("bucket", key, &handle, 2, &Payload::from(&b"lo"[..]), true)
            .await
            .unwrap();
        driver
            .complete_multipart("bucket", key, &handle, &[first, second])
            .await
            .unwrap();

        let stored = tokio::fs::read(dir.path().join("bucket/b/uploads/1234"))
            .await
            .unwrap();
        assert_eq!(stored, b"hello");
        assert!(!dir.path().join("bucket/m").join(handle.as_str()).exists());
    }

    #[tokio::test]
    async fn abort_removes_staged_parts() {
        let (dir, driver) = driver();
        let key = Utf8Path::new("uploads/5678");

        let handle = driver.create_multipart("bucket", key).await.unwrap();
        driver
            .upload_part("bucket", key, &handle, 1, &Payload::from(&b"x"[..]), false)
            .await
            .unwrap();

        driver.abort_multipart("bucket", key, &handle).await.unwrap();
        driver.abort_multipart("bucket", key, &handle).await.unwrap();
        assert!(!dir.path().join("bucket/m").join(handle.as_str()).exists());

        let error = driver
            .complete_multipart("bucket", key, &handle, &[])
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }

    #[tokio::test]
    async fn rename_moves_files() {
        let (_dir, driver) = driver();
        let mut reader = &b"data"[..];
        driver
            .upload("bucket", Utf8Path::new("uploads/a"), &mut reader)
            .await
            .unwrap();
        driver
            .rename("bucket", Utf8Path::new("uploads/a"), Utf8Path::new("repo/b"))
            .await
            .unwrap();

        assert!(driver
            .metadata("bucket", Utf8Path::new("uploads/a"))
            .await
            .unwrap_err()
            .is_not_found());
        assert_eq!(
            driver
                .metadata("bucket", Utf8Path::new("repo/b"))
                .await
                .unwrap()
                .size,
            4
        );
    }
}
