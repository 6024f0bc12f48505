use std::time::Duration;

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    ChecksumAlgorithm, ChecksumMode, CompletedMultipartUpload, CompletedPart,
};
use aws_sdk_s3::Client;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use http::Uri;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use secret::Secret;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use storage_driver::{
    Checksum, Driver, Metadata, PartReceipt, Payload, Reader, StorageError, StorageErrorKind,
    UploadHandle, Writer,
};

const ENGINE: &str = "s3";

/// Characters which must be escaped in an `x-amz-copy-source` key.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Connection settings for an S3 compatible object store.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Custom endpoint, e.g. for MinIO or R2.
    pub endpoint: Option<String>,

    /// Region to sign requests for.
    pub region: Option<String>,

    /// Static access key. The default AWS credential chain is used when unset.
    pub access_key_id: Option<String>,

    /// Static secret key, paired with `access_key_id`.
    pub secret_access_key: Option<Secret>,

    /// Address buckets as `endpoint/bucket` rather than `bucket.endpoint`.
    #[serde(default)]
    pub path_style: bool,
}

impl S3Config {
    /// Build a client from this configuration layered over the ambient AWS config.
    pub async fn client(self) -> Result<S3Driver, StorageError> {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);

        if let Some(region) = self.region {
            builder = builder.region(aws_sdk_s3::config::Region::new(region));
        }

        if let Some(endpoint) = self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        match (self.access_key_id, self.secret_access_key) {
            (Some(key), Some(secret)) => {
                builder = builder.credentials_provider(aws_sdk_s3::config::Credentials::new(
                    key,
                    secret.revealed(),
                    None,
                    None,
                    "depot-config",
                ));
            }
            (None, None) => {}
            _ => {
                return Err(StorageError::new(
                    ENGINE,
                    StorageErrorKind::InvalidRequest,
                    "access_key_id and secret_access_key must be set together",
                ))
            }
        }

        builder = builder.force_path_style(self.path_style);

        Ok(S3Driver {
            client: Client::from_conf(builder.build()),
        })
    }
}

/// Storage driver backed by the AWS S3 API.
///
/// S3 requires every part but the last to be at least 5 MiB.
#[derive(Debug, Clone)]
pub struct S3Driver {
    client: Client,
}

impl S3Driver {
    /// Wrap an already configured client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn classify<E>(err: SdkError<E, HttpResponse>, bucket: &str, remote: &Utf8Path) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let kind = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StorageErrorKind::ServiceUnavailable
        }
        SdkError::ConstructionFailure(_) => StorageErrorKind::InvalidRequest,
        _ => match err.raw_response().map(|response| response.status().as_u16()) {
            Some(404) => StorageErrorKind::NotFound,
            Some(401) | Some(403) => StorageErrorKind::PermissionDenied,
            Some(400) | Some(409) | Some(411) | Some(416) => StorageErrorKind::InvalidRequest,
            Some(429) | Some(500..=599) => StorageErrorKind::ServiceUnavailable,
            _ => StorageErrorKind::Other,
        },
    };

    StorageError::builder(ENGINE, kind, err)
        .bucket(bucket)
        .key(remote.as_str())
        .build()
}

/// Whole-object checksums only; multipart objects report a composite `hash-N` value.
fn object_checksum(value: Option<&str>) -> Option<Checksum> {
    value
        .filter(|value| !value.contains('-'))
        .map(Checksum::from_base64)
}

fn timestamp(value: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    value
        .and_then(|value| DateTime::from_timestamp(value.secs(), value.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

#[async_trait::async_trait]
impl Driver for S3Driver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "s3"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let head = self
            .client
            .head_object()
            .bucket(bucket)
            .key(remote.as_str())
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await
            .map_err(|err| classify(err, bucket, remote))?;

        Ok(Metadata {
            size: head.content_length().unwrap_or_default().max(0) as u64,
            created: timestamp(head.last_modified()),
            checksum: object_checksum(head.checksum_sha256()),
        })
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError> {
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(remote.as_str())
            .checksum_mode(ChecksumMode::Enabled)
            .send()
            .await
            .map_err(|err| classify(err, bucket, remote))?;

        let metadata = Metadata {
            size: object.content_length().unwrap_or_default().max(0) as u64,
            created: timestamp(object.last_modified()),
            checksum: object_checksum(object.checksum_sha256()),
        };

        let mut body = object.body.into_async_read();
        tokio::io::copy(&mut body, writer)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        writer
            .flush()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;

        Ok(metadata)
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<Checksum, StorageError> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        let checksum = Checksum::sha256(&data);

        self.client
            .put_object()
            .bucket(bucket)
            .key(remote.as_str())
            .checksum_sha256(checksum.as_base64())
            .content_length(size as i64)
            .body(body)
            .send()
            .await
            .map_err(|err| classify(err, bucket, remote))?;

        Ok(checksum)
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(remote.as_str())
            .send()
            .await
            .map_err(|err| classify(err, bucket, remote))?;
        Ok(())
    }

    async fn copy(
        &self,
        bucket: &str,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        let copy_source = format!(
            "{bucket}/{}",
            utf8_percent_encode(source.as_str(), COPY_SOURCE)
        );

        self.client
            .copy_object()
            .bucket(bucket)
            .key(destination.as_str())
            .copy_source(copy_source)
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .send()
            .await
            .map_err(|err| classify(err, bucket, source))?;
        Ok(())
    }

    async fn presign(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        let config = PresigningConfig::expires_in(expires_in).map_err(|err| {
            StorageError::builder(ENGINE, StorageErrorKind::InvalidRequest, err)
                .bucket(bucket)
                .key(remote.as_str())
                .build()
        })?;

        let request = self
            .client
            .get_object()
            .bucket(bucket)
            .key(remote.as_str())
            .presigned(config)
            .await
            .map_err(|err| classify(err, bucket, remote))?;

        request.uri().parse::<Uri>().map_err(|err| {
            StorageError::builder(ENGINE, StorageErrorKind::Other, err)
                .bucket(bucket)
                .key(remote.as_str())
                .context("presigned url")
                .build()
        })
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadHandle, StorageError> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(remote.as_str())
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .send()
            .await
            .map_err(|err| classify(err, bucket, remote))?;

        let upload_id = created.upload_id().ok_or_else(|| {
            StorageError::builder(ENGINE, StorageErrorKind::Other, "missing upload id")
                .bucket(bucket)
                .key(remote.as_str())
                .build()
        })?;

        tracing::debug!(%upload_id, "started s3 multipart upload");
        Ok(UploadHandle::new(upload_id))
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
        let checksum = payload
            .checksum()
            .await
            .map_err(|err| StorageError::io(ENGINE, err))?;
        let size = payload.len();
        let body = match payload {
            Payload::Bytes(data) => ByteStream::from(data.clone()),
            Payload::File { path, .. } => ByteStream::from_path(path).await.map_err(|err| {
                StorageError::builder(ENGINE, StorageErrorKind::Io, err)
                    .bucket(bucket)
                    .key(remote.as_str())
                    .context("spooled part")
                    .build()
            })?,
        };
        tracing::trace!(%handle, %part_number, %is_last, %size, "uploading s3 part");

        let part = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(remote.as_str())
            .upload_id(handle.as_str())
            .part_number(part_number as i32)
            .checksum_sha256(checksum.as_base64())
            .content_length(size as i64)
            .body(body)
            .send()
            .await
            .map_err(|err| classify(err, bucket, remote))?;

        let etag = part.e_tag().ok_or_else(|| {
            StorageError::builder(ENGINE, StorageErrorKind::Other, "missing part etag")
                .bucket(bucket)
                .key(remote.as_str())
                .build()
        })?;

        Ok(PartReceipt {
            part_number,
            etag: etag.to_owned(),
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
        let parts = parts
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(&part.etag)
                    .set_checksum_sha256(part.checksum.as_ref().map(|c| c.as_base64().to_owned()))
                    .build()
            })
            .collect::<Vec<_>>();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(remote.as_str())
            .upload_id(handle.as_str())
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|err| classify(err, bucket, remote))?;
        Ok(())
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        handle: &UploadHandle,
    ) -> Result<(), StorageError> {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(remote.as_str())
            .upload_id(handle.as_str())
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let error = classify(err, bucket, remote);
                if error.is_not_found() {
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_checksums_are_dropped() {
        assert_eq!(object_checksum(Some("abc=-3")), None);
        assert_eq!(
            object_checksum(Some("abc=")),
            Some(Checksum::from_base64("abc="))
        );
    }

    #[test]
    fn copy_source_keeps_separators() {
        let encoded = utf8_percent_encode("library/my image/blob_1.tar", COPY_SOURCE).to_string();
        assert_eq!(encoded, "library/my%20image/blob_1.tar");
    }
}
