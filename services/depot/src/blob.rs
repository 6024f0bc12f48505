//! Blob endpoints

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::DOCKER_CONTENT_DIGEST;
use crate::registry::{BlobDownload, Registry};

/// Check if a blob exists
pub(crate) async fn head_blob(
    registry: &Registry,
    name: &str,
    digest: &str,
) -> RegistryResult<Response> {
    let parsed = Digest::parse(digest);
    let size = registry
        .blob_exists(name, &parsed)
        .await?
        .ok_or_else(|| RegistryError::BlobUnknown(digest.to_owned()))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, size.to_string()),
            (DOCKER_CONTENT_DIGEST, parsed.to_string()),
        ],
    )
        .into_response())
}

/// Get a blob, preferably by redirecting to the backend
pub(crate) async fn get_blob(
    registry: &Registry,
    name: &str,
    digest: &str,
) -> RegistryResult<Response> {
    let parsed = Digest::parse(digest);
    let download = registry
        .blob_download(name, &parsed)
        .await?
        .ok_or_else(|| RegistryError::BlobUnknown(digest.to_owned()))?;

    match download {
        BlobDownload::Redirect(uri) => Ok((
            StatusCode::TEMPORARY_REDIRECT,
            [
                (header::LOCATION, uri.to_string()),
                (DOCKER_CONTENT_DIGEST, parsed.to_string()),
            ],
        )
            .into_response()),
        BlobDownload::Content(data) => Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_string()),
                (DOCKER_CONTENT_DIGEST, parsed.to_string()),
            ],
            data,
        )
            .into_response()),
    }
}
