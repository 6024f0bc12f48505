//! Blob upload endpoints

use axum::body::Body;
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::DOCKER_CONTENT_DIGEST;
use crate::registry::Registry;
use crate::session::UploadSession;
use crate::spool::spool;

const DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");

/// Query string accepted by upload endpoints
#[derive(Debug, Default, Deserialize)]
pub(crate) struct DigestQuery {
    pub(crate) digest: Option<String>,
}

fn accepted(session: &UploadSession) -> Response {
    (
        StatusCode::ACCEPTED,
        [
            (
                header::LOCATION,
                format!("/v2/{}/blobs/uploads/{}", session.repository, session.id),
            ),
            (header::RANGE, session.range()),
            (DOCKER_UPLOAD_UUID, session.id.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

fn created(name: &str, digest: &Digest) -> Response {
    (
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/blobs/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response()
}

fn required_digest(query: DigestQuery) -> RegistryResult<Digest> {
    let raw = query
        .digest
        .ok_or_else(|| RegistryError::DigestInvalid("digest query parameter is required".into()))?;
    Digest::parse_canonical(&raw).ok_or(RegistryError::DigestInvalid(raw))
}

/// Start a blob upload, or upload a whole blob when a digest is given
pub(crate) async fn start_upload(
    registry: &Registry,
    name: &str,
    query: DigestQuery,
    body: Body,
) -> RegistryResult<Response> {
    if query.digest.is_none() {
        let session = registry.begin_upload(name).await?;
        return Ok(accepted(&session));
    }

    let digest = required_digest(query)?;
    let spooled = spool(body, registry.options().spool_memory_limit).await?;
    let session = registry.begin_upload(name).await?;
    let id = session.id.to_string();

    match registry
        .finish_upload(name, &id, &digest, Some(spooled.payload()))
        .await
    {
        Ok(digest) => Ok(created(name, &digest)),
        Err(error) => {
            if let Err(abort) = registry.abort_upload(name, &id).await {
                tracing::debug!(%id, error = %abort, "monolithic upload already released");
            }
            Err(error)
        }
    }
}

/// Upload one chunk
pub(crate) async fn patch_upload(
    registry: &Registry,
    name: &str,
    id: &str,
    body: Body,
) -> RegistryResult<Response> {
    let spooled = spool(body, registry.options().spool_memory_limit).await?;
    let session = registry.append_upload(name, id, spooled.payload()).await?;
    Ok(accepted(&session))
}

/// Finish an upload, with an optional final chunk
pub(crate) async fn complete_upload(
    registry: &Registry,
    name: &str,
    id: &str,
    query: DigestQuery,
    body: Body,
) -> RegistryResult<Response> {
    let digest = required_digest(query)?;
    let spooled = spool(body, registry.options().spool_memory_limit).await?;
    let last_chunk = (!spooled.is_empty()).then(|| spooled.payload());

    let digest = registry.finish_upload(name, id, &digest, last_chunk).await?;
    Ok(created(name, &digest))
}

/// Report upload progress
pub(crate) async fn upload_status(
    registry: &Registry,
    name: &str,
    id: &str,
) -> RegistryResult<Response> {
    let session = registry.upload_status(name, id).await?;
    Ok((
        StatusCode::NO_CONTENT,
        [
            (
                header::LOCATION,
                format!("/v2/{}/blobs/uploads/{}", session.repository, session.id),
            ),
            (header::RANGE, session.range()),
            (DOCKER_UPLOAD_UUID, session.id.to_string()),
        ],
    )
        .into_response())
}

/// Cancel a blob upload
pub(crate) async fn cancel_upload(
    registry: &Registry,
    name: &str,
    id: &str,
) -> RegistryResult<StatusCode> {
    registry.abort_upload(name, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
