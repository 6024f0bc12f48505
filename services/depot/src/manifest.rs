//! Manifest endpoints

use axum::body::Body;
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::BytesMut;
use futures::StreamExt;

use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;

pub(crate) const DOCKER_CONTENT_DIGEST: HeaderName =
    HeaderName::from_static("docker-content-digest");

/// Fetch a manifest. `HEAD` requests get the headers only.
pub(crate) async fn get_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
    head: bool,
) -> RegistryResult<Response> {
    let manifest = registry
        .resolve_manifest(name, reference)
        .await?
        .ok_or_else(|| RegistryError::ManifestUnknown(reference.to_owned()))?;

    let headers = [
        (header::CONTENT_TYPE, manifest.media_type.clone()),
        (DOCKER_CONTENT_DIGEST, manifest.digest.to_string()),
        (header::CONTENT_LENGTH, manifest.size().to_string()),
    ];

    if head {
        Ok((StatusCode::OK, headers).into_response())
    } else {
        Ok((StatusCode::OK, headers, manifest.bytes).into_response())
    }
}

/// Store a manifest under `reference`.
pub(crate) async fn put_manifest(
    registry: &Registry,
    name: &str,
    reference: &str,
    body: Body,
) -> RegistryResult<Response> {
    let data = read_manifest(body, registry.options().manifest_size_limit).await?;
    if let Err(error) = serde_json::from_slice::<serde_json::Value>(&data) {
        return Err(RegistryError::ManifestInvalid(error.to_string()));
    }

    let digest = registry.save_manifest(name, reference, &data).await?;

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/v2/{name}/manifests/{digest}")),
            (DOCKER_CONTENT_DIGEST, digest.to_string()),
            (header::CONTENT_LENGTH, "0".to_string()),
        ],
    )
        .into_response())
}

async fn read_manifest(body: Body, limit: usize) -> RegistryResult<BytesMut> {
    let mut stream = body.into_data_stream();
    let mut data = BytesMut::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| {
            RegistryError::ManifestInvalid(format!("unable to read request body: {error}"))
        })?;
        if data.len() + chunk.len() > limit {
            return Err(RegistryError::SizeInvalid {
                size: (data.len() + chunk.len()) as u64,
                limit: limit as u64,
            });
        }
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

/// Detect manifest type from content
pub(crate) fn detect_manifest_type(data: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(data) {
        if let Some(media_type) = json.get("mediaType").and_then(|v| v.as_str()) {
            return media_type.to_string();
        }

        if let Some(schema_version) = json.get("schemaVersion").and_then(|v| v.as_u64()) {
            return match schema_version {
                1 => "application/vnd.docker.distribution.manifest.v1+json".to_string(),
                2 if json.get("manifests").is_some() => {
                    "application/vnd.oci.image.index.v1+json".to_string()
                }
                _ => "application/vnd.oci.image.manifest.v1+json".to_string(),
            };
        }
    }

    "application/vnd.oci.image.manifest.v1+json".to_string()
}
