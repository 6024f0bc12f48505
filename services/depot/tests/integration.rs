//! Integration tests for the OCI registry

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, Uri, header};
use camino::Utf8Path;
use depot::{
    Registry, RegistryBuilder, RegistryOptions, SessionState, StaticTokens, UploadId,
};
use sha2::{Digest, Sha256};
use storage::{
    Checksum, Driver, MemoryStorage, Metadata, PartReceipt, Payload, Reader, Storage,
    StorageError, StorageErrorKind, UploadHandle, Writer,
};
use tower::ServiceExt;

fn digest_of(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Helper to create a test registry
fn test_registry() -> (Registry, Router) {
    let storage = MemoryStorage::with_buckets(&["test-registry"]);
    RegistryBuilder::new(storage.into())
        .bucket("test-registry")
        .into_parts()
}

async fn send(app: &Router, method: &str, uri: &str, body: impl Into<Body>) -> Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(body.into())
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn error_code(response: Response<Body>) -> String {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    json["errors"][0]["code"].as_str().unwrap().to_string()
}

fn header_str<'r>(response: &'r Response<Body>, name: &str) -> &'r str {
    response.headers()[name].to_str().unwrap()
}

async fn begin(app: &Router, name: &str) -> String {
    let response = send(app, "POST", &format!("/v2/{name}/blobs/uploads/"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    header_str(&response, "location").to_string()
}

#[tokio::test]
async fn test_api_version_check() {
    let (_, app) = test_registry();

    let response = send(&app, "GET", "/v2/", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_chunked_upload_end_to_end() {
    let (_, app) = test_registry();

    let response = send(&app, "POST", "/v2/acme/blobs/uploads/", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-0");
    let id = header_str(&response, "docker-upload-uuid").to_string();
    let location = header_str(&response, "location").to_string();
    assert_eq!(location, format!("/v2/acme/blobs/uploads/{id}"));

    let response = send(&app, "PATCH", &location, "hello").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-4");

    let response = send(&app, "GET", &location, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header_str(&response, "docker-upload-uuid"), id);

    let digest = digest_of(b"hello");
    let response = send(&app, "PUT", &format!("{location}?digest={digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), digest);
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/acme/blobs/{digest}")
    );

    let response = send(&app, "HEAD", &format!("/v2/acme/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "5");
    assert_eq!(header_str(&response, "docker-content-digest"), digest);

    // Memory storage cannot presign, so the registry serves the bytes.
    let response = send(&app, "GET", &format!("/v2/acme/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"hello");

    let response = send(&app, "PATCH", &location, "more").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");
}

#[tokio::test]
async fn test_final_chunk_in_put_body() {
    let (_, app) = test_registry();
    let location = begin(&app, "library/ubuntu").await;

    send(&app, "PATCH", &location, "layer ").await;
    let digest = digest_of(b"layer data");
    let response = send(&app, "PUT", &format!("{location}?digest={digest}"), "data").await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(
        &app,
        "HEAD",
        &format!("/v2/library/ubuntu/blobs/{digest}"),
        Body::empty(),
    )
    .await;
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
}

#[tokio::test]
async fn test_invalid_repository_name() {
    let (_, app) = test_registry();

    let response = send(&app, "HEAD", "/v2/ACME/blobs/sha256:x", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "NAME_INVALID");
}

#[tokio::test]
async fn test_unknown_blob() {
    let (_, app) = test_registry();

    let digest = digest_of(b"nothing here");
    let response = send(&app, "HEAD", &format!("/v2/acme/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(&app, "GET", "/v2/acme/blobs/sha256:short", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UNKNOWN");
}

#[tokio::test]
async fn test_unknown_routes_and_methods() {
    let (_, app) = test_registry();

    let response = send(&app, "GET", "/v2/acme/tags/list", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "UNSUPPORTED");

    let response = send(&app, "DELETE", "/v2/acme/manifests/latest", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_missing_and_wrong_digest() {
    let (_, app) = test_registry();
    let location = begin(&app, "acme").await;
    send(&app, "PATCH", &location, "hello").await;

    let response = send(&app, "PUT", &location, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let wrong = digest_of(b"goodbye");
    let response = send(&app, "PUT", &format!("{location}?digest={wrong}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "DIGEST_INVALID");

    let response = send(&app, "HEAD", &format!("/v2/acme/blobs/{wrong}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // A rejected upload is gone.
    let response = send(&app, "GET", &location, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_racing_appends_use_distinct_parts() {
    let (registry, app) = test_registry();
    let location = begin(&app, "acme").await;
    let id = location.rsplit('/').next().unwrap().to_string();

    let appends: Vec<_> = (0..8)
        .map(|i| {
            let app = app.clone();
            let location = location.clone();
            tokio::spawn(async move {
                send(&app, "PATCH", &location, format!("chunk-{i};")).await.status()
            })
        })
        .collect();
    for append in appends {
        assert_eq!(append.await.unwrap(), StatusCode::ACCEPTED);
    }

    let session = registry.upload_status("acme", &id).await.unwrap();
    let numbers: Vec<u32> = session.parts.iter().map(|part| part.part_number).collect();
    assert_eq!(numbers, (1..=8).collect::<Vec<_>>());
    assert_eq!(session.next_part_number, 9);
    assert_eq!(session.received, 8 * "chunk-0;".len() as u64);
}

#[tokio::test]
async fn test_abort_releases_upload() {
    let (_, app) = test_registry();
    let location = begin(&app, "acme").await;
    send(&app, "PATCH", &location, "partial").await;

    let response = send(&app, "DELETE", &location, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = send(&app, "PATCH", &location, "more").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");

    let digest = digest_of(b"partial");
    let response = send(&app, "PUT", &format!("{location}?digest={digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");

    let response = send(&app, "DELETE", &location, Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upload_ids_are_scoped_to_repository() {
    let (_, app) = test_registry();
    let location = begin(&app, "acme").await;
    let id = location.rsplit('/').next().unwrap();

    let response = send(&app, "PATCH", &format!("/v2/other/blobs/uploads/{id}"), "x").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");
}

#[tokio::test]
async fn test_expiry_sweep() {
    let (registry, app) = test_registry();
    let stale = begin(&app, "acme").await;

    // Nothing is idle for an hour yet.
    let report = registry.sessions().sweep(Duration::from_secs(3600)).await;
    assert_eq!(report.reclaimed, 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let fresh = begin(&app, "acme").await;

    let report = registry.sessions().sweep(Duration::from_millis(250)).await;
    assert_eq!(report.reclaimed, 1);

    let response = send(&app, "PATCH", &stale, "late").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_UNKNOWN");

    let response = send(&app, "PATCH", &fresh, "on time").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_monolithic_upload() {
    let (_, app) = test_registry();
    let digest = digest_of(b"all at once");

    let response = send(
        &app,
        "POST",
        &format!("/v2/acme/blobs/uploads/?digest={digest}"),
        "all at once",
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), digest);

    let response = send(&app, "HEAD", &format!("/v2/acme/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");
}

#[tokio::test]
async fn test_manifest_tag_and_digest_round_trip() {
    let (_, app) = test_registry();
    let manifest = r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json","config":{},"layers":[]}"#;
    let digest = digest_of(manifest.as_bytes());

    let response = send(&app, "PUT", "/v2/acme/app/manifests/v1.0", manifest).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(header_str(&response, "docker-content-digest"), digest);
    assert_eq!(
        header_str(&response, "location"),
        format!("/v2/acme/app/manifests/{digest}")
    );

    for reference in ["v1.0".to_string(), digest.clone()] {
        let uri = format!("/v2/acme/app/manifests/{reference}");

        let response = send(&app, "HEAD", &uri, Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_LENGTH],
            manifest.len().to_string().as_str()
        );

        let response = send(&app, "GET", &uri, Body::empty()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            header_str(&response, "content-type"),
            "application/vnd.oci.image.manifest.v1+json"
        );
        assert_eq!(header_str(&response, "docker-content-digest"), digest);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], manifest.as_bytes());
    }

    let response = send(&app, "GET", "/v2/acme/app/manifests/v2.0", Body::empty()).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(response).await, "MANIFEST_UNKNOWN");
}

#[tokio::test]
async fn test_manifest_validation() {
    let storage = MemoryStorage::new();
    let options = RegistryOptions {
        manifest_size_limit: 64,
        ..Default::default()
    };
    let app = RegistryBuilder::new(storage.into()).options(options).build();

    let response = send(&app, "PUT", "/v2/acme/manifests/latest", "{not json").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "MANIFEST_INVALID");

    let response = send(&app, "PUT", "/v2/acme/manifests/.hidden", "{}").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "TAG_INVALID");

    let large = format!(r#"{{"schemaVersion":2,"padding":"{}"}}"#, "x".repeat(128));
    let response = send(&app, "PUT", "/v2/acme/manifests/latest", large).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "SIZE_INVALID");
}

/// Memory storage with scripted failures and optional signed download URLs.
#[derive(Debug)]
struct Scripted {
    memory: Arc<MemoryStorage>,
    presign: bool,
    failing_parts: AtomicUsize,
    failing_completions: AtomicUsize,
}

impl Scripted {
    fn with_presign(presign: bool) -> Arc<Self> {
        Arc::new(Self {
            memory: Arc::new(MemoryStorage::new()),
            presign,
            failing_parts: AtomicUsize::new(0),
            failing_completions: AtomicUsize::new(0),
        })
    }

    fn new() -> Arc<Self> {
        Self::with_presign(false)
    }

    fn presigning() -> Arc<Self> {
        Self::with_presign(true)
    }

    fn fail(counter: &AtomicUsize, operation: &str) -> Result<(), StorageError> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(StorageError::builder(
                "scripted",
                StorageErrorKind::ServiceUnavailable,
                format!("{operation} unavailable"),
            )
            .build()),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Driver for Scripted {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn scheme(&self) -> &str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.memory.metadata(bucket, remote).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<Metadata, StorageError> {
        self.memory.download(bucket, remote, writer).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<Checksum, StorageError> {
        self.memory.upload(bucket, remote, reader).await
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.memory.delete(bucket, remote).await
    }

    async fn copy(
        &self,
        bucket: &str,
        source: &Utf8Path,
        destination: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.memory.copy(bucket, source, destination).await
    }

    async fn presign(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        if !self.presign {
            return self.memory.presign(bucket, remote, expires_in).await;
        }
        let uri = format!(
            "https://objects.example.com/{bucket}/{remote}?expires={}",
            expires_in.as_secs()
        );
        Ok(uri.parse().unwrap())
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<UploadHandle, StorageError> {
        self.memory.create_multipart(bucket, remote).await
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
        Self::fail(&self.failing_parts, "upload_part")?;
        self.memory
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
        Self::fail(&self.failing_completions, "complete_multipart")?;
        self.memory
            .complete_multipart(bucket, remote, handle, parts)
            .await
    }

    async fn abort_multipart(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        handle: &UploadHandle,
    ) -> Result<(), StorageError> {
        self.memory.abort_multipart(bucket, remote, handle).await
    }
}

fn scripted_registry(driver: &Arc<Scripted>, options: RegistryOptions) -> (Registry, Router) {
    RegistryBuilder::new(Storage::from_arc(driver.clone()))
        .bucket("blobs")
        .options(options)
        .into_parts()
}

async fn read_blob(app: &Router, name: &str, digest: &str) -> Vec<u8> {
    let response = send(app, "GET", &format!("/v2/{name}/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::OK);
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

fn upload_id(location: &str) -> UploadId {
    UploadId::parse(location.rsplit('/').next().unwrap()).unwrap()
}

#[tokio::test]
async fn test_failed_completion_can_be_retried() {
    let driver = Scripted::new();
    let (registry, app) = scripted_registry(&driver, RegistryOptions::default());
    let location = begin(&app, "acme").await;

    let response = send(&app, "PATCH", &location, "hel").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    driver.failing_completions.store(1, Ordering::SeqCst);
    let digest = digest_of(b"hello");
    let finish = format!("{location}?digest={digest}");

    let response = send(&app, "PUT", &finish, "lo").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let id = upload_id(&location);
    let session = registry.sessions().get(id).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Open);
    assert_eq!(session.received, 3);
    assert_eq!(session.parts.len(), 1);

    let response = send(&app, "PUT", &finish, "lo").await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(read_blob(&app, "acme", &digest).await, b"hello");
    assert_eq!(driver.memory.pending_uploads().await, 0);
}

#[tokio::test]
async fn test_failed_part_consumes_its_number() {
    let driver = Scripted::new();
    let (registry, app) = scripted_registry(&driver, RegistryOptions::default());
    let location = begin(&app, "acme").await;

    send(&app, "PATCH", &location, "a").await;
    driver.failing_parts.store(1, Ordering::SeqCst);
    let response = send(&app, "PATCH", &location, "lost").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let response = send(&app, "PATCH", &location, "c").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(header_str(&response, "range"), "0-1");

    let session = registry.sessions().get(upload_id(&location)).await.unwrap().unwrap();
    let numbers: Vec<u32> = session.parts.iter().map(|part| part.part_number).collect();
    assert_eq!(numbers, vec![1, 3]);
    assert_eq!(session.next_part_number, 4);

    let digest = digest_of(b"ac");
    let response = send(&app, "PUT", &format!("{location}?digest={digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(read_blob(&app, "acme", &digest).await, b"ac");
}

#[tokio::test]
async fn test_finalizing_upload_rejects_appends() {
    let driver = Scripted::new();
    let (registry, app) = scripted_registry(&driver, RegistryOptions::default());
    let location = begin(&app, "acme").await;
    send(&app, "PATCH", &location, "layer").await;

    registry
        .sessions()
        .update_exclusively(upload_id(&location), |session| {
            session.state = SessionState::Finalizing;
        })
        .await
        .unwrap()
        .unwrap();

    let response = send(&app, "PATCH", &location, "more").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(response).await, "BLOB_UPLOAD_INVALID");

    // Finishing again assembles what was already committed.
    let digest = digest_of(b"layer");
    let response = send(&app, "PUT", &format!("{location}?digest={digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(read_blob(&app, "acme", &digest).await, b"layer");
}

#[tokio::test]
async fn test_busy_upload_is_unavailable() {
    let driver = Scripted::new();
    let options = RegistryOptions {
        lock_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let (registry, app) = scripted_registry(&driver, options);
    let location = begin(&app, "acme").await;

    let held = registry.sessions().lock(upload_id(&location)).await.unwrap();
    let response = send(&app, "PATCH", &location, "chunk").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_code(response).await, "UNKNOWN");

    drop(held);
    let response = send(&app, "PATCH", &location, "chunk").await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_blob_download_redirects_to_presigned_url() {
    let driver = Scripted::presigning();
    let (_, app) = scripted_registry(&driver, RegistryOptions::default());

    let digest = digest_of(b"layer");
    let response = send(
        &app,
        "POST",
        &format!("/v2/acme/blobs/uploads/?digest={digest}"),
        "layer",
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = send(&app, "GET", &format!("/v2/acme/blobs/{digest}"), Body::empty()).await;
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    let hex = digest.trim_start_matches("sha256:");
    assert_eq!(
        header_str(&response, "location"),
        format!("https://objects.example.com/blobs/acme/{hex}?expires=900")
    );
    assert!(driver.memory.contains("blobs", Utf8Path::new(&format!("acme/{hex}"))).await);
}

#[tokio::test]
async fn test_bearer_tokens() {
    let storage = MemoryStorage::new();
    let tokens = StaticTokens::new()
        .with_token("ci", "push-token", true)
        .with_token("reader", "pull-token", false);
    let app = RegistryBuilder::new(storage.into())
        .authenticator(tokens, "https://auth.example.com/token", "depot")
        .build();

    let request = |method: &str, uri: &str, token: Option<&str>| {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    };

    let response = app
        .clone()
        .oneshot(request("GET", "/v2/", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        header_str(&response, "www-authenticate"),
        r#"Bearer realm="https://auth.example.com/token",service="depot""#
    );

    let response = app
        .clone()
        .oneshot(request("POST", "/v2/acme/blobs/uploads/", Some("wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        header_str(&response, "www-authenticate"),
        r#"Bearer realm="https://auth.example.com/token",service="depot",scope="repository:acme:push""#
    );
    assert_eq!(error_code(response).await, "UNAUTHORIZED");

    let response = app
        .clone()
        .oneshot(request("POST", "/v2/acme/blobs/uploads/", Some("pull-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(response).await, "DENIED");

    let response = app
        .clone()
        .oneshot(request("POST", "/v2/acme/blobs/uploads/", Some("push-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(request("GET", "/v2/acme/manifests/latest", Some("pull-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
