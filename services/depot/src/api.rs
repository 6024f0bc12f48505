//! API server builder and router

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::auth::{AuthGate, Authenticator};
use crate::blob::{get_blob, head_blob};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::{get_manifest, put_manifest};
use crate::registry::{Registry, RegistryOptions};
use crate::routes::Route;
use crate::upload::{
    DigestQuery, cancel_upload, complete_upload, patch_upload, start_upload, upload_status,
};

/// Registry builder for configuring and creating the OCI registry service
#[derive(Debug)]
pub struct RegistryBuilder {
    storage: storage::Storage,
    bucket: Option<String>,
    options: RegistryOptions,
    auth: Option<AuthGate>,
}

impl RegistryBuilder {
    /// Create a new registry builder over a storage backend
    pub fn new(storage: storage::Storage) -> Self {
        Self {
            storage,
            bucket: None,
            options: RegistryOptions::default(),
            auth: None,
        }
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Replace the registry tunables
    pub fn options(mut self, options: RegistryOptions) -> Self {
        self.options = options;
        self
    }

    /// Require bearer tokens verified by `authenticator`
    ///
    /// `realm` and `service` are echoed in the challenge sent to
    /// unauthenticated clients.
    pub fn authenticator<A>(
        mut self,
        authenticator: A,
        realm: impl Into<String>,
        service: impl Into<String>,
    ) -> Self
    where
        A: Authenticator + 'static,
    {
        self.auth = Some(AuthGate {
            authenticator: Arc::new(authenticator),
            realm: realm.into(),
            service: service.into(),
        });
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        self.into_parts().1
    }

    /// Build the registry service, keeping a handle to the core
    ///
    /// The core is needed to run the upload expiry sweeper.
    pub fn into_parts(self) -> (Registry, Router) {
        let bucket = self.bucket.unwrap_or_else(|| "registry".to_string());
        let registry = Registry::new(&self.storage, bucket, self.options);

        let mut router = Router::new()
            .route("/v2/", get(api_version_check))
            .route("/v2/{*rest}", any(dispatch))
            .with_state(registry.clone());

        if let Some(gate) = self.auth {
            router = router.layer(axum::middleware::from_fn_with_state(
                gate,
                crate::auth::authenticate,
            ));
        }

        (registry, router.layer(TraceLayer::new_for_http()))
    }
}

/// API version check endpoint
///
/// Returns 200 OK to indicate the registry is available
async fn api_version_check() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({})))
}

fn digest_query(uri: &Uri) -> RegistryResult<DigestQuery> {
    Query::<DigestQuery>::try_from_uri(uri)
        .map(|Query(query)| query)
        .map_err(|error| RegistryError::DigestInvalid(error.body_text()))
}

async fn dispatch(
    State(registry): State<Registry>,
    Path(rest): Path<String>,
    request: Request,
) -> RegistryResult<Response> {
    let route =
        Route::parse(&rest).ok_or_else(|| RegistryError::Unsupported(format!("/v2/{rest}")))?;
    let method = request.method().clone();

    tracing::trace!(?route, %method, "dispatching");
    let response = match (route, method) {
        (Route::Blob { name, digest }, Method::HEAD) => head_blob(&registry, &name, &digest).await?,
        (Route::Blob { name, digest }, Method::GET) => get_blob(&registry, &name, &digest).await?,

        (Route::Uploads { name }, Method::POST) => {
            let query = digest_query(request.uri())?;
            start_upload(&registry, &name, query, request.into_body()).await?
        }

        (Route::Upload { name, id }, Method::GET) => upload_status(&registry, &name, &id).await?,
        (Route::Upload { name, id }, Method::PATCH) => {
            patch_upload(&registry, &name, &id, request.into_body()).await?
        }
        (Route::Upload { name, id }, Method::PUT) => {
            let query = digest_query(request.uri())?;
            complete_upload(&registry, &name, &id, query, request.into_body()).await?
        }
        (Route::Upload { name, id }, Method::DELETE) => {
            cancel_upload(&registry, &name, &id).await?.into_response()
        }

        (Route::Manifest { name, reference }, Method::HEAD) => {
            get_manifest(&registry, &name, &reference, true).await?
        }
        (Route::Manifest { name, reference }, Method::GET) => {
            get_manifest(&registry, &name, &reference, false).await?
        }
        (Route::Manifest { name, reference }, Method::PUT) => {
            put_manifest(&registry, &name, &reference, request.into_body()).await?
        }

        (_, method) => return Err(RegistryError::MethodNotAllowed(method)),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let storage = storage::MemoryStorage::with_buckets(&["test"]);
        let (registry, _router) = RegistryBuilder::new(storage.into())
            .bucket("test")
            .into_parts();
        assert_eq!(registry.options().manifest_size_limit, 4 * 1024 * 1024);
    }
}
