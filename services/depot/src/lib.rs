//! # OCI Container Registry
//!
//! This crate implements an OCI registry server following the
//! [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec),
//! backed by any object store the `storage` crate can drive.
//!
//! ## Features
//!
//! - Chunked and monolithic blob uploads, assembled with backend multipart uploads
//! - Upload sessions persisted in the bucket, so any process can serve the next chunk
//! - Per-upload locking and a background sweeper for abandoned uploads
//! - Blob downloads redirected to presigned URLs where the backend supports them
//! - Manifest storage by tag and by digest
//! - Optional bearer token authentication
//!
//! ## Example
//!
//! ```no_run
//! use depot::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["registry"]);
//! let (registry, app) = RegistryBuilder::new(storage.into())
//!     .bucket("registry")
//!     .into_parts();
//! registry.spawn_sweeper();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:5000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```

mod api;
mod auth;
mod blob;
#[cfg(feature = "cli")]
pub mod config;
mod digest;
mod error;
mod manifest;
mod registry;
mod routes;
mod session;
mod spool;
mod store;
mod upload;

pub use api::RegistryBuilder;
pub use auth::{Authenticator, Principal, StaticTokens};
pub use digest::{ChecksumDecodeError, Digest, SHA256_PREFIX};
pub use error::{ErrorCode, RegistryError, RegistryResult};
pub use registry::{BlobDownload, Manifest, Registry, RegistryOptions, validate_repository_name};
pub use session::{SessionState, UploadId, UploadSession};
pub use store::{SessionGuard, SessionStore, SessionStoreError, SweepReport};
