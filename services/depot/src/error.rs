//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use storage::{StorageError, StorageErrorKind};

use crate::session::UploadId;
use crate::store::SessionStoreError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error codes from the distribution protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Invalid repository name
    NameInvalid,
    /// Repository name not known to registry
    NameUnknown,
    /// Provided digest did not match uploaded content
    DigestInvalid,
    /// Provided length did not match content length
    SizeInvalid,
    /// Manifest tag did not match URI
    TagInvalid,
    /// Blob unknown to registry
    BlobUnknown,
    /// Blob upload invalid
    BlobUploadInvalid,
    /// Blob upload unknown to registry
    BlobUploadUnknown,
    /// Blob unknown to registry, referenced by a manifest
    ManifestBlobUnknown,
    /// Manifest invalid
    ManifestInvalid,
    /// Manifest unknown
    ManifestUnknown,
    /// Manifest failed signature verification
    ManifestUnverified,
    /// Authentication required
    Unauthorized,
    /// Requested access to the resource is denied
    Denied,
    /// The operation is unsupported
    Unsupported,
    /// Internal failure
    Unknown,
}

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Repository name does not match the naming rules
    #[error("invalid repository name: {0}")]
    NameInvalid(String),

    /// Blob not found
    #[error("blob unknown to registry: {0}")]
    BlobUnknown(String),

    /// Upload session not found (absent, expired, aborted or finished)
    #[error("blob upload unknown to registry: {0}")]
    UploadUnknown(String),

    /// Upload cannot accept this request in its current state
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    DigestInvalid(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Digest the client declared
        expected: String,
        /// Digest of the bytes received
        actual: String,
    },

    /// Manifest not found
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    ManifestInvalid(String),

    /// Tag does not match the tag rules
    #[error("invalid tag: {0}")]
    TagInvalid(String),

    /// Body exceeds the allowed size
    #[error("content of {size} bytes exceeds the limit of {limit} bytes")]
    SizeInvalid {
        /// Size of the rejected content, if known
        size: u64,
        /// Configured limit
        limit: u64,
    },

    /// No valid credentials were presented
    #[error("authentication required")]
    Unauthorized,

    /// Credentials do not grant the requested access
    #[error("requested access to the resource is denied")]
    Denied,

    /// No such endpoint
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Known endpoint, wrong method
    #[error("method {0} is not allowed here")]
    MethodNotAllowed(axum::http::Method),

    /// Session lock not acquired in time
    #[error("upload {0} is busy, retry the request")]
    LockTimeout(UploadId),

    /// Session store failure
    #[error("upload session store: {0}")]
    Session(SessionStoreError),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SessionStoreError> for RegistryError {
    fn from(error: SessionStoreError) -> Self {
        match error {
            SessionStoreError::LockTimeout(id) => RegistryError::LockTimeout(id),
            SessionStoreError::Storage(error) => RegistryError::Storage(error),
            other => RegistryError::Session(other),
        }
    }
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::BlobUnknown(_)
            | RegistryError::UploadUnknown(_)
            | RegistryError::ManifestUnknown(_)
            | RegistryError::Unsupported(_) => StatusCode::NOT_FOUND,
            RegistryError::NameInvalid(_)
            | RegistryError::BlobUploadInvalid(_)
            | RegistryError::DigestInvalid(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::ManifestInvalid(_)
            | RegistryError::TagInvalid(_)
            | RegistryError::SizeInvalid { .. } => StatusCode::BAD_REQUEST,
            RegistryError::Unauthorized => StatusCode::UNAUTHORIZED,
            RegistryError::Denied => StatusCode::FORBIDDEN,
            RegistryError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            RegistryError::LockTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::Storage(error) if error.kind() == StorageErrorKind::ServiceUnavailable => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RegistryError::Storage(_) | RegistryError::Session(_) | RegistryError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RegistryError::NameInvalid(_) => ErrorCode::NameInvalid,
            RegistryError::BlobUnknown(_) => ErrorCode::BlobUnknown,
            RegistryError::UploadUnknown(_) => ErrorCode::BlobUploadUnknown,
            RegistryError::BlobUploadInvalid(_) => ErrorCode::BlobUploadInvalid,
            RegistryError::DigestInvalid(_) | RegistryError::DigestMismatch { .. } => {
                ErrorCode::DigestInvalid
            }
            RegistryError::ManifestUnknown(_) => ErrorCode::ManifestUnknown,
            RegistryError::ManifestInvalid(_) => ErrorCode::ManifestInvalid,
            RegistryError::TagInvalid(_) => ErrorCode::TagInvalid,
            RegistryError::SizeInvalid { .. } => ErrorCode::SizeInvalid,
            RegistryError::Unauthorized => ErrorCode::Unauthorized,
            RegistryError::Denied => ErrorCode::Denied,
            RegistryError::Unsupported(_) | RegistryError::MethodNotAllowed(_) => {
                ErrorCode::Unsupported
            }
            RegistryError::LockTimeout(_)
            | RegistryError::Session(_)
            | RegistryError::Storage(_)
            | RegistryError::Io(_) => ErrorCode::Unknown,
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            RegistryError::DigestMismatch { expected, .. } => Some(expected.clone()),
            RegistryError::LockTimeout(id) => Some(id.to_string()),
            _ => None,
        }
    }
}

/// OCI error response format
#[derive(Debug, Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: ErrorCode,
    message: String,
    detail: Option<String>,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.to_string(),
                detail: self.detail(),
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}
