//! Server configuration file
//!
//! ```toml
//! bind = "0.0.0.0:5000"
//! bucket = "registry"
//!
//! [storage.local]
//! path = "/var/lib/depot"
//!
//! [uploads]
//! ttl_secs = 3600
//!
//! [auth]
//! realm = "https://auth.example.com/token"
//! service = "depot"
//!
//! [[auth.tokens]]
//! subject = "ci"
//! token = "..."
//! push = true
//! ```

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use secret::Secret;
use serde::Deserialize;
use storage::StorageConfig;

use crate::auth::StaticTokens;
use crate::registry::RegistryOptions;

/// Why a configuration file could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigErrorKind {
    /// The file could not be read.
    #[error("IO: {0}")]
    Io(#[from] io::Error),

    /// The file is not valid configuration.
    #[error("TOML: {0}")]
    Toml(#[from] toml_edit::de::Error),
}

/// A configuration file could not be loaded.
#[derive(Debug, thiserror::Error)]
#[error("Reading configuration from {path}")]
pub struct ConfigError {
    path: Utf8PathBuf,
    source: ConfigErrorKind,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_bucket() -> String {
    "registry".to_string()
}

fn default_presign_ttl_secs() -> u64 {
    900
}

fn default_manifest_size_limit() -> usize {
    4 * 1024 * 1024
}

/// Top level configuration for `depot-server`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address to listen on.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Bucket holding blobs, manifests and session records.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Object store backend.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Upload session tunables.
    #[serde(default)]
    pub uploads: UploadsConfig,

    /// Lifetime of presigned download URLs.
    #[serde(default = "default_presign_ttl_secs")]
    pub presign_ttl_secs: u64,

    /// Largest accepted manifest, in bytes.
    #[serde(default = "default_manifest_size_limit")]
    pub manifest_size_limit: usize,

    /// Require bearer tokens when present.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

/// Upload session tunables.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadsConfig {
    /// Idle seconds before a session is reclaimed.
    pub ttl_secs: u64,
    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,
    /// Milliseconds to wait for a session lock.
    pub lock_timeout_ms: u64,
    /// Hash assembled blobs before committing them.
    pub verify_digest: bool,
    /// Chunks larger than this are spooled to disk.
    pub spool_memory_limit: usize,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            sweep_interval_secs: 30,
            lock_timeout_ms: 3000,
            verify_digest: true,
            spool_memory_limit: 8 * 1024 * 1024,
        }
    }
}

/// Bearer token settings.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Token endpoint advertised in challenges.
    pub realm: String,
    /// Service name advertised in challenges.
    pub service: String,
    /// Accepted tokens.
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

/// One accepted bearer token.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    /// Who the token belongs to.
    pub subject: String,
    /// The bearer token itself.
    pub token: Secret,
    /// Whether the token may push.
    #[serde(default)]
    pub push: bool,
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml_edit::de::Error> {
        toml_edit::de::from_str(text)
    }

    /// Read and parse a configuration file.
    pub async fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let wrap = |source: ConfigErrorKind| ConfigError {
            path: path.to_path_buf(),
            source,
        };
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| wrap(error.into()))?;
        Self::from_toml(&text).map_err(|error| wrap(error.into()))
    }

    /// Registry tunables derived from this file.
    pub fn options(&self) -> RegistryOptions {
        RegistryOptions {
            presign_ttl: Duration::from_secs(self.presign_ttl_secs),
            verify_digest: self.uploads.verify_digest,
            manifest_size_limit: self.manifest_size_limit,
            spool_memory_limit: self.uploads.spool_memory_limit,
            lock_timeout: Duration::from_millis(self.uploads.lock_timeout_ms),
            upload_ttl: Duration::from_secs(self.uploads.ttl_secs),
            sweep_interval: Duration::from_secs(self.uploads.sweep_interval_secs),
        }
    }
}

impl AuthConfig {
    /// The configured tokens as an authenticator.
    pub fn authenticator(&self) -> StaticTokens {
        self.tokens.iter().fold(StaticTokens::new(), |tokens, entry| {
            tokens.with_token(entry.subject.clone(), entry.token.clone(), entry.push)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_file() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.bind, default_bind());
        assert_eq!(config.bucket, "registry");
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert!(config.auth.is_none());

        let options = config.options();
        assert_eq!(options.upload_ttl, Duration::from_secs(3600));
        assert_eq!(options.lock_timeout, Duration::from_secs(3));
        assert!(options.verify_digest);
    }

    #[test]
    fn full_file() {
        let config = Config::from_toml(
            r#"
            bind = "0.0.0.0:8080"
            bucket = "images"
            presign_ttl_secs = 60

            [storage.local]
            path = "/var/lib/depot"

            [uploads]
            ttl_secs = 600
            verify_digest = false

            [auth]
            realm = "https://auth.example.com/token"
            service = "depot"

            [[auth.tokens]]
            subject = "ci"
            token = "s3cret"
            push = true
            "#,
        )
        .unwrap();

        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.bucket, "images");
        assert!(
            matches!(&config.storage, StorageConfig::Local { path } if path == "/var/lib/depot")
        );

        let options = config.options();
        assert_eq!(options.presign_ttl, Duration::from_secs(60));
        assert_eq!(options.upload_ttl, Duration::from_secs(600));
        assert_eq!(options.sweep_interval, Duration::from_secs(30));
        assert!(!options.verify_digest);

        let auth = config.auth.unwrap();
        assert_eq!(auth.tokens.len(), 1);
        assert_eq!(auth.tokens[0].token.revealed(), "s3cret");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml("bnid = \"0.0.0.0:1\"").is_err());
    }
}
