//! Content digests

use std::fmt;

use sha2::Digest as _;
use storage::Checksum;

/// The algorithm prefix of every digest this registry produces.
pub const SHA256_PREFIX: &str = "sha256:";

/// A SHA-256 content digest.
///
/// Parsing is lenient: an optional `sha256:` prefix is stripped and the rest
/// is kept verbatim. Use [`Digest::is_canonical`] before trusting a parsed
/// value as a storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    hex: String,
}

/// A backend checksum which could not be turned into a digest.
#[derive(Debug, thiserror::Error)]
#[error("checksum {checksum} is not valid base64")]
pub struct ChecksumDecodeError {
    checksum: String,
    #[source]
    source: base64::DecodeError,
}

impl Digest {
    /// Parse a digest, with or without its `sha256:` prefix.
    pub fn parse(raw: &str) -> Self {
        let hex = raw.strip_prefix(SHA256_PREFIX).unwrap_or(raw);
        Digest {
            hex: hex.to_owned(),
        }
    }

    /// Parse a digest which must be in canonical `sha256:<64 lowercase hex>` form.
    pub fn parse_canonical(raw: &str) -> Option<Self> {
        raw.strip_prefix(SHA256_PREFIX)
            .map(Digest::parse)
            .filter(Digest::is_canonical)
    }

    /// Digest of a byte slice.
    pub fn of(data: &[u8]) -> Self {
        Digest {
            hex: hex::encode(sha2::Sha256::digest(data)),
        }
    }

    /// Convert a base64 checksum reported by the storage backend.
    pub fn from_checksum(checksum: &Checksum) -> Result<Self, ChecksumDecodeError> {
        let raw = checksum.decode().map_err(|source| ChecksumDecodeError {
            checksum: checksum.to_string(),
            source,
        })?;
        Ok(Digest {
            hex: hex::encode(raw),
        })
    }

    /// The hash value without its algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Whether the hash is exactly 64 lowercase hex characters.
    pub fn is_canonical(&self) -> bool {
        self.hex.len() == 64
            && self
                .hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SHA256_PREFIX}{}", self.hex)
    }
}
