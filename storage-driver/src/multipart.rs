use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{self, AsyncReadExt};

use crate::checksum::{Checksum, Sha256Writer};
use crate::driver::Reader;

/// Opaque token identifying an in-progress multipart upload on the backend.
///
/// The registry never interprets this value, it only hands it back to the
/// driver which created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadHandle(String);

impl UploadHandle {
    /// Wrap a backend-issued upload identifier.
    pub fn new<S: Into<String>>(handle: S) -> Self {
        UploadHandle(handle.into())
    }

    /// The raw backend identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Receipt for one part committed to a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartReceipt {
    /// The 1-based part number assigned by the caller.
    pub part_number: u32,

    /// Entity tag returned by the backend for this part.
    pub etag: String,

    /// Checksum of the part contents, when the backend reports one.
    pub checksum: Option<Checksum>,

    /// Number of bytes in the part.
    pub size: u64,
}

/// The body of a single part upload.
///
/// Parts must have a known length and be re-readable, so a streamed request
/// body is spooled into one of these before it is handed to a driver.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Part contents held in memory.
    Bytes(Bytes),

    /// Part contents spooled to a local file.
    File {
        /// Location of the spooled contents.
        path: PathBuf,
        /// Length of the file in bytes.
        len: u64,
    },
}

impl Payload {
    /// Length of the payload in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Payload::Bytes(bytes) => bytes.len() as u64,
            Payload::File { len, .. } => *len,
        }
    }

    /// Whether the payload carries no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a fresh reader positioned at the start of the payload.
    pub async fn reader(&self) -> io::Result<Box<Reader<'static>>> {
        match self {
            Payload::Bytes(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Payload::File { path, .. } => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::new(io::BufReader::new(file)))
            }
        }
    }

    /// SHA-256 of the payload. Spooled files are hashed while streaming.
    pub async fn checksum(&self) -> io::Result<Checksum> {
        match self {
            Payload::Bytes(bytes) => Ok(Checksum::sha256(bytes)),
            Payload::File { .. } => {
                let mut reader = self.reader().await?;
                let mut hasher = Sha256Writer::new(io::sink());
                io::copy_buf(&mut reader, &mut hasher).await?;
                let (_, checksum, _) = hasher.finish();
                Ok(checksum)
            }
        }
    }

    /// Read the whole payload into memory.
    pub async fn to_bytes(&self) -> io::Result<Bytes> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            Payload::File { path, len } => {
                let mut buf = Vec::with_capacity(*len as usize);
                tokio::fs::File::open(path)
                    .await?
                    .read_to_end(&mut buf)
                    .await?;
                Ok(buf.into())
            }
        }
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&'static [u8]> for Payload {
    fn from(bytes: &'static [u8]) -> Self {
        Payload::Bytes(Bytes::from_static(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn payload_reader_rewinds() {
        let payload = Payload::from(&b"chunk"[..]);
        assert_eq!(payload.len(), 5);

        for _ in 0..2 {
            let mut reader = payload.reader().await.unwrap();
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).await.unwrap();
            assert_eq!(buf, b"chunk");
        }
    }

    #[tokio::test]
    async fn file_checksum_matches_contents() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"spooled chunk").unwrap();
        let payload = Payload::File {
            path: file.path().to_owned(),
            len: 13,
        };

        assert_eq!(
            payload.checksum().await.unwrap(),
            Checksum::sha256(b"spooled chunk")
        );
    }

    #[test]
    fn handle_serializes_as_plain_text() {
        let handle = UploadHandle::new("upload-1");
        assert_eq!(serde_json::to_string(&handle).unwrap(), "\"upload-1\"");
    }
}
