use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::io::{self, AsyncWrite};

/// A SHA-256 content checksum, in the base64 encoding object stores use
/// for their `x-amz-checksum-sha256` style headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    /// Compute the checksum of a complete byte slice.
    pub fn sha256(data: &[u8]) -> Self {
        Self::from_raw(&Sha256::digest(data))
    }

    /// Wrap a raw (binary) SHA-256 hash value.
    pub fn from_raw(raw: &[u8]) -> Self {
        Checksum(STANDARD.encode(raw))
    }

    /// Wrap a checksum which is already base64 encoded, e.g. one returned
    /// by a remote object store.
    pub fn from_base64<S: Into<String>>(encoded: S) -> Self {
        Checksum(encoded.into())
    }

    /// The base64 form of this checksum.
    pub fn as_base64(&self) -> &str {
        &self.0
    }

    /// Decode the checksum back into the raw hash bytes.
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.0.as_bytes())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An [`AsyncWrite`] adaptor which hashes every byte written through it.
///
/// Wrap [`tokio::io::sink`] to hash a stream without keeping it.
#[pin_project::pin_project]
#[derive(Debug)]
pub struct Sha256Writer<W> {
    #[pin]
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W> Sha256Writer<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Number of bytes which have passed through the writer so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Consume the adaptor, returning the inner writer, the checksum of
    /// everything written, and the number of bytes written.
    pub fn finish(self) -> (W, Checksum, u64) {
        let checksum = Checksum::from_raw(&self.hasher.finalize());
        (self.inner, checksum, self.written)
    }
}

impl<W> AsyncWrite for Sha256Writer<W>
where
    W: AsyncWrite,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.hasher.update(&buf[..n]);
                *this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
