//! Request bodies spooled into re-readable part payloads

use axum::body::Body;
use bytes::BytesMut;
use futures::StreamExt;
use storage::Payload;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::error::{RegistryError, RegistryResult};

/// A request body with a known length.
///
/// Bodies larger than the memory limit live in a temporary file, which is
/// removed when this value is dropped.
#[derive(Debug)]
pub(crate) struct Spooled {
    payload: Payload,
    _file: Option<NamedTempFile>,
}

impl Spooled {
    pub(crate) fn payload(&self) -> &Payload {
        &self.payload
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Read `body` to the end, keeping up to `memory_limit` bytes in memory.
pub(crate) async fn spool(body: Body, memory_limit: usize) -> RegistryResult<Spooled> {
    let mut stream = body.into_data_stream();
    let mut buffer = BytesMut::new();
    let mut file: Option<(NamedTempFile, tokio::fs::File)> = None;
    let mut len = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| {
            RegistryError::BlobUploadInvalid(format!("unable to read request body: {error}"))
        })?;
        len += chunk.len() as u64;

        match &mut file {
            Some((_, writer)) => writer.write_all(&chunk).await?,
            None if buffer.len() + chunk.len() > memory_limit => {
                let named = NamedTempFile::new()?;
                let mut writer = tokio::fs::File::from_std(named.reopen()?);
                writer.write_all(&buffer).await?;
                writer.write_all(&chunk).await?;
                buffer.clear();
                tracing::trace!(path = %named.path().display(), "spooling body to disk");
                file = Some((named, writer));
            }
            None => buffer.extend_from_slice(&chunk),
        }
    }

    match file {
        Some((named, mut writer)) => {
            writer.flush().await?;
            Ok(Spooled {
                payload: Payload::File {
                    path: named.path().to_owned(),
                    len,
                },
                _file: Some(named),
            })
        }
        None => Ok(Spooled {
            payload: Payload::Bytes(buffer.freeze()),
            _file: None,
        }),
    }
}
