//! Registry core: blobs, manifests and the upload lifecycle.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use axum::http::Uri;
use regex::Regex;
use storage::{Payload, Sha256Writer, Storage, StorageBucket, StorageErrorKind};

use crate::digest::{Digest, SHA256_PREFIX};
use crate::error::{RegistryError, RegistryResult};
use crate::manifest::detect_manifest_type;
use crate::session::{SessionState, UploadId, UploadSession};
use crate::store::{SessionGuard, SessionStore};

static REPOSITORY_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[/._-][a-z0-9]+)*$").expect("repository name pattern")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}$").expect("tag pattern"));

/// Tunables for the registry core.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Lifetime of presigned blob download URLs.
    pub presign_ttl: Duration,

    /// Hash the assembled blob and compare it with the client's digest before committing.
    pub verify_digest: bool,

    /// Largest accepted manifest body, in bytes.
    pub manifest_size_limit: usize,

    /// Upload chunks up to this size are held in memory, larger ones are spooled to disk.
    pub spool_memory_limit: usize,

    /// How long a request waits for an upload session lock.
    pub lock_timeout: Duration,

    /// Idle time after which an upload session is reclaimed.
    pub upload_ttl: Duration,

    /// How often idle sessions are swept.
    pub sweep_interval: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            presign_ttl: Duration::from_secs(900),
            verify_digest: true,
            manifest_size_limit: 4 * 1024 * 1024,
            spool_memory_limit: 8 * 1024 * 1024,
            lock_timeout: Duration::from_secs(3),
            upload_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// How a client should fetch a blob.
#[derive(Debug)]
pub enum BlobDownload {
    /// Fetch the blob directly from the object store.
    Redirect(Uri),

    /// The backend cannot presign, so the registry serves the bytes itself.
    Content(Bytes),
}

/// A stored manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// The exact bytes that were pushed.
    pub bytes: Bytes,

    /// Media type detected from the document.
    pub media_type: String,

    /// Digest of `bytes`.
    pub digest: Digest,
}

impl Manifest {
    /// Size of the manifest in bytes.
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// The registry core.
///
/// Cheap to clone; every clone shares the same backend and session store.
#[derive(Debug, Clone)]
pub struct Registry {
    bucket: StorageBucket,
    sessions: SessionStore,
    options: Arc<RegistryOptions>,
}

/// Reject repository names outside the distribution naming rules.
pub fn validate_repository_name(name: &str) -> RegistryResult<()> {
    if REPOSITORY_NAME.is_match(name) {
        Ok(())
    } else {
        Err(RegistryError::NameInvalid(name.to_owned()))
    }
}

fn blob_key(name: &str, digest: &Digest) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{name}/{}", digest.hex()))
}

fn manifest_key(name: &str, reference: &str) -> Utf8PathBuf {
    let reference = reference.strip_prefix(SHA256_PREFIX).unwrap_or(reference);
    Utf8PathBuf::from(format!("{name}/{reference}.json"))
}

impl Registry {
    /// Serve `bucket` from `storage`.
    pub fn new(storage: &Storage, bucket: impl Into<String>, options: RegistryOptions) -> Self {
        let bucket = storage.bucket(bucket);
        let sessions = SessionStore::new(bucket.clone(), options.lock_timeout);
        Self {
            bucket,
            sessions,
            options: Arc::new(options),
        }
    }

    /// The upload session store.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Registry tunables.
    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Start the background task which reclaims idle upload sessions.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.sessions
            .spawn_sweeper(self.options.sweep_interval, self.options.upload_ttl)
    }

    /// Size of a blob, or `None` when the repository does not hold it.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn blob_exists(&self, name: &str, digest: &Digest) -> RegistryResult<Option<u64>> {
        validate_repository_name(name)?;
        if !digest.is_canonical() {
            return Ok(None);
        }

        match self.bucket.metadata(&blob_key(name, digest)).await {
            Ok(metadata) => Ok(Some(metadata.size)),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Where a client can download a blob, or `None` when it does not exist.
    #[tracing::instrument(skip(self), fields(%digest))]
    pub async fn blob_download(
        &self,
        name: &str,
        digest: &Digest,
    ) -> RegistryResult<Option<BlobDownload>> {
        if self.blob_exists(name, digest).await?.is_none() {
            return Ok(None);
        }

        let key = blob_key(name, digest);
        match self.bucket.presign(&key, self.options.presign_ttl).await {
            Ok(uri) => Ok(Some(BlobDownload::Redirect(uri))),
            Err(error) if error.kind() == StorageErrorKind::Unsupported => {
                tracing::trace!("backend cannot presign, serving blob directly");
                match self.bucket.read(&key).await {
                    Ok((data, _)) => Ok(Some(BlobDownload::Content(data.into()))),
                    Err(error) if error.is_not_found() => Ok(None),
                    Err(error) => Err(error.into()),
                }
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Look up a manifest by tag or digest.
    ///
    /// Both reference kinds share one key space once the `sha256:` prefix is removed.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_manifest(
        &self,
        name: &str,
        reference: &str,
    ) -> RegistryResult<Option<Manifest>> {
        validate_repository_name(name)?;

        let (data, metadata) = match self.bucket.read(&manifest_key(name, reference)).await {
            Ok(found) => found,
            Err(error) if error.is_not_found() => return Ok(None),
            Err(error) => return Err(error.into()),
        };

        let digest = match metadata.checksum.as_ref().map(Digest::from_checksum) {
            Some(Ok(digest)) => digest,
            Some(Err(error)) => {
                tracing::warn!(%error, "backend checksum unusable, hashing manifest");
                Digest::of(&data)
            }
            None => Digest::of(&data),
        };

        Ok(Some(Manifest {
            media_type: detect_manifest_type(&data),
            bytes: data.into(),
            digest,
        }))
    }

    /// Store a manifest under its reference and under its digest.
    #[tracing::instrument(skip(self, data), fields(size = data.len()))]
    pub async fn save_manifest(
        &self,
        name: &str,
        reference: &str,
        data: &[u8],
    ) -> RegistryResult<Digest> {
        validate_repository_name(name)?;

        let limit = self.options.manifest_size_limit;
        if data.len() > limit {
            return Err(RegistryError::SizeInvalid {
                size: data.len() as u64,
                limit: limit as u64,
            });
        }

        if reference.starts_with(SHA256_PREFIX) {
            let claimed = Digest::parse(reference);
            let actual = Digest::of(data);
            if claimed != actual {
                return Err(RegistryError::DigestMismatch {
                    expected: claimed.to_string(),
                    actual: actual.to_string(),
                });
            }
        } else if !TAG.is_match(reference) {
            return Err(RegistryError::TagInvalid(reference.to_owned()));
        }

        let key = manifest_key(name, reference);
        let checksum = self.bucket.write(&key, data).await?;
        let digest = match Digest::from_checksum(&checksum) {
            Ok(digest) => digest,
            Err(error) => {
                tracing::warn!(%error, "backend checksum unusable, hashing manifest");
                Digest::of(data)
            }
        };

        let content_key = manifest_key(name, digest.hex());
        if content_key != key {
            self.bucket.copy(&key, &content_key).await?;
        }

        tracing::info!(%digest, "stored manifest");
        Ok(digest)
    }

    /// Begin a chunked upload.
    #[tracing::instrument(skip(self))]
    pub async fn begin_upload(&self, name: &str) -> RegistryResult<UploadSession> {
        validate_repository_name(name)?;

        let id = UploadId::new();
        let handle = self.bucket.create_multipart(&id.temporary_key()).await?;
        let session = UploadSession::new(id, name, handle);

        if let Err(error) = self.sessions.save(&session).await {
            self.abort_backend(&session).await;
            return Err(error.into());
        }

        tracing::debug!(%id, "began upload");
        Ok(session)
    }

    async fn locked(
        &self,
        name: &str,
        id: &str,
    ) -> RegistryResult<(SessionGuard, UploadSession)> {
        validate_repository_name(name)?;
        let unknown = || RegistryError::UploadUnknown(id.to_owned());

        let id = UploadId::parse(id).ok_or_else(unknown)?;
        let guard = self.sessions.lock(id).await?;
        let session = guard
            .load()
            .await?
            .filter(|session| session.repository == name)
            .ok_or_else(unknown)?;
        Ok((guard, session))
    }

    /// Current state of an upload.
    #[tracing::instrument(skip(self))]
    pub async fn upload_status(&self, name: &str, id: &str) -> RegistryResult<UploadSession> {
        validate_repository_name(name)?;
        let unknown = || RegistryError::UploadUnknown(id.to_owned());

        let parsed = UploadId::parse(id).ok_or_else(unknown)?;
        self.sessions
            .get(parsed)
            .await?
            .filter(|session| session.repository == name)
            .ok_or_else(unknown)
    }

    /// Append one chunk to an open upload.
    #[tracing::instrument(skip(self, payload), fields(size = payload.len()))]
    pub async fn append_upload(
        &self,
        name: &str,
        id: &str,
        payload: &Payload,
    ) -> RegistryResult<UploadSession> {
        let (guard, mut session) = self.locked(name, id).await?;
        if !session.is_open() {
            return Err(RegistryError::BlobUploadInvalid(format!(
                "upload {id} is being finalized"
            )));
        }

        if payload.is_empty() {
            // Nothing to upload, but the append still takes its number.
            session.claim_part_number();
            guard.save(&session).await?;
            return Ok(session);
        }

        self.upload_part(&guard, &mut session, payload, false).await?;
        Ok(session)
    }

    async fn upload_part(
        &self,
        guard: &SessionGuard,
        session: &mut UploadSession,
        payload: &Payload,
        is_last: bool,
    ) -> RegistryResult<()> {
        let part_number = session.claim_part_number();
        let uploaded = self
            .bucket
            .upload_part(
                &session.temporary_key(),
                &session.handle,
                part_number,
                payload,
                is_last,
            )
            .await;

        match uploaded {
            Ok(receipt) => {
                session.commit_part(receipt);
                guard.save(session).await?;
                tracing::debug!(id = %session.id, %part_number, received = session.received, "committed part");
                Ok(())
            }
            Err(error) => {
                // The part number stays consumed.
                if let Err(save) = guard.save(session).await {
                    tracing::warn!(error = %save, "unable to persist consumed part number");
                }
                Err(error.into())
            }
        }
    }

    /// Finish an upload, committing it as the blob `digest`.
    ///
    /// A non-empty `last_chunk` is uploaded as the final part first.
    #[tracing::instrument(skip(self, last_chunk), fields(%digest))]
    pub async fn finish_upload(
        &self,
        name: &str,
        id: &str,
        digest: &Digest,
        last_chunk: Option<&Payload>,
    ) -> RegistryResult<Digest> {
        if !digest.is_canonical() {
            return Err(RegistryError::DigestInvalid(digest.to_string()));
        }

        let (guard, mut session) = self.locked(name, id).await?;
        let temporary = session.temporary_key();

        // A Finalizing session already holds its final chunk, and may even have
        // been assembled before the move failed.
        let resumed = session.state == SessionState::Finalizing;
        let assembled = resumed && self.bucket.metadata(&temporary).await.is_ok();

        if !assembled {
            let final_chunk = last_chunk
                .filter(|chunk| !chunk.is_empty())
                .filter(|_| !resumed);
            if let Some(chunk) = final_chunk {
                self.upload_part(&guard, &mut session, chunk, true).await?;
            }

            session.state = SessionState::Finalizing;
            let finished = match guard.save(&session).await {
                Ok(()) => self.assemble(&session, &temporary).await,
                Err(error) => Err(error.into()),
            };

            if let Err(error) = finished {
                if !resumed {
                    // A retried PUT carries the same final chunk again.
                    if final_chunk.is_some() {
                        session.withdraw_part();
                    }
                    session.state = SessionState::Open;
                    if let Err(save) = guard.save(&session).await {
                        tracing::warn!(error = %save, "unable to reopen upload");
                    }
                }
                return Err(error);
            }
        }

        if self.options.verify_digest {
            let actual = self.hash_object(&temporary).await?;
            if actual != *digest {
                if let Err(error) = self.bucket.delete(&temporary).await {
                    tracing::warn!(%error, "unable to remove rejected upload");
                }
                guard.remove().await?;
                return Err(RegistryError::DigestMismatch {
                    expected: digest.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        self.bucket.rename(&temporary, &blob_key(name, digest)).await?;
        guard.remove().await?;

        tracing::info!(id = %session.id, size = session.received, "committed blob");
        Ok(digest.clone())
    }

    async fn assemble(&self, session: &UploadSession, temporary: &Utf8Path) -> RegistryResult<()> {
        if session.parts.is_empty() {
            // Backends refuse to complete a multipart upload without parts.
            self.abort_backend(session).await;
            self.bucket.write(temporary, &[]).await?;
            return Ok(());
        }

        self.bucket
            .complete_multipart(temporary, &session.handle, &session.parts)
            .await?;
        Ok(())
    }

    async fn hash_object(&self, key: &Utf8Path) -> RegistryResult<Digest> {
        let mut hasher = Sha256Writer::new(tokio::io::sink());
        self.bucket.download(key, &mut hasher).await?;
        let (_, checksum, _) = hasher.finish();
        Digest::from_checksum(&checksum)
            .map_err(|error| RegistryError::Io(std::io::Error::other(error)))
    }

    async fn abort_backend(&self, session: &UploadSession) {
        if let Err(error) = self
            .bucket
            .abort_multipart(&session.temporary_key(), &session.handle)
            .await
        {
            tracing::warn!(id = %session.id, %error, "unable to abort backend upload");
        }
    }

    /// Cancel an upload and release its backend resources.
    #[tracing::instrument(skip(self))]
    pub async fn abort_upload(&self, name: &str, id: &str) -> RegistryResult<()> {
        let (guard, session) = self.locked(name, id).await?;

        self.abort_backend(&session).await;
        if session.state == SessionState::Finalizing {
            if let Err(error) = self.bucket.delete(&session.temporary_key()).await {
                tracing::warn!(%error, "unable to remove temporary object");
            }
        }

        guard.remove().await?;
        tracing::debug!(id = %session.id, "aborted upload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use storage::MemoryStorage;

    use super::*;

    fn registry() -> (Arc<MemoryStorage>, Registry) {
        let memory = Arc::new(MemoryStorage::new());
        let storage = Storage::from_arc(memory.clone());
        (memory, Registry::new(&storage, "registry", RegistryOptions::default()))
    }

    #[test]
    fn repository_names() {
        for name in ["acme", "library/ubuntu", "a.b_c-d/e", "x0/y1/z2"] {
            assert!(validate_repository_name(name).is_ok(), "{name}");
        }
        for name in ["ACME", "", "a//b", "-a", "a-", "_uploads", "a/../b"] {
            assert!(validate_repository_name(name).is_err(), "{name}");
        }
    }

    #[test]
    fn manifest_keys_strip_digest_prefix() {
        assert_eq!(manifest_key("acme", "latest").as_str(), "acme/latest.json");
        assert_eq!(manifest_key("acme", "sha256:abc").as_str(), "acme/abc.json");
    }

    #[tokio::test]
    async fn chunked_upload_commits_blob() {
        let (memory, registry) = registry();
        let session = registry.begin_upload("acme").await.unwrap();
        let id = session.id.to_string();

        registry
            .append_upload("acme", &id, &Payload::from(&b"hel"[..]))
            .await
            .unwrap();
        let session = registry
            .append_upload("acme", &id, &Payload::from(&b"lo"[..]))
            .await
            .unwrap();
        assert_eq!(session.range(), "0-4");
        assert_eq!(session.next_part_number, 3);

        let digest = Digest::of(b"hello");
        let committed = registry
            .finish_upload("acme", &id, &digest, None)
            .await
            .unwrap();
        assert_eq!(committed, digest);

        assert_eq!(registry.blob_exists("acme", &digest).await.unwrap(), Some(5));
        assert_eq!(memory.pending_uploads().await, 0);
        assert!(registry.upload_status("acme", &id).await.is_err());

        match registry.blob_download("acme", &digest).await.unwrap() {
            Some(BlobDownload::Content(bytes)) => assert_eq!(&bytes[..], b"hello"),
            other => panic!("unexpected download: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_appends_consume_a_part_number() {
        let (_, registry) = registry();
        let session = registry.begin_upload("acme").await.unwrap();
        let id = session.id.to_string();

        let session = registry
            .append_upload("acme", &id, &Payload::from(&b""[..]))
            .await
            .unwrap();
        assert_eq!(session.next_part_number, 2);
        assert!(session.parts.is_empty());

        let session = registry
            .append_upload("acme", &id, &Payload::from(&b"data"[..]))
            .await
            .unwrap();
        assert_eq!(session.parts[0].part_number, 2);

        let digest = Digest::of(b"data");
        registry
            .finish_upload("acme", &id, &digest, None)
            .await
            .unwrap();
        assert_eq!(registry.blob_exists("acme", &digest).await.unwrap(), Some(4));
    }

    #[tokio::test]
    async fn empty_upload_commits_empty_blob() {
        let (memory, registry) = registry();
        let session = registry.begin_upload("acme").await.unwrap();

        let digest = Digest::of(b"");
        registry
            .finish_upload("acme", &session.id.to_string(), &digest, None)
            .await
            .unwrap();

        assert_eq!(registry.blob_exists("acme", &digest).await.unwrap(), Some(0));
        assert_eq!(memory.pending_uploads().await, 0);
    }

    #[tokio::test]
    async fn digest_mismatch_discards_upload() {
        let (_, registry) = registry();
        let session = registry.begin_upload("acme").await.unwrap();
        let id = session.id.to_string();

        let wrong = Digest::of(b"something else");
        let error = registry
            .finish_upload("acme", &id, &wrong, Some(&Payload::from(&b"hello"[..])))
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::DigestMismatch { .. }));

        assert_eq!(registry.blob_exists("acme", &wrong).await.unwrap(), None);
        assert!(matches!(
            registry.upload_status("acme", &id).await,
            Err(RegistryError::UploadUnknown(_))
        ));
    }

    #[tokio::test]
    async fn unverified_uploads_trust_the_client() {
        let storage = Storage::new(MemoryStorage::new());
        let options = RegistryOptions {
            verify_digest: false,
            ..Default::default()
        };
        let registry = Registry::new(&storage, "registry", options);
        let session = registry.begin_upload("acme").await.unwrap();

        let claimed = Digest::of(b"claimed");
        registry
            .finish_upload(
                "acme",
                &session.id.to_string(),
                &claimed,
                Some(&Payload::from(&b"actual"[..])),
            )
            .await
            .unwrap();
        assert_eq!(registry.blob_exists("acme", &claimed).await.unwrap(), Some(6));
    }

    #[tokio::test]
    async fn sessions_are_bound_to_their_repository() {
        let (_, registry) = registry();
        let session = registry.begin_upload("acme").await.unwrap();

        let error = registry
            .append_upload("other", &session.id.to_string(), &Payload::from(&b"x"[..]))
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::UploadUnknown(_)));
    }

    #[tokio::test]
    async fn abort_releases_the_session() {
        let (memory, registry) = registry();
        let session = registry.begin_upload("acme").await.unwrap();
        let id = session.id.to_string();
        registry
            .append_upload("acme", &id, &Payload::from(&b"abc"[..]))
            .await
            .unwrap();

        registry.abort_upload("acme", &id).await.unwrap();
        assert_eq!(memory.pending_uploads().await, 0);

        let append = registry
            .append_upload("acme", &id, &Payload::from(&b"d"[..]))
            .await;
        assert!(matches!(append, Err(RegistryError::UploadUnknown(_))));

        let finish = registry
            .finish_upload("acme", &id, &Digest::of(b"abc"), None)
            .await;
        assert!(matches!(finish, Err(RegistryError::UploadUnknown(_))));
    }

    #[tokio::test]
    async fn manifest_resolves_by_tag_and_digest() {
        let (_, registry) = registry();
        let manifest = br#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json"}"#;

        let digest = registry
            .save_manifest("acme", "latest", manifest)
            .await
            .unwrap();
        assert_eq!(digest, Digest::of(manifest));

        for reference in ["latest".to_string(), digest.to_string()] {
            let found = registry
                .resolve_manifest("acme", &reference)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&found.bytes[..], &manifest[..]);
            assert_eq!(found.digest, digest);
            assert_eq!(found.media_type, "application/vnd.oci.image.manifest.v1+json");
        }

        assert!(registry
            .resolve_manifest("acme", "missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn manifest_references_are_checked() {
        let (_, registry) = registry();
        let manifest = br#"{"schemaVersion":2}"#;

        let error = registry
            .save_manifest("acme", "-bad", manifest)
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::TagInvalid(_)));

        let error = registry
            .save_manifest("acme", &Digest::of(b"other").to_string(), manifest)
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::DigestMismatch { .. }));

        registry
            .save_manifest("acme", &Digest::of(manifest).to_string(), manifest)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn non_canonical_lookups_are_unknown() {
        let (_, registry) = registry();
        assert_eq!(
            registry
                .blob_exists("acme", &Digest::parse("sha256:../../etc"))
                .await
                .unwrap(),
            None
        );
    }
}
