//! Shared persistence for upload sessions.
//!
//! Session records live as JSON objects in the registry bucket, so any
//! process sharing the bucket can serve the next call for an upload. Calls
//! which modify a session hold a per-id lock for their whole
//! read-modify-write cycle.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use storage::{StorageBucket, StorageError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::session::{UploadId, UploadSession};

/// Errors from the session store.
#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    /// The backing bucket failed.
    #[error("session storage: {0}")]
    Storage(#[from] StorageError),

    /// A persisted record could not be encoded or decoded.
    #[error("session record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The session lock was not acquired in time.
    #[error("timed out waiting for the lock on upload {0}")]
    LockTimeout(UploadId),
}

/// The persisted form of a session.
#[derive(Debug, Serialize, Deserialize)]
struct SessionRecord {
    session: UploadSession,
    last_touched: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    bucket: StorageBucket,
    lock_timeout: Duration,
    locks: DashMap<UploadId, Arc<Mutex<()>>>,

    /// Sessions this process has seen, with the last time they were touched.
    touched: DashMap<UploadId, DateTime<Utc>>,
}

/// Durable, mutually exclusive storage for upload sessions.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<Inner>,
}

/// Outcome of one expiry sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Expired candidates examined.
    pub examined: usize,

    /// Sessions aborted and removed.
    pub reclaimed: usize,

    /// Backend aborts which failed. Their records were removed anyway.
    pub failed_aborts: usize,

    /// Candidates skipped because a request held their lock.
    pub busy: usize,
}

fn record_key(id: UploadId) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("_uploads/{id}.json"))
}

impl SessionStore {
    /// Store sessions in `bucket`, waiting at most `lock_timeout` for a session lock.
    pub fn new(bucket: StorageBucket, lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                bucket,
                lock_timeout,
                locks: DashMap::new(),
                touched: DashMap::new(),
            }),
        }
    }

    /// Persist a session, refreshing its last-touched time.
    pub async fn save(&self, session: &UploadSession) -> Result<(), SessionStoreError> {
        self.save_at(session, Utc::now()).await
    }

    async fn save_at(
        &self,
        session: &UploadSession,
        touched: DateTime<Utc>,
    ) -> Result<(), SessionStoreError> {
        let record = SessionRecord {
            session: session.clone(),
            last_touched: touched,
        };
        let data = serde_json::to_vec(&record)?;
        self.inner
            .bucket
            .write(&record_key(session.id), &data)
            .await?;
        self.inner.touched.insert(session.id, touched);
        Ok(())
    }

    async fn load(&self, id: UploadId) -> Result<Option<SessionRecord>, SessionStoreError> {
        match self.inner.bucket.read(&record_key(id)).await {
            Ok((data, _)) => {
                let record: SessionRecord = serde_json::from_slice(&data)?;
                self.inner.touched.insert(id, record.last_touched);
                Ok(Some(record))
            }
            Err(error) if error.is_not_found() => {
                self.inner.touched.remove(&id);
                Ok(None)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Fetch a session without locking it.
    pub async fn get(&self, id: UploadId) -> Result<Option<UploadSession>, SessionStoreError> {
        Ok(self.load(id).await?.map(|record| record.session))
    }

    /// Remove a session record.
    pub async fn delete(&self, id: UploadId) -> Result<(), SessionStoreError> {
        self.inner.bucket.delete(&record_key(id)).await?;
        self.inner.touched.remove(&id);
        Ok(())
    }

    fn mutex(&self, id: UploadId) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Take the exclusive lock on a session.
    ///
    /// The lock is released when the returned guard is dropped.
    pub async fn lock(&self, id: UploadId) -> Result<SessionGuard, SessionStoreError> {
        let mutex = self.mutex(id);
        let guard = tokio::time::timeout(self.inner.lock_timeout, mutex.lock_owned())
            .await
            .map_err(|_| SessionStoreError::LockTimeout(id))?;
        Ok(SessionGuard {
            store: self.clone(),
            id,
            lock: Some(guard),
        })
    }

    fn try_lock(&self, id: UploadId) -> Option<SessionGuard> {
        let guard = self.mutex(id).try_lock_owned().ok()?;
        Some(SessionGuard {
            store: self.clone(),
            id,
            lock: Some(guard),
        })
    }

    /// Lock a session, apply `mutator` and save the result.
    ///
    /// Returns `None` without calling `mutator` when the session does not exist.
    pub async fn update_exclusively<F>(
        &self,
        id: UploadId,
        mutator: F,
    ) -> Result<Option<UploadSession>, SessionStoreError>
    where
        F: FnOnce(&mut UploadSession),
    {
        let guard = self.lock(id).await?;
        let Some(mut session) = guard.load().await? else {
            return Ok(None);
        };
        mutator(&mut session);
        guard.save(&session).await?;
        Ok(Some(session))
    }

    /// Sessions seen by this process which nothing has touched within `ttl`.
    pub fn list_expired(&self, ttl: Duration) -> Vec<UploadId> {
        self.expired_before(cutoff(ttl))
    }

    fn expired_before(&self, cutoff: DateTime<Utc>) -> Vec<UploadId> {
        self.inner
            .touched
            .iter()
            .filter(|entry| *entry.value() < cutoff)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Abort and remove every session which has been idle for longer than `ttl`.
    pub async fn sweep(&self, ttl: Duration) -> SweepReport {
        self.sweep_before(cutoff(ttl)).await
    }

    #[tracing::instrument(skip(self), fields(bucket = %self.inner.bucket.bucket))]
    async fn sweep_before(&self, cutoff: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        for id in self.expired_before(cutoff) {
            report.examined += 1;

            let Some(guard) = self.try_lock(id) else {
                tracing::trace!(%id, "upload is busy, skipping");
                report.busy += 1;
                continue;
            };

            let record = match self.load(id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    guard.forget();
                    continue;
                }
                Err(error) => {
                    tracing::warn!(%id, %error, "unable to load expired upload");
                    continue;
                }
            };

            // Another process may have touched the session since we last saw it.
            if record.last_touched >= cutoff {
                continue;
            }

            let session = record.session;
            let key = session.temporary_key();
            if let Err(error) = self
                .inner
                .bucket
                .abort_multipart(&key, &session.handle)
                .await
            {
                tracing::warn!(%id, %error, "unable to abort expired upload");
                report.failed_aborts += 1;
            }

            if let Err(error) = self.inner.bucket.delete(&key).await {
                tracing::warn!(%id, %error, "unable to remove temporary object");
            }

            match guard.remove().await {
                Ok(()) => report.reclaimed += 1,
                Err(error) => tracing::warn!(%id, %error, "unable to remove expired upload"),
            }
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                reclaimed = report.reclaimed,
                failed_aborts = report.failed_aborts,
                busy = report.busy,
                "swept expired uploads"
            );
        }
        report
    }

    /// Run [`SessionStore::sweep`] every `interval` on a background task.
    pub fn spawn_sweeper(&self, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep(ttl).await;
            }
        })
    }
}

fn cutoff(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Exclusive access to one upload session.
///
/// Dropping the guard releases the lock, and forgets the lock entirely when
/// no other request is waiting on it.
#[derive(Debug)]
pub struct SessionGuard {
    store: SessionStore,
    id: UploadId,
    lock: Option<OwnedMutexGuard<()>>,
}

impl SessionGuard {
    /// The locked session's id.
    pub fn id(&self) -> UploadId {
        self.id
    }

    /// Read the locked session.
    pub async fn load(&self) -> Result<Option<UploadSession>, SessionStoreError> {
        self.store.get(self.id).await
    }

    /// Persist the locked session.
    pub async fn save(&self, session: &UploadSession) -> Result<(), SessionStoreError> {
        debug_assert_eq!(session.id, self.id);
        self.store.save(session).await
    }

    /// Delete the session record and release the lock.
    pub async fn remove(self) -> Result<(), SessionStoreError> {
        self.store.delete(self.id).await?;
        self.forget();
        Ok(())
    }

    fn forget(self) {
        self.store.inner.touched.remove(&self.id);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.lock.take());
        // Waiters hold their own reference to the mutex.
        self.store
            .inner
            .locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
