//! Upload sessions

use std::fmt;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use storage::{PartReceipt, UploadHandle};
use uuid::Uuid;

/// Client-visible identifier of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadId(Uuid);

impl UploadId {
    /// A fresh random identifier.
    pub fn new() -> Self {
        UploadId(Uuid::new_v4())
    }

    /// Parse an identifier echoed back by a client.
    pub fn parse(raw: &str) -> Option<Self> {
        Uuid::parse_str(raw).ok().map(UploadId)
    }

    /// Where the blob is assembled until the upload is finished.
    pub fn temporary_key(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("uploads/{}", self.0))
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a session is in its lifecycle.
///
/// Committed and aborted sessions are deleted, so they have no state here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Accepting chunks.
    Open,

    /// A finish call has started combining the parts.
    Finalizing,
}

/// One in-progress chunked blob upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    /// Session identifier.
    pub id: UploadId,

    /// Repository the upload was started in.
    pub repository: String,

    /// Backend multipart upload this session feeds.
    pub handle: UploadHandle,

    /// Part number the next append will use.
    pub next_part_number: u32,

    /// Receipts for committed parts, in part-number order.
    pub parts: Vec<PartReceipt>,

    /// Total bytes in committed parts.
    pub received: u64,

    /// Lifecycle state.
    pub state: SessionState,

    /// When the session was begun.
    pub started: DateTime<Utc>,
}

impl UploadSession {
    /// A new open session with no parts.
    pub fn new(id: UploadId, repository: impl Into<String>, handle: UploadHandle) -> Self {
        Self {
            id,
            repository: repository.into(),
            handle,
            next_part_number: 1,
            parts: Vec::new(),
            received: 0,
            state: SessionState::Open,
            started: Utc::now(),
        }
    }

    /// Backend key the parts are assembled at.
    pub fn temporary_key(&self) -> Utf8PathBuf {
        self.id.temporary_key()
    }

    /// Consume the next part number. Numbers are never reused, even when the
    /// part they were claimed for fails to upload.
    pub fn claim_part_number(&mut self) -> u32 {
        let part_number = self.next_part_number;
        self.next_part_number += 1;
        part_number
    }

    /// Record a part the backend accepted.
    pub fn commit_part(&mut self, receipt: PartReceipt) {
        self.received += receipt.size;
        self.parts.push(receipt);
    }

    /// Drop the most recent receipt so its bytes are no longer part of the blob.
    /// The part number stays consumed.
    pub fn withdraw_part(&mut self) -> Option<PartReceipt> {
        let receipt = self.parts.pop()?;
        self.received -= receipt.size;
        Some(receipt)
    }

    /// Whether the session still accepts chunks.
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// The `Range` header value describing bytes received so far.
    pub fn range(&self) -> String {
        format!("0-{}", self.received.saturating_sub(1))
    }
}
