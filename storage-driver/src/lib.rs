//! The object-store capability consumed by the registry.
//!
//! A [`Driver`] exposes single-shot object reads and writes, presigned
//! download URLs, and the three-phase multipart upload protocol. Drivers are
//! addressed by bucket and key, and report failures as [`StorageError`]s
//! classified by [`StorageErrorKind`].

mod checksum;
mod driver;
mod error;
mod multipart;

pub use checksum::{Checksum, Sha256Writer};
pub use driver::Driver;
pub use driver::Metadata;
pub use driver::Reader;
pub use driver::Writer;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
pub use multipart::{PartReceipt, Payload, UploadHandle};
