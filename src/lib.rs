//! Deterministic snapshot diff/patch/versioning core.
//!
//! A [`Snapshot`] is an immutable, content-hashed file tree. The crate
//! computes line-level diffs between two snapshots, compiles them into
//! portable, hash-verified [`PatchDocument`]s, applies those documents
//! atomically under per-file compare-and-swap preconditions, and tracks a
//! lock/provenance record that can detect drift of the stored bytes.
//!
//! Serialization is byte-stable: the same logical file set always produces
//! the same archive bytes and therefore the same hashes.

pub mod apply;
pub mod canon;
pub mod diff;
pub mod error;
pub mod fsload;
pub mod governance;
pub mod hash;
pub mod manifest;
pub mod patch;
pub mod snapshot;
pub mod store;

pub use apply::apply;
pub use diff::{diff, ChangeKind, DiffReport, DiffStats, FileDiff};
pub use error::{
    ApplyRejection, ArchiveError, GovernanceError, ManifestError, ManifestIssue, PatchError,
    PreconditionFailure, PreconditionKind,
};
pub use governance::{Drift, GovernanceRecord, LockProvenance, LockRecord, LockStatus};
pub use hash::Digest;
pub use manifest::{Manifest, Provenance, APP_VERSION, PACK_FORMAT_VERSION, VALIDATOR_VERSION};
pub use patch::{compile, FilePatchOp, PatchDocument};
pub use snapshot::{FileEntry, Snapshot};
pub use store::{ByteStore, FsStore, MemoryStore};
