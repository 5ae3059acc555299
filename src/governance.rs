//! Governance: the per-project lock state machine and drift detection.
//!
//! Locking freezes a snapshot as "truth" by recording its pack hash, the
//! exact archive bytes it was locked from, and provenance. The record only
//! exposes state; blocking edits while locked is the caller's concern.
//! Drift detection distinguishes content drift (the locked artifact itself
//! changed) from metadata drift (same content, re-serialized with different
//! provenance), because the two call for different remediation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::GovernanceError;
use crate::hash::Digest;
use crate::manifest::{APP_VERSION, PACK_FORMAT_VERSION, VALIDATOR_VERSION};
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Unlocked,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockProvenance {
    pub base_zip_sha256: Digest,
    pub locked_zip_sha256: Digest,
    pub app_version: String,
    pub validator_version: String,
    pub pack_format_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pack_sha256: Digest,
    pub locked_at_utc: DateTime<Utc>,
    pub provenance: LockProvenance,
}

/// Drift between the last lock record and the currently stored bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drift {
    /// Stored bytes match the lock record exactly.
    None,
    /// The pack content itself changed after locking. Treat as real drift.
    Content { expected: Digest, actual: Digest },
    /// Content matches but the archive bytes differ, e.g. a re-serialization
    /// with a newer provenance stamp. Re-locking refreshes the metadata.
    Metadata { expected: Digest, actual: Digest },
}

/// Per-project lock state. Created/updated only by lock and unlock; the
/// stored bytes it is compared against live with the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceRecord {
    pub status: LockStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_locked: Option<LockRecord>,
}

impl Default for GovernanceRecord {
    fn default() -> Self {
        GovernanceRecord {
            status: LockStatus::Unlocked,
            last_locked: None,
        }
    }
}

impl GovernanceRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.status == LockStatus::Locked
    }

    /// Record a lock of `snapshot`, frozen from exactly `locked_bytes`,
    /// at the given instant. Overwrites any previous lock record.
    pub fn lock_at(
        &mut self,
        snapshot: &Snapshot,
        locked_bytes: &[u8],
        base_zip_sha256: Digest,
        at: DateTime<Utc>,
    ) {
        let record = LockRecord {
            pack_sha256: snapshot.pack_hash(),
            locked_at_utc: at,
            provenance: LockProvenance {
                base_zip_sha256,
                locked_zip_sha256: Digest::of(locked_bytes),
                app_version: APP_VERSION.to_string(),
                validator_version: VALIDATOR_VERSION.to_string(),
                pack_format_version: PACK_FORMAT_VERSION,
            },
        };
        info!(pack = %record.pack_sha256, "locking snapshot");
        self.last_locked = Some(record);
        self.status = LockStatus::Locked;
    }

    /// Record a lock stamped with the current wall-clock time.
    pub fn lock(&mut self, snapshot: &Snapshot, locked_bytes: &[u8], base_zip_sha256: Digest) {
        self.lock_at(snapshot, locked_bytes, base_zip_sha256, Utc::now());
    }

    /// Flip status back to unlocked. The last lock record stays as history
    /// until the next lock overwrites it.
    pub fn unlock(&mut self) {
        self.status = LockStatus::Unlocked;
    }

    /// Compare the currently stored archive bytes against the last lock.
    pub fn check_drift(&self, current_bytes: &[u8]) -> Result<Drift, GovernanceError> {
        let record = self.last_locked.as_ref().ok_or(GovernanceError::NeverLocked)?;

        let current = Snapshot::parse(current_bytes)?;
        let pack_hash = current.pack_hash();
        if pack_hash != record.pack_sha256 {
            warn!(expected = %record.pack_sha256, actual = %pack_hash, "content drift");
            return Ok(Drift::Content {
                expected: record.pack_sha256,
                actual: pack_hash,
            });
        }

        let zip_hash = Digest::of(current_bytes);
        if zip_hash != record.provenance.locked_zip_sha256 {
            return Ok(Drift::Metadata {
                expected: record.provenance.locked_zip_sha256,
                actual: zip_hash,
            });
        }
        Ok(Drift::None)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, GovernanceError> {
        serde_json::from_slice(bytes).map_err(|e| GovernanceError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::snapshot_of;

    fn locked_record(snapshot: &Snapshot, bytes: &[u8]) -> GovernanceRecord {
        let mut record = GovernanceRecord::new();
        record.lock(snapshot, bytes, Digest::of(bytes));
        record
    }

    #[test]
    fn test_lock_unlock_cycle_keeps_history() {
        let snap = snapshot_of("p", &[("a.txt", b"x")]);
        let bytes = snap.to_archive_bytes().unwrap();
        let mut record = GovernanceRecord::new();
        assert!(!record.is_locked());

        record.lock(&snap, &bytes, Digest::of(&bytes));
        assert!(record.is_locked());

        record.unlock();
        assert!(!record.is_locked());
        assert!(record.last_locked.is_some(), "history survives unlock");
    }

    #[test]
    fn test_no_drift_for_exact_bytes() {
        let snap = snapshot_of("p", &[("a.txt", b"x")]);
        let bytes = snap.to_archive_bytes().unwrap();
        let record = locked_record(&snap, &bytes);
        assert_eq!(record.check_drift(&bytes).unwrap(), Drift::None);
    }

    #[test]
    fn test_content_drift_then_relock_clears_it() {
        let snap = snapshot_of("p", &[("a.txt", b"x")]);
        let bytes = snap.to_archive_bytes().unwrap();
        let mut record = locked_record(&snap, &bytes);

        // Stored bytes mutated externally without re-locking.
        let mutated = snapshot_of("p", &[("a.txt", b"tampered")]);
        let mutated_bytes = mutated.to_archive_bytes().unwrap();
        assert!(matches!(
            record.check_drift(&mutated_bytes).unwrap(),
            Drift::Content { .. }
        ));

        record.lock(&mutated, &mutated_bytes, Digest::of(&bytes));
        assert_eq!(record.check_drift(&mutated_bytes).unwrap(), Drift::None);
    }

    #[test]
    fn test_metadata_drift_is_distinguished() {
        let snap = snapshot_of("p", &[("a.txt", b"x")]);
        let bytes = snap.to_archive_bytes().unwrap();
        let mut record = locked_record(&snap, &bytes);

        // Same content, different archive bytes: fake a restamped zip by
        // altering the recorded zip hash rather than the content hash.
        if let Some(last) = record.last_locked.as_mut() {
            last.provenance.locked_zip_sha256 = Digest::of(b"some other serialization");
        }
        assert!(matches!(
            record.check_drift(&bytes).unwrap(),
            Drift::Metadata { .. }
        ));
    }

    #[test]
    fn test_never_locked_is_an_error() {
        let record = GovernanceRecord::new();
        assert!(matches!(
            record.check_drift(b"whatever"),
            Err(GovernanceError::NeverLocked)
        ));
    }

    #[test]
    fn test_record_json_round_trip() {
        let snap = snapshot_of("p", &[("a.txt", b"x")]);
        let bytes = snap.to_archive_bytes().unwrap();
        let record = locked_record(&snap, &bytes);
        let back = GovernanceRecord::from_json(record.to_json().as_bytes()).unwrap();
        assert_eq!(record, back);
    }
}
