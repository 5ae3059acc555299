//! Patch Documents: portable, hash-verified descriptions of the delta
//! between two snapshots.
//!
//! The compiler emits one op per changed path and nothing else; byte-equal
//! paths never appear. Each op carries the content hash(es) it depends on,
//! which the applier later uses as compare-and-swap preconditions. The
//! human-readable patch text is advisory only; the ops are authoritative.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::canon;
use crate::diff::{path_union, DiffReport, DiffStats};
use crate::error::PatchError;
use crate::hash::Digest;
use crate::snapshot::Snapshot;

pub const PATCH_SCHEMA_ID: &str = "packpatch.patch.v1";

/// Payload cap enforced before any JSON decoding.
pub const MAX_PATCH_BYTES: u64 = 64 * 1024 * 1024;

mod b64 {
    use base64::prelude::{Engine as _, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A single file operation. Self-describing and independently verifiable:
/// every variant names the content hash(es) the applier must check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum FilePatchOp {
    Add {
        path: String,
        #[serde(rename = "new_bytes_b64", with = "b64")]
        new_bytes: Vec<u8>,
        new_sha256: Digest,
        new_size: u64,
        is_text: bool,
    },
    Remove {
        path: String,
        old_sha256: Digest,
        old_size: u64,
    },
    Modify {
        path: String,
        old_sha256: Digest,
        #[serde(rename = "new_bytes_b64", with = "b64")]
        new_bytes: Vec<u8>,
        new_sha256: Digest,
        old_size: u64,
        new_size: u64,
        is_text: bool,
    },
}

impl FilePatchOp {
    pub fn path(&self) -> &str {
        match self {
            FilePatchOp::Add { path, .. }
            | FilePatchOp::Remove { path, .. }
            | FilePatchOp::Modify { path, .. } => path,
        }
    }
}

/// Immutable, portable delta between two snapshots. Created once by
/// [`compile`], consumed idempotently by the applier, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchDocument {
    pub schema_id: String,
    pub summary: String,
    /// Human-readable unified diff. Advisory/display only.
    pub patch_text: String,
    pub stats: DiffStats,
    /// Sorted by path, no duplicates.
    pub ops: Vec<FilePatchOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_project_id: Option<String>,
}

impl PatchDocument {
    pub fn to_json(&self) -> String {
        // A document built by compile() or accepted by from_json()
        // serializes infallibly.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode and fully validate a document from transport bytes: size cap,
    /// schema id, sorted/unique/valid op paths, and payload integrity
    /// (declared hash vs. decoded bytes).
    pub fn from_json(bytes: &[u8]) -> Result<Self, PatchError> {
        if bytes.len() as u64 > MAX_PATCH_BYTES {
            return Err(PatchError::SizeLimitExceeded {
                actual: bytes.len() as u64,
                limit: MAX_PATCH_BYTES,
            });
        }
        let doc: PatchDocument =
            serde_json::from_slice(bytes).map_err(|e| PatchError::Malformed(e.to_string()))?;
        if doc.schema_id != PATCH_SCHEMA_ID {
            return Err(PatchError::SchemaMismatch(doc.schema_id));
        }
        let mut previous: Option<&str> = None;
        for op in &doc.ops {
            let path = op.path();
            canon::validate_path(path).map_err(|e| PatchError::Malformed(e.to_string()))?;
            match previous {
                Some(prev) if prev == path => {
                    return Err(PatchError::DuplicatePath(path.to_string()))
                }
                Some(prev) if prev > path => {
                    return Err(PatchError::Malformed(format!(
                        "ops not sorted by path: {prev} then {path}"
                    )))
                }
                _ => {}
            }
            previous = Some(path);
        }
        doc.verify_integrity()?;
        Ok(doc)
    }

    /// Re-hash every carried payload against its declared digest. A
    /// mismatch indicates transport corruption or tampering.
    pub fn verify_integrity(&self) -> Result<(), PatchError> {
        for op in &self.ops {
            let (path, bytes, declared, size) = match op {
                FilePatchOp::Add {
                    path,
                    new_bytes,
                    new_sha256,
                    new_size,
                    ..
                }
                | FilePatchOp::Modify {
                    path,
                    new_bytes,
                    new_sha256,
                    new_size,
                    ..
                } => (path, new_bytes, new_sha256, new_size),
                FilePatchOp::Remove { .. } => continue,
            };
            let actual = Digest::of(bytes);
            if actual != *declared || bytes.len() as u64 != *size {
                return Err(PatchError::Integrity {
                    path: path.clone(),
                    declared: *declared,
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Compile the delta between `base` and `proposal` into a patch document.
///
/// One op per changed path in sorted order; byte-identical paths are
/// omitted entirely. Hashes are computed over the exact bytes being
/// compared or introduced, independent of the diff's hunks.
pub fn compile(
    base: &Snapshot,
    proposal: &Snapshot,
    report: &DiffReport,
    summary: &str,
) -> PatchDocument {
    let text_flags: BTreeMap<&str, bool> = report
        .files
        .iter()
        .map(|f| (f.path.as_str(), f.is_text))
        .collect();
    let is_text = |path: &str| text_flags.get(path).copied().unwrap_or(false);

    let mut ops = Vec::new();
    for (old, new) in path_union(base, proposal) {
        match (old, new) {
            (None, Some(new)) => ops.push(FilePatchOp::Add {
                path: new.path.clone(),
                new_sha256: new.digest(),
                new_size: new.size(),
                is_text: is_text(&new.path),
                new_bytes: new.bytes.clone(),
            }),
            (Some(old), None) => ops.push(FilePatchOp::Remove {
                path: old.path.clone(),
                old_sha256: old.digest(),
                old_size: old.size(),
            }),
            (Some(old), Some(new)) if old.bytes != new.bytes => {
                ops.push(FilePatchOp::Modify {
                    path: old.path.clone(),
                    old_sha256: old.digest(),
                    new_sha256: new.digest(),
                    old_size: old.size(),
                    new_size: new.size(),
                    is_text: is_text(&new.path),
                    new_bytes: new.bytes.clone(),
                });
            }
            _ => {}
        }
    }

    debug_assert!(
        ops.windows(2).all(|w| w[0].path() < w[1].path()),
        "compiled ops must be sorted and duplicate-free"
    );

    PatchDocument {
        schema_id: PATCH_SCHEMA_ID.to_string(),
        summary: summary.to_string(),
        patch_text: report.full_patch_text.clone(),
        stats: report.stats,
        ops,
        base_project_id: Some(base.project_id().to_string()).filter(|s| !s.is_empty()),
        proposal_project_id: Some(proposal.project_id().to_string()).filter(|s| !s.is_empty()),
    }
}
