//! Patch application: two-phase, all-or-nothing, precondition-gated.
//!
//! Every op's precondition is checked against the current base snapshot
//! before anything is built (validate-all), and a new snapshot is committed
//! only if every check passed (commit-all). The content hash is the
//! concurrency token: a base that changed since the patch was compiled
//! fails its `old_sha256` checks and the whole apply is rejected with the
//! complete list of failing paths. The caller's base is never mutated.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{ApplyRejection, PreconditionFailure, PreconditionKind};
use crate::hash::Digest;
use crate::patch::{FilePatchOp, PatchDocument};
use crate::snapshot::Snapshot;

/// Apply a patch document to a base snapshot.
///
/// Pure function of `(base, patch)`: applying the same document to the same
/// base twice yields structurally equal snapshots. On rejection the error
/// carries every failing path, not just the first.
pub fn apply(base: &Snapshot, patch: &PatchDocument) -> Result<Snapshot, ApplyRejection> {
    // Phase 1: validate every precondition, collecting all failures.
    let mut failures: Vec<PreconditionFailure> = Vec::new();
    for op in &patch.ops {
        match op {
            FilePatchOp::Add {
                path,
                new_bytes,
                new_sha256,
                ..
            } => {
                if base.get(path).is_some() {
                    failures.push(PreconditionFailure {
                        path: path.clone(),
                        kind: PreconditionKind::PathAlreadyExists,
                    });
                } else {
                    check_payload(path, new_bytes, new_sha256, &mut failures);
                }
            }
            FilePatchOp::Remove {
                path, old_sha256, ..
            } => check_current(base, path, old_sha256, &mut failures),
            FilePatchOp::Modify {
                path,
                old_sha256,
                new_bytes,
                new_sha256,
                ..
            } => {
                check_current(base, path, old_sha256, &mut failures);
                check_payload(path, new_bytes, new_sha256, &mut failures);
            }
        }
    }

    if !failures.is_empty() {
        warn!(
            failing = failures.len(),
            ops = patch.ops.len(),
            "patch rejected, base untouched"
        );
        return Err(ApplyRejection { failures });
    }

    // Phase 2: commit. Build the new file map and a fresh snapshot; the
    // manifest is rederived from it, preserving the base's project id.
    let mut files: BTreeMap<String, Vec<u8>> = base
        .iter()
        .map(|f| (f.path.clone(), f.bytes.clone()))
        .collect();
    for op in &patch.ops {
        match op {
            FilePatchOp::Add {
                path, new_bytes, ..
            }
            | FilePatchOp::Modify {
                path, new_bytes, ..
            } => {
                files.insert(path.clone(), new_bytes.clone());
            }
            FilePatchOp::Remove { path, .. } => {
                files.remove(path);
            }
        }
    }

    let next = Snapshot::assemble(base.project_id().to_string(), files, None);
    debug!(
        base = %base.pack_hash(),
        next = %next.pack_hash(),
        ops = patch.ops.len(),
        "patch committed"
    );
    Ok(next)
}

fn check_current(
    base: &Snapshot,
    path: &str,
    expected: &Digest,
    failures: &mut Vec<PreconditionFailure>,
) {
    match base.get(path) {
        None => failures.push(PreconditionFailure {
            path: path.to_string(),
            kind: PreconditionKind::PathMissing,
        }),
        Some(entry) => {
            let actual = entry.digest();
            if actual != *expected {
                failures.push(PreconditionFailure {
                    path: path.to_string(),
                    kind: PreconditionKind::HashMismatch {
                        expected: *expected,
                        actual,
                    },
                });
            }
        }
    }
}

fn check_payload(
    path: &str,
    bytes: &[u8],
    declared: &Digest,
    failures: &mut Vec<PreconditionFailure>,
) {
    let actual = Digest::of(bytes);
    if actual != *declared {
        failures.push(PreconditionFailure {
            path: path.to_string(),
            kind: PreconditionKind::PayloadCorrupt {
                declared: *declared,
                actual,
            },
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;
    use crate::patch::compile;
    use crate::snapshot::snapshot_of;

    fn patch_between(base: &Snapshot, proposal: &Snapshot) -> PatchDocument {
        compile(base, proposal, &diff(base, proposal), "test patch")
    }

    #[test]
    fn test_round_trip_apply_reaches_proposal() {
        let base = snapshot_of("p", &[("a.txt", b"1\n"), ("b.txt", b"2\n"), ("c.txt", b"3\n")]);
        let proposal = snapshot_of("p", &[("a.txt", b"one\n"), ("c.txt", b"3\n"), ("d.txt", b"4\n")]);
        let result = apply(&base, &patch_between(&base, &proposal)).unwrap();
        assert_eq!(result, proposal);
        assert_eq!(result.pack_hash(), proposal.pack_hash());
    }

    #[test]
    fn test_stale_base_fails_with_hash_mismatch() {
        let base = snapshot_of("p", &[("README.md", b"v1")]);
        let proposal = snapshot_of("p", &[("README.md", b"v2")]);
        let doc = patch_between(&base, &proposal);

        let drifted = snapshot_of("p", &[("README.md", b"v1-changed")]);
        let rejection = apply(&drifted, &doc).unwrap_err();
        assert_eq!(rejection.failures.len(), 1);
        assert_eq!(rejection.failures[0].path, "README.md");
        assert!(matches!(
            rejection.failures[0].kind,
            PreconditionKind::HashMismatch { .. }
        ));
    }

    #[test]
    fn test_all_failures_reported_and_base_untouched() {
        let base = snapshot_of(
            "p",
            &[("a.txt", b"a\n"), ("b.txt", b"b\n"), ("c.txt", b"c\n")],
        );
        let proposal = snapshot_of(
            "p",
            &[("a.txt", b"A\n"), ("c.txt", b"c\n"), ("d.txt", b"d\n")],
        );
        let doc = patch_between(&base, &proposal);

        // A base where every targeted path is wrong: a.txt drifted, b.txt
        // already gone, d.txt already present.
        let current = snapshot_of(
            "p",
            &[("a.txt", b"drifted\n"), ("c.txt", b"c\n"), ("d.txt", b"squatter\n")],
        );
        let before = current.clone();
        let rejection = apply(&current, &doc).unwrap_err();

        let mut failing: Vec<&str> = rejection.failures.iter().map(|f| f.path.as_str()).collect();
        failing.sort();
        assert_eq!(failing, ["a.txt", "b.txt", "d.txt"]);
        assert_eq!(current, before);
    }

    #[test]
    fn test_apply_is_idempotent_against_same_base() {
        let base = snapshot_of("p", &[("a.txt", b"1\n")]);
        let proposal = snapshot_of("p", &[("a.txt", b"2\n"), ("b.txt", b"new\n")]);
        let doc = patch_between(&base, &proposal);

        let first = apply(&base, &doc).unwrap();
        let second = apply(&base, &doc).unwrap();
        assert_eq!(first, second);

        // Re-applying past the target base must fail: the add already
        // exists, the modify's old hash no longer matches.
        let rejection = apply(&first, &doc).unwrap_err();
        let mut kinds: Vec<(&str, &PreconditionKind)> = rejection
            .failures
            .iter()
            .map(|f| (f.path.as_str(), &f.kind))
            .collect();
        kinds.sort_by_key(|(p, _)| *p);
        assert_eq!(kinds.len(), 2);
        assert!(matches!(kinds[0], ("a.txt", PreconditionKind::HashMismatch { .. })));
        assert!(matches!(kinds[1], ("b.txt", PreconditionKind::PathAlreadyExists)));
    }

    #[test]
    fn test_corrupted_payload_is_rejected_not_committed() {
        let base = snapshot_of("p", &[("a.txt", b"1\n")]);
        let proposal = snapshot_of("p", &[("a.txt", b"2\n")]);
        let mut doc = patch_between(&base, &proposal);
        if let FilePatchOp::Modify { new_bytes, .. } = &mut doc.ops[0] {
            new_bytes[0] ^= 0xff;
        }
        let rejection = apply(&base, &doc).unwrap_err();
        assert!(matches!(
            rejection.failures[0].kind,
            PreconditionKind::PayloadCorrupt { .. }
        ));
    }

    #[test]
    fn test_add_to_base_keeps_existing_files() {
        let base = snapshot_of("p", &[("a.txt", b"x")]);
        let proposal = snapshot_of("p", &[("a.txt", b"x"), ("b.txt", b"y")]);
        let report = diff(&base, &proposal);
        assert_eq!(report.stats.added, 1);
        assert_eq!(report.stats.unchanged, 1);

        let doc = compile(&base, &proposal, &report, "add b");
        assert_eq!(doc.ops.len(), 1);
        let result = apply(&base, &doc).unwrap();
        assert_eq!(result.paths(), ["a.txt", "b.txt"]);

        let reparsed = Snapshot::parse(&result.to_archive_bytes().unwrap()).unwrap();
        let manifest = reparsed.manifest().unwrap();
        assert_eq!(manifest.contents, ["a.txt", "b.txt"]);
        assert_eq!(manifest.project_id, "p");
    }
}
