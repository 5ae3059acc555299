use std::collections::BTreeMap;
use std::io::{Cursor, Read};

use tracing::warn;

use crate::canon::{self, MANIFEST_NAME};
use crate::error::{ArchiveError, ManifestError, ManifestIssue};
use crate::hash::{tree_digest, Digest};
use crate::manifest::Manifest;

/// Payload cap enforced before any archive decoding.
pub const MAX_ARCHIVE_BYTES: u64 = 64 * 1024 * 1024;

/// One file in a snapshot, keyed by its POSIX-style relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: String,
    pub bytes: Vec<u8>,
}

impl FileEntry {
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn digest(&self) -> Digest {
        Digest::of(&self.bytes)
    }
}

/// An immutable, content-hashed file tree ("pack").
///
/// Files are sorted by path with no duplicates. The pack hash is a pure
/// function of the sorted `(path, bytes)` pairs; the manifest (and so the
/// provenance stamp) is excluded from it. Every logical change produces a
/// new `Snapshot` value.
#[derive(Debug, Clone)]
pub struct Snapshot {
    project_id: String,
    files: Vec<FileEntry>,
    manifest: Option<Manifest>,
    pack_hash: Digest,
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.project_id == other.project_id && self.files == other.files
    }
}

impl Eq for Snapshot {}

impl Snapshot {
    /// Parse archive bytes into a snapshot.
    ///
    /// Enforces the size cap on both the archive bytes and the cumulative
    /// decompressed bytes, skips directory entries, rejects duplicate or
    /// non-relative paths, and requires at least one file entry besides the
    /// manifest. The manifest, when present, is parsed and held on the
    /// snapshot but excluded from `files` and from the pack hash.
    pub fn parse(bytes: &[u8]) -> Result<Self, ArchiveError> {
        if bytes.len() as u64 > MAX_ARCHIVE_BYTES {
            return Err(ArchiveError::SizeLimitExceeded {
                actual: bytes.len() as u64,
                limit: MAX_ARCHIVE_BYTES,
            });
        }

        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ArchiveError::MalformedArchive(format!("zip open: {e}")))?;

        let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut manifest_bytes: Option<Vec<u8>> = None;
        let mut decoded_total: u64 = 0;

        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| ArchiveError::MalformedArchive(format!("zip entry {i}: {e}")))?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            // The header's declared size is untrusted input: clamp the
            // allocation to the remaining budget and read at most one byte
            // past it so an over-cap stream errors instead of inflating.
            let remaining = MAX_ARCHIVE_BYTES - decoded_total;
            let mut data = Vec::with_capacity(entry.size().min(remaining) as usize);
            let read = (&mut entry)
                .take(remaining + 1)
                .read_to_end(&mut data)
                .map_err(|e| ArchiveError::MalformedArchive(format!("zip entry {name}: {e}")))?;
            decoded_total += read as u64;
            if decoded_total > MAX_ARCHIVE_BYTES {
                return Err(ArchiveError::SizeLimitExceeded {
                    actual: decoded_total,
                    limit: MAX_ARCHIVE_BYTES,
                });
            }

            if name == MANIFEST_NAME {
                if manifest_bytes.is_some() {
                    return Err(ArchiveError::MalformedArchive(
                        "duplicate manifest entry".into(),
                    ));
                }
                manifest_bytes = Some(data);
                continue;
            }

            canon::validate_path(&name)?;
            if files.insert(name.clone(), data).is_some() {
                return Err(ArchiveError::MalformedArchive(format!(
                    "duplicate path: {name}"
                )));
            }
        }

        if files.is_empty() {
            return Err(ArchiveError::EmptyArchive);
        }

        let manifest = match manifest_bytes {
            Some(bytes) => Some(Manifest::parse(&bytes)?),
            None => None,
        };
        let project_id = manifest
            .as_ref()
            .map(|m| m.project_id.clone())
            .unwrap_or_default();

        Ok(Self::assemble(project_id, files, manifest))
    }

    /// Build a snapshot from a path/bytes map, validating every path.
    pub fn from_files(
        project_id: &str,
        files: BTreeMap<String, Vec<u8>>,
    ) -> Result<Self, ArchiveError> {
        if files.is_empty() {
            return Err(ArchiveError::EmptyArchive);
        }
        for path in files.keys() {
            canon::validate_path(path)?;
        }
        Ok(Self::assemble(project_id.to_string(), files, None))
    }

    /// Assemble from already-validated parts. The BTreeMap guarantees the
    /// sorted-unique path invariant.
    pub(crate) fn assemble(
        project_id: String,
        files: BTreeMap<String, Vec<u8>>,
        manifest: Option<Manifest>,
    ) -> Self {
        let files: Vec<FileEntry> = files
            .into_iter()
            .map(|(path, bytes)| FileEntry { path, bytes })
            .collect();
        let pack_hash = tree_digest(files.iter().map(|f| (f.path.as_str(), f.bytes.as_slice())));
        Snapshot {
            project_id,
            files,
            manifest,
            pack_hash,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Aggregate content hash over the sorted `(path, bytes)` pairs.
    pub fn pack_hash(&self) -> Digest {
        self.pack_hash
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.files
            .binary_search_by(|f| f.path.as_str().cmp(path))
            .ok()
            .map(|i| &self.files[i])
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    /// Ordered, restartable iterator over the files.
    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    /// Validate the embedded manifest against the actual file set.
    ///
    /// Missing manifest and contents mismatches are warnings by default;
    /// with `strict` they become a [`ManifestError`] carrying every finding.
    /// Strictness is always an explicit caller decision.
    pub fn validate_manifest(&self, strict: bool) -> Result<Vec<ManifestIssue>, ManifestError> {
        let issues = match &self.manifest {
            None => vec![ManifestIssue::Missing],
            Some(manifest) => manifest.validate_contents(&self.paths()),
        };
        for issue in &issues {
            warn!(%issue, strict, "manifest validation finding");
        }
        if strict && !issues.is_empty() {
            return Err(ManifestError { issues });
        }
        Ok(issues)
    }

    /// Re-serialize to canonical archive bytes with a freshly derived
    /// manifest (current provenance, this snapshot's project id).
    pub fn to_archive_bytes(&self) -> Result<Vec<u8>, ArchiveError> {
        let manifest = Manifest::new(&self.project_id, self.paths());
        canon::write_archive(
            &manifest,
            self.files.iter().map(|f| (f.path.as_str(), f.bytes.as_slice())),
        )
    }
}

/// Test helper: build a snapshot from literal path/content pairs.
#[cfg(test)]
pub(crate) fn snapshot_of(project_id: &str, files: &[(&str, &[u8])]) -> Snapshot {
    let map: BTreeMap<String, Vec<u8>> = files
        .iter()
        .map(|(p, b)| (p.to_string(), b.to_vec()))
        .collect();
    Snapshot::from_files(project_id, map).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip_preserves_hash() {
        let snap = snapshot_of("proj", &[("a.txt", b"x"), ("dir/b.txt", b"y")]);
        let bytes = snap.to_archive_bytes().unwrap();
        let parsed = Snapshot::parse(&bytes).unwrap();
        assert_eq!(parsed.pack_hash(), snap.pack_hash());
        assert_eq!(parsed.project_id(), "proj");
        assert_eq!(parsed.len(), 2);
        assert!(parsed.manifest().is_some());
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let snap = snapshot_of("proj", &[("a.txt", b"x"), ("b.txt", b"y")]);
        assert_eq!(
            snap.to_archive_bytes().unwrap(),
            snap.to_archive_bytes().unwrap()
        );
    }

    #[test]
    fn test_empty_archive_rejected() {
        assert!(matches!(
            Snapshot::from_files("p", BTreeMap::new()),
            Err(ArchiveError::EmptyArchive)
        ));
    }

    #[test]
    fn test_garbage_bytes_are_malformed() {
        assert!(matches!(
            Snapshot::parse(b"not a zip"),
            Err(ArchiveError::MalformedArchive(_))
        ));
    }

    #[test]
    fn test_size_cap_checked_before_decode() {
        // A sparse oversized buffer must be refused without zip parsing.
        let bytes = vec![0u8; (MAX_ARCHIVE_BYTES + 1) as usize];
        assert!(matches!(
            Snapshot::parse(&bytes),
            Err(ArchiveError::SizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_decoded_bytes_capped_even_for_small_archives() {
        // Zeros deflate to almost nothing, so the archive itself is far
        // under the cap while the decoded tree is over it.
        let big = vec![0u8; (MAX_ARCHIVE_BYTES + 1024) as usize];
        let mut files = BTreeMap::new();
        files.insert("big.bin".to_string(), big);
        let bytes = Snapshot::from_files("p", files)
            .unwrap()
            .to_archive_bytes()
            .unwrap();
        assert!((bytes.len() as u64) < MAX_ARCHIVE_BYTES);
        assert!(matches!(
            Snapshot::parse(&bytes),
            Err(ArchiveError::SizeLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_get_and_iteration_order() {
        let snap = snapshot_of("p", &[("z.txt", b"3"), ("a.txt", b"1"), ("m.txt", b"2")]);
        assert_eq!(snap.get("m.txt").unwrap().bytes, b"2");
        assert!(snap.get("missing").is_none());
        let order: Vec<&str> = snap.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(order, ["a.txt", "m.txt", "z.txt"]);
        // restartable
        assert_eq!(snap.iter().count(), snap.iter().count());
    }

    #[test]
    fn test_manifest_warnings_vs_strict() {
        let snap = snapshot_of("p", &[("a.txt", b"x")]);
        // from_files carries no embedded manifest
        let issues = snap.validate_manifest(false).unwrap();
        assert_eq!(issues, vec![ManifestIssue::Missing]);
        assert!(snap.validate_manifest(true).is_err());

        let parsed = Snapshot::parse(&snap.to_archive_bytes().unwrap()).unwrap();
        assert!(parsed.validate_manifest(true).unwrap().is_empty());
    }

    #[test]
    fn test_strict_validation_catches_contents_mismatch() {
        // Manifest lists a file the archive lacks and omits one it has.
        let manifest = Manifest::new("p", vec!["a.txt".into(), "ghost.txt".into()]);
        let bytes = canon::write_archive(
            &manifest,
            [("a.txt", b"x" as &[u8]), ("extra.txt", b"y" as &[u8])],
        )
        .unwrap();
        let snap = Snapshot::parse(&bytes).unwrap();

        let issues = snap.validate_manifest(false).unwrap();
        let err = snap.validate_manifest(true).unwrap_err();
        assert_eq!(err.issues, issues);
        match &err.issues[0] {
            ManifestIssue::ContentsMismatch { missing, unlisted } => {
                assert_eq!(missing, &["ghost.txt"]);
                assert_eq!(unlisted, &["extra.txt"]);
            }
            other => panic!("unexpected issue: {other:?}"),
        }
    }

    #[test]
    fn test_pack_hash_ignores_provenance() {
        let snap = snapshot_of("p", &[("a.txt", b"x")]);
        let parsed = Snapshot::parse(&snap.to_archive_bytes().unwrap()).unwrap();
        assert_eq!(snap.pack_hash(), parsed.pack_hash());
    }
}
