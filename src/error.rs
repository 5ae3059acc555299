use std::fmt;

use thiserror::Error;

use crate::hash::Digest;

/// Errors parsing or serializing pack archive bytes.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive contains no file entries")]
    EmptyArchive,
    #[error("malformed archive: {0}")]
    MalformedArchive(String),
    #[error("archive is {actual} bytes, limit is {limit}")]
    SizeLimitExceeded { actual: u64, limit: u64 },
}

/// A manifest validation finding. Non-fatal by default; strict callers
/// receive the same findings wrapped in a [`ManifestError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestIssue {
    Missing,
    ContentsMismatch {
        /// Listed in the manifest but absent from the archive.
        missing: Vec<String>,
        /// Present in the archive but not listed in the manifest.
        unlisted: Vec<String>,
    },
}

impl fmt::Display for ManifestIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestIssue::Missing => f.write_str("manifest is missing"),
            ManifestIssue::ContentsMismatch { missing, unlisted } => write!(
                f,
                "manifest contents mismatch: {} listed but absent, {} present but unlisted",
                missing.len(),
                unlisted.len()
            ),
        }
    }
}

/// Strict-mode manifest validation failure carrying every finding.
#[derive(Debug)]
pub struct ManifestError {
    pub issues: Vec<ManifestIssue>,
}

impl std::error::Error for ManifestError {}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "manifest validation failed:")?;
        for issue in &self.issues {
            write!(f, " {issue};")?;
        }
        Ok(())
    }
}

/// Errors decoding a PatchDocument from its JSON wire form.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error("patch document is {actual} bytes, limit is {limit}")]
    SizeLimitExceeded { actual: u64, limit: u64 },
    #[error("malformed patch document: {0}")]
    Malformed(String),
    #[error("unsupported patch schema: {0}")]
    SchemaMismatch(String),
    #[error("duplicate op path in patch document: {0}")]
    DuplicatePath(String),
    #[error("payload for {path} hashes to {actual}, document declares {declared}")]
    Integrity {
        path: String,
        declared: Digest,
        actual: Digest,
    },
}

/// Why a single patch op could not be applied to the current base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreconditionKind {
    PathAlreadyExists,
    PathMissing,
    HashMismatch { expected: Digest, actual: Digest },
    PayloadCorrupt { declared: Digest, actual: Digest },
}

impl fmt::Display for PreconditionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreconditionKind::PathAlreadyExists => f.write_str("path already exists"),
            PreconditionKind::PathMissing => f.write_str("path missing"),
            PreconditionKind::HashMismatch { expected, actual } => {
                write!(f, "hash mismatch (expected {expected}, found {actual})")
            }
            PreconditionKind::PayloadCorrupt { declared, actual } => {
                write!(f, "payload corrupt (declared {declared}, found {actual})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionFailure {
    pub path: String,
    pub kind: PreconditionKind,
}

impl fmt::Display for PreconditionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.kind)
    }
}

/// A rejected patch application. Carries every failing path, never just the
/// first, so the caller can decide whether to regenerate the whole proposal.
/// The base snapshot is untouched when this is returned.
#[derive(Debug)]
pub struct ApplyRejection {
    pub failures: Vec<PreconditionFailure>,
}

impl std::error::Error for ApplyRejection {}

impl fmt::Display for ApplyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "patch rejected, {} precondition failure(s):", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " [{failure}]")?;
        }
        Ok(())
    }
}

/// Errors from the governance/lock state machine.
#[derive(Debug, Error)]
pub enum GovernanceError {
    #[error("no lock record exists for this project")]
    NeverLocked,
    #[error("malformed governance record: {0}")]
    Malformed(String),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}
