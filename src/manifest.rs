use serde::{Deserialize, Serialize};

use crate::canon;
use crate::error::{ArchiveError, ManifestIssue};

pub const MANIFEST_SCHEMA_ID: &str = "packpatch.manifest.v1";
pub const PACK_FORMAT_VERSION: u32 = 1;
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const VALIDATOR_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub app_version: String,
    pub validator_version: String,
}

impl Provenance {
    pub fn current() -> Self {
        Provenance {
            app_version: APP_VERSION.to_string(),
            validator_version: VALIDATOR_VERSION.to_string(),
        }
    }
}

/// Canonical metadata file embedded in every serialized archive.
///
/// `contents` must exactly equal the archive's file paths minus the manifest
/// itself; a mismatch is a validation finding, never a silent correction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_id: String,
    pub project_id: String,
    pub format_version: u32,
    pub provenance: Provenance,
    pub contents: Vec<String>,
}

impl Manifest {
    pub fn new(project_id: &str, mut contents: Vec<String>) -> Self {
        contents.sort();
        Manifest {
            schema_id: MANIFEST_SCHEMA_ID.to_string(),
            project_id: project_id.to_string(),
            format_version: PACK_FORMAT_VERSION,
            provenance: Provenance::current(),
            contents,
        }
    }

    /// Render as canonical JSON bytes for embedding in an archive.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, ArchiveError> {
        let value = serde_json::to_value(self)
            .map_err(|e| ArchiveError::MalformedArchive(format!("manifest encode: {e}")))?;
        Ok(canon::canonical_json(&value).into_bytes())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let manifest: Manifest = serde_json::from_slice(bytes)
            .map_err(|e| ArchiveError::MalformedArchive(format!("manifest decode: {e}")))?;
        if manifest.schema_id != MANIFEST_SCHEMA_ID {
            return Err(ArchiveError::MalformedArchive(format!(
                "unsupported manifest schema: {}",
                manifest.schema_id
            )));
        }
        Ok(manifest)
    }

    /// Compare the listed contents against the actual archive paths
    /// (manifest excluded). `actual` must be sorted.
    pub fn validate_contents(&self, actual: &[String]) -> Vec<ManifestIssue> {
        let missing: Vec<String> = self
            .contents
            .iter()
            .filter(|p| actual.binary_search(p).is_err())
            .cloned()
            .collect();
        let unlisted: Vec<String> = actual
            .iter()
            .filter(|p| self.contents.binary_search(p).is_err())
            .cloned()
            .collect();
        if missing.is_empty() && unlisted.is_empty() {
            Vec::new()
        } else {
            vec![ManifestIssue::ContentsMismatch { missing, unlisted }]
        }
    }
}
