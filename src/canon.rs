//! Canonical serialization: byte-stable archive writing and canonical JSON.
//!
//! Two calls with structurally equal input must produce byte-identical
//! output, regardless of call order, platform, or wall-clock time. Entries
//! are written in lexicographic path order with a fixed modification time
//! and fixed permissions; the compression method is fixed per build.

use std::io::{Cursor, Write};

use serde_json::Value;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::ArchiveError;
use crate::manifest::Manifest;

/// Reserved name of the manifest entry at the archive root.
pub const MANIFEST_NAME: &str = "pack.manifest.json";

/// Validate a POSIX-style relative path for inclusion in an archive.
pub fn validate_path(path: &str) -> Result<(), ArchiveError> {
    if path.is_empty() {
        return Err(ArchiveError::MalformedArchive("empty path".into()));
    }
    if path.starts_with('/') || path.contains('\\') {
        return Err(ArchiveError::MalformedArchive(format!(
            "path is not POSIX-relative: {path}"
        )));
    }
    if path.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..") {
        return Err(ArchiveError::MalformedArchive(format!(
            "path contains empty or dot segments: {path}"
        )));
    }
    if path == MANIFEST_NAME {
        return Err(ArchiveError::MalformedArchive(format!(
            "path collides with the reserved manifest name: {path}"
        )));
    }
    Ok(())
}

fn entry_options() -> FileOptions {
    // zip::DateTime::default() is the zip epoch (1980-01-01 00:00:00),
    // a constant; wall-clock time never reaches the archive.
    FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644)
}

/// Serialize a sorted file list plus its manifest into deterministic zip
/// bytes. `files` must be sorted by path with no duplicates; the manifest
/// entry is appended last under [`MANIFEST_NAME`].
pub fn write_archive<'a, I>(manifest: &Manifest, files: I) -> Result<Vec<u8>, ArchiveError>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = entry_options();

    let mut previous: Option<String> = None;
    for (path, bytes) in files {
        validate_path(path)?;
        if let Some(prev) = &previous {
            if prev.as_str() >= path {
                return Err(ArchiveError::MalformedArchive(format!(
                    "paths not sorted and unique: {prev} then {path}"
                )));
            }
        }
        previous = Some(path.to_string());

        writer
            .start_file(path, options)
            .map_err(|e| ArchiveError::MalformedArchive(format!("zip entry {path}: {e}")))?;
        writer
            .write_all(bytes)
            .map_err(|e| ArchiveError::MalformedArchive(format!("zip entry {path}: {e}")))?;
    }

    let manifest_bytes = manifest.to_canonical_bytes()?;
    writer
        .start_file(MANIFEST_NAME, options)
        .map_err(|e| ArchiveError::MalformedArchive(format!("manifest entry: {e}")))?;
    writer
        .write_all(&manifest_bytes)
        .map_err(|e| ArchiveError::MalformedArchive(format!("manifest entry: {e}")))?;

    let cursor = writer
        .finish()
        .map_err(|e| ArchiveError::MalformedArchive(format!("finishing archive: {e}")))?;
    Ok(cursor.into_inner())
}

/// Render a JSON value with recursively sorted object keys and default
/// number/string formatting. Structurally equal values always render to the
/// same text, so diffs stay stable when no semantic content changed.
pub fn canonical_json(value: &Value) -> String {
    let mut sorted = value.clone();
    sort_json_value(&mut sorted);
    // A Value with sorted keys serializes infallibly.
    serde_json::to_string(&sorted).unwrap_or_default()
}

fn sort_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = std::mem::take(map).into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, v) in entries.iter_mut() {
                sort_json_value(v);
            }
            map.extend(entries);
        }
        Value::Array(items) => {
            for item in items {
                sort_json_value(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest() -> Manifest {
        Manifest::new("proj", vec!["a.txt".into(), "b.txt".into()])
    }

    #[test]
    fn test_archive_bytes_are_stable() {
        let files = [("a.txt", b"alpha" as &[u8]), ("b.txt", b"beta" as &[u8])];
        let first = write_archive(&manifest(), files).unwrap();
        let second = write_archive(&manifest(), files).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_unsorted_input_is_rejected() {
        let files = [("b.txt", b"beta" as &[u8]), ("a.txt", b"alpha" as &[u8])];
        assert!(write_archive(&manifest(), files).is_err());
    }

    #[test]
    fn test_duplicate_path_is_rejected() {
        let files = [("a.txt", b"one" as &[u8]), ("a.txt", b"two" as &[u8])];
        assert!(write_archive(&manifest(), files).is_err());
    }

    #[test]
    fn test_path_validation() {
        assert!(validate_path("src/lib.rs").is_ok());
        assert!(validate_path("/abs").is_err());
        assert!(validate_path("a\\b").is_err());
        assert!(validate_path("a/../b").is_err());
        assert!(validate_path("").is_err());
        assert!(validate_path(MANIFEST_NAME).is_err());
    }

    #[test]
    fn test_canonical_json_sorts_keys_recursively() {
        let value = json!({"b": 1, "a": {"z": true, "y": [ {"q": 2, "p": 3} ]}});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":{"y":[{"p":3,"q":2}],"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_canonical_json_is_stable_across_insert_order() {
        let one = json!({"x": 1, "y": 2});
        let two = json!({"y": 2, "x": 1});
        assert_eq!(canonical_json(&one), canonical_json(&two));
    }
}
