//! Loading a snapshot's file map from a directory tree, for the CLI.
//!
//! Paths use forward slashes for cross-platform consistency and must be
//! UTF-8. File bytes are memory-mapped and loaded in parallel.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memmap2::Mmap;
use rayon::prelude::*;
use walkdir::WalkDir;

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or
/// replace the underlying file while the `Mmap` is live.
fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    unsafe {
        Mmap::map(&file).with_context(|| format!("Failed to memory-map file: {}", path.display()))
    }
}

/// Walk a directory tree and load every file into a path/bytes map.
/// Directories themselves carry no content and are not recorded.
pub fn load_tree(root: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize path: {}", root.display()))?;

    let mut file_paths: Vec<(String, PathBuf)> = Vec::new();
    for entry in WalkDir::new(&root).min_depth(1) {
        let entry = entry
            .with_context(|| format!("Failed to read directory entry in {}", root.display()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let full_path = entry.path().to_path_buf();
        let relative = full_path
            .strip_prefix(&root)
            .with_context(|| "Failed to compute relative path")?;
        let relative_str = relative
            .to_str()
            .with_context(|| format!("Non-UTF8 path: {}", relative.display()))?
            .replace('\\', "/");
        file_paths.push((relative_str, full_path));
    }

    let loaded: Vec<(String, Vec<u8>)> = file_paths
        .par_iter()
        .map(|(rel_path, full_path)| -> Result<(String, Vec<u8>)> {
            let mmap = mmap_file(full_path)?;
            Ok((rel_path.clone(), mmap.to_vec()))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(loaded.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_tree_collects_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub/nested")).unwrap();
        std::fs::write(dir.path().join("top.txt"), b"top").unwrap();
        std::fs::write(dir.path().join("sub/nested/deep.txt"), b"deep").unwrap();

        let tree = load_tree(dir.path()).unwrap();
        let paths: Vec<&str> = tree.keys().map(String::as_str).collect();
        assert_eq!(paths, ["sub/nested/deep.txt", "top.txt"]);
        assert_eq!(tree["top.txt"], b"top");
    }

    #[test]
    fn test_empty_directories_are_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let tree = load_tree(dir.path()).unwrap();
        assert_eq!(tree.len(), 1);
    }
}
