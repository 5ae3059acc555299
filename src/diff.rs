//! Diff engine: per-file change classification plus line-level unified
//! hunks for text files.
//!
//! Classification unions the two path sets and compares bytes; content
//! equality is the sole criterion for "unchanged". Text files get a minimal
//! edit script from Myers' O(N·D) shortest-edit-script search, rendered as
//! unified hunks with a fixed context window. The hunk text is advisory,
//! display-only output; patch application never consults it.

use serde::{Deserialize, Serialize};

use crate::snapshot::{FileEntry, Snapshot};

/// Unchanged context lines on each side of a hunk.
const CONTEXT_LINES: usize = 3;
/// Window examined by the binary-content heuristic.
const TEXT_PROBE_BYTES: usize = 8192;
/// Minimum printable-byte ratio for the heuristic to call a file text.
const PRINTABLE_RATIO: f64 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    pub kind: ChangeKind,
    pub old_size: Option<u64>,
    pub new_size: Option<u64>,
    pub is_text: bool,
    /// Unified hunk text for changed text files, a placeholder line for
    /// binary files, empty for unchanged files.
    pub hunk_text: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffReport {
    pub stats: DiffStats,
    pub files: Vec<FileDiff>,
    /// Concatenated hunk text of changed files, in sorted path order.
    pub full_patch_text: String,
}

/// Compare two snapshots file by file.
pub fn diff(base: &Snapshot, proposal: &Snapshot) -> DiffReport {
    let mut stats = DiffStats::default();
    let mut files = Vec::new();
    let mut full_patch_text = String::new();

    for (old, new) in path_union(base, proposal) {
        let file_diff = match (old, new) {
            (None, Some(new)) => {
                stats.added += 1;
                diff_added(new)
            }
            (Some(old), None) => {
                stats.removed += 1;
                diff_removed(old)
            }
            (Some(old), Some(new)) if old.bytes == new.bytes => {
                stats.unchanged += 1;
                FileDiff {
                    path: old.path.clone(),
                    kind: ChangeKind::Unchanged,
                    old_size: Some(old.size()),
                    new_size: Some(new.size()),
                    is_text: is_text_file(&old.path, &old.bytes),
                    hunk_text: String::new(),
                }
            }
            (Some(old), Some(new)) => {
                stats.modified += 1;
                diff_modified(old, new)
            }
            (None, None) => unreachable!("path union yields at least one side"),
        };
        if file_diff.kind != ChangeKind::Unchanged {
            full_patch_text.push_str(&file_diff.hunk_text);
        }
        files.push(file_diff);
    }

    DiffReport {
        stats,
        files,
        full_patch_text,
    }
}

/// Merge-walk the two sorted file lists, yielding per-path pairs.
pub(crate) fn path_union<'a>(
    base: &'a Snapshot,
    proposal: &'a Snapshot,
) -> impl Iterator<Item = (Option<&'a FileEntry>, Option<&'a FileEntry>)> {
    let mut old_iter = base.files().iter().peekable();
    let mut new_iter = proposal.files().iter().peekable();
    std::iter::from_fn(move || match (old_iter.peek(), new_iter.peek()) {
        (None, None) => None,
        (Some(_), None) => Some((old_iter.next(), None)),
        (None, Some(_)) => Some((None, new_iter.next())),
        (Some(old), Some(new)) => match old.path.cmp(&new.path) {
            std::cmp::Ordering::Less => Some((old_iter.next(), None)),
            std::cmp::Ordering::Greater => Some((None, new_iter.next())),
            std::cmp::Ordering::Equal => Some((old_iter.next(), new_iter.next())),
        },
    })
}

fn diff_added(new: &FileEntry) -> FileDiff {
    let is_text = is_text_file(&new.path, &new.bytes);
    let mut hunk_text = format!("--- /dev/null\n+++ b/{}\n", new.path);
    if !is_text {
        hunk_text.push_str("Binary file added\n");
    } else if let Ok(text) = std::str::from_utf8(&new.bytes) {
        let lines = split_lines(text);
        if !lines.is_empty() {
            hunk_text.push_str(&format!("@@ -0,0 +1,{} @@\n", lines.len()));
            for line in &lines {
                push_marked_line(&mut hunk_text, '+', line);
            }
        }
    }
    FileDiff {
        path: new.path.clone(),
        kind: ChangeKind::Added,
        old_size: None,
        new_size: Some(new.size()),
        is_text,
        hunk_text,
    }
}

fn diff_removed(old: &FileEntry) -> FileDiff {
    let is_text = is_text_file(&old.path, &old.bytes);
    let mut hunk_text = format!("--- a/{}\n+++ /dev/null\n", old.path);
    if !is_text {
        hunk_text.push_str("Binary file removed\n");
    } else if let Ok(text) = std::str::from_utf8(&old.bytes) {
        let lines = split_lines(text);
        if !lines.is_empty() {
            hunk_text.push_str(&format!("@@ -1,{} +0,0 @@\n", lines.len()));
            for line in &lines {
                push_marked_line(&mut hunk_text, '-', line);
            }
        }
    }
    FileDiff {
        path: old.path.clone(),
        kind: ChangeKind::Removed,
        old_size: Some(old.size()),
        new_size: None,
        is_text,
        hunk_text,
    }
}

fn diff_modified(old: &FileEntry, new: &FileEntry) -> FileDiff {
    let text_pair = match (
        std::str::from_utf8(&old.bytes),
        std::str::from_utf8(&new.bytes),
    ) {
        (Ok(old_text), Ok(new_text))
            if is_text_file(&old.path, &old.bytes) && is_text_file(&new.path, &new.bytes) =>
        {
            Some((old_text, new_text))
        }
        _ => None,
    };

    let mut hunk_text = format!("--- a/{}\n+++ b/{}\n", old.path, old.path);
    let is_text = text_pair.is_some();
    match text_pair {
        Some((old_text, new_text)) => {
            let old_lines = split_lines(old_text);
            let new_lines = split_lines(new_text);
            let script = myers(&old_lines, &new_lines);
            hunk_text.push_str(&render_hunks(&script, &old_lines, &new_lines));
        }
        None => hunk_text.push_str("Binary file differs\n"),
    }

    FileDiff {
        path: old.path.clone(),
        kind: ChangeKind::Modified,
        old_size: Some(old.size()),
        new_size: Some(new.size()),
        is_text,
        hunk_text,
    }
}

/// Extensions always treated as text when the bytes are valid UTF-8.
fn has_text_extension(path: &str) -> bool {
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, e)| e.to_ascii_lowercase());
    matches!(
        ext.as_deref(),
        Some(
            "txt" | "md" | "rst" | "rs" | "toml" | "json" | "yaml" | "yml" | "xml" | "html"
                | "htm" | "css" | "js" | "jsx" | "ts" | "tsx" | "py" | "rb" | "go" | "java"
                | "c" | "h" | "cpp" | "hpp" | "sh" | "bash" | "sql" | "csv" | "tsv" | "ini"
                | "cfg" | "conf" | "env" | "lock" | "gitignore" | "dockerfile" | "svg"
        )
    )
}

/// Text classification: extension allow-list first, then a printable-ratio
/// probe of the leading bytes. A NUL byte always means binary; so do bytes
/// that are not valid UTF-8.
fn is_text_file(path: &str, bytes: &[u8]) -> bool {
    if std::str::from_utf8(bytes).is_err() {
        return false;
    }
    if has_text_extension(path) {
        return true;
    }
    let probe = &bytes[..bytes.len().min(TEXT_PROBE_BYTES)];
    if probe.is_empty() {
        return true;
    }
    if probe.contains(&0) {
        return false;
    }
    let printable = probe
        .iter()
        .filter(|&&b| b == b'\n' || b == b'\r' || b == b'\t' || (0x20..0x7f).contains(&b) || b >= 0x80)
        .count();
    printable as f64 / probe.len() as f64 >= PRINTABLE_RATIO
}

/// Split keeping line terminators, so trailing-newline differences survive.
fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

/// Append a marked diff line, normalizing the terminator and flagging a
/// missing final newline the way unified diff does.
fn push_marked_line(out: &mut String, marker: char, line: &str) {
    out.push(marker);
    match line.strip_suffix('\n') {
        Some(body) => {
            out.push_str(body.strip_suffix('\r').unwrap_or(body));
            out.push('\n');
        }
        None => {
            out.push_str(line);
            out.push('\n');
            out.push_str("\\ No newline at end of file\n");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EditKind {
    Equal,
    Delete,
    Insert,
}

/// One step of an edit script, with the 0-based positions in each sequence
/// *before* the step is taken.
#[derive(Debug, Clone, Copy)]
struct Edit {
    kind: EditKind,
    old_pos: usize,
    new_pos: usize,
}

/// Myers' shortest-edit-script search: a forward pass over diagonals
/// tracking the greatest reachable x per diagonal per edit distance, with a
/// backtrack pass reconstructing the operation sequence from the recorded
/// frontiers.
fn myers(a: &[&str], b: &[&str]) -> Vec<Edit> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    if n == 0 && m == 0 {
        return Vec::new();
    }
    let max = n + m;
    let offset = max;
    let width = (2 * max + 1) as usize;

    let mut v = vec![0isize; width.max(1)];
    let mut trace: Vec<Vec<isize>> = Vec::new();

    'search: for d in 0..=max {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let idx = (k + offset) as usize;
            let mut x = if k == -d || (k != d && v[idx - 1] < v[idx + 1]) {
                v[idx + 1]
            } else {
                v[idx - 1] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx] = x;
            if x >= n && y >= m {
                break 'search;
            }
            k += 2;
        }
    }

    backtrack(&trace, n, m, offset)
}

fn backtrack(trace: &[Vec<isize>], n: isize, m: isize, offset: isize) -> Vec<Edit> {
    let mut edits = Vec::new();
    let mut x = n;
    let mut y = m;

    for (d, v) in trace.iter().enumerate().rev() {
        let d = d as isize;
        let k = x - y;
        let prev_k = if k == -d || (k != d && v[(k - 1 + offset) as usize] < v[(k + 1 + offset) as usize])
        {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[(prev_k + offset) as usize];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            edits.push(Edit {
                kind: EditKind::Equal,
                old_pos: (x - 1) as usize,
                new_pos: (y - 1) as usize,
            });
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                edits.push(Edit {
                    kind: EditKind::Insert,
                    old_pos: prev_x as usize,
                    new_pos: prev_y as usize,
                });
            } else {
                edits.push(Edit {
                    kind: EditKind::Delete,
                    old_pos: prev_x as usize,
                    new_pos: prev_y as usize,
                });
            }
        }
        x = prev_x;
        y = prev_y;
    }

    edits.reverse();
    edits
}

/// Group an edit script into unified hunks with [`CONTEXT_LINES`] of
/// context, emitting `@@ -a,b +c,d @@` headers and marked lines.
fn render_hunks(script: &[Edit], a: &[&str], b: &[&str]) -> String {
    let changed: Vec<usize> = script
        .iter()
        .enumerate()
        .filter(|(_, e)| e.kind != EditKind::Equal)
        .map(|(i, _)| i)
        .collect();
    if changed.is_empty() {
        return String::new();
    }

    // Merge change groups whose context windows touch or overlap.
    let mut groups: Vec<(usize, usize)> = Vec::new();
    for &i in &changed {
        match groups.last_mut() {
            Some((_, end)) if i <= *end + 2 * CONTEXT_LINES + 1 => *end = i,
            _ => groups.push((i, i)),
        }
    }

    let mut out = String::new();
    for (first, last) in groups {
        let lo = first.saturating_sub(CONTEXT_LINES);
        let hi = (last + CONTEXT_LINES + 1).min(script.len());
        let range = &script[lo..hi];

        let old_count = range
            .iter()
            .filter(|e| e.kind != EditKind::Insert)
            .count();
        let new_count = range
            .iter()
            .filter(|e| e.kind != EditKind::Delete)
            .count();
        let old_start = if old_count == 0 {
            range[0].old_pos
        } else {
            range[0].old_pos + 1
        };
        let new_start = if new_count == 0 {
            range[0].new_pos
        } else {
            range[0].new_pos + 1
        };

        out.push_str(&format!(
            "@@ -{old_start},{old_count} +{new_start},{new_count} @@\n"
        ));
        for edit in range {
            match edit.kind {
                EditKind::Equal => push_marked_line(&mut out, ' ', a[edit.old_pos]),
                EditKind::Delete => push_marked_line(&mut out, '-', a[edit.old_pos]),
                EditKind::Insert => push_marked_line(&mut out, '+', b[edit.new_pos]),
            }
        }
    }
    out
}
