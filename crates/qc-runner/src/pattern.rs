//! Filename wildcard matching over a single directory level.
//!
//! BIDS names are matched with the two shell wildcards that the layout needs:
//! `*` (any run of characters, including none) and `?` (exactly one character).
//! There are no character classes or escapes; every other character is literal.

use anyhow::Result;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Match `name` against `pattern` in full.
///
/// Uses the greedy two-pointer walk with a single backtrack point, so the cost
/// is linear in practice even for patterns with many stars.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = name.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while ti < text.len() {
        if pi < pat.len() && pat[pi] == '*' {
            star = Some(pi);
            resume = ti;
            pi += 1;
        } else if pi < pat.len() && (pat[pi] == '?' || pat[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ti = resume;
        } else {
            return false;
        }
    }
    pat[pi..].iter().all(|c| *c == '*')
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// List the direct children of `dir` whose file name matches `pattern`.
///
/// Entries come back in the order the filesystem yields them. A missing `dir`
/// is not an error and produces an empty list.
pub fn list_matching(dir: &Path, pattern: &str, kind: EntryKind) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry?;
        let wanted = match kind {
            EntryKind::File => entry.file_type().is_file(),
            EntryKind::Dir => entry.file_type().is_dir(),
        };
        if !wanted {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if wildcard_match(pattern, name) {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

pub fn count_matching_files(dir: &Path, pattern: &str) -> Result<usize> {
    Ok(list_matching(dir, pattern, EntryKind::File)?.len())
}
