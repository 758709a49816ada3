//! Discovery of processing units (subject, optional session) in a BIDS tree.

use crate::pattern::{list_matching, EntryKind};
use anyhow::Result;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};

pub const SUBJECT_PREFIX: &str = "sub-";
pub const SESSION_PREFIX: &str = "ses-";

/// One subject, optionally narrowed to one of its sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Unit {
    /// Full subject id, e.g. `sub-01`.
    pub subject: String,
    /// Full session id, e.g. `ses-01`; `None` for flat datasets.
    pub session: Option<String>,
    pub path: PathBuf,
}

impl Unit {
    /// Parse a unit from a directory path.
    ///
    /// The subject is the last `sub-` component; the session is a `ses-`
    /// component that follows it. Returns `None` when no subject is present.
    pub fn from_path(path: &Path) -> Option<Unit> {
        let mut subject: Option<String> = None;
        let mut session: Option<String> = None;
        for component in path.components() {
            let Component::Normal(part) = component else {
                continue;
            };
            let Some(part) = part.to_str() else {
                continue;
            };
            if part.starts_with(SUBJECT_PREFIX) && part.len() > SUBJECT_PREFIX.len() {
                subject = Some(part.to_string());
                session = None;
            } else if subject.is_some()
                && part.starts_with(SESSION_PREFIX)
                && part.len() > SESSION_PREFIX.len()
            {
                session = Some(part.to_string());
            }
        }
        Some(Unit {
            subject: subject?,
            session,
            path: path.to_path_buf(),
        })
    }

    /// `sub-01_ses-01`, or just `sub-01` for a flat dataset.
    pub fn label(&self) -> String {
        match &self.session {
            Some(ses) => format!("{}_{}", self.subject, ses),
            None => self.subject.clone(),
        }
    }

    /// Subject id without the `sub-` prefix, as the tool expects it.
    pub fn participant_label(&self) -> &str {
        &self.subject[SUBJECT_PREFIX.len()..]
    }

    /// Session id without the `ses-` prefix.
    pub fn session_label(&self) -> Option<&str> {
        self.session.as_deref().map(|s| &s[SESSION_PREFIX.len()..])
    }

    /// Subject directory relative to which the BIDS category folders live.
    pub fn data_dir(&self, bids_dir: &Path) -> PathBuf {
        let dir = bids_dir.join(&self.subject);
        match &self.session {
            Some(ses) => dir.join(ses),
            None => dir,
        }
    }
}

/// What the enumerator produced for one requested or discovered entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Candidate {
    Unit(Unit),
    /// The entry could not be resolved to an existing unit directory.
    Unresolved { path: PathBuf, reason: String },
}

/// Produce the ordered list of candidates to consider.
///
/// Explicit `selected` entries are joined onto `bids_dir` and kept in caller
/// order. Without a selection, `sub-*/ses-*` directories are discovered; if
/// the dataset has no sessions at all, each `sub-*` directory is one unit.
pub fn enumerate_units(bids_dir: &Path, selected: &[String]) -> Result<Vec<Candidate>> {
    if !selected.is_empty() {
        return Ok(selected
            .iter()
            .map(|entry| resolve_selected(&bids_dir.join(entry)))
            .collect());
    }

    let subjects = list_matching(bids_dir, "sub-*", EntryKind::Dir)?;
    let mut sessions = Vec::new();
    for subject in &subjects {
        sessions.extend(list_matching(subject, "ses-*", EntryKind::Dir)?);
    }
    let dirs = if sessions.is_empty() { subjects } else { sessions };
    Ok(dirs.iter().map(|dir| resolve_selected(dir)).collect())
}

fn resolve_selected(path: &Path) -> Candidate {
    if !path.is_dir() {
        return Candidate::Unresolved {
            path: path.to_path_buf(),
            reason: "directory does not exist".to_string(),
        };
    }
    match Unit::from_path(path) {
        Some(unit) => Candidate::Unit(unit),
        None => Candidate::Unresolved {
            path: path.to_path_buf(),
            reason: "path does not name a sub-* directory".to_string(),
        },
    }
}
