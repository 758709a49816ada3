//! Completion accounting: raw sidecars in, HTML reports out.
//!
//! A unit is done when it has as many reports as it has anatomical and
//! functional JSON sidecars. Only the counts are compared; a truncated report
//! still counts.

use crate::pattern::{count_matching_files, list_matching, EntryKind};
use crate::units::Unit;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Sidecar suffixes, matched after the `_` that closes the unit label or a
/// later entity.
pub const ANATOMICAL_SIDECAR: &str = "T?w.json";
pub const FUNCTIONAL_SIDECAR: &str = "bold.json";

/// Category folders and the sidecar suffixes counted in each. `extra_data`
/// holds acquisitions that do not fit the standard layout but still get
/// their own report.
pub const INPUT_CATEGORIES: &[(&str, &[&str])] = &[
    ("anat", &[ANATOMICAL_SIDECAR]),
    ("func", &[FUNCTIONAL_SIDECAR]),
    ("extra_data", &[ANATOMICAL_SIDECAR, FUNCTIONAL_SIDECAR]),
];

pub const GROUP_REPORT_PATTERN: &str = "sub-*.html";

/// Result of comparing one unit's inputs and outputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assessment {
    pub inputs: usize,
    pub reports: Vec<PathBuf>,
}

impl Assessment {
    pub fn outputs(&self) -> usize {
        self.reports.len()
    }

    /// Zero inputs is never complete: there is nothing a report could cover.
    pub fn is_complete(&self) -> bool {
        self.inputs > 0 && self.outputs() == self.inputs
    }
}

/// Filename patterns for one sidecar suffix: directly after the label
/// (`sub-1_T1w.json`) or after further entities (`sub-1_acq-fast_T1w.json`).
/// The explicit `_` after the label keeps `sub-1` and `ses-1` from matching
/// `sub-10` and `ses-10`.
pub fn input_patterns(unit: &Unit, suffix: &str) -> [String; 2] {
    let label = unit.label();
    [
        format!("{}_{}", label, suffix),
        format!("{}_*_{}", label, suffix),
    ]
}

pub fn report_pattern(unit: &Unit) -> String {
    format!("{}_*.html", unit.label())
}

pub fn count_inputs(bids_dir: &Path, unit: &Unit) -> Result<usize> {
    let data_dir = unit.data_dir(bids_dir);
    let mut total = 0;
    for (category, suffixes) in INPUT_CATEGORIES {
        let dir = data_dir.join(category);
        for suffix in suffixes.iter() {
            for pattern in input_patterns(unit, suffix) {
                total += count_matching_files(&dir, &pattern)
                    .with_context(|| format!("scanning {}", dir.display()))?;
            }
        }
    }
    Ok(total)
}

pub fn unit_reports(report_dir: &Path, unit: &Unit) -> Result<Vec<PathBuf>> {
    let pattern = report_pattern(unit);
    list_matching(report_dir, &pattern, EntryKind::File)
        .with_context(|| format!("scanning {}", report_dir.display()))
}

pub fn assess_unit(bids_dir: &Path, report_dir: &Path, unit: &Unit) -> Result<Assessment> {
    let inputs = count_inputs(bids_dir, unit)?;
    let reports = unit_reports(report_dir, unit)?;
    debug!(unit = %unit.label(), inputs, outputs = reports.len(), "assessed unit");
    Ok(Assessment { inputs, reports })
}

/// Participant reports present in a group output directory. The group job
/// only needs at least one of them, not a particular count.
pub fn group_reports(output_dir: &Path) -> Result<Vec<PathBuf>> {
    list_matching(output_dir, GROUP_REPORT_PATTERN, EntryKind::File)
        .with_context(|| format!("scanning {}", output_dir.display()))
}

/// Delete previous reports and, if given and present, a reused working
/// directory. There is no backup.
pub fn purge_previous_outputs(reports: &[PathBuf], workdir: Option<&Path>) -> Result<()> {
    if let Some(dir) = workdir {
        if dir.is_dir() {
            info!(workdir = %dir.display(), "removing previous working directory");
            fs::remove_dir_all(dir)
                .with_context(|| format!("removing working directory {}", dir.display()))?;
        }
    }
    for report in reports {
        match fs::remove_file(report) {
            Ok(()) => info!(report = %report.display(), "removed previous report"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("removing report {}", report.display()))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"{}").expect("write");
    }

    fn unit(bids: &Path, rel: &str) -> Unit {
        Unit::from_path(&bids.join(rel)).expect("unit")
    }

    #[test]
    fn counts_sidecars_across_categories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let bids = tmp.path();
        touch(bids, "sub-01/ses-01/anat/sub-01_ses-01_T1w.json");
        touch(bids, "sub-01/ses-01/anat/sub-01_ses-01_T1w.nii.gz");
        touch(bids, "sub-01/ses-01/anat/sub-01_ses-01_FLAIR.json");
        touch(bids, "sub-01/ses-01/func/sub-01_ses-01_task-rest_bold.json");
        touch(bids, "sub-01/ses-01/func/sub-01_ses-01_task-rest_events.tsv");
        touch(bids, "sub-01/ses-01/extra_data/sub-01_ses-01_acq-fast_T2w.json");
        touch(bids, "sub-01/ses-01/extra_data/sub-01_ses-01_task-odd_bold.json");
        touch(bids, "sub-01/ses-01/dwi/sub-01_ses-01_dwi.json");

        let u = unit(bids, "sub-01/ses-01");
        assert_eq!(count_inputs(bids, &u).expect("count"), 4);
    }

    #[test]
    fn flat_prefix_does_not_leak_into_longer_subject_ids() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let bids = tmp.path().join("bids");
        let out = tmp.path().join("out");
        touch(&bids, "sub-1/anat/sub-1_T1w.json");
        touch(&out, "sub-1_T1w.html");
        touch(&out, "sub-10_T1w.html");

        let u = unit(&bids, "sub-1");
        let a = assess_unit(&bids, &out, &u).expect("assess");
        assert_eq!((a.inputs, a.outputs()), (1, 1));
        assert!(a.is_complete());
    }

    #[test]
    fn flat_names_without_extra_entities_are_counted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let bids = tmp.path();
        touch(bids, "sub-1/anat/sub-1_T1w.json");
        touch(bids, "sub-1/anat/sub-1_acq-fast_T2w.json");
        touch(bids, "sub-1/func/sub-1_task-rest_bold.json");
        touch(bids, "sub-1/func/sub-1_bold.json");
        touch(bids, "sub-1/anat/sub-10_T1w.json");
        assert_eq!(count_inputs(bids, &unit(bids, "sub-1")).expect("count"), 4);
    }

    #[test]
    fn session_reports_do_not_include_longer_session_ids() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let bids = tmp.path().join("bids");
        let out = tmp.path().join("out");
        touch(&bids, "sub-01/ses-1/anat/sub-01_ses-1_T1w.json");
        touch(&out, "sub-01_ses-1_T1w.html");
        touch(&out, "sub-01_ses-10_T1w.html");
        touch(&out, "sub-01_ses-10_T2w.html");

        let a = assess_unit(&bids, &out, &unit(&bids, "sub-01/ses-1")).expect("assess");
        assert_eq!(a.reports, vec![out.join("sub-01_ses-1_T1w.html")]);
        assert!(a.is_complete());
    }

    #[test]
    fn zero_inputs_is_incomplete() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let bids = tmp.path().join("bids");
        fs::create_dir_all(bids.join("sub-01/ses-01")).expect("mkdir");
        let u = unit(&bids, "sub-01/ses-01");
        let a = assess_unit(&bids, &tmp.path().join("missing"), &u).expect("assess");
        assert_eq!((a.inputs, a.outputs()), (0, 0));
        assert!(!a.is_complete());
    }

    #[test]
    fn group_reports_only_match_participant_html() {
        let tmp = tempfile::tempdir().expect("tempdir");
        touch(tmp.path(), "sub-01_T1w.html");
        touch(tmp.path(), "group_T1w.html");
        touch(tmp.path(), "sub-01_T1w.json");
        assert_eq!(group_reports(tmp.path()).expect("reports").len(), 1);
    }

    #[test]
    fn purge_removes_reports_and_workdir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        touch(tmp.path(), "out/sub-01_ses-01_T1w.html");
        touch(tmp.path(), "work/sub-01_ses-01/cache.pklz");
        let reports = vec![
            tmp.path().join("out/sub-01_ses-01_T1w.html"),
            tmp.path().join("out/already-gone.html"),
        ];
        let workdir = tmp.path().join("work/sub-01_ses-01");
        purge_previous_outputs(&reports, Some(&workdir)).expect("purge");
        assert!(!reports[0].exists());
        assert!(!workdir.exists());
        assert!(tmp.path().join("work").is_dir());
    }
}
