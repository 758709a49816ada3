//! Submission of MRIQC quality-control jobs to a PBS cluster.
//!
//! [`submit_participants`] walks the subject/session units of a BIDS dataset,
//! skips units whose reports are complete or whose job is still queued, and
//! submits one job per remaining unit. [`submit_group`] submits the single
//! group-level job once participant reports exist.

pub mod config;
pub mod job;
pub mod oracle;
pub mod pattern;
pub mod scheduler;
pub mod units;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub use config::{SchedulerSettings, Settings};
pub use job::{AnalysisLevel, JobDescriptor, WorkDir, GROUP_JOB_NAME, JOB_PREFIX};
pub use scheduler::{PbsScheduler, Scheduler, SchedulerError, SubmitReceipt};
pub use units::{Candidate, Unit};

/// Folder below the derivatives directory that holds the reports.
pub const PIPELINE_DIR: &str = "mriqc";

#[derive(Debug, Clone)]
pub struct ParticipantOptions {
    pub bids_dir: PathBuf,
    /// Derivatives root; reports go to `<output_dir>/mriqc`. Defaults to
    /// `<bids_dir>/derivatives`.
    pub output_dir: Option<PathBuf>,
    /// Reused working-directory root; ephemeral scratch directories otherwise.
    pub workdir: Option<PathBuf>,
    /// Explicit `sub-*[/ses-*]` entries relative to `bids_dir`, in order.
    pub selected: Vec<String>,
    pub force: bool,
    /// Skip units whose job is already held, queued or running.
    pub skip_active: bool,
    pub dry_run: bool,
    pub mem_gb: u32,
    pub tool_args: String,
    /// Directory the job changes into before running the tool.
    pub launch_dir: PathBuf,
}

impl ParticipantOptions {
    pub fn new(bids_dir: impl Into<PathBuf>, launch_dir: impl Into<PathBuf>) -> Self {
        Self {
            bids_dir: bids_dir.into(),
            output_dir: None,
            workdir: None,
            selected: Vec::new(),
            force: false,
            skip_active: true,
            dry_run: false,
            mem_gb: 18,
            tool_args: String::new(),
            launch_dir: launch_dir.into(),
        }
    }

    pub fn report_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.bids_dir.join("derivatives"))
            .join(PIPELINE_DIR)
    }
}

#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub bids_dir: PathBuf,
    /// Directory holding the participant reports. Defaults to
    /// `<bids_dir>/derivatives/mriqc`.
    pub output_dir: Option<PathBuf>,
    /// Submit even while other `mriqc_` jobs are still active.
    pub force: bool,
    pub dry_run: bool,
    pub mem_gb: u32,
    pub tool_args: String,
    pub launch_dir: PathBuf,
}

impl GroupOptions {
    pub fn new(bids_dir: impl Into<PathBuf>, launch_dir: impl Into<PathBuf>) -> Self {
        Self {
            bids_dir: bids_dir.into(),
            output_dir: None,
            force: false,
            dry_run: false,
            mem_gb: 1,
            tool_args: String::new(),
            launch_dir: launch_dir.into(),
        }
    }

    pub fn resolved_output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| self.bids_dir.join("derivatives").join(PIPELINE_DIR))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The requested entry is not an existing unit directory.
    Missing { reason: String },
    /// Every input already has a report.
    Complete,
    /// No participant reports exist yet for the group job to aggregate.
    NothingToDo,
    /// Matching jobs are still held, queued or running.
    AlreadyActive { jobs: Vec<String> },
    DryRun { script: String },
    Submitted { job_id: String, script: String },
    Failed { error: String },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Missing { .. } => "missing",
            Outcome::Complete => "complete",
            Outcome::NothingToDo => "nothing_to_do",
            Outcome::AlreadyActive { .. } => "already_active",
            Outcome::DryRun { .. } => "dry_run",
            Outcome::Submitted { .. } => "submitted",
            Outcome::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    /// Unit label, `group`, or the unresolved path.
    pub target: String,
    pub job_name: Option<String>,
    pub inputs: Option<usize>,
    pub outputs: Option<usize>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub level: AnalysisLevel,
    pub started_at: DateTime<Utc>,
    pub bids_dir: PathBuf,
    pub output_dir: PathBuf,
    pub units: Vec<UnitReport>,
}

impl BatchReport {
    fn new(level: AnalysisLevel, bids_dir: &Path, output_dir: &Path) -> Self {
        Self {
            level,
            started_at: Utc::now(),
            bids_dir: bids_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            units: Vec::new(),
        }
    }

    pub fn attempted(&self) -> usize {
        self.units.len()
    }

    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.units.iter().filter(|u| pred(&u.outcome)).count()
    }

    pub fn submitted(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Submitted { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, Outcome::Failed { .. }))
    }
}

/// Submit one participant-level job per unit that still needs processing.
///
/// Per-unit problems (missing directories, scan or submission failures) are
/// recorded in the report and the batch moves on. Only configuration errors
/// abort the whole call.
pub fn submit_participants(
    opts: &ParticipantOptions,
    settings: &Settings,
    scheduler: &dyn Scheduler,
) -> Result<BatchReport> {
    if opts.workdir.is_none() {
        settings.scratch_dir()?;
    }
    let report_dir = opts.report_dir();
    let mut batch = BatchReport::new(AnalysisLevel::Participant, &opts.bids_dir, &report_dir);

    let candidates = units::enumerate_units(&opts.bids_dir, &opts.selected)?;
    let total = candidates.len();
    for (n, candidate) in candidates.into_iter().enumerate() {
        let entry = match candidate {
            Candidate::Unresolved { path, reason } => {
                warn!(path = %path.display(), %reason, "skipping unit");
                UnitReport {
                    target: path.display().to_string(),
                    job_name: None,
                    inputs: None,
                    outputs: None,
                    outcome: Outcome::Missing { reason },
                }
            }
            Candidate::Unit(unit) => process_unit(opts, settings, scheduler, &report_dir, &unit),
        };
        info!(
            unit = %entry.target,
            position = n + 1,
            total,
            outcome = entry.outcome.label(),
            "processed unit"
        );
        batch.units.push(entry);
    }
    Ok(batch)
}

fn process_unit(
    opts: &ParticipantOptions,
    settings: &Settings,
    scheduler: &dyn Scheduler,
    report_dir: &Path,
    unit: &Unit,
) -> UnitReport {
    let name = job::unit_job_name(unit);
    let mut entry = UnitReport {
        target: unit.label(),
        job_name: Some(name.clone()),
        inputs: None,
        outputs: None,
        outcome: Outcome::Complete,
    };

    let assessment = match oracle::assess_unit(&opts.bids_dir, report_dir, unit) {
        Ok(a) => a,
        Err(err) => {
            entry.outcome = Outcome::Failed {
                error: format!("{:#}", err),
            };
            return entry;
        }
    };
    entry.inputs = Some(assessment.inputs);
    entry.outputs = Some(assessment.outputs());
    if !opts.force && assessment.is_complete() {
        return entry;
    }

    let workdir = match job::resolve_workdir(unit, opts.workdir.as_deref(), settings) {
        Ok(w) => w,
        Err(err) => {
            entry.outcome = Outcome::Failed {
                error: format!("{:#}", err),
            };
            return entry;
        }
    };
    let descriptor = JobDescriptor::participant(
        unit,
        settings,
        &opts.launch_dir,
        &opts.bids_dir,
        report_dir,
        workdir.clone(),
        opts.mem_gb,
        &opts.tool_args,
    );
    let script = descriptor.render(settings);

    if opts.skip_active {
        let active = scheduler.list_active(JOB_PREFIX);
        if active.contains(&name) {
            entry.outcome = Outcome::AlreadyActive { jobs: vec![name] };
            return entry;
        }
    }

    if opts.dry_run {
        entry.outcome = Outcome::DryRun { script };
        return entry;
    }

    // Clear the unit's previous reports; under force also its persistent workdir.
    let stale_workdir = match (&workdir, opts.force) {
        (WorkDir::Persistent(dir), true) => Some(dir.as_path()),
        _ => None,
    };
    if let Err(err) = oracle::purge_previous_outputs(&assessment.reports, stale_workdir) {
        entry.outcome = Outcome::Failed {
            error: format!("{:#}", err),
        };
        return entry;
    }

    entry.outcome = match scheduler.submit(&descriptor, &script) {
        Ok(receipt) => Outcome::Submitted {
            job_id: receipt.job_id,
            script,
        },
        Err(err) => Outcome::Failed {
            error: err.to_string(),
        },
    };
    entry
}

/// Submit the group-level job that aggregates existing participant reports.
///
/// A missing output directory is a configuration error. Zero participant
/// reports means there is nothing to aggregate and nothing is submitted.
pub fn submit_group(
    opts: &GroupOptions,
    settings: &Settings,
    scheduler: &dyn Scheduler,
) -> Result<BatchReport> {
    let output_dir = opts.resolved_output_dir();
    if !output_dir.is_dir() {
        return Err(anyhow!(
            "output directory does not exist: {}",
            output_dir.display()
        ));
    }
    let mut batch = BatchReport::new(AnalysisLevel::Group, &opts.bids_dir, &output_dir);

    let reports = oracle::group_reports(&output_dir)?;
    let mut entry = UnitReport {
        target: AnalysisLevel::Group.as_str().to_string(),
        job_name: Some(GROUP_JOB_NAME.to_string()),
        inputs: None,
        outputs: Some(reports.len()),
        outcome: Outcome::NothingToDo,
    };
    if reports.is_empty() {
        batch.units.push(entry);
        return Ok(batch);
    }

    let descriptor = JobDescriptor::group(
        settings,
        &opts.launch_dir,
        &opts.bids_dir,
        &output_dir,
        opts.mem_gb,
        &opts.tool_args,
    );
    let script = descriptor.render(settings);

    // Any active mriqc_ job, participant or group, holds the group job back.
    if !opts.force {
        let active = scheduler.list_active(JOB_PREFIX);
        if !active.is_empty() {
            entry.outcome = Outcome::AlreadyActive {
                jobs: active.into_iter().collect(),
            };
            batch.units.push(entry);
            return Ok(batch);
        }
    }

    entry.outcome = if opts.dry_run {
        Outcome::DryRun { script }
    } else {
        match scheduler.submit(&descriptor, &script) {
            Ok(receipt) => Outcome::Submitted {
                job_id: receipt.job_id,
                script,
            },
            Err(err) => Outcome::Failed {
                error: err.to_string(),
            },
        }
    };
    batch.units.push(entry);
    Ok(batch)
}
