//! Job descriptors and their rendering into PBS job scripts.

use crate::config::Settings;
use crate::units::Unit;
use anyhow::Result;
use serde::Serialize;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Every job this tool submits carries this prefix, which is also what the
/// active-job query filters on.
pub const JOB_PREFIX: &str = "mriqc_";
pub const GROUP_JOB_NAME: &str = "mriqc_group";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisLevel {
    Participant,
    Group,
}

impl AnalysisLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisLevel::Participant => "participant",
            AnalysisLevel::Group => "group",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum WorkDir {
    /// Unique per invocation and removed by the job itself when it ends.
    Ephemeral(PathBuf),
    /// Chosen by the caller and reused by later runs for the same unit.
    Persistent(PathBuf),
}

impl WorkDir {
    pub fn path(&self) -> &Path {
        match self {
            WorkDir::Ephemeral(p) | WorkDir::Persistent(p) => p.as_path(),
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, WorkDir::Ephemeral(_))
    }
}

/// Working directory for one unit: `<root>/<sub>_<ses>` when the caller gave a
/// root, otherwise a fresh `<scratch>/<sub>_<ses>_<uuid>`.
pub fn resolve_workdir(unit: &Unit, root: Option<&Path>, settings: &Settings) -> Result<WorkDir> {
    let stem = format!("{}_{}", unit.subject, unit.session.as_deref().unwrap_or(""));
    Ok(match root {
        Some(root) => WorkDir::Persistent(root.join(stem)),
        None => WorkDir::Ephemeral(
            settings
                .scratch_dir()?
                .join(format!("{}_{}", stem, Uuid::new_v4())),
        ),
    })
}

pub fn unit_job_name(unit: &Unit) -> String {
    format!("{}{}", JOB_PREFIX, unit.label())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Resources {
    pub mem_gb: u32,
    pub walltime: String,
}

/// Everything needed to render one job script. Tool flags are kept as an
/// argument list; `extra_args` is the caller's opaque passthrough.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobDescriptor {
    pub name: String,
    pub level: AnalysisLevel,
    pub resources: Resources,
    pub launch_dir: PathBuf,
    pub bids_dir: PathBuf,
    pub output_dir: PathBuf,
    pub workdir: Option<WorkDir>,
    pub tool_args: Vec<String>,
    pub extra_args: String,
}

impl JobDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn participant(
        unit: &Unit,
        settings: &Settings,
        launch_dir: &Path,
        bids_dir: &Path,
        report_dir: &Path,
        workdir: WorkDir,
        mem_gb: u32,
        extra_args: &str,
    ) -> Self {
        let mut tool_args = vec![
            "-w".to_string(),
            workdir.path().display().to_string(),
            "--participant-label".to_string(),
            unit.participant_label().to_string(),
        ];
        if let Some(ses) = unit.session_label() {
            tool_args.push("--session-id".to_string());
            tool_args.push(ses.to_string());
        }
        tool_args.extend([
            "--verbose-reports".to_string(),
            "--mem_gb".to_string(),
            mem_gb.to_string(),
            "--ants-nthreads".to_string(),
            "1".to_string(),
            "--nprocs".to_string(),
            "1".to_string(),
        ]);
        Self {
            name: unit_job_name(unit),
            level: AnalysisLevel::Participant,
            resources: Resources {
                mem_gb,
                walltime: settings.participant_walltime.clone(),
            },
            launch_dir: launch_dir.to_path_buf(),
            bids_dir: bids_dir.to_path_buf(),
            output_dir: report_dir.to_path_buf(),
            workdir: Some(workdir),
            tool_args,
            extra_args: extra_args.to_string(),
        }
    }

    pub fn group(
        settings: &Settings,
        launch_dir: &Path,
        bids_dir: &Path,
        output_dir: &Path,
        mem_gb: u32,
        extra_args: &str,
    ) -> Self {
        Self {
            name: GROUP_JOB_NAME.to_string(),
            level: AnalysisLevel::Group,
            resources: Resources {
                mem_gb,
                walltime: settings.group_walltime.clone(),
            },
            launch_dir: launch_dir.to_path_buf(),
            bids_dir: bids_dir.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            workdir: None,
            tool_args: vec!["--nprocs".to_string(), "1".to_string()],
            extra_args: extra_args.to_string(),
        }
    }

    /// Render the job script fed to `qsub` on stdin.
    pub fn render(&self, settings: &Settings) -> String {
        let mut script = String::new();
        let _ = writeln!(script, "#!/bin/bash");
        let _ = writeln!(script, "#PBS -N {}", self.name);
        let _ = writeln!(
            script,
            "#PBS -l walltime={},mem={}gb",
            self.resources.walltime, self.resources.mem_gb
        );
        let _ = writeln!(
            script,
            "module add mriqc; cd {}",
            shell_quote(&self.launch_dir.display().to_string())
        );

        let mut command = vec!["singularity".to_string(), "run".to_string()];
        if self.level == AnalysisLevel::Group {
            command.push("--cleanenv".to_string());
        }
        command.push(settings.container_image().display().to_string());
        command.push(self.bids_dir.display().to_string());
        command.push(self.output_dir.display().to_string());
        command.push(self.level.as_str().to_string());
        command.extend(self.tool_args.iter().cloned());

        let mut line = String::from("unset PYTHONPATH; export PYTHONNOUSERSITE=1; ");
        line.push_str(&shell_join(&command));
        if !self.extra_args.is_empty() {
            line.push(' ');
            line.push_str(&self.extra_args);
        }
        let _ = writeln!(script, "{}", line);

        if let Some(WorkDir::Ephemeral(dir)) = &self.workdir {
            let _ = writeln!(script, "rm -rf {}", shell_quote(&dir.display().to_string()));
        }
        script
    }
}

fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            opt_dir: PathBuf::from("/opt"),
            tool_version: "0.16.1".to_string(),
            user: "marzwi".to_string(),
            ..Settings::default()
        }
    }

    fn unit(rel: &str) -> Unit {
        Unit::from_path(&Path::new("/project/bids").join(rel)).expect("unit")
    }

    #[test]
    fn job_names_are_distinct_per_unit() {
        assert_eq!(unit_job_name(&unit("sub-01/ses-01")), "mriqc_sub-01_ses-01");
        assert_eq!(unit_job_name(&unit("sub-01")), "mriqc_sub-01");
        assert_ne!(
            unit_job_name(&unit("sub-01/ses-1")),
            unit_job_name(&unit("sub-01/ses-10"))
        );
        assert_ne!(unit_job_name(&unit("sub-1")), GROUP_JOB_NAME);
    }

    #[test]
    fn workdir_placement() {
        let s = settings();
        let u = unit("sub-01/ses-02");
        let kept = resolve_workdir(&u, Some(Path::new("/project/work")), &s).expect("workdir");
        assert_eq!(kept, WorkDir::Persistent(PathBuf::from("/project/work/sub-01_ses-02")));

        let a = resolve_workdir(&u, None, &s).expect("workdir");
        let b = resolve_workdir(&u, None, &s).expect("workdir");
        assert!(a.is_ephemeral());
        assert_ne!(a, b);
        assert!(a.path().starts_with("/tmp/marzwi/work_mriqc"));
        let name = a.path().file_name().and_then(|n| n.to_str()).expect("name");
        assert!(name.starts_with("sub-01_ses-02_"));
    }

    #[test]
    fn participant_script_with_ephemeral_workdir() {
        let s = settings();
        let u = unit("sub-01/ses-01");
        let wd = WorkDir::Ephemeral(PathBuf::from("/tmp/marzwi/work_mriqc/sub-01_ses-01_x"));
        let job = JobDescriptor::participant(
            &u,
            &s,
            Path::new("/home/marzwi"),
            Path::new("/project/bids"),
            Path::new("/project/bids/derivatives/mriqc"),
            wd,
            18,
            "--fft-spikes-detector --no-sub",
        );
        let script = job.render(&s);
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[1], "#PBS -N mriqc_sub-01_ses-01");
        assert_eq!(lines[2], "#PBS -l walltime=24:00:00,mem=18gb");
        assert_eq!(lines[3], "module add mriqc; cd /home/marzwi");
        assert_eq!(
            lines[4],
            "unset PYTHONPATH; export PYTHONNOUSERSITE=1; singularity run \
             /opt/mriqc/0.16.1/mriqc-0.16.1.simg /project/bids /project/bids/derivatives/mriqc \
             participant -w /tmp/marzwi/work_mriqc/sub-01_ses-01_x --participant-label 01 \
             --session-id 01 --verbose-reports --mem_gb 18 --ants-nthreads 1 --nprocs 1 \
             --fft-spikes-detector --no-sub"
        );
        assert_eq!(lines[5], "rm -rf /tmp/marzwi/work_mriqc/sub-01_ses-01_x");
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn persistent_workdir_has_no_cleanup_and_flat_unit_has_no_session() {
        let s = settings();
        let job = JobDescriptor::participant(
            &unit("sub-07"),
            &s,
            Path::new("/home/marzwi"),
            Path::new("/project/bids"),
            Path::new("/project/out/mriqc"),
            WorkDir::Persistent(PathBuf::from("/project/work/sub-07_")),
            4,
            "",
        );
        let script = job.render(&s);
        assert!(!script.contains("rm -rf"));
        assert!(!script.contains("--session-id"));
        assert!(script.contains("--participant-label 07 --verbose-reports"));
        assert!(script.trim_end().ends_with("--nprocs 1"));
    }

    #[test]
    fn group_script_and_verbatim_extra_args() {
        let s = settings();
        let extra = "--modalities 'T1w bold'  --verbose $HOME";
        let job = JobDescriptor::group(
            &s,
            Path::new("/home/my dir"),
            Path::new("/project/bids"),
            Path::new("/project/bids/derivatives/mriqc"),
            1,
            extra,
        );
        let script = job.render(&s);
        assert!(script.contains("#PBS -N mriqc_group\n"));
        assert!(script.contains("#PBS -l walltime=0:10:00,mem=1gb\n"));
        assert!(script.contains("cd '/home/my dir'\n"));
        assert!(script.contains("singularity run --cleanenv /opt/mriqc/0.16.1/mriqc-0.16.1.simg"));
        assert!(script.contains(&format!("group --nprocs 1 {}\n", extra)));
        assert!(!script.contains("rm -rf"));
    }

    #[test]
    fn quoting_paths_with_spaces_and_quotes() {
        assert_eq!(shell_quote("/plain/path-1.0"), "/plain/path-1.0");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), "'it'\"'\"'s'");
        assert_eq!(shell_quote(""), "''");
    }
}
