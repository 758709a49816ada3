//! The batch-scheduler seam.
//!
//! Orchestration talks to a [`Scheduler`]; [`PbsScheduler`] drives the
//! Torque/PBS command-line tools. Every external call is bounded by a timeout
//! and spawned with an argument vector, never through a shell.

use crate::config::SchedulerSettings;
use crate::job::JobDescriptor;
use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::process::{ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("{program} failed with exit code {}: {}", display_code(.code), trimmed(.stderr))]
    Rejected {
        program: String,
        code: Option<i32>,
        stderr: String,
        stdout: String,
    },
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn trimmed(text: &str) -> &str {
    text.trim()
}

/// What the scheduler answered when a job was accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub job_id: String,
}

pub trait Scheduler {
    /// Names of held, queued and running jobs that contain `pattern`.
    ///
    /// Query failures are reported as an empty set: a broken scheduler query
    /// leads to (possibly duplicate) submission rather than a stalled batch.
    fn list_active(&self, pattern: &str) -> BTreeSet<String>;

    fn submit(&self, job: &JobDescriptor, script: &str) -> Result<SubmitReceipt, SchedulerError>;
}

pub struct PbsScheduler {
    settings: SchedulerSettings,
    submit_args: Vec<String>,
}

impl PbsScheduler {
    /// `submit_args` are passed to `qsub` ahead of the script on stdin.
    pub fn new(settings: SchedulerSettings, submit_args: Vec<String>) -> Self {
        Self {
            settings,
            submit_args,
        }
    }

    /// Job names in state R, Q or H, unfiltered.
    pub fn query_active(&self) -> Result<Vec<String>, SchedulerError> {
        let timeout = self.settings.timeout();
        let selected = run_with_timeout(
            &self.settings.qselect,
            &["-s".to_string(), "RQH".to_string()],
            None,
            timeout,
        )?
        .into_success(&self.settings.qselect)?;
        let ids: Vec<String> = selected
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["-f".to_string()];
        args.extend(ids);
        let full = run_with_timeout(&self.settings.qstat, &args, None, timeout)?
            .into_success(&self.settings.qstat)?;
        Ok(parse_job_names(&full))
    }
}

impl Scheduler for PbsScheduler {
    fn list_active(&self, pattern: &str) -> BTreeSet<String> {
        match self.query_active() {
            Ok(names) => {
                let active: BTreeSet<String> = names
                    .into_iter()
                    .filter(|name| name.contains(pattern))
                    .collect();
                debug!(pattern, count = active.len(), "active scheduler jobs");
                active
            }
            Err(err) => {
                warn!(error = %err, "active job query failed; assuming no jobs are active");
                BTreeSet::new()
            }
        }
    }

    fn submit(&self, job: &JobDescriptor, script: &str) -> Result<SubmitReceipt, SchedulerError> {
        debug!(job = %job.name, args = ?self.submit_args, "submitting job script");
        let output = run_with_timeout(
            &self.settings.qsub,
            &self.submit_args,
            Some(script),
            self.settings.timeout(),
        )?;
        if output.code != Some(0) || !output.stderr.trim().is_empty() {
            return Err(SchedulerError::Rejected {
                program: self.settings.qsub.clone(),
                code: output.code,
                stderr: output.stderr,
                stdout: output.stdout,
            });
        }
        Ok(SubmitReceipt {
            job_id: output.stdout.trim().to_string(),
        })
    }
}

/// Extract `Job_Name` values from `qstat -f` output.
pub fn parse_job_names(qstat_full: &str) -> Vec<String> {
    qstat_full
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| key.trim() == "Job_Name")
        .map(|(_, value)| value.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Split the caller's opaque scheduler options on whitespace.
pub fn split_submit_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[derive(Debug)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    fn into_success(self, program: &str) -> Result<String, SchedulerError> {
        if self.code == Some(0) {
            Ok(self.stdout)
        } else {
            Err(SchedulerError::Rejected {
                program: program.to_string(),
                code: self.code,
                stderr: self.stderr,
                stdout: self.stdout,
            })
        }
    }
}

/// Extra time granted to the output readers when the deadline has already
/// passed by the time the process exits.
const OUTPUT_GRACE: Duration = Duration::from_millis(100);

/// Run `program` to completion, killing it once `timeout` has passed.
///
/// Feeding stdin and draining stdout/stderr happen on helper threads, so
/// neither a child that never reads its input nor a background process that
/// keeps the output pipes open can hold the caller past the deadline.
pub fn run_with_timeout(
    program: &str,
    args: &[String],
    input: Option<&str>,
    timeout: Duration,
) -> Result<CommandOutput, SchedulerError> {
    let io_err = |source: std::io::Error| SchedulerError::Io {
        program: program.to_string(),
        source,
    };

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let deadline = Instant::now() + timeout;
    let mut child = cmd.spawn().map_err(io_err)?;
    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);
    let writer = match (input, child.stdin.take()) {
        (Some(text), Some(stdin)) => Some(spawn_writer(stdin, text.to_string())),
        _ => None,
    };

    let status = loop {
        if let Some(e) = writer.as_ref().and_then(write_failure) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io_err(e));
        }
        match child.try_wait().map_err(io_err)? {
            Some(status) => break status,
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SchedulerError::Timeout {
                    program: program.to_string(),
                    timeout,
                });
            }
            None => thread::sleep(Duration::from_millis(20)),
        }
    };

    let drain_until = deadline.max(Instant::now() + OUTPUT_GRACE);
    Ok(CommandOutput {
        code: status.code(),
        stdout: collect_output(program, stdout, drain_until),
        stderr: collect_output(program, stderr, drain_until),
    })
}

fn spawn_writer(mut stdin: ChildStdin, text: String) -> Receiver<std::io::Result<()>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(stdin.write_all(text.as_bytes()));
    });
    rx
}

/// A child that exits without reading its stdin is judged by its exit
/// status, so a broken pipe is not a failure.
fn write_failure(rx: &Receiver<std::io::Result<()>>) -> Option<std::io::Error> {
    match rx.try_recv() {
        Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => Some(e),
        _ => None,
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Gather what a reader thread produced until its pipe closes or `until`
/// passes, whichever comes first.
fn collect_output(program: &str, rx: Option<Receiver<Vec<u8>>>, until: Instant) -> String {
    let Some(rx) = rx else {
        return String::new();
    };
    let mut buf = Vec::new();
    loop {
        let wait = until.saturating_duration_since(Instant::now());
        match rx.recv_timeout(wait) {
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                warn!(program, "output pipe still open after exit; keeping what was read");
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
