use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use qc_runner::scheduler::split_submit_args;
use qc_runner::{
    BatchReport, GroupOptions, Outcome, ParticipantOptions, PbsScheduler, Settings, UnitReport,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "qcsub",
    version = "0.3.0",
    about = "Submit MRIQC quality-control jobs for a BIDS dataset to a PBS cluster"
)]
struct Cli {
    /// YAML file with tool, scratch and scheduler settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log scheduler calls and per-unit decisions to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SubmitArgs {
    /// Maximum required amount of memory in GB
    #[arg(short = 'm', long = "mem_gb")]
    mem_gb: Option<u32>,
    /// Additional arguments appended verbatim to the mriqc command line
    #[arg(short = 'a', long = "args", default_value = "", allow_hyphen_values = true)]
    tool_args: String,
    /// Additional arguments passed to qsub
    #[arg(short = 'q', long = "qargs", default_value = "", allow_hyphen_values = true)]
    qargs: String,
    /// Print the job scripts without submitting them
    #[arg(short = 'd', long)]
    dryrun: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit participant-level jobs for new or incomplete sessions
    Participant {
        /// BIDS directory with the (new) subject data
        bidsdir: PathBuf,
        /// Derivatives directory; reports are stored in its mriqc subfolder (default: bidsdir/derivatives)
        #[arg(short, long)]
        outputdir: Option<PathBuf>,
        /// Working directory for intermediate files (default: a temporary directory per job)
        #[arg(short, long)]
        workdir: Option<PathBuf>,
        /// Selected sub-#/ses-# folders to process instead of all sessions
        #[arg(short, long, num_args = 1..)]
        sessions: Vec<String>,
        /// Reprocess sessions regardless of existing reports (removes them first)
        #[arg(short, long)]
        force: bool,
        /// Submit even if a job with the same name is already running or scheduled
        #[arg(short, long)]
        ignore: bool,
        #[command(flatten)]
        submit: SubmitArgs,
    },
    /// Submit the group-level job once participant reports exist
    Group {
        /// BIDS directory with the subject data
        bidsdir: PathBuf,
        /// Directory with the participant html reports (default: bidsdir/derivatives/mriqc)
        #[arg(short, long)]
        outputdir: Option<PathBuf>,
        /// Submit even while mriqc participant or group jobs are still running or scheduled
        #[arg(short, long)]
        force: bool,
        #[command(flatten)]
        submit: SubmitArgs,
    },
}

impl Commands {
    fn json_mode(&self) -> bool {
        match self {
            Commands::Participant { submit, .. } | Commands::Group { submit, .. } => submit.json,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let json_mode = cli.command.json_mode();
    let result = run_command(cli.config, cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(config: Option<PathBuf>, command: Commands) -> Result<Option<Value>> {
    let settings = Settings::load(config.as_deref())?;
    let launch_dir = std::env::current_dir()?;
    match command {
        Commands::Participant {
            bidsdir,
            outputdir,
            workdir,
            sessions,
            force,
            ignore,
            submit,
        } => {
            let mut opts = ParticipantOptions::new(bidsdir, launch_dir);
            opts.output_dir = outputdir;
            opts.workdir = workdir;
            opts.selected = sessions;
            opts.force = force;
            opts.skip_active = !ignore;
            opts.dry_run = submit.dryrun;
            if let Some(mem) = submit.mem_gb {
                opts.mem_gb = mem;
            }
            opts.tool_args = submit.tool_args;
            let scheduler =
                PbsScheduler::new(settings.scheduler.clone(), split_submit_args(&submit.qargs));
            let report = qc_runner::submit_participants(&opts, &settings, &scheduler)?;
            if submit.json {
                return Ok(Some(batch_to_json("participant", &report)));
            }
            print_participant_report(&report);
        }
        Commands::Group {
            bidsdir,
            outputdir,
            force,
            submit,
        } => {
            let mut opts = GroupOptions::new(bidsdir, launch_dir);
            opts.output_dir = outputdir;
            opts.force = force;
            opts.dry_run = submit.dryrun;
            if let Some(mem) = submit.mem_gb {
                opts.mem_gb = mem;
            }
            opts.tool_args = submit.tool_args;
            let scheduler =
                PbsScheduler::new(settings.scheduler.clone(), split_submit_args(&submit.qargs));
            let report = qc_runner::submit_group(&opts, &settings, &scheduler)?;
            if submit.json {
                return Ok(Some(batch_to_json("group", &report)));
            }
            print_group_report(&report);
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn batch_to_json(command: &str, report: &BatchReport) -> Value {
    json!({
        "ok": true,
        "command": command,
        "attempted": report.attempted(),
        "submitted": report.submitted(),
        "failed": report.failed(),
        "batch": serde_json::to_value(report).unwrap_or(Value::Null),
    })
}

fn print_participant_report(report: &BatchReport) {
    let total = report.attempted();
    for (n, unit) in report.units.iter().enumerate() {
        let pos = format!("({}/{})", n + 1, total);
        if let (Some(inputs), Some(outputs)) = (unit.inputs, unit.outputs) {
            println!(
                "\n>>> Found {}/{} existing MRIQC-reports for: {}",
                outputs, inputs, unit.target
            );
        }
        print_outcome(unit, &pos);
    }
    println!(
        "\n----------------\n\
         Done! Submitted {} of {} job(s), {} failed. Now wait for the jobs to finish... \
         Check that e.g. with this command:\n\n  qstat -a $(qselect -s RQ) | grep mriqc_sub\n\n\
         When finished you can run e.g. a group-level QC analysis like this:\n\n  qcsub group {}\n",
        report.submitted(),
        total,
        report.failed(),
        report.bids_dir.display()
    );
}

fn print_group_report(report: &BatchReport) {
    for unit in &report.units {
        println!(
            "\n>>> Found {} existing MRIQC-reports in {}",
            unit.outputs.unwrap_or(0),
            report.output_dir.display()
        );
        print_outcome(unit, "(1/1)");
    }
    if report.submitted() > 0 {
        println!(
            "\n----------------\n\
             Done! Now wait for the job to finish... Check that e.g. with this command:\n\n  \
             qstat $(qselect -N mriqc_group)\n"
        );
    }
}

fn print_outcome(unit: &UnitReport, pos: &str) {
    let name = unit.job_name.as_deref().unwrap_or(&unit.target);
    match &unit.outcome {
        Outcome::Missing { reason } => {
            println!(">>> Skipping {} {}: {}", pos, unit.target, reason)
        }
        Outcome::Complete => println!("--> Nothing to do for job {}: {}", pos, unit.target),
        Outcome::NothingToDo => println!("--> Nothing to do for {}", name),
        Outcome::AlreadyActive { jobs } => println!(
            "--> Skipping already running / scheduled job {}: {} (active: {})",
            pos,
            name,
            jobs.join(", ")
        ),
        Outcome::DryRun { script } => {
            println!("--> Dry run, not submitting job {}:\n{}", pos, script)
        }
        Outcome::Submitted { job_id, script } => println!(
            "--> Submitted job {} as {}:\n{}",
            pos, job_id, script
        ),
        Outcome::Failed { error } => {
            println!("WARNING: Job submission failed {} for {}: {}", pos, name, error)
        }
    }
}
