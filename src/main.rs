//! RuleForge CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Build the first rule of rules.yaml in the current directory
//! ruleforge --cores 4
//!
//! # Build specific files, preview only
//! ruleforge results/a.txt results/b.txt --dry-run
//!
//! # Submit jobs to a queue, at most 50 at a time
//! ruleforge --jobs 50 --cluster "sbatch -c {threads} --parsable" --cluster-status ./status.sh
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use ruleforge::dag::BuildSettings;
use ruleforge::execution::engine::{DEFAULT_RULES_FILE, DEFAULT_WRAPPER_PREFIX};
use ruleforge::execution::executor::cluster::ClusterCommands;
use ruleforge::execution::{Engine, ExecutionMode, ExecutorSettings, RunConfig};
use ruleforge::{WorkflowError, APP_NAME, VERSION};

/// Rule-based workflow engine
#[derive(Parser, Debug)]
#[command(name = "ruleforge")]
#[command(about = "Build target files from wildcard rules, locally or on a cluster", long_about = None)]
#[command(version)]
struct Cli {
    /// Files or rule names to build; defaults to the first rule
    targets: Vec<String>,

    /// Rule file, relative to the working directory
    #[arg(short = 's', long, default_value = DEFAULT_RULES_FILE)]
    rules: PathBuf,

    /// Working directory
    #[arg(short = 'd', long, default_value = ".")]
    directory: PathBuf,

    /// Local cores to use; all detected cores when omitted
    #[arg(short, long)]
    cores: Option<u64>,

    /// Cluster jobs submitted at once
    #[arg(short, long)]
    jobs: Option<u64>,

    /// Additional pool resources, e.g. --resources gpu=2 mem_mb=16000
    #[arg(long, num_args = 1.., value_parser = parse_resource)]
    resources: Vec<(String, u64)>,

    /// Submission template; the jobscript path is appended
    #[arg(long, conflicts_with = "cluster_sync")]
    cluster: Option<String>,

    /// Blocking submission template; the jobscript path is appended
    #[arg(long)]
    cluster_sync: Option<String>,

    /// Status command for --cluster; the job handle is appended
    #[arg(long, requires = "cluster")]
    cluster_status: Option<String>,

    /// Cancel command for --cluster; the job handle is appended
    #[arg(long, requires = "cluster")]
    cluster_cancel: Option<String>,

    /// Seconds to wait for outputs to appear after a job ends
    #[arg(short = 'w', long, default_value_t = 5)]
    latency_wait: u64,

    /// Only run jobs of these rules and their upstream jobs
    #[arg(long, num_args = 1..)]
    until: Vec<String>,

    /// Never run these rules; their outputs must already exist
    #[arg(long, num_args = 1..)]
    treat_as_source: Vec<String>,

    /// Drop jobs of these rules and everything downstream
    #[arg(long, num_args = 1..)]
    omit_from: Vec<String>,

    /// Print the jobs that would run
    #[arg(short = 'n', long, conflicts_with = "touch")]
    dry_run: bool,

    /// Mark outputs as up to date instead of running jobs
    #[arg(short, long)]
    touch: bool,

    /// Rerun the jobs of the requested targets
    #[arg(short = 'f', long)]
    force: bool,

    /// Rerun every job the targets depend on
    #[arg(short = 'F', long)]
    forceall: bool,

    /// Rerun every job of these rules
    #[arg(short = 'R', long, num_args = 1..)]
    forcerun: Vec<String>,

    /// Keep running independent jobs after a failure
    #[arg(short = 'k', long)]
    keep_going: bool,

    /// Directory holding wrappers, relative to the working directory
    #[arg(long, default_value = DEFAULT_WRAPPER_PREFIX)]
    wrapper_prefix: PathBuf,

    /// Write run statistics as JSON
    #[arg(long)]
    stats: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_resource(arg: &str) -> Result<(String, u64), String> {
    let (name, amount) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=N, got '{}'", arg))?;
    let amount = amount
        .parse()
        .map_err(|_| format!("invalid amount for resource '{}': {}", name, amount))?;
    Ok((name.to_string(), amount))
}

impl Cli {
    fn mode(&self) -> ExecutionMode {
        if self.dry_run {
            return ExecutionMode::DryRun;
        }
        if self.touch {
            return ExecutionMode::Touch;
        }
        if let Some(submit) = &self.cluster {
            let mut commands = ClusterCommands::new(submit.clone());
            if let Some(status) = &self.cluster_status {
                commands = commands.with_status(status.clone());
            }
            if let Some(cancel) = &self.cluster_cancel {
                commands = commands.with_cancel(cancel.clone());
            }
            return ExecutionMode::Cluster(commands);
        }
        if let Some(template) = &self.cluster_sync {
            return ExecutionMode::ClusterSync(template.clone());
        }
        ExecutionMode::Local
    }

    fn into_config(self) -> RunConfig {
        let names = |list: Vec<String>| list.into_iter().collect::<BTreeSet<_>>();

        RunConfig {
            mode: self.mode(),
            workdir: self.directory,
            rules_file: self.rules,
            targets: self.targets,
            build: BuildSettings {
                force: self.force,
                forceall: self.forceall,
                forcerun: names(self.forcerun),
                until: names(self.until),
                treat_as_source: names(self.treat_as_source),
                omit_from: names(self.omit_from),
            },
            cores: self.cores,
            jobs: self.jobs,
            resources: self.resources.into_iter().collect::<BTreeMap<_, _>>(),
            executor: ExecutorSettings {
                latency_wait: Duration::from_secs(self.latency_wait),
                ..ExecutorSettings::default()
            },
            keep_going: self.keep_going,
            wrapper_prefix: self.wrapper_prefix,
            stats: self.stats,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Rule-Based Workflow Engine");
    println!();
}

fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let config = cli.into_config();
    config.validate()?;

    match &config.mode {
        ExecutionMode::DryRun => info!("Mode: DRY RUN (commands will not execute)"),
        ExecutionMode::Touch => info!("Mode: TOUCH (outputs will be marked up to date)"),
        ExecutionMode::Cluster(_) | ExecutionMode::ClusterSync(_) => {
            info!("Mode: CLUSTER (up to {} jobs)", config.jobs.unwrap_or_default())
        }
        ExecutionMode::Local => {}
    }

    let summary = Engine::new(config).run()?;
    Ok(summary.outcome()?)
}

/// Shell convention for a run stopped by SIGINT.
const INTERRUPTED_EXIT: u8 = 130;

fn failure_code(error: &(dyn std::error::Error + 'static)) -> u8 {
    match error.downcast_ref::<WorkflowError>() {
        Some(WorkflowError::Interrupted) => INTERRUPTED_EXIT,
        _ => 1,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    print_banner();

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{}", e);
            ExitCode::from(failure_code(e.as_ref()))
        }
    }
}
