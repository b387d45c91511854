//! Workflow Execution Engine
//!
//! Ties one run together:
//! - Loads the rule file and the metadata of the working directory
//! - Prepares conda environments (skipped for dry runs and `--touch`)
//! - Builds the job graph for the requested targets
//! - Picks the executor and drives the graph through the [`Scheduler`]
//! - Forwards SIGINT/SIGTERM to the scheduler and reports the outcome

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;

use colored::Colorize;
use log::{debug, error, info, warn};

use super::action::ActionDispatcher;
use super::executor::cluster::ClusterCommands;
use super::executor::{
    ClusterExecutor, DryRunExecutor, Executor, ExecutorSettings, JobEvent, LocalExecutor,
    SyncClusterExecutor, TouchExecutor,
};
use super::resources::{ResourcePool, JOBS};
use super::scheduler::{RunSummary, Scheduler};
use crate::dag::{BuildSettings, DagBuilder};
use crate::environment::conda::ensure_env;
use crate::environment::LocalWrapperRepository;
use crate::errors::{Result, WorkflowError};
use crate::storage::{FileProvider, Storage};
use crate::workflow::model::CORES;
use crate::workflow::{load_workflow, MetadataStore, RuleRegistry};

/// Default rule file, relative to the working directory.
pub const DEFAULT_RULES_FILE: &str = "rules.yaml";

/// Default wrapper repository, relative to the working directory.
pub const DEFAULT_WRAPPER_PREFIX: &str = "wrappers";

/// Where jobs run.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionMode {
    Local,
    Cluster(ClusterCommands),
    /// Submission template whose command blocks until the job ends.
    ClusterSync(String),
    DryRun,
    Touch,
}

impl ExecutionMode {
    pub fn is_cluster(&self) -> bool {
        matches!(self, ExecutionMode::Cluster(_) | ExecutionMode::ClusterSync(_))
    }

    /// Whether actions actually run.
    fn runs_actions(&self) -> bool {
        !matches!(self, ExecutionMode::DryRun | ExecutionMode::Touch)
    }
}

/// Settings for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub workdir: PathBuf,
    /// Rule file; relative paths are taken from `workdir`.
    pub rules_file: PathBuf,
    pub targets: Vec<String>,
    pub build: BuildSettings,
    /// Local cores; detected when unset.
    pub cores: Option<u64>,
    /// Concurrent cluster jobs.
    pub jobs: Option<u64>,
    /// Extra pool resources (`--resources NAME=N`).
    pub resources: BTreeMap<String, u64>,
    pub mode: ExecutionMode,
    pub executor: ExecutorSettings,
    pub keep_going: bool,
    /// Wrapper repository; relative paths are taken from `workdir`.
    pub wrapper_prefix: PathBuf,
    pub stats: Option<PathBuf>,
}

impl RunConfig {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            rules_file: PathBuf::from(DEFAULT_RULES_FILE),
            targets: Vec::new(),
            build: BuildSettings::default(),
            cores: None,
            jobs: None,
            resources: BTreeMap::new(),
            mode: ExecutionMode::Local,
            executor: ExecutorSettings::default(),
            keep_going: false,
            wrapper_prefix: PathBuf::from(DEFAULT_WRAPPER_PREFIX),
            stats: None,
        }
    }

    /// Checks settings that depend on each other.
    pub fn validate(&self) -> Result<()> {
        if self.mode.is_cluster() && self.jobs.is_none() {
            return Err(WorkflowError::Config(
                "cluster execution requires --jobs to bound the number of submitted jobs".to_string(),
            ));
        }
        if self.cores == Some(0) || self.jobs == Some(0) {
            return Err(WorkflowError::Config(
                "--cores and --jobs must be at least 1".to_string(),
            ));
        }
        if self.resources.contains_key(CORES) || self.resources.contains_key(JOBS) {
            return Err(WorkflowError::Config(
                "use --cores or --jobs instead of --resources cores=N".to_string(),
            ));
        }
        Ok(())
    }

    /// The resource pool for this run. Cluster runs add one job slot per
    /// `--jobs`; `cores` then only bounds local rules.
    pub fn resource_pool(&self) -> ResourcePool {
        let cluster = self.mode.is_cluster();
        let mut pool = match self.cores {
            Some(cores) => ResourcePool::new(cores),
            None if cluster => ResourcePool::new(num_cpus::get() as u64),
            None => ResourcePool::from_system(),
        };
        if let Some(jobs) = self.jobs.filter(|_| cluster) {
            pool = pool.with_resource(JOBS, jobs);
        }
        for (name, amount) in &self.resources {
            pool = pool.with_resource(name.clone(), *amount);
        }
        pool
    }
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use ruleforge::execution::{Engine, RunConfig};
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut config = RunConfig::new("/data/analysis");
///     config.targets = vec!["results/summary.txt".to_string()];
///     config.cores = Some(4);
///
///     let summary = Engine::new(config).run()?;
///     println!("{} jobs finished", summary.finished);
///     Ok(())
/// }
/// ```
pub struct Engine {
    config: RunConfig,
    handle_signals: bool,
}

impl Engine {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            handle_signals: true,
        }
    }

    /// Whether SIGINT/SIGTERM are forwarded to the scheduler.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Executes the run. Job failures are reported in the returned summary;
    /// an `Err` means no job was dispatched or the run could not be set up.
    pub fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;

        let workdir = self.config.workdir.canonicalize().map_err(|e| {
            WorkflowError::Config(format!(
                "Working directory '{}' is not accessible: {}",
                self.config.workdir.display(),
                e
            ))
        })?;
        info!("Working directory: {}", workdir.display());

        let registry = load_workflow(workdir.join(&self.config.rules_file))?;
        let store = MetadataStore::load(&workdir)?;

        if self.config.mode.runs_actions() {
            setup_environments(&registry, &workdir)?;
        }

        let pool = self.config.resource_pool();
        let storage = Arc::new(Storage::new(&workdir).with_provider(Arc::new(FileProvider)));

        let mut builder = DagBuilder::new(registry, Arc::clone(&storage))
            .with_settings(self.config.build.clone())
            .with_metadata(store.data().clone())
            .with_limits(pool.capacity().clone())
            .with_job_slots(self.config.mode.is_cluster());
        let dag = builder.build(&self.config.targets)?;

        if dag.is_empty() {
            info!("Nothing to be done.");
        } else {
            info!("Job graph has {} jobs", dag.len());
        }

        let metadata = if self.config.mode == ExecutionMode::DryRun {
            MetadataStore::in_memory()
        } else {
            store
        };

        let executor = self.executor(&storage, &workdir);
        let scheduler = Scheduler::new(dag, builder, executor, pool, metadata)
            .with_keep_going(self.config.keep_going);

        if self.handle_signals {
            spawn_signal_listener(scheduler.sender());
        }

        let summary = scheduler.run()?;
        self.report(&summary);
        Ok(summary)
    }

    fn executor(&self, storage: &Arc<Storage>, workdir: &std::path::Path) -> Box<dyn Executor> {
        let wrappers = Arc::new(LocalWrapperRepository::new(
            workdir.join(&self.config.wrapper_prefix),
        ));
        let actions = Arc::new(ActionDispatcher::new(Arc::clone(storage), wrappers));
        let settings = self.config.executor.clone();

        match &self.config.mode {
            ExecutionMode::Local => Box::new(LocalExecutor::new(actions, settings)),
            ExecutionMode::Cluster(commands) => {
                Box::new(ClusterExecutor::new(commands.clone(), actions, settings))
            }
            ExecutionMode::ClusterSync(template) => {
                Box::new(SyncClusterExecutor::new(template.clone(), actions, settings))
            }
            ExecutionMode::DryRun => Box::new(DryRunExecutor::new(actions)),
            ExecutionMode::Touch => Box::new(TouchExecutor::new(Arc::clone(storage))),
        }
    }

    fn report(&self, summary: &RunSummary) {
        debug!("{}", summary.timeline.gantt_chart());

        if let Some(path) = &self.config.stats {
            let path = self.config.workdir.join(path);
            match summary.timeline.write_stats(&path) {
                Ok(()) => info!("Wrote run statistics to {}", path.display()),
                Err(e) => warn!("Failed to write statistics to {}: {}", path.display(), e),
            }
        }

        let elapsed = summary.timeline.elapsed().num_milliseconds() as f64 / 1000.0;
        println!();
        if summary.success() {
            println!(
                "{} {} of {} jobs in {:.2}s",
                "Finished".green().bold(),
                summary.finished,
                summary.total,
                elapsed
            );
            return;
        }

        if summary.interrupted {
            println!("{}", "Run interrupted".yellow().bold());
        }
        for (job, reason) in &summary.failed {
            error!("Job {} failed: {}", job, reason);
        }
        for message in &summary.errors {
            error!("{}", message);
        }
        println!(
            "{} {} finished, {} failed, {} skipped of {} jobs in {:.2}s",
            "Incomplete:".red().bold(),
            summary.finished,
            summary.failed.len(),
            summary.skipped,
            summary.total,
            elapsed
        );
    }
}

/// Creates or verifies the conda environment of every rule that names one.
fn setup_environments(registry: &RuleRegistry, workdir: &std::path::Path) -> Result<()> {
    let specs: BTreeSet<&str> = registry
        .rules()
        .filter_map(|rule| rule.conda.as_deref())
        .collect();

    if specs.is_empty() {
        debug!("No conda environments required");
        return Ok(());
    }

    info!("Setting up {} conda environments", specs.len());
    for spec in specs {
        let name = ensure_env(spec, workdir)?;
        info!("Environment '{}' ready", name);
    }
    Ok(())
}

/// Forwards SIGINT and SIGTERM to the scheduler until it stops listening.
fn spawn_signal_listener(events: Sender<JobEvent>) {
    let spawned = thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!("Failed to start signal listener: {}", e);
                    return;
                }
            };

            runtime.block_on(async move {
                use tokio::signal::unix::{signal, SignalKind};

                let mut terminate = match signal(SignalKind::terminate()) {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!("Failed to listen for SIGTERM: {}", e);
                        return;
                    }
                };

                loop {
                    tokio::select! {
                        received = tokio::signal::ctrl_c() => {
                            if let Err(e) = received {
                                error!("Failed to listen for SIGINT: {}", e);
                                return;
                            }
                        }
                        _ = terminate.recv() => {}
                    }
                    warn!("Received interrupt");
                    if events.send(JobEvent::Interrupt).is_err() {
                        return;
                    }
                }
            });
        });

    if let Err(e) = spawned {
        error!("Failed to spawn signal listener: {}", e);
    }
}
