//! Cluster Execution
//!
//! Jobs are wrapped in a jobscript and handed to a queue through a
//! user-supplied submission command, e.g. `sbatch -c {threads} --mem={resources.mem_mb}`.
//! The jobscript path is appended to the rendered command.
//!
//! The asynchronous executor reads a job handle from the last line the
//! submission command prints and polls it from a background thread, either
//! with a status command (which must print `success`, `failed` or `running`)
//! or by looking for the marker files the jobscript writes. The synchronous
//! executor expects the submission command to block until the job is done
//! and uses its exit status.
//!
//! Rules marked local always run through a [`LocalExecutor`].

use std::collections::HashMap;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tempfile::TempDir;

use super::local::LocalExecutor;
use super::{
    cleanup_outputs, job_tmp_dir, missing_outputs, prepare_outputs, report, signal_group,
    touch_outputs, wait_for_outputs, Executor, ExecutorSettings, JobEvent,
};
use crate::dag::{Job, JobId};
use crate::errors::{Result, WorkflowError};
use crate::execution::action::{script_command, shell_quote, write_script, ActionDispatcher, Placeholders};
use crate::storage::Storage;

const FINISHED_MARKER: &str = "finished";
const FAILED_MARKER: &str = "failed";

/// Granularity at which the poller notices shutdown.
const POLLER_TICK: Duration = Duration::from_millis(100);

/// Queue commands for cluster execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterCommands {
    /// Submission template; the jobscript path is appended.
    pub submit: String,
    /// Status command; the job handle is appended.
    pub status: Option<String>,
    /// Cancel command; the job handle is appended.
    pub cancel: Option<String>,
}

impl ClusterCommands {
    pub fn new(submit: impl Into<String>) -> Self {
        Self {
            submit: submit.into(),
            status: None,
            cancel: None,
        }
    }

    pub fn with_status(mut self, command: impl Into<String>) -> Self {
        self.status = Some(command.into());
        self
    }

    pub fn with_cancel(mut self, command: impl Into<String>) -> Self {
        self.cancel = Some(command.into());
        self
    }
}

/// Renders a command for inclusion in a shell script.
fn command_line(cmd: &Command) -> String {
    let mut parts: Vec<String> = cmd
        .get_envs()
        .filter_map(|(key, value)| {
            value.map(|v| {
                format!(
                    "{}={}",
                    key.to_string_lossy(),
                    shell_quote(&v.to_string_lossy())
                )
            })
        })
        .collect();
    parts.push(shell_quote(&cmd.get_program().to_string_lossy()));
    parts.extend(cmd.get_args().map(|a| shell_quote(&a.to_string_lossy())));
    parts.join(" ")
}

/// Jobscript plus the scratch directory holding it and its markers.
struct Jobscript {
    dir: TempDir,
    path: PathBuf,
}

impl Jobscript {
    /// Stages inputs, renders the action and writes the jobscript.
    fn prepare(job: &Job, actions: &ActionDispatcher) -> Result<Self> {
        let storage = actions.storage();
        storage.fetch_inputs(&job.input)?;
        prepare_outputs(job, storage)?;

        let dir = job_tmp_dir(storage, job)?;
        let runner = match actions.render(job)? {
            Some(rendered) => {
                let inner = write_script(&dir.path().join("action"), job, &rendered.body)?;
                let cmd = script_command(&inner, rendered.conda_env.as_deref(), storage.workdir())?;
                command_line(&cmd)
            }
            None => "true".to_string(),
        };

        let finished = shell_quote(&dir.path().join(FINISHED_MARKER).to_string_lossy());
        let failed = shell_quote(&dir.path().join(FAILED_MARKER).to_string_lossy());
        let body = format!(
            "# {}\ncd {}\nif {}; then touch {}; else touch {}; exit 1; fi",
            job.display_name(),
            shell_quote(&storage.workdir().to_string_lossy()),
            runner,
            finished,
            failed
        );

        let script = write_script(dir.path(), job, &body)?;
        let path = dir.path().join(format!("jobscript_{}.sh", job.id));
        fs::rename(script, &path)?;
        Ok(Self { dir, path })
    }

    fn marker(&self, name: &str) -> bool {
        self.dir.path().join(name).exists()
    }

    fn submit_command(&self, template: &str, job: &Job, storage: &Storage) -> Command {
        let rendered = Placeholders::for_job(job, storage).substitute(template);
        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(format!("{} {}", rendered, shell_quote(&self.path.to_string_lossy())))
            .current_dir(storage.workdir());
        cmd
    }
}

/// Checks outputs after the queue reports success, waiting the latency
/// window once before giving up.
fn finalize(job: &Job, storage: &Storage, settings: &ExecutorSettings) -> Result<()> {
    if !missing_outputs(job, storage).is_empty() {
        info!(
            "Outputs of {} not visible yet; waiting up to {}s",
            job,
            settings.latency_wait.as_secs()
        );
        wait_for_outputs(job, storage, settings.latency_wait)?;
    }
    touch_outputs(job, storage)?;
    storage.upload_outputs(&job.output)?;
    Ok(())
}

/// Outcome of one status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteStatus {
    Running,
    Success,
    Failed,
}

fn parse_status(output: &str) -> Option<RemoteStatus> {
    match output.trim().lines().last()?.trim() {
        "running" => Some(RemoteStatus::Running),
        "success" => Some(RemoteStatus::Success),
        "failed" => Some(RemoteStatus::Failed),
        _ => None,
    }
}

/// A submitted job the poller keeps track of.
struct ActiveJob {
    job: Job,
    handle: String,
    script: Jobscript,
    events: Sender<JobEvent>,
    retries: u32,
}

type ActiveTable = Arc<Mutex<HashMap<JobId, ActiveJob>>>;

/// Submits jobs to a queue and polls them asynchronously.
pub struct ClusterExecutor {
    commands: ClusterCommands,
    actions: Arc<ActionDispatcher>,
    settings: ExecutorSettings,
    local: LocalExecutor,
    active: ActiveTable,
    stop: Arc<AtomicBool>,
    poller: Option<thread::JoinHandle<()>>,
}

impl ClusterExecutor {
    pub fn new(
        commands: ClusterCommands,
        actions: Arc<ActionDispatcher>,
        settings: ExecutorSettings,
    ) -> Self {
        let local = LocalExecutor::new(Arc::clone(&actions), settings.clone());
        Self {
            commands,
            actions,
            settings,
            local,
            active: Arc::new(Mutex::new(HashMap::new())),
            stop: Arc::new(AtomicBool::new(false)),
            poller: None,
        }
    }

    fn submit(&self, job: &Job, script: &Jobscript) -> Result<String> {
        let storage = self.actions.storage();
        let output = script
            .submit_command(&self.commands.submit, job, storage)
            .output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkflowError::ClusterSubmission {
                job: job.display_name(),
                message: format!("{} {}", output.status, stderr.trim()),
            });
        }
        let handle = stdout.trim().lines().last().unwrap_or_default().trim().to_string();
        if handle.is_empty() {
            return Err(WorkflowError::ClusterSubmission {
                job: job.display_name(),
                message: "submission command printed no job handle".to_string(),
            });
        }
        Ok(handle)
    }

    fn ensure_poller(&mut self) -> Result<()> {
        if self.poller.as_ref().is_some_and(|p| !p.is_finished()) {
            return Ok(());
        }
        let poller = Poller {
            active: Arc::clone(&self.active),
            stop: Arc::clone(&self.stop),
            status_command: self.commands.status.clone(),
            storage: Arc::clone(self.actions.storage()),
            settings: self.settings.clone(),
        };
        self.poller = Some(
            thread::Builder::new()
                .name("cluster-poller".to_string())
                .spawn(move || poller.run())?,
        );
        Ok(())
    }

    /// Number of submitted jobs still being polled.
    pub fn in_flight(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }
}

impl Executor for ClusterExecutor {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn run(&mut self, job: &Job, events: Sender<JobEvent>) -> Result<()> {
        if job.is_local() {
            return self.local.run(job, events);
        }

        let script = Jobscript::prepare(job, &self.actions)?;
        let handle = self.submit(job, &script)?;
        info!("Submitted {} with external id '{}'", job, handle);

        if let Ok(mut active) = self.active.lock() {
            active.insert(
                job.id,
                ActiveJob {
                    job: job.clone(),
                    handle,
                    script,
                    events,
                    retries: 0,
                },
            );
        }
        self.ensure_poller()
    }

    fn terminate_all(&mut self, kill: bool) {
        self.local.terminate_all(kill);
        let Some(cancel) = &self.commands.cancel else {
            return;
        };
        let drained: Vec<ActiveJob> = match self.active.lock() {
            Ok(mut active) => active.drain().map(|(_, a)| a).collect(),
            Err(_) => return,
        };
        let storage = self.actions.storage();
        for active in drained {
            info!("Cancelling {} ({})", active.job, active.handle);
            let status = Command::new("bash")
                .arg("-c")
                .arg(format!("{} {}", cancel, shell_quote(&active.handle)))
                .current_dir(storage.workdir())
                .status();
            if !matches!(status, Ok(s) if s.success()) {
                warn!("Cancel command failed for {}", active.handle);
            }
            cleanup_outputs(&active.job, storage);
            let _ = active.events.send(JobEvent::Failed {
                id: active.job.id,
                error: "cancelled".to_string(),
            });
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(poller) = self.poller.take() {
            if poller.join().is_err() {
                warn!("Cluster poller panicked");
            }
        }
        self.local.shutdown();
    }
}

/// Background thread polling submitted jobs.
struct Poller {
    active: ActiveTable,
    stop: Arc<AtomicBool>,
    status_command: Option<String>,
    storage: Arc<Storage>,
    settings: ExecutorSettings,
}

impl Poller {
    fn run(self) {
        let mut last_poll = Instant::now();
        while !self.stop.load(Ordering::Relaxed) {
            thread::sleep(POLLER_TICK);
            if last_poll.elapsed() < self.settings.poll_interval {
                continue;
            }
            last_poll = Instant::now();
            self.poll_once();
        }
    }

    fn query(&self, handle: &str, markers: &Path) -> Option<RemoteStatus> {
        let Some(command) = &self.status_command else {
            return Some(if markers.join(FINISHED_MARKER).exists() {
                RemoteStatus::Success
            } else if markers.join(FAILED_MARKER).exists() {
                RemoteStatus::Failed
            } else {
                RemoteStatus::Running
            });
        };

        let output = Command::new("bash")
            .arg("-c")
            .arg(format!("{} {}", command, shell_quote(handle)))
            .current_dir(self.storage.workdir())
            .output();
        match output {
            Ok(out) if out.status.success() => parse_status(&String::from_utf8_lossy(&out.stdout)),
            Ok(out) => {
                debug!(
                    "Status command for {} failed: {}",
                    handle,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                None
            }
            Err(e) => {
                debug!("Status command for {} failed: {}", handle, e);
                None
            }
        }
    }

    /// Queries every submitted job. Status commands run without holding the
    /// job table, so submissions are never blocked by a slow queue.
    fn poll_once(&self) {
        let snapshot: Vec<(JobId, String, PathBuf)> = match self.active.lock() {
            Ok(active) => active
                .iter()
                .map(|(id, a)| (*id, a.handle.clone(), a.script.dir.path().to_path_buf()))
                .collect(),
            Err(_) => return,
        };

        let results: Vec<(JobId, Option<RemoteStatus>)> = snapshot
            .into_iter()
            .map(|(id, handle, markers)| (id, self.query(&handle, &markers)))
            .collect();

        let Ok(mut active) = self.active.lock() else {
            return;
        };
        let mut done = Vec::new();
        for (id, status) in results {
            // Cancelled while the query ran.
            let Some(job) = active.get_mut(&id) else {
                continue;
            };
            match status {
                Some(RemoteStatus::Running) => {}
                Some(status) => done.push((id, status)),
                None => {
                    job.retries += 1;
                    if job.retries > self.settings.status_attempts {
                        error!("Giving up on status of {} after {} attempts", job.job, job.retries);
                        done.push((id, RemoteStatus::Failed));
                    } else {
                        warn!("Status check for {} failed (attempt {})", job.job, job.retries);
                        let _ = job.events.send(JobEvent::StatusCheckRetry {
                            id,
                            attempt: job.retries,
                        });
                    }
                }
            }
        }

        for (id, status) in done {
            let Some(finished) = active.remove(&id) else {
                continue;
            };
            let storage = Arc::clone(&self.storage);
            let settings = self.settings.clone();
            // Output checks may wait for the latency window; keep polling others.
            let spawned = thread::Builder::new()
                .name(format!("finalize-{}", id))
                .spawn(move || finish(finished, status, &storage, &settings));
            if let Err(e) = spawned {
                error!("Failed to finalize job {}: {}", id, e);
            }
        }
    }
}

fn finish(active: ActiveJob, status: RemoteStatus, storage: &Storage, settings: &ExecutorSettings) {
    let result = match status {
        RemoteStatus::Success => finalize(&active.job, storage, settings),
        _ => Err(WorkflowError::JobFailed {
            job: active.job.display_name(),
            reason: format!("cluster job {} failed", active.handle),
        }),
    };
    if result.is_err() {
        cleanup_outputs(&active.job, storage);
    }
    drop(active.script);
    report(&active.events, active.job.id, result);
}

/// Runs the submission command as a blocking call per job.
pub struct SyncClusterExecutor {
    template: String,
    actions: Arc<ActionDispatcher>,
    settings: ExecutorSettings,
    local: LocalExecutor,
    processes: Arc<Mutex<HashMap<JobId, u32>>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl SyncClusterExecutor {
    pub fn new(template: impl Into<String>, actions: Arc<ActionDispatcher>, settings: ExecutorSettings) -> Self {
        let local = LocalExecutor::new(Arc::clone(&actions), settings.clone());
        Self {
            template: template.into(),
            actions,
            settings,
            local,
            processes: Arc::new(Mutex::new(HashMap::new())),
            workers: Vec::new(),
        }
    }
}

fn run_blocking(
    job: &Job,
    template: &str,
    actions: &ActionDispatcher,
    settings: &ExecutorSettings,
    processes: &Mutex<HashMap<JobId, u32>>,
) -> Result<()> {
    let storage = actions.storage();
    let script = Jobscript::prepare(job, actions)?;
    let mut cmd = script.submit_command(template, job, storage);
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).process_group(0);

    let child = cmd.spawn()?;
    if let Ok(mut table) = processes.lock() {
        table.insert(job.id, child.id());
    }
    let output = child.wait_with_output();
    if let Ok(mut table) = processes.lock() {
        table.remove(&job.id);
    }
    let output = output?;

    if !output.status.success() || script.marker(FAILED_MARKER) {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(WorkflowError::JobFailed {
            job: job.display_name(),
            reason: format!("cluster job failed ({}): {}", output.status, stderr.trim()),
        });
    }
    finalize(job, storage, settings)
}

impl Executor for SyncClusterExecutor {
    fn name(&self) -> &'static str {
        "cluster-sync"
    }

    fn run(&mut self, job: &Job, events: Sender<JobEvent>) -> Result<()> {
        if job.is_local() {
            return self.local.run(job, events);
        }

        let job = job.clone();
        let template = self.template.clone();
        let actions = Arc::clone(&self.actions);
        let settings = self.settings.clone();
        let processes = Arc::clone(&self.processes);

        let handle = thread::Builder::new()
            .name(format!("sync-job-{}", job.id))
            .spawn(move || {
                let result = run_blocking(&job, &template, &actions, &settings, &processes);
                if let Err(e) = &result {
                    error!("Error in {}: {}", job, e);
                    cleanup_outputs(&job, actions.storage());
                }
                report(&events, job.id, result);
            })?;
        self.workers.retain(|w| !w.is_finished());
        self.workers.push(handle);
        Ok(())
    }

    fn terminate_all(&mut self, kill: bool) {
        self.local.terminate_all(kill);
        if let Ok(processes) = self.processes.lock() {
            for pgid in processes.values() {
                signal_group(*pgid, kill);
            }
        }
    }

    fn shutdown(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("A submission thread panicked");
            }
        }
        self.local.shutdown();
    }
}
