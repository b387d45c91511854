//! Job Executors
//!
//! An executor turns a dispatched job into a terminal [`JobEvent`] sent back
//! to the scheduler. `run` returns as soon as the job has been started; the
//! outcome arrives later on the event channel.
//!
//! # Variants
//!
//! - [`LocalExecutor`]: one thread and one process group per job
//! - [`ClusterExecutor`]: submits jobscripts to a queue and polls them
//! - [`SyncClusterExecutor`]: the submission command blocks until the job ends
//! - [`DryRunExecutor`]: prints what would run
//! - [`TouchExecutor`]: marks outputs up to date without running anything

pub mod cluster;
pub mod dryrun;
pub mod local;

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, warn};
use tempfile::TempDir;

use crate::dag::{Job, JobId};
use crate::errors::{Result, WorkflowError};
use crate::storage::Storage;
use crate::workflow::metadata::METADATA_DIR;

pub use cluster::{ClusterExecutor, SyncClusterExecutor};
pub use dryrun::{DryRunExecutor, TouchExecutor};
pub use local::LocalExecutor;

/// Interval between output checks while waiting for the filesystem.
const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Messages delivered to the scheduler loop.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Finished(JobId),
    Failed { id: JobId, error: String },
    /// A cluster status query failed transiently; the job is still running.
    StatusCheckRetry { id: JobId, attempt: u32 },
    /// SIGINT or SIGTERM received.
    Interrupt,
}

/// Backend running dispatched jobs.
pub trait Executor: Send {
    fn name(&self) -> &'static str;

    /// Starts the job. An error means the job never started.
    fn run(&mut self, job: &Job, events: Sender<JobEvent>) -> Result<()>;

    /// Stops every running job; `kill` forces termination.
    fn terminate_all(&mut self, kill: bool);

    /// Removes the outputs of a job that did not finish.
    fn cleanup(&self, job: &Job, storage: &Storage) {
        cleanup_outputs(job, storage);
    }

    /// Whether finished jobs update the metadata store.
    fn records_metadata(&self) -> bool {
        true
    }

    /// Called once after the last job has ended.
    fn shutdown(&mut self) {}
}

/// Settings shared by the executors.
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// How long outputs may take to appear after a job ends.
    pub latency_wait: Duration,
    pub poll_interval: Duration,
    /// Transient status-check failures tolerated per job.
    pub status_attempts: u32,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            latency_wait: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            status_attempts: 10,
        }
    }
}

/// Per-job scratch directory under `.ruleforge/tmp`, removed on drop.
pub(crate) fn job_tmp_dir(storage: &Storage, job: &Job) -> Result<TempDir> {
    let root = storage.workdir().join(METADATA_DIR).join("tmp");
    fs::create_dir_all(&root)?;
    Ok(tempfile::Builder::new()
        .prefix(&format!("job_{}_", job.id))
        .tempdir_in(root)?)
}

/// Creates output directories and removes stale outputs before a run.
pub(crate) fn prepare_outputs(job: &Job, storage: &Storage) -> Result<()> {
    for file in job.expected_files() {
        let path = storage.local_path(file);
        remove_path(&path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

pub(crate) fn missing_outputs(job: &Job, storage: &Storage) -> Vec<PathBuf> {
    job.output
        .iter()
        .filter(|f| !storage.local_path(f).exists())
        .cloned()
        .collect()
}

/// Waits up to `latency` for every output to become visible.
pub(crate) fn wait_for_outputs(job: &Job, storage: &Storage, latency: Duration) -> Result<()> {
    let deadline = Instant::now() + latency;
    loop {
        let missing = missing_outputs(job, storage);
        if missing.is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(WorkflowError::LatencyTimeout {
                job: job.display_name(),
                files: missing,
                waited_secs: latency.as_secs(),
            });
        }
        debug!("Waiting for outputs of {}: {:?}", job, missing);
        thread::sleep(OUTPUT_POLL_INTERVAL.min(latency));
    }
}

/// Sets output timestamps to now, or past the newest input if that is later.
pub(crate) fn touch_outputs(job: &Job, storage: &Storage) -> Result<()> {
    let newest_input = job
        .input
        .iter()
        .filter_map(|f| fs::metadata(storage.local_path(f)).and_then(|m| m.modified()).ok())
        .max();
    let now = SystemTime::now();
    let stamp = match newest_input {
        Some(t) if t >= now => t + Duration::from_millis(1),
        _ => now,
    };

    for file in &job.output {
        let path = storage.local_path(file);
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            File::create(&path)?;
        }
        File::open(&path)?.set_modified(stamp)?;
    }
    Ok(())
}

/// Removes whatever outputs a failed or interrupted job left behind.
pub(crate) fn cleanup_outputs(job: &Job, storage: &Storage) {
    for file in &job.output {
        let path = storage.local_path(file);
        if let Err(e) = remove_path(&path) {
            warn!("Failed to remove output {} of {}: {}", path.display(), job, e);
        } else {
            debug!("Removed output {} of {}", path.display(), job);
        }
    }
}

/// Sends the terminal event for a job.
pub(crate) fn report(events: &Sender<JobEvent>, id: JobId, result: Result<()>) {
    let event = match result {
        Ok(()) => JobEvent::Finished(id),
        Err(e) => JobEvent::Failed {
            id,
            error: e.to_string(),
        },
    };
    if let Err(e) = events.send(event) {
        warn!("Failed to report status of job {}: {}", id, e);
    }
}

/// Signals a whole process group through `kill`.
pub(crate) fn signal_group(pgid: u32, kill: bool) {
    let signal = if kill { "-KILL" } else { "-TERM" };
    match std::process::Command::new("kill")
        .arg(signal)
        .arg("--")
        .arg(format!("-{}", pgid))
        .status()
    {
        Ok(status) if status.success() => debug!("Sent {} to process group {}", signal, pgid),
        Ok(_) => debug!("Process group {} already gone", pgid),
        Err(e) => warn!("Failed to signal process group {}: {}", pgid, e),
    }
}
