//! Local Execution
//!
//! Each job runs on its own thread as a bash script. The script is started
//! as the leader of a new process group so that termination signals can be
//! forwarded to the job and everything it spawned.
//!
//! Jobs with a shadow mode run inside a sandbox directory under
//! `.ruleforge/shadow`; outputs are moved back into the working directory on
//! success and the sandbox is removed on every exit path.

use std::collections::HashMap;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, error, info, warn};
use tempfile::TempDir;
use walkdir::WalkDir;

use super::{
    job_tmp_dir, prepare_outputs, report, signal_group, touch_outputs, wait_for_outputs, Executor,
    ExecutorSettings, JobEvent,
};
use crate::dag::{Job, JobId};
use crate::errors::{Result, WorkflowError};
use crate::execution::action::{script_command, write_script, ActionDispatcher};
use crate::storage::Storage;
use crate::workflow::metadata::METADATA_DIR;
use crate::workflow::ShadowMode;

/// Process groups of running jobs, by job.
type ProcessTable = Arc<Mutex<HashMap<JobId, u32>>>;

/// Runs jobs as child processes of this host.
pub struct LocalExecutor {
    actions: Arc<ActionDispatcher>,
    settings: ExecutorSettings,
    processes: ProcessTable,
    workers: Vec<thread::JoinHandle<()>>,
}

impl LocalExecutor {
    pub fn new(actions: Arc<ActionDispatcher>, settings: ExecutorSettings) -> Self {
        Self {
            actions,
            settings,
            processes: Arc::new(Mutex::new(HashMap::new())),
            workers: Vec::new(),
        }
    }

    /// Number of jobs with a live process group.
    pub fn running(&self) -> usize {
        self.processes.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    fn run(&mut self, job: &Job, events: Sender<JobEvent>) -> Result<()> {
        let job = job.clone();
        let actions = Arc::clone(&self.actions);
        let settings = self.settings.clone();
        let processes = Arc::clone(&self.processes);

        let handle = thread::Builder::new()
            .name(format!("job-{}", job.id))
            .spawn(move || {
                let storage = actions.storage();
                let result = run_job(&job, &actions, &settings, &processes);
                if let Err(e) = &result {
                    error!("Error in {}: {}", job, e);
                    super::cleanup_outputs(&job, storage);
                }
                report(&events, job.id, result);
            })?;
        self.workers.retain(|w| !w.is_finished());
        self.workers.push(handle);
        Ok(())
    }

    fn terminate_all(&mut self, kill: bool) {
        let Ok(processes) = self.processes.lock() else {
            return;
        };
        for (id, pgid) in processes.iter() {
            info!("Terminating job {} (process group {})", id, pgid);
            signal_group(*pgid, kill);
        }
    }

    fn shutdown(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("A job thread panicked");
            }
        }
    }
}

/// Runs one job to completion on the calling thread.
pub(crate) fn run_job(
    job: &Job,
    actions: &ActionDispatcher,
    settings: &ExecutorSettings,
    processes: &ProcessTable,
) -> Result<()> {
    let storage = actions.storage();
    storage.fetch_inputs(&job.input)?;
    prepare_outputs(job, storage)?;

    if let Some(rendered) = actions.render(job)? {
        let tmp = job_tmp_dir(storage, job)?;
        let script = write_script(tmp.path(), job, &rendered.body)?;

        let shadow = match job.rule.shadow {
            Some(mode) => Some(ShadowDir::create(storage, job, mode)?),
            None => None,
        };
        let run_dir = shadow
            .as_ref()
            .map(|s| s.path().to_path_buf())
            .unwrap_or_else(|| storage.workdir().to_path_buf());

        let mut cmd = script_command(&script, rendered.conda_env.as_deref(), storage.workdir())?;
        cmd.current_dir(&run_dir).env("TMPDIR", tmp.path()).process_group(0);
        debug!("Executing {} in {}", job, run_dir.display());

        let child = cmd.stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;
        if let Ok(mut table) = processes.lock() {
            table.insert(job.id, child.id());
        }
        let output = child.wait_with_output();
        if let Ok(mut table) = processes.lock() {
            table.remove(&job.id);
        }
        let output = output?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("{} output:\n{}", job, stdout);
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                error!("stderr of {}:\n{}", job, stderr.trim_end());
            }
            let reason = match output.status.code() {
                Some(code) => format!("exit code {}", code),
                None => "terminated by signal".to_string(),
            };
            return Err(WorkflowError::JobFailed {
                job: job.display_name(),
                reason,
            });
        }

        if let Some(shadow) = &shadow {
            shadow.merge_back(job)?;
        }
    }

    wait_for_outputs(job, storage, settings.latency_wait)?;
    touch_outputs(job, storage)?;
    storage.upload_outputs(&job.output)?;
    Ok(())
}

/// Sandbox directory for one job. Removed when dropped.
pub(crate) struct ShadowDir {
    dir: TempDir,
    workdir: PathBuf,
    storage: Storage,
}

impl ShadowDir {
    pub(crate) fn create(storage: &Storage, job: &Job, mode: ShadowMode) -> Result<Self> {
        let workdir = storage.workdir().to_path_buf();
        let root = workdir.join(METADATA_DIR).join("shadow");
        fs::create_dir_all(&root)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("job_{}_", job.id))
            .tempdir_in(&root)?;
        let shadow = Self {
            dir,
            workdir,
            storage: storage.clone(),
        };

        match mode {
            ShadowMode::Minimal => {
                for input in &job.input {
                    shadow.link(&storage.action_path(input))?;
                }
            }
            ShadowMode::Shallow => {
                for entry in fs::read_dir(&shadow.workdir)? {
                    let name = PathBuf::from(entry?.file_name());
                    if name != Path::new(METADATA_DIR) {
                        shadow.link(&name)?;
                    }
                }
            }
            ShadowMode::Full => {
                let walker = WalkDir::new(&shadow.workdir)
                    .min_depth(1)
                    .into_iter()
                    .filter_entry(|e| e.file_name() != METADATA_DIR);
                for entry in walker {
                    let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
                    let relative = entry
                        .path()
                        .strip_prefix(&shadow.workdir)
                        .map_err(|e| std::io::Error::other(e.to_string()))?;
                    if entry.file_type().is_dir() {
                        fs::create_dir_all(shadow.path().join(relative))?;
                    } else {
                        shadow.link(relative)?;
                    }
                }
            }
        }

        for file in job.expected_files() {
            if let Some(parent) = shadow.path().join(storage.action_path(file)).parent() {
                fs::create_dir_all(parent)?;
            }
        }

        debug!("Created {:?} shadow for {} at {}", mode, job, shadow.path().display());
        Ok(shadow)
    }

    pub(crate) fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Symlinks `relative` from the working directory into the sandbox.
    fn link(&self, relative: &Path) -> Result<()> {
        let source = self.workdir.join(relative);
        if !source.exists() {
            return Ok(());
        }
        let target = self.path().join(relative);
        if target.exists() {
            return Ok(());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(&source, &target)?;
        Ok(())
    }

    /// Moves the job's outputs and logs into the working directory.
    pub(crate) fn merge_back(&self, job: &Job) -> Result<()> {
        for file in job.expected_files() {
            let relative = self.storage.action_path(file);
            let produced = self.path().join(&relative);
            let Ok(meta) = fs::symlink_metadata(&produced) else {
                continue;
            };
            if meta.file_type().is_symlink() {
                continue;
            }
            let dest = self.workdir.join(&relative);
            if fs::canonicalize(&produced)? == fs::canonicalize(&dest).unwrap_or_default() {
                continue;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&produced, &dest)?;
            debug!("Moved {} out of shadow", relative.display());
        }
        Ok(())
    }
}
