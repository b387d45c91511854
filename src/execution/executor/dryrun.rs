//! Dry-Run and Touch Execution
//!
//! Neither executor runs an action. Jobs report success as soon as they are
//! dispatched, so the scheduler walks the whole graph in order.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use colored::Colorize;
use log::info;

use super::{report, touch_outputs, Executor, JobEvent};
use crate::dag::Job;
use crate::errors::Result;
use crate::execution::action::ActionDispatcher;
use crate::storage::Storage;

/// Prints every job instead of running it.
pub struct DryRunExecutor {
    actions: Arc<ActionDispatcher>,
}

impl DryRunExecutor {
    pub fn new(actions: Arc<ActionDispatcher>) -> Self {
        Self { actions }
    }

    /// Human-readable description of a job.
    pub fn describe(&self, job: &Job) -> String {
        let list = |files: &[std::path::PathBuf]| {
            files
                .iter()
                .map(|f| f.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut lines = vec![format!("{} {}", "rule".bold(), job.rule.name.bold().cyan())];
        if !job.wildcards.is_empty() {
            let bindings: Vec<String> = job.wildcards.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            lines.push(format!("    wildcards: {}", bindings.join(", ")));
        }
        if !job.input.is_empty() {
            lines.push(format!("    input: {}", list(&job.input)));
        }
        if !job.output.is_empty() {
            lines.push(format!("    output: {}", list(&job.output)));
        }
        if !job.log.is_empty() {
            lines.push(format!("    log: {}", list(&job.log)));
        }
        lines.push(format!("    jobid: {}", job.id));
        lines.push(format!("    reason: {}", job.reason.to_string().yellow()));
        if job.threads() > 1 {
            lines.push(format!("    threads: {}", job.threads()));
        }
        match self.actions.render(job) {
            Ok(Some(rendered)) => lines.push(format!("    command: {}", rendered.body.dimmed())),
            Ok(None) => {}
            Err(e) => lines.push(format!("    command: {}", e.to_string().red())),
        }
        lines.join("\n")
    }
}

impl Executor for DryRunExecutor {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn run(&mut self, job: &Job, events: Sender<JobEvent>) -> Result<()> {
        println!("\n{}", self.describe(job));
        report(&events, job.id, Ok(()));
        Ok(())
    }

    fn terminate_all(&mut self, _kill: bool) {}

    /// Nothing was written, so nothing is removed.
    fn cleanup(&self, _job: &Job, _storage: &Storage) {}

    fn records_metadata(&self) -> bool {
        false
    }
}

/// Marks outputs as up to date without running the action.
pub struct TouchExecutor {
    storage: Arc<Storage>,
}

impl TouchExecutor {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl Executor for TouchExecutor {
    fn name(&self) -> &'static str {
        "touch"
    }

    fn run(&mut self, job: &Job, events: Sender<JobEvent>) -> Result<()> {
        info!("Touching outputs of {}", job);
        report(&events, job.id, touch_outputs(job, &self.storage));
        Ok(())
    }

    fn terminate_all(&mut self, _kill: bool) {}

    fn cleanup(&self, _job: &Job, _storage: &Storage) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::job::tests::sample_job;
    use crate::dag::JobId;
    use crate::environment::LocalWrapperRepository;
    use crate::workflow::Rule;
    use std::fs;
    use std::path::PathBuf;
    use std::sync::mpsc::channel;
    use tempfile::tempdir;

    #[test]
    fn test_dry_run_reports_success_without_running() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::new(dir.path()));
        let actions = Arc::new(ActionDispatcher::new(
            storage,
            Arc::new(LocalWrapperRepository::new(dir.path())),
        ));
        let mut exec = DryRunExecutor::new(actions);

        let mut job = sample_job(0, Rule::new("count").with_shell("wc -l {input} > {output}"));
        job.input = vec![PathBuf::from("a.txt")];
        job.output = vec![PathBuf::from("a.count")];
        job.wildcards.insert("sample".to_string(), "a".to_string());

        colored::control::set_override(false);
        let text = exec.describe(&job);
        assert!(text.contains("rule count"));
        assert!(text.contains("wildcards: sample=a"));
        assert!(text.contains("command: wc -l a.txt > a.count"));

        let (tx, rx) = channel();
        exec.run(&job, tx).unwrap();
        assert_eq!(rx.recv().unwrap(), JobEvent::Finished(JobId(0)));
        assert!(!dir.path().join("a.count").exists());
        assert!(!exec.records_metadata());
    }

    #[test]
    fn test_touch_creates_outputs() {
        let dir = tempdir().unwrap();
        let mut exec = TouchExecutor::new(Arc::new(Storage::new(dir.path())));
        let mut job = sample_job(1, Rule::new("a").with_shell("exit 1"));
        job.output = vec![PathBuf::from("out/a.txt")];

        let (tx, rx) = channel();
        exec.run(&job, tx).unwrap();
        assert_eq!(rx.recv().unwrap(), JobEvent::Finished(JobId(1)));
        assert!(fs::metadata(dir.path().join("out/a.txt")).unwrap().is_file());
    }
}
