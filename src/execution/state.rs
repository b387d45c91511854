//! Job State
//!
//! Per-job status record. The scheduler owns every record and only changes
//! one in response to an event from that job's executor.

use chrono::{DateTime, Utc};

/// Status of a job during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Waiting for dependencies or deferred inputs
    Pending,
    /// Dependencies finished; waiting for resources
    Ready,
    Running,
    Finished,
    /// Failed with error message
    Failed(String),
    /// Never dispatched because an upstream job failed or the run stopped
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed(_) | Self::Skipped)
    }
}

/// Status plus timestamps for one job.
#[derive(Debug, Clone)]
pub struct JobState {
    pub status: JobStatus,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Transient status-check failures seen while running.
    pub status_retries: u32,
}

impl JobState {
    pub fn new() -> Self {
        Self {
            status: JobStatus::Pending,
            dispatched_at: None,
            finished_at: None,
            status_retries: 0,
        }
    }

    pub fn mark_ready(&mut self) {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Ready;
        }
    }

    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.dispatched_at = Some(Utc::now());
    }

    /// Stays running; only the retry count changes.
    pub fn record_status_retry(&mut self, attempt: u32) {
        self.status_retries = attempt;
    }

    pub fn mark_finished(&mut self) {
        self.status = JobStatus::Finished;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed(error.into());
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self) {
        if !self.status.is_terminal() {
            self.status = JobStatus::Skipped;
        }
    }

    /// Wall-clock run time, once the job has ended.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.finished_at? - self.dispatched_at?)
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}
