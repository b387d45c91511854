//! Execution Timeline
//!
//! Records when each job was dispatched and when it ended. The timeline
//! feeds the progress summary, the ASCII chart shown with `--verbose` and
//! the JSON statistics written with `--stats`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dag::{Job, JobId};
use crate::errors::Result;
use crate::workflow::Wildcards;

/// Type of timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Started,
    Completed,
    Failed,
}

/// A single event in the execution timeline.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub job: JobId,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct JobInfo {
    rule: String,
    wildcards: Wildcards,
    label: String,
}

/// Per-job entry of the statistics file.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JobStats {
    pub jobid: usize,
    pub rule: String,
    pub wildcards: Wildcards,
    pub start_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
    /// Seconds, once the job has ended.
    pub duration: Option<f64>,
    pub success: Option<bool>,
}

/// Per-rule runtime summary.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RuleStats {
    pub count: usize,
    pub mean_runtime: f64,
    pub min_runtime: f64,
    pub max_runtime: f64,
}

/// Contents of the `--stats` file.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub start_time: DateTime<Utc>,
    pub total_runtime: f64,
    pub rules: BTreeMap<String, RuleStats>,
    pub jobs: Vec<JobStats>,
}

/// Tracks the execution timeline of a run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    jobs: BTreeMap<JobId, JobInfo>,
    start_time: DateTime<Utc>,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            jobs: BTreeMap::new(),
            start_time: Utc::now(),
        }
    }

    pub fn job_started(&mut self, job: &Job) {
        self.jobs.insert(
            job.id,
            JobInfo {
                rule: job.rule.name.clone(),
                wildcards: job.wildcards.clone(),
                label: job.display_name(),
            },
        );
        self.add_event(job.id, EventType::Started);
    }

    pub fn add_event(&mut self, job: JobId, event_type: EventType) {
        self.events.push(TimelineEvent {
            job,
            event_type,
            timestamp: Utc::now(),
        });
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.start_time
    }

    /// Start, end and outcome per job, in order of dispatch.
    fn spans(&self) -> Vec<(JobId, DateTime<Utc>, Option<(DateTime<Utc>, bool)>)> {
        let mut spans: Vec<(JobId, DateTime<Utc>, Option<(DateTime<Utc>, bool)>)> = Vec::new();
        for event in &self.events {
            match event.event_type {
                EventType::Started => spans.push((event.job, event.timestamp, None)),
                EventType::Completed | EventType::Failed => {
                    if let Some(span) = spans.iter_mut().rev().find(|s| s.0 == event.job) {
                        span.2 = Some((event.timestamp, event.event_type == EventType::Completed));
                    }
                }
            }
        }
        spans
    }

    /// Job durations in milliseconds.
    pub fn durations(&self) -> BTreeMap<JobId, i64> {
        self.spans()
            .into_iter()
            .filter_map(|(id, start, end)| end.map(|(end, _)| (id, (end - start).num_milliseconds())))
            .collect()
    }

    /// Generates an ASCII Gantt chart of the jobs that ended.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total_time = self.elapsed().num_milliseconds();
        if total_time <= 0 {
            return output;
        }

        // Scale to 50 characters width
        let scale = 50.0 / total_time as f64;

        for (id, start, end) in self.spans() {
            let Some((end, _)) = end else {
                continue;
            };
            let start_ms = (start - self.start_time).num_milliseconds().max(0);
            let duration_ms = (end - start).num_milliseconds().max(0);
            let start_pos = (start_ms as f64 * scale) as usize;
            let width = (duration_ms as f64 * scale).max(1.0) as usize;

            let label = self.jobs.get(&id).map(|j| j.label.as_str()).unwrap_or("?");
            output.push_str(&format!(
                "{:16} |{}{}| ({} ms)\n",
                truncate(label, 16),
                " ".repeat(start_pos),
                "#".repeat(width),
                duration_ms
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }

    pub fn stats(&self) -> RunStats {
        let mut jobs = Vec::new();
        let mut runtimes: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for (id, start, end) in self.spans() {
            let Some(info) = self.jobs.get(&id) else {
                continue;
            };
            let duration = end.map(|(end, _)| (end - start).num_milliseconds() as f64 / 1000.0);
            if let Some(seconds) = duration {
                runtimes.entry(info.rule.clone()).or_default().push(seconds);
            }
            jobs.push(JobStats {
                jobid: id.0,
                rule: info.rule.clone(),
                wildcards: info.wildcards.clone(),
                start_time: start,
                stop_time: end.map(|(end, _)| end),
                duration,
                success: end.map(|(_, ok)| ok),
            });
        }

        let rules = runtimes
            .into_iter()
            .map(|(rule, times)| {
                let count = times.len();
                let stats = RuleStats {
                    count,
                    mean_runtime: times.iter().sum::<f64>() / count as f64,
                    min_runtime: times.iter().copied().fold(f64::INFINITY, f64::min),
                    max_runtime: times.iter().copied().fold(0.0, f64::max),
                };
                (rule, stats)
            })
            .collect();

        RunStats {
            start_time: self.start_time,
            total_runtime: self.elapsed().num_milliseconds() as f64 / 1000.0,
            rules,
            jobs,
        }
    }

    /// Writes [`stats`](Self::stats) as pretty JSON.
    pub fn write_stats(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&self.stats())?)?;
        Ok(())
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or truncates a label to a fixed width.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}
