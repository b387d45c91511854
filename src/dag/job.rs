//! Jobs
//!
//! A job is a rule instantiated with one wildcard binding. All of its paths,
//! params and resources are rendered once, when the job is created.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::workflow::model::{Rule, CORES};
use crate::workflow::wildcards::Wildcards;

/// Stable index of a job in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub usize);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a job has to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunReason {
    Forced,
    MissingOutput(Vec<PathBuf>),
    UpdatedInput(Vec<PathBuf>),
    /// At least one input is produced by another job of this run.
    UpstreamRerun,
    RuleChanged,
    Incomplete(Vec<PathBuf>),
    /// The rule has an action but no outputs, so it can never be up to date.
    NoOutput,
}

impl fmt::Display for RunReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |files: &[PathBuf]| {
            files
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        match self {
            Self::Forced => write!(f, "Forced execution"),
            Self::MissingOutput(files) => write!(f, "Missing output files: {}", list(files)),
            Self::UpdatedInput(files) => write!(f, "Updated input files: {}", list(files)),
            Self::UpstreamRerun => write!(f, "Input files updated by another job"),
            Self::RuleChanged => write!(f, "Rule definition changed since last run"),
            Self::Incomplete(files) => write!(f, "Incomplete output files: {}", list(files)),
            Self::NoOutput => write!(f, "Rule has no output files"),
        }
    }
}

/// An input whose files are only known once its source has been produced.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredInput {
    /// Consumer pattern with the job's own wildcards substituted.
    pub pattern: String,
    /// Pattern enumerated on disk to bind the remaining wildcards.
    pub source: String,
    /// Job whose completion unlocks the expansion.
    pub producer: JobId,
}

/// A rule instantiated with one wildcard binding.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub rule: Arc<Rule>,
    pub wildcards: Wildcards,
    pub input: Vec<PathBuf>,
    pub output: Vec<PathBuf>,
    /// Dynamic output patterns with the job's wildcards substituted.
    pub dynamic_output: Vec<String>,
    pub log: Vec<PathBuf>,
    pub params: BTreeMap<String, String>,
    /// Requested resources, already capped to the pool maximum.
    pub resources: BTreeMap<String, u64>,
    pub dependencies: BTreeSet<JobId>,
    pub deferred: Vec<DeferredInput>,
    pub reason: RunReason,
}

impl Job {
    /// `rule[name=value,...]`, or just the rule name without wildcards.
    pub fn display_name(&self) -> String {
        if self.wildcards.is_empty() {
            return self.rule.name.clone();
        }
        let bindings: Vec<String> = self
            .wildcards
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!("{}[{}]", self.rule.name, bindings.join(","))
    }

    pub fn threads(&self) -> u64 {
        self.resources.get(CORES).copied().unwrap_or(self.rule.threads)
    }

    pub fn is_local(&self) -> bool {
        self.rule.local
    }

    /// True while deferred inputs still wait for their producer.
    pub fn has_pending_inputs(&self) -> bool {
        !self.deferred.is_empty()
    }

    /// Files that must exist when the job ends: outputs and logs.
    pub fn expected_files(&self) -> impl Iterator<Item = &PathBuf> {
        self.output.iter().chain(self.log.iter())
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (job {})", self.display_name(), self.id)
    }
}
