//! Error Types
//!
//! Crate-wide error taxonomy. Construction errors (`RuleMatch`, `Recursion`,
//! `MissingInput`) abort before any job is dispatched; runtime errors
//! (`JobFailed`, `ClusterSubmission`, `LatencyTimeout`) only fail the job
//! that raised them and its dependents.

use std::path::PathBuf;

use thiserror::Error;

/// Why no single rule could be chosen for a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchFailure {
    /// No rule declares an output matching the path.
    NoProducer,
    /// Several rules match and `ruleorder` does not separate them.
    AmbiguousRules(Vec<String>),
    /// One rule matches the path with more than one wildcard binding.
    AmbiguousBinding(String),
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("{}", describe_match_failure(path, reason))]
    RuleMatch { path: String, reason: MatchFailure },

    #[error("Cyclic rule dependency detected: {}", chain.join(" -> "))]
    Recursion { chain: Vec<String> },

    #[error("Missing input files for rule '{rule}': {}", join_paths(files))]
    MissingInput { rule: String, files: Vec<PathBuf> },

    #[error("Job '{job}' failed: {reason}")]
    JobFailed { job: String, reason: String },

    #[error("Cluster rejected job '{job}': {message}")]
    ClusterSubmission { job: String, message: String },

    #[error(
        "Outputs of job '{job}' still missing after {waited_secs}s latency wait: {}",
        join_paths(files)
    )]
    LatencyTimeout {
        job: String,
        files: Vec<PathBuf>,
        waited_secs: u64,
    },

    #[error(
        "Rule '{rule}' requests {requested} {resource} but only {available} are available; scaling down to {available}"
    )]
    ResourceOverflow {
        rule: String,
        resource: String,
        requested: u64,
        available: u64,
    },

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Wildcard '{{{name}}}' in '{pattern}' has no value")]
    UnboundWildcard { pattern: String, name: String },

    #[error("Invalid workflow:\n{0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Wrapper '{0}' could not be resolved")]
    WrapperNotFound(String),

    #[error("Storage error for '{path}': {message}")]
    Storage { path: String, message: String },

    #[error("Execution interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkflowError {
    /// Returns true for errors raised while building the job graph.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::RuleMatch { .. } | Self::Recursion { .. } | Self::MissingInput { .. }
        )
    }
}

fn describe_match_failure(path: &str, reason: &MatchFailure) -> String {
    match reason {
        MatchFailure::NoProducer => format!("No rule to produce '{}'", path),
        MatchFailure::AmbiguousRules(rules) => format!(
            "Rules {} are ambiguous for '{}'; declare a ruleorder to choose one",
            rules.join(", "),
            path
        ),
        MatchFailure::AmbiguousBinding(rule) => format!(
            "Rule '{}' matches '{}' with more than one wildcard binding; constrain its wildcards",
            rule, path
        ),
    }
}

fn join_paths(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|f| f.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursion_message_shows_chain() {
        let err = WorkflowError::Recursion {
            chain: vec!["a[x=1]".to_string(), "b[x=1]".to_string(), "a[x=1]".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Cyclic rule dependency detected: a[x=1] -> b[x=1] -> a[x=1]"
        );
        assert!(err.is_construction_error());
    }

    #[test]
    fn test_rule_match_messages() {
        let err = WorkflowError::RuleMatch {
            path: "out/1.txt".to_string(),
            reason: MatchFailure::AmbiguousRules(vec!["a".to_string(), "b".to_string()]),
        };
        assert!(err.to_string().contains("a, b"));

        let err = WorkflowError::RuleMatch {
            path: "out/1.txt".to_string(),
            reason: MatchFailure::NoProducer,
        };
        assert_eq!(err.to_string(), "No rule to produce 'out/1.txt'");
    }

    #[test]
    fn test_runtime_errors_are_not_construction_errors() {
        let err = WorkflowError::JobFailed {
            job: "a".to_string(),
            reason: "exit code 1".to_string(),
        };
        assert!(!err.is_construction_error());
    }
}
