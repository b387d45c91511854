//! Wrapper Resolution
//!
//! A wrapper is a reusable action addressed by name, e.g. `bio/samtools/sort`.
//! Resolution turns the name into a runnable script plus the environment it
//! declares.

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Deserialize;

use crate::errors::{Result, WorkflowError};

/// A wrapper ready to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWrapper {
    pub script: PathBuf,
    /// Conda environment declared by the wrapper, if any.
    pub conda_env: Option<String>,
}

pub trait WrapperResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<ResolvedWrapper>;
}

/// Wrappers laid out as `<prefix>/<name>/wrapper.sh`, with an optional
/// `environment.yaml` next to the script.
#[derive(Debug, Clone)]
pub struct LocalWrapperRepository {
    prefix: PathBuf,
}

#[derive(Deserialize)]
struct EnvironmentFile {
    name: Option<String>,
}

impl LocalWrapperRepository {
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &Path {
        &self.prefix
    }
}

impl WrapperResolver for LocalWrapperRepository {
    fn resolve(&self, name: &str) -> Result<ResolvedWrapper> {
        let dir = self.prefix.join(name.trim_matches('/'));
        let script = dir.join("wrapper.sh");
        if !script.is_file() {
            return Err(WorkflowError::WrapperNotFound(name.to_string()));
        }

        let env_path = dir.join("environment.yaml");
        let conda_env = if env_path.is_file() {
            let content = fs::read_to_string(&env_path)?;
            let env: EnvironmentFile = serde_yaml::from_str(&content)?;
            env.name
        } else {
            None
        };

        debug!("Resolved wrapper '{}' to {}", name, script.display());
        Ok(ResolvedWrapper { script, conda_env })
    }
}
