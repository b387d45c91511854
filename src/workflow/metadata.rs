//! Persistent Workflow Metadata
//!
//! Records what the freshness check cannot learn from timestamps alone:
//! - the action hash of each rule at its last successful job, so that
//!   editing a rule body forces its outputs to be rebuilt
//! - outputs of jobs that started but never finished
//!
//! Metadata is saved to `.ruleforge/metadata.json` in the working directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::model::Rule;
use crate::errors::Result;

/// Directory holding all engine bookkeeping inside the working directory.
pub const METADATA_DIR: &str = ".ruleforge";

const METADATA_FILE: &str = "metadata.json";

/// Serialized metadata contents.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    /// Rule name to action hash of its last successful job.
    pub rule_hashes: BTreeMap<String, String>,

    /// Outputs of jobs that were started but did not finish.
    pub incomplete: BTreeSet<String>,

    /// Last time the metadata was updated.
    pub updated: Option<DateTime<Utc>>,
}

impl Metadata {
    /// True if the rule ran before with a different definition.
    pub fn rule_changed(&self, rule: &Rule) -> bool {
        self.rule_hashes
            .get(&rule.name)
            .is_some_and(|hash| *hash != rule.action_hash())
    }

    pub fn is_incomplete(&self, path: &str) -> bool {
        self.incomplete.contains(path)
    }
}

/// Metadata bound to its file on disk.
#[derive(Debug)]
pub struct MetadataStore {
    path: Option<PathBuf>,
    data: Metadata,
}

impl MetadataStore {
    /// Loads metadata for a working directory; a missing file yields empty
    /// metadata.
    pub fn load(workdir: &Path) -> Result<Self> {
        let path = workdir.join(METADATA_DIR).join(METADATA_FILE);

        let data = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let data: Metadata = serde_json::from_str(&content)?;
            info!("Loaded workflow metadata from {}", path.display());
            debug!("Incomplete outputs: {:?}", data.incomplete);
            data
        } else {
            Metadata::default()
        };

        Ok(Self {
            path: Some(path),
            data,
        })
    }

    /// Metadata that is never written, used for dry runs.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Metadata::default(),
        }
    }

    pub fn data(&self) -> &Metadata {
        &self.data
    }

    /// Saves the metadata file, creating `.ruleforge` if needed.
    pub fn save(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        self.data.updated = Some(Utc::now());
        let json = serde_json::to_string_pretty(&self.data)?;
        fs::write(path, json)?;

        debug!("Saved workflow metadata to {}", path.display());
        Ok(())
    }

    /// Records the current definition of a rule after a successful job.
    pub fn record_rule(&mut self, rule: &Rule) {
        self.data
            .rule_hashes
            .insert(rule.name.clone(), rule.action_hash());
    }

    pub fn mark_incomplete<'a>(&mut self, outputs: impl IntoIterator<Item = &'a Path>) {
        for output in outputs {
            self.data
                .incomplete
                .insert(output.to_string_lossy().into_owned());
        }
    }

    pub fn clear_incomplete<'a>(&mut self, outputs: impl IntoIterator<Item = &'a Path>) {
        for output in outputs {
            self.data.incomplete.remove(output.to_string_lossy().as_ref());
        }
    }
}
