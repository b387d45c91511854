//! Rule Data Model
//!
//! A rule is a template mapping input patterns to output patterns through an
//! action. Rules are instantiated into jobs once a wildcard binding is known.
//!
//! # Example YAML Format
//!
//! ```yaml
//! ruleorder: [bwa_mem, bowtie2]
//! localrules: [all]
//!
//! rules:
//!   - name: all
//!     input: [aligned/a.bam, aligned/b.bam]
//!
//!   - name: bwa_mem
//!     input: reads/{sample}.fastq
//!     output: aligned/{sample}.bam
//!     threads: 8
//!     resources:
//!       mem_mb: 4000
//!     conda: bwa
//!     shell: bwa mem -t {threads} ref.fa {input} > {output}
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use super::wildcards::extract_wildcard_names;

/// Name of the resource that `threads` is accounted against.
pub const CORES: &str = "cores";

/// One input of a rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum InputSpec {
    /// A pattern rendered from the job's wildcards.
    Path(String),
    /// A pattern whose extra wildcards are enumerated from the files matching
    /// `from` once the producer of those files has run.
    Deferred { pattern: String, from: String },
}

impl InputSpec {
    pub fn pattern(&self) -> &str {
        match self {
            Self::Path(p) => p,
            Self::Deferred { pattern, .. } => pattern,
        }
    }

    /// Pattern whose matching files provide values for unbound wildcards.
    pub fn source(&self) -> &str {
        match self {
            Self::Path(p) => p,
            Self::Deferred { from, .. } => from,
        }
    }
}

/// One output of a rule.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum OutputSpec {
    Path(String),
    /// Contains wildcards the job does not bind; the concrete files are only
    /// known after the job has run.
    Dynamic { dynamic: String },
}

impl OutputSpec {
    pub fn pattern(&self) -> &str {
        match self {
            Self::Path(p) => p,
            Self::Dynamic { dynamic } => dynamic,
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic { .. })
    }
}

/// What a job runs. Interpreted only by the action handlers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Shell(String),
    Script(PathBuf),
    Wrapper(String),
    /// Aggregation rule: nothing to execute.
    #[default]
    None,
}

/// Sandbox flavour for running a job away from the working directory.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ShadowMode {
    /// Only the job's inputs are linked into the sandbox.
    Minimal,
    /// Top-level entries of the working directory are linked.
    Shallow,
    /// The directory tree is recreated with every file linked.
    Full,
}

/// A declared production rule.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub input: Vec<InputSpec>,
    pub output: Vec<OutputSpec>,
    pub params: BTreeMap<String, String>,
    pub threads: u64,
    pub resources: BTreeMap<String, u64>,
    pub action: Action,
    pub conda: Option<String>,
    pub shadow: Option<ShadowMode>,
    pub priority: i64,
    pub log: Vec<String>,
    pub checkpoint: bool,
    /// Always executed on the submitting host, even in cluster mode.
    pub local: bool,
}

impl Rule {
    /// Creates a rule with no inputs, outputs or action.
    ///
    /// ```
    /// use ruleforge::workflow::Rule;
    ///
    /// let rule = Rule::new("align")
    ///     .with_input("reads/{sample}.fastq")
    ///     .with_output("aligned/{sample}.bam")
    ///     .with_shell("bwa mem {input} > {output}")
    ///     .with_threads(4);
    /// assert_eq!(rule.output_wildcards(), vec!["sample"]);
    /// ```
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            input: Vec::new(),
            output: Vec::new(),
            params: BTreeMap::new(),
            threads: 1,
            resources: BTreeMap::new(),
            action: Action::None,
            conda: None,
            shadow: None,
            priority: 0,
            log: Vec::new(),
            checkpoint: false,
            local: false,
        }
    }

    pub fn with_input(mut self, pattern: impl Into<String>) -> Self {
        self.input.push(InputSpec::Path(pattern.into()));
        self
    }

    pub fn with_deferred_input(mut self, pattern: impl Into<String>, from: impl Into<String>) -> Self {
        self.input.push(InputSpec::Deferred {
            pattern: pattern.into(),
            from: from.into(),
        });
        self
    }

    pub fn with_output(mut self, pattern: impl Into<String>) -> Self {
        self.output.push(OutputSpec::Path(pattern.into()));
        self
    }

    pub fn with_dynamic_output(mut self, pattern: impl Into<String>) -> Self {
        self.output.push(OutputSpec::Dynamic {
            dynamic: pattern.into(),
        });
        self
    }

    pub fn with_shell(mut self, command: impl Into<String>) -> Self {
        self.action = Action::Shell(command.into());
        self
    }

    pub fn with_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.action = Action::Script(path.into());
        self
    }

    pub fn with_wrapper(mut self, name: impl Into<String>) -> Self {
        self.action = Action::Wrapper(name.into());
        self
    }

    pub fn with_threads(mut self, threads: u64) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, amount: u64) -> Self {
        self.resources.insert(name.into(), amount);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_shadow(mut self, mode: ShadowMode) -> Self {
        self.shadow = Some(mode);
        self
    }

    pub fn with_log(mut self, pattern: impl Into<String>) -> Self {
        self.log.push(pattern.into());
        self
    }

    pub fn with_conda(mut self, env: impl Into<String>) -> Self {
        self.conda = Some(env.into());
        self
    }

    pub fn checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    /// Wildcards bound by the rule's non-dynamic outputs. Every job of the
    /// rule binds exactly these.
    pub fn output_wildcards(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for output in self.output.iter().filter(|o| !o.is_dynamic()) {
            for name in extract_wildcard_names(output.pattern()) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    pub fn has_dynamic_output(&self) -> bool {
        self.output.iter().any(OutputSpec::is_dynamic)
    }

    /// Whether consumers of this rule's outputs must wait for it to finish
    /// before they can be fully expanded.
    pub fn defers_consumers(&self) -> bool {
        self.checkpoint || self.has_dynamic_output()
    }

    /// Requested resources with threads accounted as cores.
    pub fn requested_resources(&self) -> BTreeMap<String, u64> {
        let mut resources = self.resources.clone();
        resources.insert(CORES.to_string(), self.threads);
        resources
    }

    /// Fingerprint of everything that defines what the rule executes.
    /// A change forces the rule's jobs to rerun.
    pub fn action_hash(&self) -> String {
        #[derive(Serialize)]
        struct Definition<'a> {
            action: &'a Action,
            params: &'a BTreeMap<String, String>,
            conda: &'a Option<String>,
        }

        let definition = Definition {
            action: &self.action,
            params: &self.params,
            conda: &self.conda,
        };
        let bytes = serde_json::to_vec(&definition).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }
}

/// Accepts either a single value or a list of values.
pub(crate) fn single_or_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}
