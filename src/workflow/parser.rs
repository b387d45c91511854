//! Rule File Parser
//!
//! Loads rule declarations from YAML into a [`RuleRegistry`]. This is the
//! default declaration surface; the engine itself only consumes the
//! registry.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Deserialize;

use super::model::{single_or_vec, Action, InputSpec, OutputSpec, Rule, ShadowMode};
use super::registry::RuleRegistry;
use super::validator::validate_rules;
use crate::errors::{Result, WorkflowError};

/// Top-level layout of a rule file.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct WorkflowDef {
    rules: Vec<RuleDef>,
    #[serde(default)]
    ruleorder: Vec<String>,
    #[serde(default)]
    localrules: Vec<String>,
}

/// One rule as written in YAML.
#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct RuleDef {
    name: String,
    #[serde(default, deserialize_with = "single_or_vec")]
    input: Vec<InputSpec>,
    #[serde(default, deserialize_with = "single_or_vec")]
    output: Vec<OutputSpec>,
    #[serde(default)]
    params: BTreeMap<String, serde_yaml::Value>,
    #[serde(default = "default_threads")]
    threads: u64,
    #[serde(default)]
    resources: BTreeMap<String, u64>,
    shell: Option<String>,
    script: Option<PathBuf>,
    wrapper: Option<String>,
    conda: Option<String>,
    shadow: Option<ShadowMode>,
    #[serde(default)]
    priority: i64,
    #[serde(default, deserialize_with = "single_or_vec")]
    log: Vec<String>,
    #[serde(default)]
    checkpoint: bool,
}

/// Default thread count for rules that don't specify
fn default_threads() -> u64 {
    1
}

impl RuleDef {
    fn into_rule(self) -> Result<Rule> {
        let action = match (self.shell, self.script, self.wrapper) {
            (None, None, None) => Action::None,
            (Some(cmd), None, None) => Action::Shell(cmd),
            (None, Some(path), None) => Action::Script(path),
            (None, None, Some(name)) => Action::Wrapper(name),
            _ => {
                return Err(WorkflowError::Validation(format!(
                    "Rule '{}' declares more than one of shell, script and wrapper",
                    self.name
                )))
            }
        };

        let params = self
            .params
            .into_iter()
            .map(|(key, value)| scalar_to_string(&value).map(|v| (key.clone(), v)).ok_or_else(|| {
                WorkflowError::Validation(format!(
                    "Rule '{}': param '{}' must be a string, number or boolean",
                    self.name, key
                ))
            }))
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(Rule {
            name: self.name,
            input: self.input,
            output: self.output,
            params,
            threads: self.threads,
            resources: self.resources,
            action,
            conda: self.conda,
            shadow: self.shadow,
            priority: self.priority,
            log: self.log,
            checkpoint: self.checkpoint,
            local: false,
        })
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Parses rule declarations from YAML text.
pub fn parse_workflow(yaml_content: &str) -> Result<RuleRegistry> {
    let def: WorkflowDef = serde_yaml::from_str(yaml_content)?;

    let rules = def
        .rules
        .into_iter()
        .map(RuleDef::into_rule)
        .collect::<Result<Vec<_>>>()?;

    validate_rules(&rules)?;

    let mut registry = RuleRegistry::from_rules(rules)?;
    registry.set_ruleorder(def.ruleorder)?;
    registry.set_localrules(&def.localrules)?;

    debug!("Registered rules: {:?}", registry.rules().map(|r| &r.name).collect::<Vec<_>>());
    Ok(registry)
}

/// Loads a rule file.
///
/// # Example
///
/// ```rust,no_run
/// use ruleforge::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = load_workflow("rules.yaml")?;
///     println!("Loaded {} rules", registry.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<RuleRegistry> {
    let path = path.as_ref();
    info!("Loading rules from: {}", path.display());

    let yaml_content = fs::read_to_string(path).map_err(|e| {
        WorkflowError::Config(format!(
            "Failed to read rule file '{}': {}. Check that the file exists and is readable.",
            path.display(),
            e
        ))
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let registry = parse_workflow(&yaml_content)?;
    info!("Parsed {} rules", registry.len());
    Ok(registry)
}
