//! Job Actions
//!
//! Turns a job's action into a bash script. Each action kind has its own
//! [`ActionHandler`]; the [`ActionDispatcher`] asks them in order and the
//! first one that accepts the action renders it. Placeholders available to
//! commands:
//! - `{input}`, `{output}`, `{log}`: space-separated file lists
//! - `{input[N]}`, `{output[N]}`, `{log[N]}`: a single file
//! - `{threads}`, `{rule}`, `{jobid}`
//! - `{wildcards.X}`, `{params.X}`, `{resources.X}`
//!
//! `{{` and `}}` produce literal braces. Unknown placeholders are kept.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use log::debug;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::dag::Job;
use crate::environment::conda;
use crate::environment::WrapperResolver;
use crate::errors::{Result, WorkflowError};
use crate::storage::Storage;
use crate::workflow::model::Action;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{|\}\}|\{(?P<key>\w+)(?:\[(?P<index>\d+)\]|\.(?P<attr>\w+))?\}")
        .expect("placeholder regex is valid")
});

/// Values a job exposes to its command and to cluster templates.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    lists: BTreeMap<String, Vec<String>>,
    scalars: BTreeMap<String, String>,
    maps: BTreeMap<String, BTreeMap<String, String>>,
}

impl Placeholders {
    pub fn for_job(job: &Job, storage: &Storage) -> Self {
        let paths = |files: &[PathBuf]| -> Vec<String> {
            files
                .iter()
                .map(|f| storage.action_path(f).to_string_lossy().into_owned())
                .collect()
        };

        let lists = BTreeMap::from([
            ("input".to_string(), paths(&job.input)),
            ("output".to_string(), paths(&job.output)),
            ("log".to_string(), paths(&job.log)),
        ]);
        let threads = job.threads().to_string();
        let scalars = BTreeMap::from([
            ("threads".to_string(), threads.clone()),
            ("cores".to_string(), threads),
            ("rule".to_string(), job.rule.name.clone()),
            ("jobid".to_string(), job.id.to_string()),
        ]);
        let maps = BTreeMap::from([
            ("wildcards".to_string(), job.wildcards.clone()),
            ("params".to_string(), job.params.clone()),
            (
                "resources".to_string(),
                job.resources
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_string()))
                    .collect(),
            ),
        ]);

        Self {
            lists,
            scalars,
            maps,
        }
    }

    fn lookup(&self, caps: &Captures<'_>) -> Option<String> {
        let key = caps.name("key")?.as_str();
        if let Some(index) = caps.name("index") {
            let index: usize = index.as_str().parse().ok()?;
            return self.lists.get(key)?.get(index).cloned();
        }
        if let Some(attr) = caps.name("attr") {
            return self.maps.get(key)?.get(attr.as_str()).cloned();
        }
        self.lists
            .get(key)
            .map(|files| files.join(" "))
            .or_else(|| self.scalars.get(key).cloned())
    }

    /// Replaces every known placeholder in `template`.
    pub fn substitute(&self, template: &str) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &Captures<'_>| match &caps[0] {
                "{{" => "{".to_string(),
                "}}" => "}".to_string(),
                whole => self.lookup(caps).unwrap_or_else(|| whole.to_string()),
            })
            .into_owned()
    }

    /// `RULEFORGE_*` variables exported to scripts.
    fn exports(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        for (key, files) in &self.lists {
            vars.push((key.to_uppercase(), files.join(" ")));
        }
        for (key, value) in &self.scalars {
            vars.push((key.to_uppercase(), value.clone()));
        }
        for (group, values) in &self.maps {
            for (key, value) in values {
                vars.push((format!("{}_{}", group.to_uppercase(), key.to_uppercase()), value.clone()));
            }
        }
        vars.into_iter()
            .map(|(k, v)| (format!("RULEFORGE_{}", k), v))
            .collect()
    }
}

pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Script body plus the environment it must run in.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedAction {
    pub body: String,
    pub conda_env: Option<String>,
}

pub trait ActionHandler: Send + Sync {
    fn handles(&self, action: &Action) -> bool;

    fn render(&self, job: &Job, placeholders: &Placeholders) -> Result<RenderedAction>;
}

/// Runs `shell:` commands after placeholder substitution.
pub struct ShellHandler;

impl ActionHandler for ShellHandler {
    fn handles(&self, action: &Action) -> bool {
        matches!(action, Action::Shell(_))
    }

    fn render(&self, job: &Job, placeholders: &Placeholders) -> Result<RenderedAction> {
        let Action::Shell(command) = &job.rule.action else {
            return Err(WorkflowError::JobFailed {
                job: job.display_name(),
                reason: "shell handler received a non-shell action".to_string(),
            });
        };
        Ok(RenderedAction {
            body: placeholders.substitute(command),
            conda_env: job.rule.conda.clone(),
        })
    }
}

/// Runs external scripts with an interpreter chosen by extension. Job values
/// reach the script as `RULEFORGE_*` environment variables.
pub struct ScriptHandler;

impl ScriptHandler {
    fn interpreter(path: &Path) -> Option<&'static str> {
        match path.extension()?.to_str()? {
            "py" => Some("python"),
            "R" | "r" => Some("Rscript"),
            "sh" | "bash" => Some("bash"),
            "pl" => Some("perl"),
            _ => None,
        }
    }
}

impl ActionHandler for ScriptHandler {
    fn handles(&self, action: &Action) -> bool {
        matches!(action, Action::Script(_))
    }

    fn render(&self, job: &Job, placeholders: &Placeholders) -> Result<RenderedAction> {
        let Action::Script(path) = &job.rule.action else {
            return Err(WorkflowError::JobFailed {
                job: job.display_name(),
                reason: "script handler received a non-script action".to_string(),
            });
        };

        let mut body = String::new();
        for (key, value) in placeholders.exports() {
            body.push_str(&format!("export {}={}\n", key, shell_quote(&value)));
        }
        let script = shell_quote(&path.to_string_lossy());
        match Self::interpreter(path) {
            Some(interpreter) => body.push_str(&format!("{} {}", interpreter, script)),
            None => body.push_str(&script),
        }

        Ok(RenderedAction {
            body,
            conda_env: job.rule.conda.clone(),
        })
    }
}

/// Runs a named wrapper's script, in the wrapper's environment unless the
/// rule overrides it.
pub struct WrapperHandler {
    resolver: Arc<dyn WrapperResolver>,
}

impl WrapperHandler {
    pub fn new(resolver: Arc<dyn WrapperResolver>) -> Self {
        Self { resolver }
    }
}

impl ActionHandler for WrapperHandler {
    fn handles(&self, action: &Action) -> bool {
        matches!(action, Action::Wrapper(_))
    }

    fn render(&self, job: &Job, placeholders: &Placeholders) -> Result<RenderedAction> {
        let Action::Wrapper(name) = &job.rule.action else {
            return Err(WorkflowError::JobFailed {
                job: job.display_name(),
                reason: "wrapper handler received a non-wrapper action".to_string(),
            });
        };
        let resolved = self.resolver.resolve(name)?;
        let template = fs::read_to_string(&resolved.script)?;

        Ok(RenderedAction {
            body: placeholders.substitute(&template),
            conda_env: job.rule.conda.clone().or(resolved.conda_env),
        })
    }
}

/// Ordered list of handlers.
pub struct ActionDispatcher {
    handlers: Vec<Box<dyn ActionHandler>>,
    storage: Arc<Storage>,
}

impl ActionDispatcher {
    /// Shell, script and wrapper handlers, in that order.
    pub fn new(storage: Arc<Storage>, wrappers: Arc<dyn WrapperResolver>) -> Self {
        Self {
            handlers: vec![
                Box::new(ShellHandler),
                Box::new(ScriptHandler),
                Box::new(WrapperHandler::new(wrappers)),
            ],
            storage,
        }
    }

    pub fn with_handler(mut self, handler: Box<dyn ActionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Renders the job's action; `None` for rules without one.
    pub fn render(&self, job: &Job) -> Result<Option<RenderedAction>> {
        if job.rule.action == Action::None {
            return Ok(None);
        }
        let placeholders = Placeholders::for_job(job, &self.storage);
        match self.handlers.iter().find(|h| h.handles(&job.rule.action)) {
            Some(handler) => handler.render(job, &placeholders).map(Some),
            None => Err(WorkflowError::JobFailed {
                job: job.display_name(),
                reason: format!("no handler for action {:?}", job.rule.action),
            }),
        }
    }
}

/// Writes the job script into `dir`.
pub fn write_script(dir: &Path, job: &Job, body: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let script_path = dir.join(format!("job_{}.sh", job.id));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", body)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    debug!("Wrote script for {} to {}", job.display_name(), script_path.display());
    Ok(script_path)
}

/// Command running a script, inside its conda environment if it has one.
pub fn script_command(script: &Path, conda_env: Option<&str>, workdir: &Path) -> Result<Command> {
    Ok(match conda_env {
        Some(spec) => conda::run_in_env(&conda::env_name(spec, workdir)?, script),
        None => {
            let mut cmd = Command::new("bash");
            cmd.arg(script);
            cmd
        }
    })
}
