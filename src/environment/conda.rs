//! Conda/Micromamba Environment Management
//!
//! Jobs of rules with a `conda` entry run through `micromamba run`. The entry
//! is either the name of an existing environment or the path of an
//! environment file; file-based environments are named after a hash of the
//! file and created on first use.
//!
//! # Micromamba Resolution Priority
//!
//! 1. Next to the ruleforge executable
//! 2. Development path: `{project_root}/runtime/micromamba`
//! 3. System PATH

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;

use crate::errors::{Result, WorkflowError};

/// Lazily-initialized path to the micromamba binary.
pub static MICROMAMBA_PATH: Lazy<PathBuf> = Lazy::new(|| {
    let prod_path = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("micromamba")));
    if let Some(path) = prod_path.as_ref().filter(|p| p.exists()) {
        info!("Using bundled micromamba: {}", path.display());
        return path.clone();
    }

    let dev_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("runtime")
        .join("micromamba");
    if dev_path.exists() {
        info!("Using development micromamba: {}", dev_path.display());
        return dev_path;
    }

    if let Ok(output) = Command::new("which").arg("micromamba").output() {
        if output.status.success() {
            let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path_str.is_empty() {
                info!("Using system micromamba: {}", path_str);
                return PathBuf::from(path_str);
            }
        }
    }

    warn!("Micromamba binary not found; jobs with a conda environment will fail");
    PathBuf::from("micromamba")
});

/// Root prefix holding the environments created by ruleforge.
pub static MAMBA_ROOT_PREFIX: Lazy<PathBuf> = Lazy::new(|| {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    let prefix = PathBuf::from(home).join(".ruleforge").join("micromamba");

    if let Err(e) = fs::create_dir_all(&prefix) {
        warn!("Failed to create micromamba root prefix: {}", e);
    }
    debug!("Using micromamba root prefix: {}", prefix.display());
    prefix
});

fn micromamba_command() -> Command {
    let mut cmd = Command::new(&*MICROMAMBA_PATH);
    cmd.env("MAMBA_ROOT_PREFIX", &*MAMBA_ROOT_PREFIX);
    cmd
}

fn is_env_file(spec: &str) -> bool {
    spec.ends_with(".yaml") || spec.ends_with(".yml")
}

/// Name of the environment a rule's `conda` entry refers to.
pub fn env_name(spec: &str, workdir: &Path) -> Result<String> {
    if !is_env_file(spec) {
        return Ok(spec.to_string());
    }
    let content = fs::read(workdir.join(spec)).map_err(|e| {
        WorkflowError::Config(format!("Cannot read conda environment file '{}': {}", spec, e))
    })?;
    let hash = blake3::hash(&content).to_hex();
    Ok(format!("ruleforge-{}", &hash[..12]))
}

/// Checks whether a micromamba environment exists.
fn check_env(env_name: &str) -> Result<bool> {
    let output = micromamba_command().arg("env").arg("list").output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("Failed to list environments: {}", stderr);
        return Err(WorkflowError::Config(
            "Failed to list micromamba environments".to_string(),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .any(|line| matches!(line.split_whitespace().next(), Some(name) if name == env_name)))
}

/// Makes sure the environment for a `conda` entry exists and returns its
/// name. Named environments must already exist; environment files are
/// created if needed.
pub fn ensure_env(spec: &str, workdir: &Path) -> Result<String> {
    let name = env_name(spec, workdir)?;
    if check_env(&name)? {
        debug!("Environment '{}' already exists", name);
        return Ok(name);
    }
    if !is_env_file(spec) {
        return Err(WorkflowError::Config(format!(
            "Conda environment '{}' does not exist. Create it with: micromamba create -n {}",
            spec, spec
        )));
    }

    info!("Creating environment '{}' from {}", name, spec);
    let output = micromamba_command()
        .arg("create")
        .arg("-y")
        .arg("-n")
        .arg(&name)
        .arg("-f")
        .arg(workdir.join(spec))
        .output()?;

    if output.status.success() {
        info!("Successfully created environment '{}'", name);
        Ok(name)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("Failed to create environment '{}': {}", name, stderr);
        Err(WorkflowError::Config(format!(
            "Failed to create conda environment '{}'",
            name
        )))
    }
}

/// Command running `script` with bash inside an environment.
pub fn run_in_env(env_name: &str, script: &Path) -> Command {
    let mut cmd = micromamba_command();
    cmd.arg("run").arg("-n").arg(env_name).arg("bash").arg(script);
    cmd
}
