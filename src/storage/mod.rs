//! File Storage Capability
//!
//! The engine never talks to a storage backend directly. Every existence or
//! timestamp query goes through [`Storage`], which answers local paths from
//! the filesystem and hands `scheme://` paths to a registered
//! [`StorageProvider`]. Remote files are staged under
//! `.ruleforge/remote/<scheme>/` so that actions only ever see local paths.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, info};

use crate::errors::{Result, WorkflowError};
use crate::workflow::metadata::METADATA_DIR;

/// Uniform handle to a remote storage backend.
pub trait StorageProvider: Send + Sync {
    /// URL scheme served by this provider, e.g. `s3`.
    fn scheme(&self) -> &str;

    fn exists(&self, path: &str) -> Result<bool>;

    /// Modification time, or `None` if the file does not exist.
    fn mtime(&self, path: &str) -> Result<Option<SystemTime>>;

    /// Copies the remote file to `local`.
    fn fetch(&self, path: &str, local: &Path) -> Result<()>;

    /// Copies `local` to the remote location.
    fn upload(&self, local: &Path, path: &str) -> Result<()>;
}

/// Serves `file://` paths from the local filesystem, for workflows that keep
/// shared data outside the working directory.
#[derive(Debug, Clone, Default)]
pub struct FileProvider;

impl FileProvider {
    fn target(path: &str) -> &Path {
        Path::new(path.strip_prefix("file://").unwrap_or(path))
    }
}

impl StorageProvider for FileProvider {
    fn scheme(&self) -> &str {
        "file"
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(Self::target(path).exists())
    }

    fn mtime(&self, path: &str) -> Result<Option<SystemTime>> {
        match fs::metadata(Self::target(path)) {
            Ok(meta) => Ok(Some(meta.modified()?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn fetch(&self, path: &str, local: &Path) -> Result<()> {
        fs::copy(Self::target(path), local).map_err(|e| WorkflowError::Storage {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    fn upload(&self, local: &Path, path: &str) -> Result<()> {
        let target = Self::target(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(local, target).map_err(|e| WorkflowError::Storage {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }
}

/// Resolves file queries for one working directory.
#[derive(Clone)]
pub struct Storage {
    workdir: PathBuf,
    providers: Vec<Arc<dyn StorageProvider>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("workdir", &self.workdir)
            .field(
                "providers",
                &self.providers.iter().map(|p| p.scheme().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn split_scheme(path: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = path.split_once("://")?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
        return None;
    }
    Some((scheme, rest))
}

impl Storage {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            providers: Vec::new(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn provider_for(&self, path: &str) -> Result<Option<&dyn StorageProvider>> {
        let Some((scheme, _)) = split_scheme(path) else {
            return Ok(None);
        };
        self.providers
            .iter()
            .find(|p| p.scheme() == scheme)
            .map(|p| Some(p.as_ref()))
            .ok_or_else(|| WorkflowError::Storage {
                path: path.to_string(),
                message: format!("no storage provider registered for scheme '{}'", scheme),
            })
    }

    pub fn is_remote(&self, path: &Path) -> bool {
        split_scheme(&path.to_string_lossy()).is_some()
    }

    /// Where the file lives on the local filesystem.
    pub fn local_path(&self, path: &Path) -> PathBuf {
        let text = path.to_string_lossy();
        match split_scheme(&text) {
            Some((scheme, rest)) => self
                .workdir
                .join(METADATA_DIR)
                .join("remote")
                .join(scheme)
                .join(rest.trim_start_matches('/')),
            None => self.workdir.join(path),
        }
    }

    /// Path as seen from inside the working directory (what actions use).
    pub fn action_path(&self, path: &Path) -> PathBuf {
        if self.is_remote(path) {
            let local = self.local_path(path);
            local
                .strip_prefix(&self.workdir)
                .map(Path::to_path_buf)
                .unwrap_or(local)
        } else {
            path.to_path_buf()
        }
    }

    pub fn exists(&self, path: &Path) -> Result<bool> {
        let text = path.to_string_lossy();
        match self.provider_for(&text)? {
            Some(provider) => provider.exists(&text),
            None => Ok(self.local_path(path).exists()),
        }
    }

    /// Modification time, or `None` if the file is missing.
    pub fn mtime(&self, path: &Path) -> Result<Option<SystemTime>> {
        let text = path.to_string_lossy();
        match self.provider_for(&text)? {
            Some(provider) => provider.mtime(&text),
            None => match fs::metadata(self.local_path(path)) {
                Ok(meta) => Ok(Some(meta.modified()?)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Stages remote inputs locally. Local inputs are left untouched.
    pub fn fetch_inputs(&self, inputs: &[PathBuf]) -> Result<()> {
        for input in inputs {
            let text = input.to_string_lossy();
            if let Some(provider) = self.provider_for(&text)? {
                let local = self.local_path(input);
                if let Some(parent) = local.parent() {
                    fs::create_dir_all(parent)?;
                }
                info!("Fetching {} to {}", text, local.display());
                provider.fetch(&text, &local)?;
            }
        }
        Ok(())
    }

    /// Uploads remote outputs from their staging location.
    pub fn upload_outputs(&self, outputs: &[PathBuf]) -> Result<()> {
        for output in outputs {
            let text = output.to_string_lossy();
            if let Some(provider) = self.provider_for(&text)? {
                let local = self.local_path(output);
                debug!("Uploading {} to {}", local.display(), text);
                provider.upload(&local, &text)?;
            }
        }
        Ok(())
    }
}
