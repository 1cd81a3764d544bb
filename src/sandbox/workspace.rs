//! On-disk layout of a single sandbox.

use std::path::{Path, PathBuf};

use crate::config::AgentPaths;
use crate::error::{Error, Result};
use crate::git;

/// Directories and files owned by one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxDirs {
    /// Root of everything this sandbox owns.
    state_dir: PathBuf,
    /// Host-side git clone of the project.
    workspace: PathBuf,
}

impl SandboxDirs {
    /// Layout for `name` under the configuration root.
    pub fn for_name(paths: &AgentPaths, name: &str) -> Self {
        Self::at(paths.sandbox_dir(name))
    }

    /// Layout rooted at an existing state directory.
    pub fn at(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        let workspace = state_dir.join("workspace");
        Self {
            state_dir,
            workspace,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Output of the supervisor process.
    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("supervisor.log")
    }

    /// Directory holding only the generated virtual machine configuration;
    /// it is the root handed to `nix build`.
    pub fn vm_dir(&self) -> PathBuf {
        self.state_dir.join("vm")
    }

    /// Generated virtual machine configuration.
    pub fn flake_file(&self) -> PathBuf {
        self.vm_dir().join("flake.nix")
    }

    /// Creates the state directory and clones `project` into the workspace.
    ///
    /// Returns true if a fresh clone was made.
    pub fn create(&self, project: &Path) -> Result<bool> {
        std::fs::create_dir_all(&self.state_dir)?;
        git::clone_workspace(project, &self.workspace)
    }

    /// Removes every directory owned by the sandbox.
    pub fn remove(&self) -> Result<()> {
        if !self.state_dir.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&self.state_dir).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("failed to remove {}: {}", self.state_dir.display(), e),
            ))
        })?;
        tracing::info!(path = %self.state_dir.display(), "removed sandbox directories");
        Ok(())
    }
}
