//! Sandbox record types persisted in the registry.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recorded lifecycle state of a sandbox.
///
/// This is what the registry says, not what the operating system observes;
/// see [`crate::reconcile::StatusReconciler`] for the latter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SandboxState {
    /// Returns true for the states in which a process handle must be recorded.
    pub fn has_process(&self) -> bool {
        !matches!(self, SandboxState::Stopped)
    }

    /// Returns the lowercase display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Stopped => "stopped",
            SandboxState::Starting => "starting",
            SandboxState::Running => "running",
            SandboxState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guest networking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// User-mode networking with a host port forward to the guest's sshd.
    #[default]
    User,
    /// No guest network interface.
    None,
}

/// How code moves between sandbox and host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Only on explicit `sync`.
    #[default]
    Manual,
    AutoCommit,
    AutoIdle,
}

/// Authentication used on the remote command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    #[default]
    PublicKey,
    Password,
}

/// Resources requested for the virtual machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// Guest memory in MiB.
    pub memory_mb: u32,
    /// Number of virtual CPUs.
    pub vcpu_count: u32,
    /// Expose hardware virtualization to the guest.
    #[serde(default)]
    pub nested_virtualization_enabled: bool,
    /// Guest networking.
    #[serde(default)]
    pub network_mode: NetworkMode,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            memory_mb: 4096,
            vcpu_count: 2,
            nested_virtualization_enabled: false,
            network_mode: NetworkMode::User,
        }
    }
}

/// Identity of a launched supervisor process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandle {
    pub pid: i32,
    /// Equal to `pid` for a supervisor launched in its own session.
    pub process_group_id: i32,
}

/// One sandbox as persisted in the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxRecord {
    /// Unique key; immutable after creation.
    pub name: String,
    pub state: SandboxState,
    /// Host project the workspace was cloned from.
    pub project_path: PathBuf,
    /// Host-side git clone that is pushed into the sandbox.
    pub workspace_path: PathBuf,
    /// Directory holding everything this sandbox owns on disk.
    pub state_dir: PathBuf,
    pub resource_spec: ResourceSpec,
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Present only while a supervisor process has been launched.
    #[serde(default)]
    pub process_handle: Option<ProcessHandle>,
    /// Host port forwarded to the guest's sshd.
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(default)]
    pub auth_mode: AuthMode,
    /// Output of the build collaborator, set after a successful build.
    #[serde(default)]
    pub runner_path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SandboxRecord {
    /// Returns true if the recorded state and process handle agree.
    pub fn is_consistent(&self) -> bool {
        self.state.has_process() == self.process_handle.is_some()
    }

    /// Records a launched supervisor and moves to `state`.
    pub fn attach_process(&mut self, handle: ProcessHandle, state: SandboxState) {
        debug_assert!(state.has_process());
        self.process_handle = Some(handle);
        self.state = state;
        self.touch();
    }

    /// Forgets the supervisor and marks the sandbox stopped.
    pub fn mark_stopped(&mut self) {
        self.process_handle = None;
        self.state = SandboxState::Stopped;
        self.touch();
    }

    /// Bumps the update timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Derives a sandbox name from a project directory.
///
/// Keeps ASCII alphanumerics, `-` and `_`; everything else becomes `-`.
pub fn derive_name(project_path: &std::path::Path) -> Option<String> {
    let base = project_path.file_name()?.to_string_lossy();
    let name: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let name = name.trim_matches('-').to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Returns true if `name` is safe to use as a directory and host name.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
