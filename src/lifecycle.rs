//! Sandbox lifecycle: start, stop and destroy.
//!
//! The controller is the only component that launches or kills supervisor
//! processes and therefore the only one that changes port occupancy. Every
//! persisted record keeps the invariant that a process handle is present
//! exactly when the state is not `Stopped`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::AgentConfig;
use crate::error::{tail_lines, Error, Result};
use crate::git;
use crate::process::{self, KillProtocol};
use crate::provision::{self, Provisioner};
use crate::reconcile::StatusReconciler;
use crate::remote::RemoteExecutor;
use crate::retry::RetryPolicy;
use crate::sandbox::{
    derive_name, is_valid_name, AuthMode, ProcessHandle, ResourceSpec, Registry, SandboxDirs,
    SandboxRecord, SandboxState, SyncMode,
};
use crate::sync::{SyncEngine, SyncOptions};

/// Parameters for [`LifecycleController::start`].
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Explicit name; derived from the project directory when absent.
    pub name: Option<String>,
    pub project_path: PathBuf,
    /// Overrides the configured default resources.
    pub resources: Option<ResourceSpec>,
    pub sync_mode: Option<SyncMode>,
    pub auth_mode: Option<AuthMode>,
    /// Tear down any existing sandbox of the same name first.
    pub fresh: bool,
}

/// Result of a successful start.
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub record: SandboxRecord,
    /// The remote channel accepted connections within the readiness window.
    pub ready: bool,
    /// The workspace was copied into the sandbox.
    pub workspace_pushed: bool,
}

/// Result of a stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running and nothing was recorded as running.
    AlreadyStopped,
    /// The recorded supervisor had died; leftovers were cleaned up.
    Reclaimed,
    /// A running sandbox was shut down.
    Stopped { graceful: bool },
}

/// Result of a destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    Destroyed { directories_removed: bool },
    /// The confirmation callback declined.
    Cancelled,
}

/// Orchestrates sandbox start, stop and destroy.
pub struct LifecycleController {
    registry: Registry,
    config: AgentConfig,
    reconciler: StatusReconciler,
    remote: Arc<dyn RemoteExecutor>,
    provisioner: Arc<dyn Provisioner>,
    kill: KillProtocol,
}

impl LifecycleController {
    pub fn new(
        registry: Registry,
        config: AgentConfig,
        remote: Arc<dyn RemoteExecutor>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            reconciler: StatusReconciler::new(registry.clone()),
            kill: KillProtocol::from_timing(&config.timing),
            registry,
            config,
            remote,
            provisioner,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// A sync engine sharing this controller's registry and channel.
    pub fn sync_engine(&self) -> SyncEngine {
        SyncEngine::new(
            self.registry.clone(),
            self.config.clone(),
            Arc::clone(&self.remote),
        )
    }

    /// Resolves the sandbox name for `request`.
    fn resolve_name(request: &StartRequest, project: &std::path::Path) -> Result<String> {
        let name = match &request.name {
            Some(name) => name.clone(),
            None => derive_name(project)
                .ok_or_else(|| Error::InvalidName(project.display().to_string()))?,
        };
        if !is_valid_name(&name) {
            return Err(Error::InvalidName(name));
        }
        Ok(name)
    }

    /// Starts (or restarts) a sandbox for a project.
    pub async fn start(&self, request: StartRequest) -> Result<StartReport> {
        if !git::is_git_repository(&request.project_path) {
            return Err(Error::NotAGitRepository(request.project_path.clone()));
        }
        let project = request.project_path.canonicalize()?;
        let name = Self::resolve_name(&request, &project)?;

        let mut existing = match self.registry.get(&name)? {
            Some(_) => Some(self.reconciler.reconcile(&name)?),
            None => None,
        };

        if let Some(record) = &existing {
            if record.state == SandboxState::Running && !request.fresh {
                return Err(Error::AlreadyRunning(name));
            }
        }
        // Leftovers of a crashed supervisor must not outlive the record.
        if let Some(record) = existing.as_mut().filter(|r| r.state == SandboxState::Stopping) {
            if let Some(handle) = record.process_handle {
                tracing::info!(name = %name, "reclaiming leftovers of a crashed sandbox");
                self.teardown(record, &handle).await?;
            }
        }

        if request.fresh {
            if let Some(record) = existing.take() {
                tracing::info!(name = %name, "removing existing sandbox for fresh start");
                if record.state != SandboxState::Stopped {
                    self.stop(&name, false).await?;
                }
                SandboxDirs::at(&record.state_dir).remove()?;
                self.registry.remove(&name)?;
            }
        }

        let dirs = SandboxDirs::for_name(self.registry.paths(), &name);
        if dirs.create(&project)? {
            tracing::info!(name = %name, workspace = %dirs.workspace().display(), "created workspace");
        } else {
            let head = git::refresh_workspace(&project, dirs.workspace())?;
            tracing::info!(name = %name, head = %head, "refreshed workspace from project");
        }

        let mut record = self.prepare_record(&name, &project, &dirs, &request, existing)?;
        self.registry.put(&name, record.clone())?;

        let runner = self.provisioner.build(&record).await?;
        record.runner_path = Some(runner.clone());
        record.touch();
        self.registry.put(&name, record.clone())?;

        let handle = process::launch_supervisor(
            &provision::run_script(&runner),
            dirs.state_dir(),
            &dirs.log_file(),
        )?;
        record.attach_process(handle, SandboxState::Starting);
        self.registry.put(&name, record.clone())?;

        let ready = self.wait_until_ready(&record).await;
        if !process::process_alive(handle.pid) {
            return Err(self.abort_start(record, &dirs).await);
        }
        if !ready {
            tracing::warn!(
                name = %name,
                port = record.ssh_port,
                "sandbox did not accept connections in time; it may still be booting"
            );
        }

        record.state = SandboxState::Running;
        record.touch();
        self.registry.put(&name, record.clone())?;
        tracing::info!(name = %name, pid = handle.pid, port = record.ssh_port, "sandbox running");

        let workspace_pushed = self.push_workspace(&record, &dirs).await;

        Ok(StartReport {
            record,
            ready,
            workspace_pushed,
        })
    }

    /// Builds the record to persist before provisioning.
    fn prepare_record(
        &self,
        name: &str,
        project: &std::path::Path,
        dirs: &SandboxDirs,
        request: &StartRequest,
        existing: Option<SandboxRecord>,
    ) -> Result<SandboxRecord> {
        let taken: HashSet<u16> = self
            .registry
            .list_all()?
            .into_values()
            .filter(|other| other.name != name)
            .map(|other| other.ssh_port)
            .collect();

        let mut record = match existing {
            Some(mut record) => {
                if taken.contains(&record.ssh_port) || !process::port_is_free(record.ssh_port) {
                    let port = process::allocate_port(self.config.ssh.base_port, &taken)?;
                    tracing::info!(name, old = record.ssh_port, new = port, "sandbox port reassigned");
                    record.ssh_port = port;
                }
                record.project_path = project.to_path_buf();
                record
            }
            None => {
                let now = chrono::Utc::now();
                SandboxRecord {
                    name: name.to_string(),
                    state: SandboxState::Stopped,
                    project_path: project.to_path_buf(),
                    workspace_path: dirs.workspace().to_path_buf(),
                    state_dir: dirs.state_dir().to_path_buf(),
                    resource_spec: self.config.default_resources(),
                    sync_mode: self.config.defaults.sync_mode,
                    process_handle: None,
                    ssh_port: process::allocate_port(self.config.ssh.base_port, &taken)?,
                    ssh_user: self.config.ssh.user.clone(),
                    auth_mode: self.config.defaults.auth_mode,
                    runner_path: None,
                    created_at: now,
                    updated_at: now,
                }
            }
        };

        if let Some(resources) = &request.resources {
            record.resource_spec = resources.clone();
        }
        if let Some(sync_mode) = request.sync_mode {
            record.sync_mode = sync_mode;
        }
        if let Some(auth_mode) = request.auth_mode {
            record.auth_mode = auth_mode;
        }
        record.mark_stopped();
        Ok(record)
    }

    /// Polls the remote channel's port. Returns early if the supervisor dies.
    async fn wait_until_ready(&self, record: &SandboxRecord) -> bool {
        let Some(handle) = record.process_handle else {
            return false;
        };
        let connect = self.config.ssh.connect_timeout();
        let port = record.ssh_port;

        let settled = self
            .config
            .timing
            .readiness()
            .poll_until(|| async move {
                !process::process_alive(handle.pid) || process::port_accepts(port, connect).await
            })
            .await;
        settled && process::process_alive(handle.pid)
    }

    /// Cleans up after a supervisor that exited during boot.
    async fn abort_start(&self, mut record: SandboxRecord, dirs: &SandboxDirs) -> Error {
        if let Err(e) = self.kill.run(record.process_handle.as_ref(), record.ssh_port).await {
            tracing::warn!(name = %record.name, error = %e, "cleanup after failed boot was incomplete");
        }
        record.mark_stopped();
        if let Err(e) = self.registry.put(&record.name.clone(), record.clone()) {
            tracing::error!(name = %record.name, error = %e, "failed to persist stopped state");
        }

        let log = std::fs::read_to_string(dirs.log_file()).unwrap_or_default();
        Error::SupervisorLaunch(format!(
            "supervisor for '{}' exited during boot\n{}",
            record.name,
            tail_lines(log.trim_end(), self.config.provision.diagnostic_lines)
        ))
    }

    /// Copies the host workspace into the sandbox, retrying while the
    /// channel comes up.
    async fn push_workspace(&self, record: &SandboxRecord, dirs: &SandboxDirs) -> bool {
        let guest = self.config.guest.workspace.as_str();
        let result = self
            .config
            .timing
            .push()
            .retry(|attempt| async move {
                tracing::debug!(name = %record.name, attempt, "pushing workspace");
                self.remote.push_dir(record, dirs.workspace(), guest).await
            })
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    name = %record.name,
                    error = %e,
                    "failed to push workspace into sandbox; run start again once it is reachable"
                );
                false
            }
        }
    }

    /// Stops a sandbox. Succeeds without doing anything if it is not running.
    pub async fn stop(&self, name: &str, sync_first: bool) -> Result<StopOutcome> {
        let recorded = self.registry.require(name)?;
        let mut record = self.reconciler.reconcile(name)?;

        if record.state == SandboxState::Stopped {
            if recorded.state == SandboxState::Stopped {
                tracing::debug!(name, "sandbox already stopped");
                return Ok(StopOutcome::AlreadyStopped);
            }
            // Crashed supervisor: an orphan outside its group may hold the port.
            tracing::info!(name, "sandbox supervisor is gone; reclaiming its port");
            self.kill
                .run(recorded.process_handle.as_ref(), recorded.ssh_port)
                .await?;
            return Ok(StopOutcome::Reclaimed);
        }

        let Some(handle) = record.process_handle else {
            return Err(Error::NotRunning(name.to_string()));
        };

        if !StatusReconciler::is_actually_running(&record) {
            tracing::info!(
                name,
                pgid = handle.process_group_id,
                "sandbox supervisor is gone; reclaiming its leftovers"
            );
            self.teardown(&mut record, &handle).await?;
            return Ok(StopOutcome::Reclaimed);
        }

        if sync_first {
            match self.sync_engine().sync(name, SyncOptions::default()).await {
                Ok(report) => {
                    tracing::info!(name, commits = report.commits.len(), "synced before stop")
                }
                Err(Error::NoChanges { .. }) => tracing::debug!(name, "nothing to sync before stop"),
                Err(e) => tracing::warn!(name, error = %e, "sync before stop failed; stopping anyway"),
            }
        }

        record.state = SandboxState::Stopping;
        record.touch();
        self.registry.put(name, record.clone())?;

        let graceful = self.graceful_shutdown(&record).await;
        self.teardown(&mut record, &handle).await?;

        tracing::info!(name, graceful, "sandbox stopped");
        Ok(StopOutcome::Stopped { graceful })
    }

    /// Runs the kill protocol against `handle` and marks the record stopped
    /// once the group is gone.
    async fn teardown(&self, record: &mut SandboxRecord, handle: &ProcessHandle) -> Result<()> {
        let group_gone = self.kill.run(Some(handle), record.ssh_port).await;
        match group_gone {
            Ok(true) | Err(Error::PortStillBound(_)) => {
                record.mark_stopped();
                self.registry.put(&record.name.clone(), record.clone())?;
            }
            Ok(false) | Err(_) => {}
        }
        if !group_gone? {
            tracing::error!(
                name = %record.name,
                pgid = handle.process_group_id,
                "process group survived SIGKILL"
            );
            return Err(Error::SandboxBusy(record.name.clone()));
        }
        Ok(())
    }

    /// Runs the supervisor's shutdown operation, if any, and waits for the
    /// supervisor to exit. Returns true if it exited.
    async fn graceful_shutdown(&self, record: &SandboxRecord) -> bool {
        let (Some(runner), Some(handle)) = (&record.runner_path, record.process_handle) else {
            return false;
        };
        let script = provision::shutdown_script(runner);
        if !script.exists() {
            return false;
        }

        let limit = self.config.timing.graceful_shutdown();
        let outcome = tokio::time::timeout(
            limit,
            tokio::process::Command::new(&script)
                .current_dir(&record.state_dir)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;
        match outcome {
            Ok(Ok(status)) if status.success() => {}
            Ok(Ok(status)) => {
                tracing::warn!(name = %record.name, %status, "shutdown operation failed");
                return false;
            }
            Ok(Err(e)) => {
                tracing::warn!(name = %record.name, error = %e, "cannot run shutdown operation");
                return false;
            }
            Err(_) => {
                tracing::warn!(name = %record.name, "shutdown operation timed out");
                return false;
            }
        }

        let interval = Duration::from_millis(500);
        let attempts = (limit.as_millis() / interval.as_millis()).max(1) as u32;
        RetryPolicy::new(attempts, interval)
            .poll_until(|| {
                let gone = !process::handle_alive(&handle);
                async move { gone }
            })
            .await
    }

    /// Removes a sandbox's directories and registry entry.
    ///
    /// A sandbox that is not stopped needs `force`, in which case its group
    /// and port are torn down first. `confirm` is consulted unless `force`
    /// is set.
    pub async fn destroy<F>(&self, name: &str, force: bool, confirm: F) -> Result<DestroyOutcome>
    where
        F: FnOnce(&SandboxRecord) -> bool,
    {
        let record = self.reconciler.reconcile(name)?;

        if !force && record.state != SandboxState::Stopped {
            return Err(Error::SandboxBusy(name.to_string()));
        }
        if !force && !confirm(&record) {
            return Ok(DestroyOutcome::Cancelled);
        }

        if record.state != SandboxState::Stopped {
            tracing::warn!(name, state = %record.state, "killing sandbox before destroy");
            if let Err(e) = self
                .kill
                .run(record.process_handle.as_ref(), record.ssh_port)
                .await
            {
                tracing::warn!(name, error = %e, "kill before destroy was incomplete");
            }
        }

        let directories_removed = match SandboxDirs::at(&record.state_dir).remove() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(name, error = %e, "failed to remove sandbox directories");
                false
            }
        };
        self.registry.remove(name)?;

        tracing::info!(name, directories_removed, "sandbox destroyed");
        Ok(DestroyOutcome::Destroyed {
            directories_removed,
        })
    }

    /// Reconciled record for `name`.
    pub fn status(&self, name: &str) -> Result<SandboxRecord> {
        self.reconciler.reconcile(name)
    }

    /// Every reconciled record, in name order.
    pub fn list(&self) -> Result<Vec<SandboxRecord>> {
        self.reconciler.reconcile_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_name_must_be_valid() {
        let request = StartRequest {
            name: Some("bad name".into()),
            project_path: PathBuf::from("/src/proj"),
            ..Default::default()
        };
        assert!(matches!(
            LifecycleController::resolve_name(&request, &request.project_path),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn name_is_derived_from_project_directory() {
        let request = StartRequest {
            project_path: PathBuf::from("/src/My Project"),
            ..Default::default()
        };
        assert_eq!(
            LifecycleController::resolve_name(&request, &request.project_path).unwrap(),
            "my-project"
        );
    }
}
