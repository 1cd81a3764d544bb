//! Shared fixtures for integration tests.
//!
//! Sandboxes here are ordinary host processes: the provisioner writes shell
//! scripts as the runner, and the remote channel runs commands on the host
//! against a directory standing in for the guest workspace.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use keystone_agent::config::AgentConfig;
use keystone_agent::git::GitRemote;
use keystone_agent::tokens::FORWARDABLE_TOKENS;
use keystone_agent::{
    AgentPaths, Error, ExecOutput, LifecycleController, Provisioner, Registry, RemoteCommand,
    RemoteExecutor, Result, SandboxRecord, StartRequest,
};

/// Helper to create a temp git repo with one commit on `main`.
pub fn create_temp_git_repo() -> TempDir {
    let temp_dir = TempDir::new().expect("failed to create temp dir");

    for args in [
        vec!["init", "-b", "main"],
        vec!["config", "user.email", "test@test.com"],
        vec!["config", "user.name", "Test User"],
    ] {
        Command::new("git")
            .args(&args)
            .current_dir(temp_dir.path())
            .output()
            .expect("failed to set up git repo");
    }

    std::fs::write(temp_dir.path().join("README.md"), "# Test\n").expect("failed to write readme");
    commit_file(temp_dir.path(), "README.md", "# Test\n", "initial");

    temp_dir
}

/// Writes `file` and commits it with a fixed identity.
pub fn commit_file(repo: &Path, file: &str, content: &str, message: &str) {
    std::fs::write(repo.join(file), content).expect("failed to write file");
    let add = Command::new("git")
        .args(["add", "-A"])
        .current_dir(repo)
        .output()
        .expect("failed to stage");
    assert!(add.status.success());

    let commit = Command::new("git")
        .args([
            "-c",
            "user.name=Test User",
            "-c",
            "user.email=test@test.com",
            "commit",
            "-q",
            "-m",
            message,
        ])
        .current_dir(repo)
        .output()
        .expect("failed to commit");
    assert!(
        commit.status.success(),
        "commit failed: {}",
        String::from_utf8_lossy(&commit.stderr)
    );
}

pub fn head(repo: &Path) -> String {
    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(repo)
        .output()
        .expect("failed to rev-parse");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A port nobody is listening on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("failed to find a free port")
}

/// Runs "remote" commands on the host.
pub struct LocalExecutor;

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    async fn run(&self, _record: &SandboxRecord, command: &RemoteCommand) -> Result<ExecOutput> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command.to_shell()).stdin(Stdio::null());
        for name in FORWARDABLE_TOKENS {
            cmd.env_remove(name);
        }
        let output = cmd.output().await?;
        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn push_dir(&self, record: &SandboxRecord, local: &Path, remote_dir: &str) -> Result<()> {
        let script = format!(
            "mkdir -p {dest} && cp -a {src}/. {dest}/",
            src = local.display(),
            dest = remote_dir
        );
        let output = self.run(record, &RemoteCommand::shell(script)).await?;
        if !output.success() {
            return Err(Error::RemoteUnreachable(output.stderr));
        }
        Ok(())
    }

    async fn pull_dir(
        &self,
        record: &SandboxRecord,
        remote_path: &str,
        local_parent: &Path,
    ) -> Result<()> {
        let script = format!("cp -a {} {}/", remote_path, local_parent.display());
        let output = self.run(record, &RemoteCommand::shell(script)).await?;
        if !output.success() {
            return Err(Error::RemoteUnreachable(output.stderr));
        }
        Ok(())
    }

    fn git_remote(&self, _record: &SandboxRecord, remote_repo: &str) -> GitRemote {
        GitRemote::local(remote_repo)
    }
}

/// Writes shell scripts as the runner instead of building a virtual machine.
pub struct FakeProvisioner {
    runner_root: PathBuf,
    supervisor: String,
    shutdown: Option<String>,
}

impl FakeProvisioner {
    /// A supervisor that sleeps until killed.
    pub fn sleeper(runner_root: &Path) -> Self {
        Self::with_script(runner_root, "exec sleep 300")
    }

    /// A supervisor running `body` under `/bin/sh`; `{port}` is replaced
    /// with the sandbox's port.
    pub fn with_script(runner_root: &Path, body: &str) -> Self {
        Self {
            runner_root: runner_root.to_path_buf(),
            supervisor: body.to_string(),
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, body: &str) -> Self {
        self.shutdown = Some(body.to_string());
        self
    }
}

fn write_script(path: &Path, body: &str) -> std::io::Result<()> {
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn build(&self, record: &SandboxRecord) -> Result<PathBuf> {
        let runner = self.runner_root.join(&record.name);
        let bin = runner.join("bin");
        std::fs::create_dir_all(&bin)?;
        let supervisor = self
            .supervisor
            .replace("{port}", &record.ssh_port.to_string());
        write_script(&bin.join("microvm-run"), &supervisor)?;
        if let Some(shutdown) = &self.shutdown {
            write_script(&bin.join("microvm-shutdown"), shutdown)?;
        }
        Ok(runner)
    }
}

/// A configuration root, a guest stand-in and a runner directory.
pub struct TestEnv {
    pub root: TempDir,
    pub guest: TempDir,
    pub runners: TempDir,
    pub config: AgentConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        let root = TempDir::new().expect("failed to create root");
        let guest = TempDir::new().expect("failed to create guest dir");
        let runners = TempDir::new().expect("failed to create runner dir");

        let mut config = AgentConfig::default();
        config.ssh.base_port = free_port();
        config.ssh.connect_timeout_secs = 1;
        config.guest.workspace = guest.path().join("workspace").display().to_string();
        config.timing.readiness_attempts = 2;
        config.timing.readiness_interval_ms = 50;
        config.timing.kill_attempts = 10;
        config.timing.kill_interval_ms = 100;
        config.timing.graceful_shutdown_secs = 5;
        config.timing.port_verify_timeout_ms = 500;
        config.timing.port_verify_interval_ms = 50;
        config.timing.push_attempts = 2;
        config.timing.push_interval_ms = 50;
        config.sync.artifact_dirs = vec!["target".to_string(), "dist".to_string()];

        Self {
            root,
            guest,
            runners,
            config,
        }
    }

    /// The stand-in for the guest workspace.
    pub fn guest_workspace(&self) -> PathBuf {
        PathBuf::from(&self.config.guest.workspace)
    }

    pub fn registry(&self) -> Registry {
        Registry::new(AgentPaths::new(self.root.path()))
    }

    pub fn controller(&self) -> LifecycleController {
        self.controller_with(FakeProvisioner::sleeper(self.runners.path()))
    }

    pub fn controller_with(&self, provisioner: FakeProvisioner) -> LifecycleController {
        LifecycleController::new(
            self.registry(),
            self.config.clone(),
            Arc::new(LocalExecutor),
            Arc::new(provisioner),
        )
    }

    pub fn request(project: &Path, name: &str) -> StartRequest {
        StartRequest {
            name: Some(name.to_string()),
            project_path: project.to_path_buf(),
            ..Default::default()
        }
    }
}
