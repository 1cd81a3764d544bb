//! SSH transport to `localhost:<sshPort>`.
//!
//! The guest is only reachable through a localhost port forward, so host key
//! checking is disabled and no known-hosts entries are written. Password auth
//! goes through `sshpass -e` with the password in `SSHPASS`.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{quote_argv, ExecOutput, RemoteCommand, RemoteExecutor};
use crate::config::AgentConfig;
use crate::error::{tail_lines, Error, Result};
use crate::git::GitRemote;
use crate::sandbox::{AuthMode, SandboxRecord};
use crate::tokens::TokenSet;

/// Exit status ssh uses for its own failures.
const SSH_FAILURE: i32 = 255;

/// Options that skip host identity checks for the localhost forward.
const TRUST_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
];

/// Remote executor over the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    password: String,
    connect_timeout: Duration,
    command_timeout: Duration,
    transfer_timeout: Duration,
}

impl SshExecutor {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            password: config.ssh.password.clone(),
            connect_timeout: config.ssh.connect_timeout(),
            command_timeout: config.timing.command_timeout(),
            transfer_timeout: config.timing.transfer_timeout(),
        }
    }

    /// ssh options for `record`, without program name or destination.
    pub fn options(&self, record: &SandboxRecord) -> Vec<String> {
        let mut args: Vec<String> = TRUST_OPTIONS.iter().map(|s| s.to_string()).collect();
        args.push("-o".into());
        args.push(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        match record.auth_mode {
            AuthMode::PublicKey => {
                args.push("-o".into());
                args.push("BatchMode=yes".into());
            }
            AuthMode::Password => {
                args.push("-o".into());
                args.push("PreferredAuthentications=password,keyboard-interactive".into());
                args.push("-o".into());
                args.push("PubkeyAuthentication=no".into());
            }
        }
        args
    }

    fn destination(record: &SandboxRecord) -> String {
        format!("{}@localhost", record.ssh_user)
    }

    /// Program and leading arguments: `ssh`, or `sshpass -e ssh`.
    fn program(&self, record: &SandboxRecord) -> (String, Vec<String>) {
        match record.auth_mode {
            AuthMode::PublicKey => ("ssh".to_string(), Vec::new()),
            AuthMode::Password => ("sshpass".to_string(), vec!["-e".into(), "ssh".into()]),
        }
    }

    /// Full argument vector (after the program) running `remote` in the guest.
    pub fn command_args(&self, record: &SandboxRecord, remote: &str) -> Vec<String> {
        let (_, mut args) = self.program(record);
        args.extend(self.options(record));
        args.push("-p".into());
        args.push(record.ssh_port.to_string());
        args.push(Self::destination(record));
        args.push(remote.to_string());
        args
    }

    fn command(&self, record: &SandboxRecord, remote: &str) -> Command {
        let (program, _) = self.program(record);
        let mut cmd = Command::new(program);
        cmd.args(self.command_args(record, remote))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if record.auth_mode == AuthMode::Password {
            cmd.env("SSHPASS", &self.password);
        }
        cmd
    }

    /// Blocking command for an interactive login shell with `tokens` exported.
    ///
    /// The caller is expected to replace its process with it.
    pub fn attach_command(&self, record: &SandboxRecord, tokens: &TokenSet) -> std::process::Command {
        let (program, mut args) = self.program(record);
        args.push("-t".into());
        args.extend(self.options(record));
        args.push("-p".into());
        args.push(record.ssh_port.to_string());
        args.push(Self::destination(record));
        args.push(format!("{}exec $SHELL -l", tokens.export_prefix()));

        let mut cmd = std::process::Command::new(program);
        cmd.args(args);
        if record.auth_mode == AuthMode::Password {
            cmd.env("SSHPASS", &self.password);
        }
        cmd
    }

    fn unreachable_error(record: &SandboxRecord, stderr: &str) -> Error {
        Error::RemoteUnreachable(format!(
            "{}@localhost:{}: {}",
            record.ssh_user,
            record.ssh_port,
            tail_lines(stderr.trim(), 5)
        ))
    }

    /// Runs `producer | consumer`, failing if either side fails.
    async fn pipe(
        &self,
        record: &SandboxRecord,
        mut producer: Command,
        mut consumer: Command,
        remote_is_producer: bool,
    ) -> Result<()> {
        producer.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut upstream = producer.spawn()?;
        let stdout = upstream
            .stdout
            .take()
            .ok_or_else(|| Error::Io(std::io::Error::other("producer stdout not captured")))?;
        let stdin: Stdio = stdout.try_into()?;

        consumer.stdin(stdin).stdout(Stdio::null()).stderr(Stdio::piped());
        let downstream = consumer.spawn()?;

        let both = async {
            let (up, down) = tokio::join!(upstream.wait_with_output(), downstream.wait_with_output());
            Ok::<_, std::io::Error>((up?, down?))
        };
        let (up, down) = tokio::time::timeout(self.transfer_timeout, both)
            .await
            .map_err(|_| {
                Error::RemoteUnreachable(format!(
                    "transfer to port {} timed out after {}s",
                    record.ssh_port,
                    self.transfer_timeout.as_secs()
                ))
            })??;

        let (remote, local) = if remote_is_producer {
            (&up, &down)
        } else {
            (&down, &up)
        };
        if remote.status.code() == Some(SSH_FAILURE) {
            return Err(Self::unreachable_error(
                record,
                &String::from_utf8_lossy(&remote.stderr),
            ));
        }
        for output in [remote, local] {
            if !output.status.success() {
                return Err(Error::Io(std::io::Error::other(format!(
                    "transfer failed: {}",
                    tail_lines(String::from_utf8_lossy(&output.stderr).trim(), 5)
                ))));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, record: &SandboxRecord, command: &RemoteCommand) -> Result<ExecOutput> {
        let mut cmd = self.command(record, &command.to_shell());
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let limit = self.command_timeout;

        let child = cmd.spawn()?;
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| {
                Error::RemoteUnreachable(format!(
                    "command on port {} timed out after {}s",
                    record.ssh_port,
                    limit.as_secs()
                ))
            })??;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = command
            .tokens()
            .redact(&String::from_utf8_lossy(&output.stderr));
        if exit_code == SSH_FAILURE {
            return Err(Self::unreachable_error(record, &stderr));
        }

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }

    async fn push_dir(&self, record: &SandboxRecord, local: &Path, remote_dir: &str) -> Result<()> {
        let mut tar = Command::new("tar");
        tar.arg("-C").arg(local).args(["-cf", "-", "."]).kill_on_drop(true);

        let quoted = quote_argv(&[remote_dir]);
        let unpack = self.command(
            record,
            &format!("mkdir -p {q} && tar -C {q} -xf -", q = quoted),
        );

        self.pipe(record, tar, unpack, false).await?;
        tracing::info!(
            name = %record.name,
            local = %local.display(),
            remote = remote_dir,
            "pushed directory into sandbox"
        );
        Ok(())
    }

    async fn pull_dir(
        &self,
        record: &SandboxRecord,
        remote_path: &str,
        local_parent: &Path,
    ) -> Result<()> {
        let remote = Path::new(remote_path);
        let (parent, base) = match (remote.parent(), remote.file_name()) {
            (Some(parent), Some(base)) => (parent, base),
            _ => {
                return Err(Error::Config(format!(
                    "cannot pull '{}': not a directory path",
                    remote_path
                )))
            }
        };

        let pack = self.command(
            record,
            &quote_argv(&[
                "tar",
                "-C",
                &parent.to_string_lossy(),
                "-cf",
                "-",
                &base.to_string_lossy(),
            ]),
        );

        std::fs::create_dir_all(local_parent)?;
        let mut untar = Command::new("tar");
        untar.arg("-C").arg(local_parent).args(["-xf", "-"]).kill_on_drop(true);

        self.pipe(record, pack, untar, true).await?;
        tracing::info!(
            name = %record.name,
            remote = remote_path,
            local = %local_parent.display(),
            "pulled directory from sandbox"
        );
        Ok(())
    }

    fn git_remote(&self, record: &SandboxRecord, remote_repo: &str) -> GitRemote {
        let (program, mut args) = self.program(record);
        args.extend(self.options(record));
        let ssh_command = std::iter::once(program)
            .chain(args)
            .collect::<Vec<_>>()
            .join(" ");

        let env = match record.auth_mode {
            AuthMode::Password => vec![("SSHPASS".to_string(), self.password.clone())],
            AuthMode::PublicKey => Vec::new(),
        };

        GitRemote {
            url: format!(
                "ssh://{}@localhost:{}{}",
                record.ssh_user, record.ssh_port, remote_repo
            ),
            ssh_command: Some(ssh_command),
            env,
        }
    }
}
