//! Remote command channel into a running sandbox.
//!
//! [`RemoteExecutor`] is the seam between the lifecycle and sync logic and
//! whatever transport reaches the guest. [`SshExecutor`] is the production
//! implementation over `localhost:<sshPort>`.

mod ssh;

pub use ssh::SshExecutor;

use std::borrow::Cow;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::git::GitRemote;
use crate::sandbox::SandboxRecord;
use crate::tokens::TokenSet;

/// Result of a command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A shell command line to run inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct RemoteCommand {
    script: String,
    tokens: TokenSet,
}

impl RemoteCommand {
    /// Runs `argv` with every argument shell-quoted.
    pub fn argv<S: AsRef<str>>(argv: &[S]) -> Self {
        Self::shell(quote_argv(argv))
    }

    /// Runs `script` as-is through the guest's shell.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            ..Default::default()
        }
    }

    /// Exports `tokens` before running the command.
    pub fn with_tokens(mut self, tokens: TokenSet) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn tokens(&self) -> &TokenSet {
        &self.tokens
    }

    /// The command line as handed to the guest shell.
    pub fn to_shell(&self) -> String {
        format!("{}{}", self.tokens.export_prefix(), self.script)
    }
}

/// Quotes each argument and joins them with spaces.
pub fn quote_argv<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| shell_escape::unix::escape(Cow::Borrowed(arg.as_ref())).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Command execution and file transfer inside a running sandbox.
///
/// Calls are single-shot with a bounded timeout; callers own retry policy.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `command` and returns its exit status and output.
    ///
    /// A non-zero exit of the command itself is not an error; an unreachable
    /// channel is `RemoteUnreachable`.
    async fn run(&self, record: &SandboxRecord, command: &RemoteCommand) -> Result<ExecOutput>;

    /// Copies the contents of local directory `local` into `remote_dir`,
    /// creating it if needed.
    async fn push_dir(&self, record: &SandboxRecord, local: &Path, remote_dir: &str)
        -> Result<()>;

    /// Copies `remote_path` (a directory) into `local_parent`, keeping its
    /// base name.
    async fn pull_dir(
        &self,
        record: &SandboxRecord,
        remote_path: &str,
        local_parent: &Path,
    ) -> Result<()>;

    /// How host-side git reaches the repository at `remote_repo`.
    fn git_remote(&self, record: &SandboxRecord, remote_repo: &str) -> GitRemote;
}
