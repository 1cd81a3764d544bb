//! Error types for the keystone sandbox manager.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The project directory is not a git working copy.
    #[error("not a git repository: {0}")]
    NotAGitRepository(PathBuf),

    /// The sandbox is already running; attach instead of starting.
    #[error("sandbox '{0}' is already running")]
    AlreadyRunning(String),

    /// The virtualization build collaborator failed.
    #[error("failed to provision sandbox: {message}\n{diagnostics}")]
    ProvisioningFailed {
        message: String,
        /// Last lines of the build tool's output.
        diagnostics: String,
    },

    /// The sandbox is not actually running.
    #[error("sandbox '{0}' is not running")]
    NotRunning(String),

    /// The sandbox must be stopped before this operation.
    #[error("sandbox '{0}' is busy; stop it first or pass --force")]
    SandboxBusy(String),

    /// Nothing to pull from the sandbox.
    #[error("nothing to sync")]
    NoChanges {
        /// Uncommitted changes present in the sandbox workspace.
        uncommitted: Vec<String>,
    },

    /// Host and sandbox histories cannot be fast-forwarded.
    #[error("cannot fast-forward host to sandbox history: {reason}\n{remediation}")]
    MergeConflict {
        reason: String,
        remediation: String,
    },

    /// The sandbox port is still bound after every kill strategy.
    #[error("port {0} is still in use after all kill attempts")]
    PortStillBound(u16),

    /// The persisted registry could not be parsed.
    #[error("sandbox registry at {path} is corrupt: {reason}")]
    RegistryCorrupt { path: PathBuf, reason: String },

    /// The remote command channel could not be reached.
    #[error("remote channel unreachable: {0}")]
    RemoteUnreachable(String),

    /// No registry entry for the given name.
    #[error("sandbox '{0}' not found")]
    NotFound(String),

    /// The sandbox name cannot be used.
    #[error("invalid sandbox name: {0}")]
    InvalidName(String),

    /// The supervisor process could not be launched.
    #[error("failed to launch supervisor: {0}")]
    SupervisorLaunch(String),

    /// Git operation failed.
    #[error("git operation failed: {0}")]
    Git(String),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization of persisted state failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_lines_keeps_last_lines() {
        let text = "one\ntwo\nthree\nfour";
        assert_eq!(tail_lines(text, 2), "three\nfour");
    }

    #[test]
    fn tail_lines_returns_everything_when_short() {
        assert_eq!(tail_lines("only", 10), "only");
        assert_eq!(tail_lines("", 3), "");
    }

    #[test]
    fn no_changes_message_is_stable() {
        let err = Error::NoChanges {
            uncommitted: vec![" M src/lib.rs".to_string()],
        };
        assert_eq!(err.to_string(), "nothing to sync");
    }
}
