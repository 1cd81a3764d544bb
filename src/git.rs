//! Host-side git plumbing.
//!
//! Thin wrappers over the `git` CLI, run against a working copy on the host.

use std::path::Path;
use std::process::{Command, Output};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A commit as listed by `git log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    /// Full commit hash.
    pub hash: String,
    /// First line of the message.
    pub subject: String,
}

impl CommitSummary {
    /// Abbreviated hash for display.
    pub fn short_hash(&self) -> &str {
        if self.hash.len() > 7 {
            &self.hash[..7]
        } else {
            &self.hash
        }
    }
}

/// Reference in a workspace clone marking the host commit it was last
/// brought up to.
pub const SYNC_BASE_REF: &str = "refs/remotes/origin/HEAD";

/// Log format understood by [`parse_commit_log`].
pub const COMMIT_LOG_FORMAT: &str = "--format=%H%x09%s";

/// Where to fetch from and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRemote {
    /// URL or path accepted by `git fetch`.
    pub url: String,
    /// Value for `GIT_SSH_COMMAND`, if the transport needs one.
    pub ssh_command: Option<String>,
    /// Extra environment for the fetch (e.g. `SSHPASS`).
    pub env: Vec<(String, String)>,
}

impl GitRemote {
    /// A remote reachable without any transport setup.
    pub fn local(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ssh_command: None,
            env: Vec::new(),
        }
    }
}

fn git(repo: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo);
    cmd
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Returns true if `path` is inside a git working copy.
pub fn is_git_repository(path: &Path) -> bool {
    if !path.is_dir() {
        return false;
    }
    git(path)
        .args(["rev-parse", "--is-inside-work-tree"])
        .output()
        .map(|out| out.status.success() && stdout_of(&out) == "true")
        .unwrap_or(false)
}

/// Clones `source` into `dest`. Skipped if `dest` already holds a clone.
pub fn clone_workspace(source: &Path, dest: &Path) -> Result<bool> {
    if dest.join(".git").exists() {
        tracing::debug!(dest = %dest.display(), "workspace already cloned");
        return Ok(false);
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let output = Command::new("git")
        .arg("clone")
        .arg("--quiet")
        .arg(source)
        .arg(dest)
        .output()?;

    if !output.status.success() {
        return Err(Error::Git(format!("git clone failed: {}", stderr_of(&output))));
    }

    tracing::info!(
        source = %source.display(),
        dest = %dest.display(),
        "cloned workspace"
    );
    Ok(true)
}

/// Moves an existing clone at `dest` to the current HEAD of `source`.
///
/// The clone follows the branch checked out in `source` (detached when
/// `source` is) and its [`SYNC_BASE_REF`] moves along. Returns the new HEAD.
pub fn refresh_workspace(source: &Path, dest: &Path) -> Result<String> {
    let head = fetch(dest, &GitRemote::local(source.display().to_string()), "HEAD")?;

    let mut cmd = git(dest);
    cmd.args(["checkout", "--quiet", "--force"]);
    match current_branch(source)? {
        Some(branch) => cmd.arg("-B").arg(branch),
        None => cmd.arg("--detach"),
    };
    let output = cmd.arg(&head).output()?;
    if !output.status.success() {
        return Err(Error::Git(format!(
            "failed to refresh workspace {}: {}",
            dest.display(),
            stderr_of(&output)
        )));
    }

    let output = git(dest)
        .args(["update-ref", "--no-deref", SYNC_BASE_REF, &head])
        .output()?;
    if !output.status.success() {
        return Err(Error::Git(format!(
            "failed to move {} in {}: {}",
            SYNC_BASE_REF,
            dest.display(),
            stderr_of(&output)
        )));
    }

    tracing::debug!(dest = %dest.display(), head = %head, "refreshed workspace");
    Ok(head)
}

/// Returns `git status --porcelain` lines (empty when clean).
pub fn uncommitted_changes(repo: &Path) -> Result<Vec<String>> {
    let output = git(repo).args(["status", "--porcelain"]).output()?;
    if !output.status.success() {
        return Err(Error::Git(format!(
            "failed to read status: {}",
            stderr_of(&output)
        )));
    }
    Ok(parse_porcelain(&String::from_utf8_lossy(&output.stdout)))
}

/// Resolves `rev` to a commit hash.
pub fn rev_parse(repo: &Path, rev: &str) -> Result<String> {
    let output = git(repo).args(["rev-parse", "--verify", rev]).output()?;
    if !output.status.success() {
        return Err(Error::Git(format!(
            "failed to resolve {}: {}",
            rev,
            stderr_of(&output)
        )));
    }
    Ok(stdout_of(&output))
}

/// Returns the checked-out branch, or `None` on a detached HEAD.
pub fn current_branch(repo: &Path) -> Result<Option<String>> {
    let output = git(repo)
        .args(["symbolic-ref", "--quiet", "--short", "HEAD"])
        .output()?;
    if output.status.success() {
        Ok(Some(stdout_of(&output)))
    } else {
        Ok(None)
    }
}

/// Fetches `refspec` from `remote` into `FETCH_HEAD` and returns its hash.
///
/// Only `FETCH_HEAD` is written; no branch or working-tree file changes.
pub fn fetch(repo: &Path, remote: &GitRemote, refspec: &str) -> Result<String> {
    let mut cmd = git(repo);
    cmd.args(["fetch", "--quiet", "--no-tags"])
        .arg(&remote.url)
        .arg(refspec);
    if let Some(ssh) = &remote.ssh_command {
        cmd.env("GIT_SSH_COMMAND", ssh);
    }
    cmd.envs(remote.env.iter().map(|(k, v)| (k, v)));

    let output = cmd.output()?;
    if !output.status.success() {
        return Err(Error::Git(format!(
            "failed to fetch from {}: {}",
            remote.url,
            stderr_of(&output)
        )));
    }

    rev_parse(repo, "FETCH_HEAD")
}

/// Returns true if `ancestor` is reachable from `descendant`.
pub fn is_ancestor(repo: &Path, ancestor: &str, descendant: &str) -> Result<bool> {
    let output = git(repo)
        .args(["merge-base", "--is-ancestor", ancestor, descendant])
        .output()?;
    match output.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(Error::Git(format!(
            "failed to compare {} and {}: {}",
            ancestor,
            descendant,
            stderr_of(&output)
        ))),
    }
}

/// Fast-forwards the current branch to `rev`.
///
/// Fails with `MergeConflict` if git refuses; nothing is changed in that case.
pub fn merge_fast_forward(repo: &Path, rev: &str) -> Result<()> {
    let output = git(repo)
        .args(["merge", "--ff-only", "--quiet", rev])
        .output()?;

    if !output.status.success() {
        return Err(Error::MergeConflict {
            reason: stderr_of(&output),
            remediation: format!(
                "Resolve the blocking changes in {} and run sync again.",
                repo.display()
            ),
        });
    }
    Ok(())
}

/// Reads a value from the user's global git configuration.
pub fn global_config(key: &str) -> Option<String> {
    let output = Command::new("git")
        .args(["config", "--global", key])
        .output()
        .ok()?;
    if output.status.success() {
        Some(stdout_of(&output)).filter(|v| !v.is_empty())
    } else {
        None
    }
}

/// Parses `git status --porcelain` output.
pub fn parse_porcelain(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.to_string())
        .collect()
}

/// Parses `git log` output produced with [`COMMIT_LOG_FORMAT`].
pub fn parse_commit_log(output: &str) -> Vec<CommitSummary> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut parts = line.splitn(2, '\t');
            let hash = parts.next().unwrap_or_default().trim().to_string();
            let subject = parts.next().unwrap_or_default().to_string();
            CommitSummary { hash, subject }
        })
        .collect()
}
