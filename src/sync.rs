//! Host-initiated synchronization out of a running sandbox.
//!
//! Code moves by git: the sandbox's new commits are fetched over the remote
//! channel and fast-forwarded onto the host's current branch. Diverged
//! histories are never merged automatically. Build artifacts move by
//! directory copy.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::config::AgentConfig;
use crate::error::{tail_lines, Error, Result};
use crate::git::{self, CommitSummary, COMMIT_LOG_FORMAT, SYNC_BASE_REF};
use crate::reconcile::StatusReconciler;
use crate::remote::{ExecOutput, RemoteCommand, RemoteExecutor};
use crate::sandbox::{Registry, SandboxRecord, SandboxState};
use crate::tokens::TokenSet;

/// Options for [`SyncEngine::sync`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Also copy build-output directories back to the host.
    pub artifacts: bool,
    /// Report what would be synced without changing anything.
    pub dry_run: bool,
}

/// What happened to one artifact directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status", content = "error")]
pub enum ArtifactStatus {
    Copied,
    /// Not present in the sandbox.
    Missing,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactOutcome {
    pub dir: String,
    pub status: ArtifactStatus,
}

/// Result of a sync.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Sandbox commits not yet on the host, oldest last.
    pub commits: Vec<CommitSummary>,
    /// Uncommitted changes in the sandbox workspace (not synced).
    pub uncommitted: Vec<String>,
    /// Uncommitted changes on the host at the time of sync.
    pub host_uncommitted: Vec<String>,
    /// Host HEAD after a successful fast-forward.
    pub merged_head: Option<String>,
    pub artifacts: Vec<ArtifactOutcome>,
    pub dry_run: bool,
}

/// Outcome of [`SyncEngine::sync_git_identity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySync {
    Applied { name: String, email: String },
    /// The host has no complete global identity.
    Incomplete,
}

/// Moves commits and artifacts from sandboxes to the host.
#[derive(Clone)]
pub struct SyncEngine {
    reconciler: StatusReconciler,
    remote: Arc<dyn RemoteExecutor>,
    config: AgentConfig,
}

impl SyncEngine {
    pub fn new(registry: Registry, config: AgentConfig, remote: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            reconciler: StatusReconciler::new(registry),
            remote,
            config,
        }
    }

    /// Reconciles `name` and requires it to be running.
    pub fn require_running(&self, name: &str) -> Result<SandboxRecord> {
        let record = self.reconciler.reconcile(name)?;
        if record.state != SandboxState::Running {
            return Err(Error::NotRunning(name.to_string()));
        }
        Ok(record)
    }

    fn guest_workspace(&self) -> &str {
        &self.config.guest.workspace
    }

    /// Runs `git -C <guest workspace> args...` in the sandbox.
    async fn guest_git(&self, record: &SandboxRecord, args: &[&str]) -> Result<ExecOutput> {
        let mut argv = vec!["git", "-C", self.guest_workspace()];
        argv.extend_from_slice(args);
        self.remote.run(record, &RemoteCommand::argv(&argv)).await
    }

    async fn guest_git_ok(&self, record: &SandboxRecord, args: &[&str]) -> Result<String> {
        let output = self.guest_git(record, args).await?;
        if !output.success() {
            return Err(Error::Git(format!(
                "sandbox git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                tail_lines(output.stderr.trim(), 10)
            )));
        }
        Ok(output.stdout)
    }

    /// The commit or ref inside the sandbox that the host already has.
    async fn sandbox_base(&self, record: &SandboxRecord, host: &Path) -> Result<(String, bool)> {
        let output = self
            .guest_git(record, &["rev-parse", "--verify", "--quiet", SYNC_BASE_REF])
            .await?;
        if output.success() {
            return Ok((SYNC_BASE_REF.to_string(), true));
        }
        Ok((git::rev_parse(host, "HEAD")?, false))
    }

    /// Pulls new sandbox commits (and optionally artifacts) into the host.
    pub async fn sync(&self, name: &str, options: SyncOptions) -> Result<SyncReport> {
        let record = self.require_running(name)?;
        let host = record.project_path.clone();

        let mut report = SyncReport {
            dry_run: options.dry_run,
            host_uncommitted: git::uncommitted_changes(&host)?,
            ..Default::default()
        };
        if !report.host_uncommitted.is_empty() {
            tracing::warn!(
                name,
                changes = report.host_uncommitted.len(),
                "host working copy has uncommitted changes; an incoming merge may collide"
            );
        }

        report.uncommitted =
            git::parse_porcelain(&self.guest_git_ok(&record, &["status", "--porcelain"]).await?);

        let (base, base_is_ref) = self.sandbox_base(&record, &host).await?;
        let range = format!("{}..HEAD", base);
        report.commits = git::parse_commit_log(
            &self
                .guest_git_ok(&record, &["log", COMMIT_LOG_FORMAT, &range])
                .await?,
        );

        for change in &report.uncommitted {
            tracing::info!(name, change = %change, "uncommitted change in sandbox is not synced");
        }

        if report.commits.is_empty() && !options.artifacts {
            return Err(Error::NoChanges {
                uncommitted: report.uncommitted,
            });
        }

        if options.dry_run {
            return Ok(report);
        }

        if !report.commits.is_empty() {
            let head = self.pull_commits(&record, &host).await?;
            if base_is_ref {
                self.mark_synced(&record, &head).await;
            }
            report.merged_head = Some(head);
        }

        if options.artifacts {
            report.artifacts = self.pull_artifacts(&record, &host).await;
        }

        Ok(report)
    }

    /// Fetches the sandbox HEAD and fast-forwards the host to it.
    async fn pull_commits(&self, record: &SandboxRecord, host: &Path) -> Result<String> {
        let remote = self.remote.git_remote(record, self.guest_workspace());
        let fetched = git::fetch(host, &remote, "HEAD")?;
        let host_head = git::rev_parse(host, "HEAD")?;

        if !git::is_ancestor(host, &host_head, &fetched)? {
            return Err(Error::MergeConflict {
                reason: format!(
                    "host HEAD {} is not an ancestor of sandbox HEAD {}; histories have diverged",
                    short(&host_head),
                    short(&fetched)
                ),
                remediation: format!(
                    "Rebase the sandbox work onto the host branch inside the sandbox, or integrate \
                     FETCH_HEAD manually in {}, then sync again.",
                    host.display()
                ),
            });
        }

        git::merge_fast_forward(host, &fetched)?;
        tracing::info!(
            name = %record.name,
            from = short(&host_head),
            to = short(&fetched),
            "fast-forwarded host to sandbox history"
        );
        Ok(fetched)
    }

    /// Moves the sandbox's base ref to `head` so synced commits are not
    /// reported again.
    async fn mark_synced(&self, record: &SandboxRecord, head: &str) {
        match self.guest_git(record, &["update-ref", SYNC_BASE_REF, head]).await {
            Ok(output) if output.success() => {}
            Ok(output) => tracing::warn!(
                name = %record.name,
                error = %output.stderr.trim(),
                "failed to record sync point in sandbox"
            ),
            Err(e) => tracing::warn!(
                name = %record.name,
                error = %e,
                "failed to record sync point in sandbox"
            ),
        }
    }

    /// Copies every configured artifact directory present in the sandbox.
    async fn pull_artifacts(&self, record: &SandboxRecord, host: &Path) -> Vec<ArtifactOutcome> {
        let mut outcomes = Vec::new();
        for dir in &self.config.sync.artifact_dirs {
            let remote_path = format!("{}/{}", self.guest_workspace().trim_end_matches('/'), dir);
            let status = match self
                .remote
                .run(record, &RemoteCommand::argv(&["test", "-d", &remote_path]))
                .await
            {
                Ok(output) if output.success() => {
                    match self.remote.pull_dir(record, &remote_path, host).await {
                        Ok(()) => ArtifactStatus::Copied,
                        Err(e) => {
                            tracing::warn!(name = %record.name, dir = %dir, error = %e, "failed to copy artifacts");
                            ArtifactStatus::Failed(e.to_string())
                        }
                    }
                }
                Ok(_) => {
                    tracing::debug!(name = %record.name, dir = %dir, "no artifacts");
                    ArtifactStatus::Missing
                }
                Err(e) => {
                    tracing::warn!(name = %record.name, dir = %dir, error = %e, "failed to check artifacts");
                    ArtifactStatus::Failed(e.to_string())
                }
            };
            outcomes.push(ArtifactOutcome {
                dir: dir.clone(),
                status,
            });
        }
        outcomes
    }

    /// Writes the host's global git identity into the sandbox.
    pub async fn sync_git_identity(&self, name: &str) -> Result<IdentitySync> {
        let record = self.require_running(name)?;

        let (Some(user_name), Some(email)) = (
            git::global_config("user.name"),
            git::global_config("user.email"),
        ) else {
            tracing::warn!(name, "host git identity is incomplete; nothing to sync");
            return Ok(IdentitySync::Incomplete);
        };

        // The guest's XDG config may be a read-only link; drop it so
        // --global writes ~/.gitconfig.
        let script = format!(
            "rm -f ~/.config/git/config && {} && {}",
            crate::remote::quote_argv(&["git", "config", "--global", "user.name", &user_name]),
            crate::remote::quote_argv(&["git", "config", "--global", "user.email", &email]),
        );
        let output = self.remote.run(&record, &RemoteCommand::shell(script)).await?;
        if !output.success() {
            return Err(Error::Git(format!(
                "failed to set git identity in sandbox: {}",
                tail_lines(output.stderr.trim(), 10)
            )));
        }

        tracing::info!(name, user = %user_name, "synced git identity into sandbox");
        Ok(IdentitySync::Applied {
            name: user_name,
            email,
        })
    }

    /// Runs `argv` in a running sandbox, optionally exporting host tokens.
    pub async fn exec(&self, name: &str, argv: &[String], tokens: Option<TokenSet>) -> Result<ExecOutput> {
        let record = self.require_running(name)?;
        let mut command = RemoteCommand::argv(argv);
        if let Some(tokens) = tokens {
            command = command.with_tokens(tokens);
        }
        self.remote.run(&record, &command).await
    }
}

fn short(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hash_handles_short_input() {
        assert_eq!(short("0123456789abcdef"), "0123456");
        assert_eq!(short("abc"), "abc");
    }

    #[test]
    fn artifact_status_serializes_with_tag() {
        let json = serde_json::to_string(&ArtifactOutcome {
            dir: "target".into(),
            status: ArtifactStatus::Failed("boom".into()),
        })
        .unwrap();
        assert_eq!(json, r#"{"dir":"target","status":{"status":"failed","error":"boom"}}"#);
    }
}
