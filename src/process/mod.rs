//! Host process supervision.
//!
//! A sandbox runs as a supervisor process leading its own process group.
//! [`KillProtocol`] tears such a group down and then makes sure the
//! sandbox's port is actually released, killing stragglers by port
//! ownership if needed.

mod group;
mod port;

pub use group::{group_alive, launch_supervisor, process_alive, signal_group, signal_process};
pub use port::{allocate_port, kill_port_owners, port_accepts, port_is_free, port_owners};

use nix::sys::signal::Signal;

use crate::config::TimingConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::sandbox::ProcessHandle;

/// Returns true if the recorded supervisor or anything in its group is alive.
pub fn handle_alive(handle: &ProcessHandle) -> bool {
    process_alive(handle.pid) || group_alive(handle.process_group_id)
}

/// Escalating termination of a sandbox's process group and port.
#[derive(Debug, Clone, Copy)]
pub struct KillProtocol {
    /// Polling after each group signal.
    pub kill: RetryPolicy,
    /// Polling for the port to become bindable.
    pub port_verify: RetryPolicy,
}

impl KillProtocol {
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            kill: timing.kill(),
            port_verify: timing.port_verify(),
        }
    }

    /// Terminates the group: SIGTERM, wait, then SIGKILL.
    ///
    /// Returns true if nothing in the group is left alive.
    pub async fn terminate_group(&self, handle: &ProcessHandle) -> bool {
        let pgid = handle.process_group_id;

        if signal_group(pgid, Signal::SIGTERM) {
            tracing::info!(pgid, "sent SIGTERM to sandbox process group");
            if self.wait_for_exit(handle).await {
                return true;
            }
            tracing::warn!(pgid, "process group ignored SIGTERM, sending SIGKILL");
            signal_group(pgid, Signal::SIGKILL);
            if self.wait_for_exit(handle).await {
                return true;
            }
        }

        // The supervisor may have left its group; hit it directly.
        if handle.pid != pgid && process_alive(handle.pid) {
            tracing::warn!(pid = handle.pid, "killing supervisor outside its group");
            signal_process(handle.pid, Signal::SIGKILL);
            self.wait_for_exit(handle).await
        } else {
            !handle_alive(handle)
        }
    }

    async fn wait_for_exit(&self, handle: &ProcessHandle) -> bool {
        self.kill
            .poll_until(|| {
                let gone = !handle_alive(handle);
                async move { gone }
            })
            .await
    }

    async fn wait_for_port(&self, port: u16) -> bool {
        self.port_verify
            .poll_until(|| {
                let free = port_is_free(port);
                async move { free }
            })
            .await
    }

    /// Ensures `port` is bindable, killing whatever holds it.
    ///
    /// Two rounds of kill-by-ownership are attempted before giving up.
    pub async fn reclaim_port(&self, port: u16) -> Result<()> {
        for round in 1..=2 {
            let killed = kill_port_owners(port);
            if killed > 0 {
                tracing::warn!(port, killed, round, "killed processes holding sandbox port");
            }
            if self.wait_for_port(port).await {
                tracing::debug!(port, "port is free");
                return Ok(());
            }
        }
        tracing::error!(port, "port still bound after kill attempts");
        Err(Error::PortStillBound(port))
    }

    /// Full teardown: terminate the group if there is one, then reclaim the
    /// port.
    ///
    /// Returns whether the group was confirmed gone (true when no handle).
    pub async fn run(&self, handle: Option<&ProcessHandle>, port: u16) -> Result<bool> {
        let group_gone = match handle {
            Some(handle) => self.terminate_group(handle).await,
            None => true,
        };
        if !group_gone {
            tracing::warn!(port, "process group survived SIGKILL, continuing with port cleanup");
        }
        self.reclaim_port(port).await?;
        Ok(group_gone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::TempDir;

    fn fast_protocol() -> KillProtocol {
        KillProtocol {
            kill: RetryPolicy::new(10, Duration::from_millis(50)),
            port_verify: RetryPolicy::new(10, Duration::from_millis(50)),
        }
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("run");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn terminates_cooperative_group() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "sleep 30 &\nexec sleep 30");
        let handle = launch_supervisor(&script, dir.path(), &dir.path().join("log")).unwrap();

        assert!(fast_protocol().terminate_group(&handle).await);
        assert!(!group_alive(handle.process_group_id));
    }

    #[tokio::test]
    async fn escalates_when_sigterm_is_ignored() {
        let dir = TempDir::new().unwrap();
        let script = write_script(dir.path(), "trap '' TERM\nwhile true; do sleep 1; done");
        let handle = launch_supervisor(&script, dir.path(), &dir.path().join("log")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(fast_protocol().terminate_group(&handle).await);
        assert!(!handle_alive(&handle));
    }

    #[tokio::test]
    async fn dead_handle_counts_as_gone() {
        let handle = ProcessHandle {
            pid: i32::MAX - 1,
            process_group_id: i32::MAX - 1,
        };
        assert!(fast_protocol().terminate_group(&handle).await);
    }

    #[tokio::test]
    async fn reclaim_of_free_port_succeeds() {
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        assert!(fast_protocol().run(None, port).await.unwrap());
    }

    #[tokio::test]
    async fn port_held_by_invoking_process_is_reported() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let err = fast_protocol().reclaim_port(port).await.unwrap_err();
        assert!(matches!(err, Error::PortStillBound(p) if p == port));
    }
}
