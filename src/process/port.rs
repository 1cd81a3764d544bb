//! Host port occupancy: bind checks, connectivity probes and ownership.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use nix::sys::signal::Signal;

use crate::error::{Error, Result};

use super::group::signal_process;

/// Returns true if a listener can be bound to `127.0.0.1:port` right now.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Returns true if something accepts TCP connections on `127.0.0.1:port`.
pub async fn port_accepts(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Picks the lowest port `>= base` not in `taken` that is bindable.
pub fn allocate_port(base: u16, taken: &HashSet<u16>) -> Result<u16> {
    (base..=u16::MAX)
        .filter(|port| !taken.contains(port))
        .find(|port| port_is_free(*port))
        .ok_or_else(|| Error::Config(format!("no free port at or above {}", base)))
}

/// Returns the pids holding a TCP socket on local `port`, excluding the
/// invoking process.
pub fn port_owners(port: u16) -> Vec<i32> {
    let own = std::process::id() as i32;
    let pids = if Path::new("/proc/net/tcp").exists() {
        procfs_port_owners(port)
    } else {
        lsof_port_owners(port)
    };
    pids.into_iter().filter(|pid| *pid != own).collect()
}

/// Force-kills every process holding `port`. Returns how many were signalled.
pub fn kill_port_owners(port: u16) -> usize {
    port_owners(port)
        .into_iter()
        .filter(|pid| {
            tracing::warn!(pid, port, "force killing process holding sandbox port");
            signal_process(*pid, Signal::SIGKILL)
        })
        .count()
}

fn procfs_port_owners(port: u16) -> Vec<i32> {
    let mut inodes = HashSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(content) = std::fs::read_to_string(table) {
            inodes.extend(parse_socket_table(&content, port));
        }
    }
    if inodes.is_empty() {
        return Vec::new();
    }

    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut owners = Vec::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let pid = match entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) {
            Some(pid) => pid,
            None => continue,
        };
        // Other users' fd tables are unreadable; skip them.
        let fds = match std::fs::read_dir(entry.path().join("fd")) {
            Ok(fds) => fds,
            Err(_) => continue,
        };
        let holds_socket = fds.filter_map(|fd| fd.ok()).any(|fd| {
            std::fs::read_link(fd.path())
                .ok()
                .and_then(|target| socket_inode(&target.to_string_lossy()))
                .is_some_and(|inode| inodes.contains(&inode))
        });
        if holds_socket {
            owners.push(pid);
        }
    }
    owners
}

fn lsof_port_owners(port: u16) -> Vec<i32> {
    let output = match Command::new("lsof")
        .args(["-t", &format!("-iTCP:{}", port)])
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            tracing::debug!(error = %e, "lsof unavailable");
            return Vec::new();
        }
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

/// Extracts socket inodes bound to local `port` from `/proc/net/tcp{,6}`.
pub(crate) fn parse_socket_table(content: &str, port: u16) -> Vec<u64> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let local = fields.get(1)?;
            let local_port = u16::from_str_radix(local.rsplit(':').next()?, 16).ok()?;
            let inode: u64 = fields.get(9)?.parse().ok()?;
            (local_port == port && inode != 0).then_some(inode)
        })
        .collect()
}

/// Parses a `socket:[12345]` fd link target.
fn socket_inode(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}
