//! Supervisor launch and process-group signalling.

use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};

use crate::error::{Error, Result};
use crate::sandbox::ProcessHandle;

/// Launches `program` in a new session so its whole tree shares one group.
///
/// Output goes to `log_file`; the process is not waited on and outlives
/// the caller.
pub fn launch_supervisor(program: &Path, cwd: &Path, log_file: &Path) -> Result<ProcessHandle> {
    if !program.exists() {
        return Err(Error::SupervisorLaunch(format!(
            "run script not found: {}",
            program.display()
        )));
    }

    let log = File::create(log_file)?;
    let log_err = log.try_clone()?;

    let mut command = Command::new(program);
    command
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(log)
        .stderr(log_err);

    // Safety: setsid is async-signal-safe and only affects the child, which
    // becomes leader of a new session and process group (pgid == pid).
    unsafe {
        command.pre_exec(|| {
            unistd::setsid()?;
            Ok(())
        });
    }

    let child = command
        .spawn()
        .map_err(|e| Error::SupervisorLaunch(format!("{}: {}", program.display(), e)))?;

    let pid = child.id() as i32;
    let process_group_id = match unistd::getpgid(Some(Pid::from_raw(pid))) {
        Ok(pgid) => pgid.as_raw(),
        // Already exited; setsid made it its own group leader.
        Err(_) => pid,
    };
    if process_group_id != pid {
        tracing::warn!(pid, process_group_id, "supervisor is not its own group leader");
    }

    tracing::info!(
        pid,
        process_group_id,
        log = %log_file.display(),
        "launched supervisor"
    );

    Ok(ProcessHandle {
        pid,
        process_group_id,
    })
}

/// Parsed fields of `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcStat {
    pub pid: i32,
    pub state: char,
    pub pgrp: i32,
}

/// Parses `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are read after the last `)`.
pub(crate) fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let pid = content[..open].trim().parse().ok()?;
    let mut rest = content[close + 1..].split_whitespace();
    let state = rest.next()?.chars().next()?;
    let _ppid = rest.next()?;
    let pgrp = rest.next()?.parse().ok()?;
    Some(ProcStat { pid, state, pgrp })
}

fn read_proc_stat(pid: i32) -> Option<ProcStat> {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|content| parse_proc_stat(&content))
}

fn procfs_available() -> bool {
    Path::new("/proc/self/stat").exists()
}

/// Returns true if `pid` exists, is signalable by the invoking user and is
/// not a zombie.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => match read_proc_stat(pid) {
            Some(stat) => stat.state != 'Z',
            None => !procfs_available(),
        },
        // EPERM: exists but belongs to someone else.
        Err(_) => false,
    }
}

/// Returns true if any non-zombie process remains in group `pgid`.
pub fn group_alive(pgid: i32) -> bool {
    if pgid <= 0 {
        return false;
    }
    if signal::killpg(Pid::from_raw(pgid), None).is_err() {
        return false;
    }
    if !procfs_available() {
        return true;
    }

    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return true,
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(read_proc_stat)
        .any(|stat| stat.pgrp == pgid && stat.state != 'Z')
}

/// Sends `sig` to every process in group `pgid`.
///
/// Returns false if the group no longer exists or is our own.
pub fn signal_group(pgid: i32, sig: Signal) -> bool {
    if pgid <= 1 || pgid == unistd::getpgrp().as_raw() {
        return false;
    }
    match signal::killpg(Pid::from_raw(pgid), sig) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pgid, signal = %sig, error = %e, "failed to signal process group");
            false
        }
    }
}

/// Sends `sig` to a single process. Returns false if it could not be signalled.
pub fn signal_process(pid: i32, sig: Signal) -> bool {
    if pid <= 1 || pid == std::process::id() as i32 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pid, signal = %sig, error = %e, "failed to signal process");
            false
        }
    }
}
