//! Integration tests for sandbox start, stop and destroy.
//!
//! Supervisors are shell scripts running on the host, so these tests need
//! only `sh`, `sleep` and `git`.

mod common;

use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use common::{create_temp_git_repo, FakeProvisioner, TestEnv};
use keystone_agent::process::{group_alive, port_is_free, port_owners, process_alive};
use keystone_agent::{DestroyOutcome, Error, SandboxState, StopOutcome};

#[tokio::test]
async fn start_then_stop_round_trip() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller();

    let report = assert_ok!(controller.start(TestEnv::request(project.path(), "proj")).await);
    let record = report.record;
    assert_eq!(record.state, SandboxState::Running);
    assert!(record.is_consistent());
    assert!(report.workspace_pushed);
    assert!(env.guest_workspace().join("README.md").exists());

    let handle = record.process_handle.expect("running sandbox has a handle");
    assert!(process_alive(handle.pid));
    assert_eq!(handle.pid, handle.process_group_id);

    let outcome = assert_ok!(controller.stop("proj", false).await);
    assert_eq!(outcome, StopOutcome::Stopped { graceful: false });
    assert!(!process_alive(handle.pid));
    assert!(port_is_free(record.ssh_port));

    let stored = env.registry().require("proj").unwrap();
    assert_eq!(stored.state, SandboxState::Stopped);
    assert!(stored.process_handle.is_none());
    assert_eq!(stored.ssh_port, record.ssh_port);
}

#[tokio::test]
async fn stop_when_stopped_is_a_no_op() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller();

    controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();
    controller.stop("proj", false).await.unwrap();

    let outcome = assert_ok!(controller.stop("proj", false).await);
    assert_eq!(outcome, StopOutcome::AlreadyStopped);
}

#[tokio::test]
async fn stop_reclaims_crashed_sandbox() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller();

    let report = controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();
    let handle = report.record.process_handle.unwrap();

    kill(Pid::from_raw(handle.pid), Signal::SIGKILL).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = assert_ok!(controller.stop("proj", false).await);
    assert_eq!(outcome, StopOutcome::Reclaimed);

    let stored = env.registry().require("proj").unwrap();
    assert_eq!(stored.state, SandboxState::Stopped);
    assert!(stored.is_consistent());
    assert!(port_is_free(stored.ssh_port));
}

#[tokio::test]
async fn stop_escalates_past_ignored_sigterm() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller_with(FakeProvisioner::with_script(
        env.runners.path(),
        "trap '' TERM\nwhile true; do sleep 1; done",
    ));

    let report = controller
        .start(TestEnv::request(project.path(), "stubborn"))
        .await
        .unwrap();
    let handle = report.record.process_handle.unwrap();

    let outcome = assert_ok!(controller.stop("stubborn", false).await);
    assert_eq!(outcome, StopOutcome::Stopped { graceful: false });
    assert!(!process_alive(handle.pid));
    assert_eq!(
        env.registry().require("stubborn").unwrap().state,
        SandboxState::Stopped
    );
}

#[tokio::test]
async fn stop_uses_shutdown_operation_when_present() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let provisioner = FakeProvisioner::with_script(
        env.runners.path(),
        "echo $$ > supervisor.pid\nexec sleep 300",
    )
    .with_shutdown("kill \"$(cat supervisor.pid)\"");
    let controller = env.controller_with(provisioner);

    controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();

    let outcome = assert_ok!(controller.stop("proj", false).await);
    assert_eq!(outcome, StopOutcome::Stopped { graceful: true });
}

#[tokio::test]
async fn start_twice_reports_already_running() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller();

    controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();

    let err = assert_err!(controller.start(TestEnv::request(project.path(), "proj")).await);
    assert!(matches!(err, Error::AlreadyRunning(name) if name == "proj"));

    controller.stop("proj", false).await.unwrap();
}

#[tokio::test]
async fn restart_after_crash_is_allowed() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller();

    let first = controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();
    let old = first.record.process_handle.unwrap();
    kill(Pid::from_raw(old.pid), Signal::SIGKILL).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = assert_ok!(controller.start(TestEnv::request(project.path(), "proj")).await);
    let new = second.record.process_handle.unwrap();
    assert_ne!(old.pid, new.pid);
    assert_eq!(second.record.created_at, first.record.created_at);

    controller.stop("proj", false).await.unwrap();
}

#[tokio::test]
async fn start_rejects_non_git_directory() {
    let env = TestEnv::new();
    let plain = TempDir::new().unwrap();

    let err = assert_err!(env.controller().start(TestEnv::request(plain.path(), "proj")).await);
    assert!(matches!(err, Error::NotAGitRepository(_)));
    assert!(env.registry().get("proj").unwrap().is_none());
}

#[tokio::test]
async fn supervisor_exiting_during_boot_is_reported() {
    let mut env = TestEnv::new();
    env.config.timing.readiness_attempts = 50;
    let project = create_temp_git_repo();
    let controller = env.controller_with(FakeProvisioner::with_script(
        env.runners.path(),
        "echo 'kvm not available' >&2\nexit 3",
    ));

    let err = assert_err!(controller.start(TestEnv::request(project.path(), "proj")).await);
    match err {
        Error::SupervisorLaunch(message) => assert!(message.contains("kvm not available")),
        other => panic!("unexpected error: {}", other),
    }

    let stored = env.registry().require("proj").unwrap();
    assert_eq!(stored.state, SandboxState::Stopped);
    assert!(stored.is_consistent());
}

#[tokio::test]
async fn sandboxes_get_distinct_ports() {
    let env = TestEnv::new();
    let first = create_temp_git_repo();
    let second = create_temp_git_repo();
    let controller = env.controller();

    let a = controller
        .start(TestEnv::request(first.path(), "first"))
        .await
        .unwrap();
    let b = controller
        .start(TestEnv::request(second.path(), "second"))
        .await
        .unwrap();
    assert_ne!(a.record.ssh_port, b.record.ssh_port);
    assert!(a.record.ssh_port >= env.config.ssh.base_port);
    assert!(b.record.ssh_port >= env.config.ssh.base_port);

    controller.stop("first", false).await.unwrap();
    controller.stop("second", false).await.unwrap();
}

#[tokio::test]
async fn destroy_running_sandbox_requires_force() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller();

    let report = controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();
    let handle = report.record.process_handle.unwrap();

    let err = assert_err!(controller.destroy("proj", false, |_| true).await);
    assert!(matches!(err, Error::SandboxBusy(_)));
    assert!(process_alive(handle.pid));

    let outcome = assert_ok!(controller.destroy("proj", true, |_| false).await);
    assert_eq!(
        outcome,
        DestroyOutcome::Destroyed {
            directories_removed: true
        }
    );
    assert!(!process_alive(handle.pid));
    assert!(!report.record.state_dir.exists());
    assert!(env.registry().get("proj").unwrap().is_none());

    let err = assert_err!(controller.destroy("proj", true, |_| true).await);
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn declined_destroy_keeps_everything() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller();

    let report = controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();
    controller.stop("proj", false).await.unwrap();

    let outcome = assert_ok!(controller.destroy("proj", false, |_| false).await);
    assert_eq!(outcome, DestroyOutcome::Cancelled);
    assert!(report.record.state_dir.exists());
    assert!(env.registry().get("proj").unwrap().is_some());
}

#[tokio::test]
async fn fresh_start_replaces_running_sandbox() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller();

    let first = controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();
    let old = first.record.process_handle.unwrap();
    std::fs::write(first.record.workspace_path.join("scratch.txt"), "x").unwrap();

    let mut request = TestEnv::request(project.path(), "proj");
    request.fresh = true;
    let second = assert_ok!(controller.start(request).await);

    assert!(!process_alive(old.pid));
    assert!(!second.record.workspace_path.join("scratch.txt").exists());
    assert_eq!(second.record.state, SandboxState::Running);

    controller.stop("proj", false).await.unwrap();
}

#[tokio::test]
async fn list_reconciles_every_record() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller();

    let report = controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();
    kill(
        Pid::from_raw(report.record.process_handle.unwrap().pid),
        Signal::SIGKILL,
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let records = assert_ok!(controller.list());
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, SandboxState::Stopped);
    assert!(records[0].process_handle.is_none());
}

#[tokio::test]
async fn stop_after_status_reclaims_orphaned_children() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller_with(FakeProvisioner::with_script(
        env.runners.path(),
        "sleep 300 &\nwait",
    ));

    let report = controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();
    let handle = report.record.process_handle.unwrap();
    kill(Pid::from_raw(handle.pid), Signal::SIGKILL).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The supervisor is gone but its child still runs in the group.
    let status = assert_ok!(controller.status("proj"));
    assert_eq!(status.state, SandboxState::Stopping);
    assert_eq!(status.process_handle, Some(handle));
    assert!(group_alive(handle.process_group_id));

    let outcome = assert_ok!(controller.stop("proj", false).await);
    assert_eq!(outcome, StopOutcome::Reclaimed);
    assert!(!group_alive(handle.process_group_id));

    let stored = env.registry().require("proj").unwrap();
    assert_eq!(stored.state, SandboxState::Stopped);
    assert!(stored.is_consistent());
}

#[tokio::test]
async fn start_reclaims_orphaned_children_of_crashed_sandbox() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let controller = env.controller_with(FakeProvisioner::with_script(
        env.runners.path(),
        "sleep 300 &\nwait",
    ));

    let first = controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();
    let old = first.record.process_handle.unwrap();
    kill(Pid::from_raw(old.pid), Signal::SIGKILL).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(assert_ok!(controller.list())[0].state, SandboxState::Stopping);

    let err = assert_err!(controller.destroy("proj", false, |_| true).await);
    assert!(matches!(err, Error::SandboxBusy(_)));

    let second = assert_ok!(controller.start(TestEnv::request(project.path(), "proj")).await);
    assert!(!group_alive(old.process_group_id));
    assert_ne!(second.record.process_handle.unwrap().pid, old.pid);

    controller.stop("proj", false).await.unwrap();
}

/// Environment variable telling [`hold_port_in_new_session`] which port to bind.
const HOLD_PORT_VAR: &str = "KEYSTONE_TEST_HOLD_PORT";

/// Started by a supervisor script as a detached process holding the
/// sandbox's port from outside the supervisor's group. Does nothing when
/// run directly.
#[test]
#[ignore]
fn hold_port_in_new_session() {
    let Ok(port) = std::env::var(HOLD_PORT_VAR) else {
        return;
    };
    nix::unistd::setsid().expect("failed to start a new session");
    let port: u16 = port.parse().expect("invalid port");
    let _listener = std::net::TcpListener::bind(("127.0.0.1", port)).expect("failed to bind");
    std::thread::sleep(Duration::from_secs(300));
}

#[tokio::test]
async fn stop_reclaims_port_held_outside_the_group() {
    let env = TestEnv::new();
    let project = create_temp_git_repo();
    let exe = std::env::current_exe().unwrap();
    let script = format!(
        "{}={{port}} '{}' hold_port_in_new_session --exact --ignored --test-threads=1 \
         >/dev/null 2>&1 &\nexec sleep 300",
        HOLD_PORT_VAR,
        exe.display()
    );
    let controller = env.controller_with(FakeProvisioner::with_script(env.runners.path(), &script));

    let report = controller
        .start(TestEnv::request(project.path(), "proj"))
        .await
        .unwrap();
    let port = report.record.ssh_port;
    for _ in 0..100 {
        if !port_is_free(port) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!port_is_free(port));
    assert!(!port_owners(port).is_empty());

    assert_ok!(controller.stop("proj", false).await);
    assert!(port_is_free(port));
    assert!(port_owners(port).is_empty());
}
