//! Keystone Agent - microVM sandboxes for coding agents
//!
//! This library manages isolated virtual machines that run autonomous agents
//! against a clone of a project: starting and stopping their supervisor
//! processes, reconciling recorded state with the operating system, and
//! pulling commits and build artifacts back to the host.

pub mod config;
pub mod error;
pub mod git;
pub mod lifecycle;
pub mod nix_expr;
pub mod process;
pub mod provision;
pub mod reconcile;
pub mod remote;
pub mod retry;
pub mod sandbox;
pub mod sync;
pub mod tokens;

pub use config::{AgentConfig, AgentPaths, Validate, ValidationResult};
pub use error::{Error, Result};
pub use lifecycle::{DestroyOutcome, LifecycleController, StartReport, StartRequest, StopOutcome};
pub use provision::{NixProvisioner, Provisioner};
pub use reconcile::StatusReconciler;
pub use remote::{ExecOutput, RemoteCommand, RemoteExecutor, SshExecutor};
pub use retry::RetryPolicy;
pub use sandbox::{
    AuthMode, NetworkMode, ProcessHandle, Registry, ResourceSpec, SandboxRecord, SandboxState,
    SyncMode,
};
pub use sync::{ArtifactOutcome, ArtifactStatus, IdentitySync, SyncEngine, SyncOptions, SyncReport};
pub use tokens::TokenSet;
