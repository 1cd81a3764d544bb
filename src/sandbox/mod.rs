//! Sandbox data model, registry and on-disk layout.
//!
//! [`SandboxRecord`] is the persisted view of a sandbox, stored by name in the
//! [`Registry`]. [`SandboxDirs`] describes the directories a sandbox owns.

mod record;
mod registry;
mod workspace;

pub use record::{
    derive_name, is_valid_name, AuthMode, NetworkMode, ProcessHandle, ResourceSpec,
    SandboxRecord, SandboxState, SyncMode,
};
pub use registry::{Registry, RegistryDocument};
pub use workspace::SandboxDirs;
