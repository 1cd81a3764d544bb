//! Reconciliation of recorded sandbox state with the operating system.

use crate::error::Result;
use crate::process;
use crate::sandbox::{Registry, SandboxRecord, SandboxState};

/// Corrects recorded state against actual process liveness.
#[derive(Debug, Clone)]
pub struct StatusReconciler {
    registry: Registry,
}

impl StatusReconciler {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// Returns true if the recorded supervisor pid exists and is ours.
    ///
    /// Pid reuse is not detected.
    pub fn is_actually_running(record: &SandboxRecord) -> bool {
        record
            .process_handle
            .map(|handle| process::process_alive(handle.pid))
            .unwrap_or(false)
    }

    /// Returns true if the supervisor is gone but something it started
    /// survives: members of its process group, or a holder of its port.
    pub fn has_leftovers(record: &SandboxRecord) -> bool {
        match record.process_handle {
            Some(handle) if !process::process_alive(handle.pid) => {
                process::group_alive(handle.process_group_id)
                    || !process::port_owners(record.ssh_port).is_empty()
            }
            _ => false,
        }
    }

    /// The state `record` should have given actual liveness, if different.
    ///
    /// A dead supervisor with surviving leftovers is `Stopping`: the handle
    /// is kept so that a later stop can still tear its group down.
    pub fn correction(record: &SandboxRecord) -> Option<SandboxState> {
        let actual = if Self::is_actually_running(record) {
            SandboxState::Running
        } else if Self::has_leftovers(record) {
            SandboxState::Stopping
        } else {
            SandboxState::Stopped
        };
        (actual != record.state).then_some(actual)
    }

    /// Reconciles one record and persists any correction.
    pub fn reconcile(&self, name: &str) -> Result<SandboxRecord> {
        let record = self.registry.require(name)?;
        self.apply(record)
    }

    /// Reconciles every record, returning them in name order.
    pub fn reconcile_all(&self) -> Result<Vec<SandboxRecord>> {
        self.registry
            .list_all()?
            .into_values()
            .map(|record| self.apply(record))
            .collect()
    }

    fn apply(&self, mut record: SandboxRecord) -> Result<SandboxRecord> {
        let Some(state) = Self::correction(&record) else {
            return Ok(record);
        };

        tracing::info!(
            name = %record.name,
            recorded = %record.state,
            actual = %state,
            "correcting recorded sandbox state"
        );
        match state {
            SandboxState::Stopped => record.mark_stopped(),
            _ => {
                record.state = state;
                record.touch();
            }
        }
        self.registry.put(&record.name.clone(), record.clone())?;
        Ok(record)
    }
}
