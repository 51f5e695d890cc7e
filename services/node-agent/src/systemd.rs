//! systemd process supervisor adapter.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::command::{CommandError, CommandRunner};
use crate::vm::VmState;

/// `systemctl stop` on a unit that was never loaded.
const UNIT_NOT_LOADED: &[&str] = &["not loaded"];

/// Errors from the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("failed to query unit {unit}: {output}")]
    Query { unit: String, output: String },
}

/// Process state of a unit, collapsed to what the agent acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Running,
    Stopped,
    Failed,
}

impl UnitState {
    /// Map a systemd `ActiveState` value.
    pub fn from_active_state(state: &str) -> Self {
        match state {
            "active" | "deactivating" => Self::Running,
            "inactive" | "unknown" => Self::Stopped,
            "failed" => Self::Failed,
            other => {
                warn!(state = %other, "Unknown unit state");
                Self::Failed
            }
        }
    }

    pub fn vm_state(self) -> VmState {
        match self {
            Self::Running => VmState::Running,
            Self::Stopped => VmState::Stopped,
            Self::Failed => VmState::Failed,
        }
    }
}

/// Per-unit process supervisor.
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn start(&self, unit: &str) -> Result<(), SupervisorError>;

    /// Stop a unit. Stopping a unit that is not loaded succeeds.
    async fn stop(&self, unit: &str) -> Result<(), SupervisorError>;

    /// Re-read unit files.
    async fn reload(&self) -> Result<(), SupervisorError>;

    async fn state(&self, unit: &str) -> Result<UnitState, SupervisorError>;
}

/// Supervisor backed by `systemctl`.
pub struct SystemdSupervisor {
    runner: Arc<dyn CommandRunner>,
}

impl SystemdSupervisor {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Supervisor for SystemdSupervisor {
    async fn start(&self, unit: &str) -> Result<(), SupervisorError> {
        debug!(unit = %unit, "Starting unit");
        self.runner.run("systemctl", &["start", unit]).await?;
        Ok(())
    }

    async fn stop(&self, unit: &str) -> Result<(), SupervisorError> {
        debug!(unit = %unit, "Stopping unit");
        self.runner
            .run_tolerant(UNIT_NOT_LOADED, "systemctl", &["stop", unit])
            .await?;
        Ok(())
    }

    async fn reload(&self) -> Result<(), SupervisorError> {
        self.runner.run("systemctl", &["daemon-reload"]).await?;
        Ok(())
    }

    async fn state(&self, unit: &str) -> Result<UnitState, SupervisorError> {
        // is-active exits non-zero for every state but "active"
        let output = self.runner.output("systemctl", &["is-active", unit]).await?;
        let state = output.stdout.trim();
        if state.is_empty() {
            return Err(SupervisorError::Query {
                unit: unit.to_string(),
                output: output.stderr.trim().to_string(),
            });
        }
        Ok(UnitState::from_active_state(state))
    }
}
