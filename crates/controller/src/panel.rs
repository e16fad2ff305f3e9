//! Operator interface seam.
//!
//! The supervisor pulls the requested mode and manual command from the panel
//! each cycle and pushes the outcome back.  [`LocalPanel`] is backed by the
//! in-process [`SystemState`](crate::state::SystemState) that the HTTP API
//! reads and writes.

use async_trait::async_trait;

use crate::arbiter::{ControlMode, Decision};
use crate::error::ControlResult;
use crate::registry::ActuatorCommand;
use crate::snapshot::SensorSnapshot;
use crate::state::SharedState;

#[async_trait]
pub trait OperatorPanel: Send + Sync {
    async fn get_control_mode(&self) -> ControlResult<ControlMode>;

    async fn get_manual_commands(&self) -> ControlResult<ActuatorCommand>;

    /// Best-effort; callers log failures and carry on.
    async fn push_status(
        &self,
        snapshot: &SensorSnapshot,
        mode: ControlMode,
        decision: Option<&Decision>,
    ) -> ControlResult<()>;
}

#[derive(Clone)]
pub struct LocalPanel {
    shared: SharedState,
}

impl LocalPanel {
    pub fn new(shared: SharedState) -> Self {
        Self { shared }
    }
}

#[async_trait]
impl OperatorPanel for LocalPanel {
    async fn get_control_mode(&self) -> ControlResult<ControlMode> {
        Ok(self.shared.read().await.requested_mode)
    }

    async fn get_manual_commands(&self) -> ControlResult<ActuatorCommand> {
        Ok(self.shared.read().await.manual.clone())
    }

    async fn push_status(
        &self,
        snapshot: &SensorSnapshot,
        mode: ControlMode,
        decision: Option<&Decision>,
    ) -> ControlResult<()> {
        let mut st = self.shared.write().await;
        st.snapshot = Some(snapshot.clone());
        st.mode = mode;
        if let Some(d) = decision {
            st.decision = Some(d.clone());
        }
        Ok(())
    }
}
