//! Tagged errors surfaced by the control components to the supervisor.

use crate::actuator::ActuatorId;
use crate::critical::CriticalAction;
use crate::snapshot::SensorKind;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    /// A network or bus call failed or timed out.
    #[error("transient i/o failure: {0}")]
    TransientIo(String),

    #[error("sensor_unavailable: {kind}: {detail}")]
    SensorUnavailable { kind: SensorKind, detail: String },

    #[error("model_unavailable: {0}")]
    ModelUnavailable(String),

    #[error("bad_shape: {0}")]
    BadShape(String),

    /// The driver call failed; the actuator was forced off.
    #[error("actuator {actuator} failed to switch (on={target}): {detail}")]
    Actuator {
        actuator: ActuatorId,
        target: bool,
        detail: String,
    },

    #[error("critical section busy with {0}")]
    Busy(CriticalAction),

    /// A programming fault, never expected in production.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("safety ceiling of {limit_secs}s exceeded after {delivered_l:.2} L")]
    SafetyCeilingExceeded { limit_secs: u64, delivered_l: f64 },
}

impl ControlError {
    /// Whether the supervisor may keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvariantViolation(_))
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
