//! The single critical section shared by every task that touches actuators
//! or the water budget.
//!
//! Entry never blocks: `try_enter` either hands back a [`BusyGuard`] or
//! reports which action currently holds the section.  Dropping the guard
//! releases it, so every exit path (including `?` and panics unwinding
//! through a task) clears `busy`.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalAction {
    /// Supervisor applying this cycle's decision (and replanning the budget).
    ControlCycle,
    Dosing,
    ScheduledIrrigation,
    ModeSwitch,
    Shutdown,
}

impl fmt::Display for CriticalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CriticalAction::ControlCycle => "control cycle",
            CriticalAction::Dosing => "dosing",
            CriticalAction::ScheduledIrrigation => "scheduled irrigation",
            CriticalAction::ModeSwitch => "mode switch",
            CriticalAction::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Default)]
struct Inner {
    holder: Mutex<Option<CriticalAction>>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Option<CriticalAction>> {
        // The lock only guards a Copy value; a poisoned one is still usable.
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle to the shared `busy` flag.
#[derive(Clone, Default)]
pub struct CriticalSection {
    inner: Arc<Inner>,
}

impl CriticalSection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the section for `action`, or report who holds it.
    pub fn try_enter(&self, action: CriticalAction) -> ControlResult<BusyGuard> {
        let mut holder = self.inner.lock();
        if let Some(current) = *holder {
            debug!(requested = %action, holder = %current, "critical section busy");
            return Err(ControlError::Busy(current));
        }
        *holder = Some(action);
        debug!(action = %action, "critical section entered");
        Ok(BusyGuard {
            inner: Arc::clone(&self.inner),
            action,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().is_some()
    }

    pub fn holder(&self) -> Option<CriticalAction> {
        *self.inner.lock()
    }

    /// Fails with `InvariantViolation` unless `guard` was issued by this section.
    pub fn verify(&self, guard: &BusyGuard) -> ControlResult<()> {
        if Arc::ptr_eq(&self.inner, &guard.inner) {
            Ok(())
        } else {
            Err(ControlError::InvariantViolation(format!(
                "guard for {} belongs to a different critical section",
                guard.action
            )))
        }
    }
}

/// Proof that the holder is inside the critical section.
#[must_use = "the critical section is released as soon as the guard is dropped"]
pub struct BusyGuard {
    inner: Arc<Inner>,
    action: CriticalAction,
}

impl BusyGuard {
    pub fn action(&self) -> CriticalAction {
        self.action
    }
}

impl fmt::Debug for BusyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusyGuard").field("action", &self.action).finish()
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        let mut holder = self.inner.lock();
        *holder = None;
        debug!(action = %self.action, "critical section released");
    }
}
