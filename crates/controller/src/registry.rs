//! Authoritative record of actuator on/off state.
//!
//! The registry is the only writer to the actuator bank.  Every write needs
//! a [`BusyGuard`] from the controller's critical section, so state can only
//! change inside a critical action.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::actuator::{ActuatorBank, ActuatorId};
use crate::critical::{BusyGuard, CriticalSection};
use crate::error::{ControlError, ControlResult};

// ---------------------------------------------------------------------------
// Command & state values
// ---------------------------------------------------------------------------

/// Desired actuator outputs for one decision.
///
/// A switch left as `None` was not decided by anyone; when a non-empty
/// command is applied, undecided outputs are driven to their safe state (off).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorCommand {
    pub activate_pump: Option<bool>,
    pub open_irrigation_valve: Option<bool>,
    pub inject_fertilizer: Option<bool>,
    pub fertilizer_percent: f64,
    pub open_alt_supply_valve: Option<bool>,
    pub water_amount: f64,
}

impl ActuatorCommand {
    /// A command that sets every switch off.
    pub fn all_off() -> Self {
        Self {
            activate_pump: Some(false),
            open_irrigation_valve: Some(false),
            inject_fertilizer: Some(false),
            open_alt_supply_valve: Some(false),
            ..Self::default()
        }
    }

    /// True when no switch has been decided.
    pub fn is_empty(&self) -> bool {
        self.activate_pump.is_none()
            && self.open_irrigation_valve.is_none()
            && self.inject_fertilizer.is_none()
            && self.open_alt_supply_valve.is_none()
    }

    pub fn switch(&self, id: ActuatorId) -> Option<bool> {
        match id {
            ActuatorId::Pump => self.activate_pump,
            ActuatorId::IrrigationValve => self.open_irrigation_valve,
            ActuatorId::FertilizerValve => self.inject_fertilizer,
            ActuatorId::AltSupplyValve => self.open_alt_supply_valve,
        }
    }

    /// Pump and irrigation valve together.
    pub fn set_irrigation(&mut self, on: bool) {
        self.activate_pump = Some(on);
        self.open_irrigation_valve = Some(on);
    }

    fn desired(&self, id: ActuatorId) -> bool {
        self.switch(id).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActuatorState {
    pub pump: bool,
    pub irrigation_valve: bool,
    pub alt_supply_valve: bool,
    pub fertilizer_valve: bool,
}

impl ActuatorState {
    pub fn get(&self, id: ActuatorId) -> bool {
        match id {
            ActuatorId::Pump => self.pump,
            ActuatorId::IrrigationValve => self.irrigation_valve,
            ActuatorId::FertilizerValve => self.fertilizer_valve,
            ActuatorId::AltSupplyValve => self.alt_supply_valve,
        }
    }

    fn set(&mut self, id: ActuatorId, on: bool) {
        match id {
            ActuatorId::Pump => self.pump = on,
            ActuatorId::IrrigationValve => self.irrigation_valve = on,
            ActuatorId::FertilizerValve => self.fertilizer_valve = on,
            ActuatorId::AltSupplyValve => self.alt_supply_valve = on,
        }
    }

    pub fn irrigating(&self) -> bool {
        self.pump && self.irrigation_valve
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct Inner {
    bank: ActuatorBank,
    state: ActuatorState,
}

pub struct ActuatorRegistry {
    section: CriticalSection,
    inner: Mutex<Inner>,
}

impl ActuatorRegistry {
    /// Takes ownership of the bank; all outputs are assumed off at startup.
    pub fn new(bank: ActuatorBank, section: CriticalSection) -> Self {
        Self {
            section,
            inner: Mutex::new(Inner {
                bank,
                state: ActuatorState::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ActuatorState {
        self.lock().state
    }

    /// Drive the outputs to `cmd`, issuing a hardware call only where the
    /// desired state differs from the recorded one.
    ///
    /// Outputs are switched off first, pump leading, then switched on with
    /// the pump last, so the pump never runs against a closed line.  On a
    /// driver failure the failing output is forced off, recorded as off,
    /// and the error is returned; outputs after it are left untouched.  A
    /// failed irrigation valve also stops the pump.
    pub fn apply(&self, cmd: ActuatorCommand, guard: &BusyGuard) -> ControlResult<ActuatorState> {
        self.section.verify(guard)?;
        if !self.section.is_busy() {
            return Err(ControlError::InvariantViolation(
                "actuator write outside the critical section".into(),
            ));
        }

        let mut inner = self.lock();
        let Inner { bank, state } = &mut *inner;

        let mut turn_off = Vec::new();
        let mut turn_on = Vec::new();
        for id in ActuatorId::ALL {
            let want = cmd.desired(id);
            if state.get(id) == want {
                debug!(actuator = %id, on = want, "already in that state");
            } else if want {
                turn_on.push(id);
            } else {
                turn_off.push(id);
            }
        }
        // ALL lists the pump first.
        turn_on.reverse();

        for (id, want) in turn_off
            .into_iter()
            .map(|id| (id, false))
            .chain(turn_on.into_iter().map(|id| (id, true)))
        {
            if let Err(e) = switch(bank, state, id, want, guard) {
                if id == ActuatorId::IrrigationValve && state.pump {
                    if let Err(stop_err) = switch(bank, state, ActuatorId::Pump, false, guard) {
                        error!("pump stop after valve failure failed: {stop_err}");
                    }
                }
                return Err(e);
            }
        }

        Ok(*state)
    }

    /// Everything off.
    pub fn force_all_off(&self, guard: &BusyGuard) -> ControlResult<ActuatorState> {
        self.apply(ActuatorCommand::all_off(), guard)
    }
}

fn switch(
    bank: &mut ActuatorBank,
    state: &mut ActuatorState,
    id: ActuatorId,
    want: bool,
    guard: &BusyGuard,
) -> ControlResult<()> {
    let device = bank.get_mut(id).ok_or_else(|| {
        ControlError::InvariantViolation(format!("no device registered for {id}"))
    })?;

    let result = if want {
        device.turn_on()
    } else {
        device.turn_off()
    };

    match result {
        Ok(()) => {
            state.set(id, want);
            info!(actuator = %id, on = want, by = %guard.action(), "actuator switched");
            Ok(())
        }
        Err(e) => {
            if let Err(off_err) = device.turn_off() {
                error!(actuator = %id, "safe-state rollback failed: {off_err:#}");
            }
            state.set(id, false);
            error!(actuator = %id, on = want, "actuator driver failed: {e:#}");
            Err(ControlError::Actuator {
                actuator: id,
                target: want,
                detail: format!("{e:#}"),
            })
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{MockRelays, PinMap};
    use crate::critical::CriticalAction;

    fn mock_registry() -> (ActuatorRegistry, MockRelays, CriticalSection) {
        let cs = CriticalSection::new();
        let (bank, relays) = ActuatorBank::mock(&PinMap::default());
        (ActuatorRegistry::new(bank, cs.clone()), relays, cs)
    }

    fn irrigate() -> ActuatorCommand {
        let mut cmd = ActuatorCommand::default();
        cmd.set_irrigation(true);
        cmd
    }

    // -- ActuatorCommand ----------------------------------------------------

    #[test]
    fn default_command_is_empty() {
        assert!(ActuatorCommand::default().is_empty());
        assert!(!irrigate().is_empty());
        assert!(!ActuatorCommand::all_off().is_empty());
    }

    #[test]
    fn command_deserializes_with_missing_fields() {
        let cmd: ActuatorCommand =
            serde_json::from_str(r#"{"activate_pump":true,"water_amount":12.5}"#).unwrap();
        assert_eq!(cmd.activate_pump, Some(true));
        assert_eq!(cmd.open_irrigation_valve, None);
        assert_eq!(cmd.water_amount, 12.5);
    }

    // -- apply --------------------------------------------------------------

    #[test]
    fn apply_switches_requested_outputs() {
        let (reg, relays, cs) = mock_registry();
        let g = cs.try_enter(CriticalAction::ControlCycle).unwrap();
        let st = reg.apply(irrigate(), &g).unwrap();
        assert!(st.pump && st.irrigation_valve);
        assert!(!st.fertilizer_valve && !st.alt_supply_valve);
        assert!(relays.get(ActuatorId::Pump).is_on());
        assert_eq!(relays.total_switches(), 2);
    }

    #[test]
    fn apply_twice_is_idempotent() {
        let (reg, relays, cs) = mock_registry();
        let g = cs.try_enter(CriticalAction::ControlCycle).unwrap();
        let first = reg.apply(irrigate(), &g).unwrap();
        let calls = relays.total_switches();
        let second = reg.apply(irrigate(), &g).unwrap();
        assert_eq!(first, second);
        assert_eq!(relays.total_switches(), calls, "no extra hardware calls");
    }

    #[test]
    fn undecided_switches_go_off() {
        let (reg, _relays, cs) = mock_registry();
        let g = cs.try_enter(CriticalAction::ControlCycle).unwrap();
        let mut cmd = irrigate();
        cmd.inject_fertilizer = Some(true);
        reg.apply(cmd, &g).unwrap();

        let mut only_pump = ActuatorCommand::default();
        only_pump.activate_pump = Some(true);
        let st = reg.apply(only_pump, &g).unwrap();
        assert!(st.pump);
        assert!(!st.irrigation_valve);
        assert!(!st.fertilizer_valve);
    }

    #[test]
    fn driver_failure_rolls_back_to_off_and_propagates() {
        let (reg, relays, cs) = mock_registry();
        relays.get(ActuatorId::IrrigationValve).set_fault(true);
        let g = cs.try_enter(CriticalAction::ControlCycle).unwrap();

        let err = reg.apply(irrigate(), &g).unwrap_err();
        assert!(matches!(
            err,
            ControlError::Actuator {
                actuator: ActuatorId::IrrigationValve,
                target: true,
                ..
            }
        ));
        let st = reg.state();
        assert!(!st.pump, "pump starts only after the valve is open");
        assert!(!st.irrigation_valve);
        assert!(!relays.get(ActuatorId::Pump).is_on());
        assert_eq!(relays.get(ActuatorId::Pump).switches(), 0);
        assert!(!relays.get(ActuatorId::IrrigationValve).is_on());
    }

    #[test]
    fn failed_valve_stops_a_running_pump() {
        let (reg, relays, cs) = mock_registry();
        let g = cs.try_enter(CriticalAction::ControlCycle).unwrap();
        let mut pump_only = ActuatorCommand::default();
        pump_only.activate_pump = Some(true);
        pump_only.open_irrigation_valve = Some(false);
        reg.apply(pump_only, &g).unwrap();
        assert!(relays.get(ActuatorId::Pump).is_on());

        relays.get(ActuatorId::IrrigationValve).set_fault(true);
        assert!(reg.apply(irrigate(), &g).is_err());
        assert!(!reg.state().pump);
        assert!(!relays.get(ActuatorId::Pump).is_on());
    }

    #[test]
    fn foreign_guard_is_an_invariant_violation() {
        let (reg, relays, _cs) = mock_registry();
        let other = CriticalSection::new();
        let g = other.try_enter(CriticalAction::Dosing).unwrap();
        let err = reg.apply(irrigate(), &g).unwrap_err();
        assert!(matches!(err, ControlError::InvariantViolation(_)));
        assert_eq!(relays.total_switches(), 0);
    }

    #[test]
    fn force_all_off_clears_everything() {
        let (reg, _relays, cs) = mock_registry();
        let g = cs.try_enter(CriticalAction::Shutdown).unwrap();
        let mut cmd = irrigate();
        cmd.open_alt_supply_valve = Some(true);
        reg.apply(cmd, &g).unwrap();
        let st = reg.force_all_off(&g).unwrap();
        assert_eq!(st, ActuatorState::default());
    }
}
