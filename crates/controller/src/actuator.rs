//! Relay-driven actuators. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation tracks state in memory and logs changes.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// The four physical outputs of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActuatorId {
    Pump,
    IrrigationValve,
    FertilizerValve,
    AltSupplyValve,
}

impl ActuatorId {
    /// Order in which commands are applied.
    pub const ALL: [ActuatorId; 4] = [
        ActuatorId::Pump,
        ActuatorId::IrrigationValve,
        ActuatorId::FertilizerValve,
        ActuatorId::AltSupplyValve,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActuatorId::Pump => "pump",
            ActuatorId::IrrigationValve => "irrigation_valve",
            ActuatorId::FertilizerValve => "fertilizer_valve",
            ActuatorId::AltSupplyValve => "alt_supply_valve",
        }
    }
}

impl fmt::Display for ActuatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On/off capability implemented once per physical device.
pub trait Actuator: Send {
    fn turn_on(&mut self) -> Result<()>;
    fn turn_off(&mut self) -> Result<()>;
    fn is_on(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Real GPIO relay (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct GpioRelay {
    id: ActuatorId,
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl GpioRelay {
    pub fn new(gpio: &Gpio, id: ActuatorId, pin_num: u8, active_low: bool) -> Result<Self> {
        let pin = gpio.get(pin_num)?.into_output();
        let mut relay = Self { id, pin, active_low };
        // Fail-safe: ensure "OFF" at startup
        relay.drive(false);
        info!(actuator = %id, gpio = pin_num, "relay initialised");
        Ok(relay)
    }

    fn drive(&mut self, on: bool) {
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }
}

#[cfg(feature = "gpio")]
impl Actuator for GpioRelay {
    fn turn_on(&mut self) -> Result<()> {
        self.drive(true);
        info!(actuator = %self.id, "relay set ON");
        Ok(())
    }

    fn turn_off(&mut self) -> Result<()> {
        self.drive(false);
        info!(actuator = %self.id, "relay set OFF");
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.pin.is_set_high() != self.active_low
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware, state kept in memory)
// ---------------------------------------------------------------------------

/// Shared view of a mock relay, handed to the simulator and to tests.
#[derive(Clone, Default)]
pub struct RelayHandle {
    on: Arc<AtomicBool>,
    switches: Arc<AtomicUsize>,
    fault: Arc<AtomicBool>,
}

impl RelayHandle {
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }

    /// Number of hardware switch calls issued so far.
    pub fn switches(&self) -> usize {
        self.switches.load(Ordering::SeqCst)
    }

    /// While set, `turn_on` fails as if the driver rejected the write.
    pub fn set_fault(&self, fault: bool) {
        self.fault.store(fault, Ordering::SeqCst);
    }
}

pub struct MockRelay {
    id: ActuatorId,
    handle: RelayHandle,
}

impl MockRelay {
    pub fn new(id: ActuatorId, pin_num: u8) -> Self {
        info!(actuator = %id, gpio = pin_num, "[mock-gpio] registered (not wired)");
        Self {
            id,
            handle: RelayHandle::default(),
        }
    }

    pub fn handle(&self) -> RelayHandle {
        self.handle.clone()
    }
}

impl Actuator for MockRelay {
    fn turn_on(&mut self) -> Result<()> {
        self.handle.switches.fetch_add(1, Ordering::SeqCst);
        if self.handle.fault.load(Ordering::SeqCst) {
            anyhow::bail!("[mock-gpio] injected fault on {}", self.id);
        }
        self.handle.on.store(true, Ordering::SeqCst);
        info!(actuator = %self.id, "[mock-gpio] set ON");
        Ok(())
    }

    fn turn_off(&mut self) -> Result<()> {
        self.handle.switches.fetch_add(1, Ordering::SeqCst);
        self.handle.on.store(false, Ordering::SeqCst);
        info!(actuator = %self.id, "[mock-gpio] set OFF");
        Ok(())
    }

    fn is_on(&self) -> bool {
        self.handle.is_on()
    }
}

// ---------------------------------------------------------------------------
// Bank of all four outputs
// ---------------------------------------------------------------------------

/// BCM pin assignment for each actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinMap {
    pub pump: u8,
    pub irrigation_valve: u8,
    pub fertilizer_valve: u8,
    pub alt_supply_valve: u8,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            pump: 17,
            irrigation_valve: 27,
            fertilizer_valve: 22,
            alt_supply_valve: 23,
        }
    }
}

impl PinMap {
    pub fn pin(&self, id: ActuatorId) -> u8 {
        match id {
            ActuatorId::Pump => self.pump,
            ActuatorId::IrrigationValve => self.irrigation_valve,
            ActuatorId::FertilizerValve => self.fertilizer_valve,
            ActuatorId::AltSupplyValve => self.alt_supply_valve,
        }
    }
}

pub struct ActuatorBank {
    devices: Vec<(ActuatorId, Box<dyn Actuator>)>,
}

impl ActuatorBank {
    pub fn new(devices: Vec<(ActuatorId, Box<dyn Actuator>)>) -> Self {
        Self { devices }
    }

    /// Real relays on the configured pins.
    #[cfg(feature = "gpio")]
    pub fn gpio(pins: &PinMap, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut devices: Vec<(ActuatorId, Box<dyn Actuator>)> = Vec::new();
        for id in ActuatorId::ALL {
            let relay = GpioRelay::new(&gpio, id, pins.pin(id), active_low)?;
            devices.push((id, Box::new(relay)));
        }
        Ok(Self { devices })
    }

    /// Mock relays, plus handles keyed by actuator for observers.
    pub fn mock(pins: &PinMap) -> (Self, MockRelays) {
        let mut devices: Vec<(ActuatorId, Box<dyn Actuator>)> = Vec::new();
        let mut relays = Vec::new();
        for id in ActuatorId::ALL {
            let relay = MockRelay::new(id, pins.pin(id));
            relays.push((id, relay.handle()));
            devices.push((id, Box::new(relay)));
        }
        info!("[mock-gpio] actuator bank initialised (no hardware)");
        (Self { devices }, MockRelays(relays))
    }

    pub fn get_mut(&mut self, id: ActuatorId) -> Option<&mut (dyn Actuator + 'static)> {
        self.devices
            .iter_mut()
            .find(|(d, _)| *d == id)
            .map(|(_, a)| a.as_mut())
    }
}

#[derive(Clone)]
pub struct MockRelays(Vec<(ActuatorId, RelayHandle)>);

impl MockRelays {
    pub fn get(&self, id: ActuatorId) -> RelayHandle {
        self.0
            .iter()
            .find(|(d, _)| *d == id)
            .map(|(_, p)| p.clone())
            .unwrap_or_default()
    }

    pub fn total_switches(&self) -> usize {
        self.0.iter().map(|(_, p)| p.switches()).sum()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- MockRelay ----------------------------------------------------------

    #[test]
    fn mock_relay_starts_off() {
        let relay = MockRelay::new(ActuatorId::Pump, 17);
        assert!(!relay.is_on());
    }

    #[test]
    fn mock_relay_on_off() {
        let mut relay = MockRelay::new(ActuatorId::Pump, 17);
        relay.turn_on().unwrap();
        assert!(relay.is_on());
        relay.turn_off().unwrap();
        assert!(!relay.is_on());
        assert_eq!(relay.handle().switches(), 2);
    }

    #[test]
    fn mock_relay_fault_rejects_turn_on() {
        let mut relay = MockRelay::new(ActuatorId::FertilizerValve, 22);
        relay.handle().set_fault(true);
        assert!(relay.turn_on().is_err());
        assert!(!relay.is_on());
        // turning off still works so the caller can reach the safe state
        relay.turn_off().unwrap();
    }

    // -- ActuatorBank -------------------------------------------------------

    #[test]
    fn mock_bank_registers_all_four() {
        let (mut bank, relays) = ActuatorBank::mock(&PinMap::default());
        for id in ActuatorId::ALL {
            assert!(bank.get_mut(id).is_some(), "{id} missing");
            assert!(!relays.get(id).is_on());
        }
    }

    #[test]
    fn handle_observes_bank_changes() {
        let (mut bank, relays) = ActuatorBank::mock(&PinMap::default());
        bank.get_mut(ActuatorId::IrrigationValve)
            .unwrap()
            .turn_on()
            .unwrap();
        assert!(relays.get(ActuatorId::IrrigationValve).is_on());
        assert!(!relays.get(ActuatorId::Pump).is_on());
        assert_eq!(relays.total_switches(), 1);
    }

    #[test]
    fn default_pins_match_wiring() {
        let pins = PinMap::default();
        assert_eq!(pins.pin(ActuatorId::Pump), 17);
        assert_eq!(pins.pin(ActuatorId::IrrigationValve), 27);
        assert_eq!(pins.pin(ActuatorId::AltSupplyValve), 23);
        assert_eq!(pins.pin(ActuatorId::FertilizerValve), 22);
    }
}
