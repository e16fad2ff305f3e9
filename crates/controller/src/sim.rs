//! Closed-loop plant simulator for running without field hardware.
//!
//! The plant watches the mock relays: soil humidity rises while the pump and
//! irrigation valve are open and dries out otherwise, flow ramps up and down
//! with the same pair, the fertilizer injector raises CE and pulls pH toward
//! neutral, and the alternate supply refills the tank and dilutes CE.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;

use crate::actuator::{ActuatorId, MockRelays, RelayHandle};
use crate::error::ControlResult;
use crate::sensors::Sensor;
use crate::snapshot::{Reading, SensorKind};

/// Flow gained or lost per read, L/min.
pub const FLOW_STEP: f64 = 5.0;

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlantState {
    pub humidity: f64,
    pub temperature: f64,
    pub ph: f64,
    pub ce: f64,
    pub water_level: f64,
    pub flow_rate: f64,
}

impl Default for PlantState {
    fn default() -> Self {
        Self {
            humidity: 45.0,
            temperature: 22.0,
            ph: 6.5,
            ce: 1.6,
            water_level: 60.0,
            flow_rate: 0.0,
        }
    }
}

pub struct SimPlant {
    pump: RelayHandle,
    irrigation_valve: RelayHandle,
    fertilizer_valve: RelayHandle,
    alt_supply_valve: RelayHandle,
    state: Mutex<PlantState>,
    /// Line flow once the ramp has settled, L/min.
    nominal_flow: f64,
    /// Measurement noise multiplier; 0 makes the plant deterministic.
    noise: f64,
}

impl SimPlant {
    pub fn new(relays: &MockRelays, initial: PlantState, nominal_flow: f64, noise: f64) -> Self {
        Self {
            pump: relays.get(ActuatorId::Pump),
            irrigation_valve: relays.get(ActuatorId::IrrigationValve),
            fertilizer_valve: relays.get(ActuatorId::FertilizerValve),
            alt_supply_valve: relays.get(ActuatorId::AltSupplyValve),
            state: Mutex::new(initial),
            nominal_flow: nominal_flow.max(0.0),
            noise,
        }
    }

    pub fn state(&self) -> PlantState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn irrigating(&self) -> bool {
        self.pump.is_on() && self.irrigation_valve.is_on()
    }

    /// Advance the quantity `kind` by one step and return its measured value.
    pub fn step(&self, kind: SensorKind) -> f64 {
        let irrigating = self.irrigating();
        let dosing = self.fertilizer_valve.is_on();
        let refilling = self.alt_supply_valve.is_on();
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());

        match kind {
            SensorKind::FlowRate => {
                s.flow_rate = if irrigating {
                    (s.flow_rate + FLOW_STEP).min(self.nominal_flow)
                } else {
                    (s.flow_rate - FLOW_STEP).max(0.0)
                };
                s.flow_rate
            }
            SensorKind::Humidity => {
                let delta = if irrigating { 1.5 } else { -0.3 };
                s.humidity = (s.humidity + delta).clamp(0.0, 100.0);
                (s.humidity + gaussian(0.0, 0.5 * self.noise)).clamp(0.0, 100.0)
            }
            SensorKind::Temperature => {
                s.temperature += gaussian(0.0, 0.2 * self.noise) + 0.05 * (22.0 - s.temperature);
                s.temperature
            }
            SensorKind::Ph => {
                let pull = if dosing { 0.1 * (6.5 - s.ph) } else { 0.0 };
                s.ph = (s.ph + pull + gaussian(0.0, 0.02 * self.noise)).clamp(3.0, 10.0);
                s.ph
            }
            SensorKind::Ce => {
                let mut delta = -0.005;
                if dosing {
                    delta += 0.05;
                }
                if refilling {
                    delta -= 0.03;
                }
                s.ce = (s.ce + delta).clamp(0.0, 5.0);
                (s.ce + gaussian(0.0, 0.01 * self.noise)).max(0.0)
            }
            SensorKind::WaterLevel => {
                let mut delta = 0.0;
                if refilling {
                    delta += 1.0;
                }
                if irrigating {
                    delta -= 0.5;
                }
                s.water_level = (s.water_level + delta).clamp(0.0, 100.0);
                s.water_level
            }
        }
    }
}

pub struct SimSensor {
    kind: SensorKind,
    plant: Arc<SimPlant>,
}

impl SimSensor {
    /// One simulated sensor per quantity, all observing `plant`.
    pub fn all(plant: &Arc<SimPlant>) -> Vec<Arc<dyn Sensor>> {
        SensorKind::ALL
            .into_iter()
            .map(|kind| {
                Arc::new(SimSensor {
                    kind,
                    plant: Arc::clone(plant),
                }) as Arc<dyn Sensor>
            })
            .collect()
    }
}

#[async_trait]
impl Sensor for SimSensor {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    async fn read(&self) -> ControlResult<Reading> {
        Ok(Reading {
            value: self.plant.step(self.kind),
            ts: OffsetDateTime::now_utc().unix_timestamp(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{ActuatorBank, PinMap};

    const NOMINAL: f64 = 30.0;

    fn plant() -> (Arc<SimPlant>, ActuatorBank) {
        let (bank, relays) = ActuatorBank::mock(&PinMap::default());
        (Arc::new(SimPlant::new(&relays, PlantState::default(), NOMINAL, 0.0)), bank)
    }

    fn irrigate(bank: &mut ActuatorBank, on: bool) {
        for id in [ActuatorId::Pump, ActuatorId::IrrigationValve] {
            let dev = bank.get_mut(id).unwrap();
            if on {
                dev.turn_on().unwrap();
            } else {
                dev.turn_off().unwrap();
            }
        }
    }

    #[test]
    fn flow_settles_at_nominal_while_irrigating() {
        let (plant, mut bank) = plant();
        irrigate(&mut bank, true);
        let flows: Vec<f64> = (0..14).map(|_| plant.step(SensorKind::FlowRate)).collect();
        assert_eq!(&flows[..3], &[5.0, 10.0, 15.0]);
        assert!(flows.iter().all(|f| *f <= NOMINAL));
        assert_eq!(*flows.last().unwrap(), NOMINAL);
    }

    #[test]
    fn flow_decays_to_zero_when_stopped() {
        let (plant, mut bank) = plant();
        irrigate(&mut bank, true);
        for _ in 0..4 {
            plant.step(SensorKind::FlowRate);
        }
        irrigate(&mut bank, false);
        let flows: Vec<f64> = (0..6).map(|_| plant.step(SensorKind::FlowRate)).collect();
        assert_eq!(flows, [15.0, 10.0, 5.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn pump_alone_gives_no_flow() {
        let (plant, mut bank) = plant();
        bank.get_mut(ActuatorId::Pump).unwrap().turn_on().unwrap();
        assert_eq!(plant.step(SensorKind::FlowRate), 0.0);
    }

    #[test]
    fn humidity_rises_while_irrigating_and_falls_otherwise() {
        let (plant, mut bank) = plant();
        let start = plant.state().humidity;
        plant.step(SensorKind::Humidity);
        assert!(plant.state().humidity < start);

        irrigate(&mut bank, true);
        let before = plant.state().humidity;
        plant.step(SensorKind::Humidity);
        assert!(plant.state().humidity > before);
    }

    #[test]
    fn alt_supply_refills_tank() {
        let (plant, mut bank) = plant();
        bank.get_mut(ActuatorId::AltSupplyValve)
            .unwrap()
            .turn_on()
            .unwrap();
        let before = plant.state().water_level;
        plant.step(SensorKind::WaterLevel);
        assert_eq!(plant.state().water_level, before + 1.0);
    }

    #[tokio::test]
    async fn sim_sensors_cover_every_quantity() {
        let (plant, _bank) = plant();
        let sensors = SimSensor::all(&plant);
        assert_eq!(sensors.len(), SensorKind::ALL.len());
        for s in sensors {
            assert!(s.read().await.is_ok());
        }
    }
}
