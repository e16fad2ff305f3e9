//! Flow-based leak/blockage detection.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    /// Flow where none is expected, or more than expected.
    Leak,
    /// Less flow than expected.
    Blockage,
    /// No flow reading available.
    NoReading,
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Anomaly::Leak => "leak",
            Anomaly::Blockage => "blockage",
            Anomaly::NoReading => "no flow reading",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyDetector {
    /// Expected flow (L/min) with pump and irrigation valve both on.
    pub nominal_flow: f64,
    /// Flow at or below this counts as zero.
    pub minimal_flow_threshold: f64,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self {
            nominal_flow: 30.0,
            minimal_flow_threshold: 0.5,
        }
    }
}

impl AnomalyDetector {
    pub fn new(nominal_flow: f64, minimal_flow_threshold: f64) -> Self {
        Self {
            nominal_flow,
            minimal_flow_threshold,
        }
    }

    pub fn expected_flow(&self, pump_on: bool, valve_on: bool) -> f64 {
        if pump_on && valve_on {
            self.nominal_flow
        } else {
            0.0
        }
    }

    pub fn classify(
        &self,
        observed: Option<f64>,
        pump_on: bool,
        valve_on: bool,
        tolerance: f64,
    ) -> Option<Anomaly> {
        let Some(flow) = observed.filter(|f| f.is_finite()) else {
            return Some(Anomaly::NoReading);
        };
        let expected = self.expected_flow(pump_on, valve_on);

        if expected <= 0.0 {
            return (flow > self.minimal_flow_threshold).then_some(Anomaly::Leak);
        }
        if flow < expected * (1.0 - tolerance) {
            Some(Anomaly::Blockage)
        } else if flow > expected * (1.0 + tolerance) {
            Some(Anomaly::Leak)
        } else {
            None
        }
    }

    pub fn detect(&self, observed: Option<f64>, pump_on: bool, valve_on: bool, tolerance: f64) -> bool {
        self.classify(observed, pump_on, valve_on, tolerance).is_some()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
