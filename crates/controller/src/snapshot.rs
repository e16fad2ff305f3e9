//! Sensor readings and the immutable per-cycle snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

use crate::model::{Feature, Features};
use crate::season::Season;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Humidity,
    Temperature,
    Ph,
    Ce,
    WaterLevel,
    FlowRate,
}

impl SensorKind {
    pub const ALL: [SensorKind; 6] = [
        SensorKind::Humidity,
        SensorKind::Temperature,
        SensorKind::Ph,
        SensorKind::Ce,
        SensorKind::WaterLevel,
        SensorKind::FlowRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Humidity => "humidity",
            SensorKind::Temperature => "temperature",
            SensorKind::Ph => "ph",
            SensorKind::Ce => "ce",
            SensorKind::WaterLevel => "water_level",
            SensorKind::FlowRate => "flow_rate",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SensorKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown sensor kind '{s}'"))
    }
}

/// One value from a sensor driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub value: f64,
    /// Unix seconds.
    pub ts: i64,
}

/// Everything the arbiter sees in one cycle.  Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub humidity: f64,
    pub temperature: f64,
    pub ph: f64,
    pub ce: f64,
    pub water_level: f64,
    pub flow_rate: f64,
    pub season: Season,
}

impl SensorSnapshot {
    pub fn value(&self, kind: SensorKind) -> f64 {
        match kind {
            SensorKind::Humidity => self.humidity,
            SensorKind::Temperature => self.temperature,
            SensorKind::Ph => self.ph,
            SensorKind::Ce => self.ce,
            SensorKind::WaterLevel => self.water_level,
            SensorKind::FlowRate => self.flow_rate,
        }
    }

    /// Model input: every quantity by name plus the season as a category.
    pub fn features(&self) -> Features {
        let mut features: Features = SensorKind::ALL
            .into_iter()
            .map(|k| (k.as_str().to_string(), Feature::Number(self.value(k))))
            .collect();
        features.insert(
            "season".to_string(),
            Feature::Category(self.season.as_str().to_string()),
        );
        features
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A snapshot inside every summer band.
    pub fn calm_summer() -> SensorSnapshot {
        SensorSnapshot {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            humidity: 50.0,
            temperature: 25.0,
            ph: 6.5,
            ce: 1.8,
            water_level: 50.0,
            flow_rate: 0.0,
            season: Season::Summer,
        }
    }
}
