//! Seasons and the per-season safe bands used by the arbiter.
//!
//! Every season carries its own min/max table for the six monitored
//! quantities. `Season::Default` is the season-agnostic table used by the
//! degraded (model unavailable) rule set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::snapshot::SensorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    Summer,
    Autumn,
    Winter,
    Spring,
    Default,
}

impl Season {
    pub const ALL: [Season; 5] = [
        Season::Summer,
        Season::Autumn,
        Season::Winter,
        Season::Spring,
        Season::Default,
    ];

    /// Calendar season for a month (1-12).  The southern mapping puts
    /// December-February in summer.
    pub fn from_month(month: u8, hemisphere: Hemisphere) -> Self {
        if !(1..=12).contains(&month) {
            return Season::Default;
        }
        let month = match hemisphere {
            Hemisphere::South => month,
            Hemisphere::North => (month + 5) % 12 + 1,
        };
        match month {
            12 | 1 | 2 => Season::Summer,
            3..=5 => Season::Autumn,
            6..=8 => Season::Winter,
            9..=11 => Season::Spring,
            _ => Season::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Summer => "summer",
            Season::Autumn => "autumn",
            Season::Winter => "winter",
            Season::Spring => "spring",
            Season::Default => "default",
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Season {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "summer" => Ok(Season::Summer),
            "autumn" | "fall" => Ok(Season::Autumn),
            "winter" => Ok(Season::Winter),
            "spring" => Ok(Season::Spring),
            "default" => Ok(Season::Default),
            other => Err(format!("unknown season '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Hemisphere {
    #[default]
    South,
    North,
}

// ---------------------------------------------------------------------------
// Bands
// ---------------------------------------------------------------------------

/// Inclusive safe range for one quantity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandCheck {
    Below,
    Within,
    Above,
}

impl Band {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn check(&self, value: f64) -> BandCheck {
        if value < self.min {
            BandCheck::Below
        } else if value > self.max {
            BandCheck::Above
        } else {
            BandCheck::Within
        }
    }
}

/// One season's table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeasonThresholds {
    pub humidity: Band,
    pub temperature: Band,
    pub ph: Band,
    pub ce: Band,
    pub water_level: Band,
    pub flow_rate: Band,
}

impl SeasonThresholds {
    pub fn band(&self, kind: SensorKind) -> Band {
        match kind {
            SensorKind::Humidity => self.humidity,
            SensorKind::Temperature => self.temperature,
            SensorKind::Ph => self.ph,
            SensorKind::Ce => self.ce,
            SensorKind::WaterLevel => self.water_level,
            SensorKind::FlowRate => self.flow_rate,
        }
    }

    /// Built-in table for a season.
    pub fn builtin(season: Season) -> Self {
        match season {
            Season::Summer => Self {
                humidity: Band::new(20.0, 75.0),
                temperature: Band::new(12.0, 38.0),
                ph: Band::new(5.5, 7.5),
                ce: Band::new(1.0, 2.2),
                water_level: Band::new(25.0, 90.0),
                flow_rate: Band::new(0.0, 60.0),
            },
            Season::Autumn => Self {
                humidity: Band::new(25.0, 80.0),
                temperature: Band::new(8.0, 32.0),
                ph: Band::new(5.5, 7.5),
                ce: Band::new(1.0, 2.5),
                water_level: Band::new(20.0, 85.0),
                flow_rate: Band::new(0.0, 55.0),
            },
            Season::Winter => Self {
                humidity: Band::new(30.0, 85.0),
                temperature: Band::new(4.0, 28.0),
                ph: Band::new(5.8, 7.5),
                ce: Band::new(1.2, 2.5),
                water_level: Band::new(20.0, 80.0),
                flow_rate: Band::new(0.0, 45.0),
            },
            Season::Spring => Self {
                humidity: Band::new(25.0, 80.0),
                temperature: Band::new(8.0, 34.0),
                ph: Band::new(5.5, 7.5),
                ce: Band::new(1.0, 2.4),
                water_level: Band::new(22.0, 85.0),
                flow_rate: Band::new(0.0, 55.0),
            },
            Season::Default => Self {
                humidity: Band::new(20.0, 80.0),
                temperature: Band::new(5.0, 35.0),
                ph: Band::new(5.5, 7.5),
                ce: Band::new(1.0, 2.5),
                water_level: Band::new(20.0, 80.0),
                flow_rate: Band::new(0.0, 60.0),
            },
        }
    }
}

/// All five season tables.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdTable {
    summer: SeasonThresholds,
    autumn: SeasonThresholds,
    winter: SeasonThresholds,
    spring: SeasonThresholds,
    default: SeasonThresholds,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            summer: SeasonThresholds::builtin(Season::Summer),
            autumn: SeasonThresholds::builtin(Season::Autumn),
            winter: SeasonThresholds::builtin(Season::Winter),
            spring: SeasonThresholds::builtin(Season::Spring),
            default: SeasonThresholds::builtin(Season::Default),
        }
    }
}

impl ThresholdTable {
    pub fn get(&self, season: Season) -> &SeasonThresholds {
        match season {
            Season::Summer => &self.summer,
            Season::Autumn => &self.autumn,
            Season::Winter => &self.winter,
            Season::Spring => &self.spring,
            Season::Default => &self.default,
        }
    }

    pub fn set(&mut self, season: Season, thresholds: SeasonThresholds) {
        match season {
            Season::Summer => self.summer = thresholds,
            Season::Autumn => self.autumn = thresholds,
            Season::Winter => self.winter = thresholds,
            Season::Spring => self.spring = thresholds,
            Season::Default => self.default = thresholds,
        }
    }
}
