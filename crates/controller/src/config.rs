//! TOML config file loading, validation, and environment overrides.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use time::UtcOffset;

use crate::actuator::{ActuatorId, PinMap};
use crate::budget::SplitPolicy;
use crate::scheduler::{parse_time_of_day, RunSettings, ScheduleTable};
use crate::season::{Hemisphere, Season, SeasonThresholds, ThresholdTable};
use crate::snapshot::SensorKind;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorBackend {
    /// Simulated plant driven by the mock relays.
    #[default]
    Sim,
    /// Latest values published by field nodes over MQTT.
    Telemetry,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub controller_id: String,
    pub sampling_period_seconds: u64,
    pub flow_tolerance: f64,
    pub minimal_flow_threshold: f64,
    pub nominal_flow_lpm: f64,
    pub max_irrigation_seconds: u64,
    pub metering_interval_seconds: u64,
    pub per_event_split_policy: SplitPolicy,
    pub busy_retry_seconds: u64,
    pub busy_retries: u32,
    pub error_cooldown_seconds: u64,
    pub network_timeout_seconds: u64,
    pub hemisphere: Hemisphere,
    pub utc_offset_hours: i8,
    pub sensor_backend: SensorBackend,
    pub stale_timeout_seconds: u64,
    pub sync_buffer_capacity: usize,
    pub db_url: String,
    pub model_path: String,
    pub mqtt: MqttConfig,
    pub web: WebConfig,
    pub gpio: GpioConfig,
    /// Irrigation times ("HH:MM") per season.  Seasons not listed keep
    /// the built-in times.
    pub schedule: HashMap<String, Vec<String>>,
    /// Full replacement of a season's built-in band table.
    pub thresholds: HashMap<String, SeasonThresholds>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            controller_id: "controller-1".to_string(),
            sampling_period_seconds: 60,
            flow_tolerance: 0.2,
            minimal_flow_threshold: 0.5,
            nominal_flow_lpm: 30.0,
            max_irrigation_seconds: 30 * 60,
            metering_interval_seconds: 1,
            per_event_split_policy: SplitPolicy::EqualSplit,
            busy_retry_seconds: 5,
            busy_retries: 12,
            error_cooldown_seconds: 5,
            network_timeout_seconds: 5,
            hemisphere: Hemisphere::South,
            utc_offset_hours: 0,
            sensor_backend: SensorBackend::Sim,
            stale_timeout_seconds: 300,
            sync_buffer_capacity: 1000,
            db_url: "sqlite:irrigation.db?mode=rwc".to_string(),
            model_path: "model.json".to_string(),
            mqtt: MqttConfig::default(),
            web: WebConfig::default(),
            gpio: GpioConfig::default(),
            schedule: HashMap::new(),
            thresholds: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_seconds: u64,
    /// Largest MQTT packet sent or accepted.  Upload batches are split to
    /// fit under it.
    pub max_packet_bytes: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            keep_alive_seconds: 30,
            max_packet_bytes: 10 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpioConfig {
    /// Drive real relays; otherwise mock relays are used.
    pub enabled: bool,
    /// Many common relay boards are active-low.
    pub active_low: bool,
    pub pump: u8,
    pub irrigation_valve: u8,
    pub fertilizer_valve: u8,
    pub alt_supply_valve: u8,
}

impl Default for GpioConfig {
    fn default() -> Self {
        let pins = PinMap::default();
        Self {
            enabled: false,
            active_low: true,
            pump: pins.pump,
            irrigation_valve: pins.irrigation_valve,
            fertilizer_valve: pins.fertilizer_valve,
            alt_supply_valve: pins.alt_supply_valve,
        }
    }
}

impl GpioConfig {
    pub fn pins(&self) -> PinMap {
        PinMap {
            pump: self.pump,
            irrigation_valve: self.irrigation_valve,
            fertilizer_valve: self.fertilizer_valve,
            alt_supply_valve: self.alt_supply_valve,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[u8] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Room for at least one snapshot plus the readings topic.
const MIN_MQTT_PACKET_BYTES: usize = 1024;

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_general(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_flow(&mut errors);
        self.validate_gpio(&mut errors);
        self.validate_schedule(&mut errors);
        self.validate_thresholds(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_general(&self, errors: &mut Vec<String>) {
        let id = self.controller_id.trim();
        if id.is_empty() {
            errors.push("controller_id is empty".to_string());
        } else if id.contains(&['/', '+', '#'][..]) {
            errors.push(format!(
                "controller_id '{id}' must not contain MQTT topic characters (/ + #)"
            ));
        }

        if !self.db_url.starts_with("sqlite:") {
            errors.push(format!("db_url '{}' is not a sqlite url", self.db_url));
        }
        if self.model_path.trim().is_empty() {
            errors.push("model_path is empty".to_string());
        }
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".to_string());
        }
        if self.mqtt.max_packet_bytes < MIN_MQTT_PACKET_BYTES {
            errors.push(format!(
                "mqtt.max_packet_bytes {} is below {MIN_MQTT_PACKET_BYTES}",
                self.mqtt.max_packet_bytes
            ));
        }
        if self.web.bind.parse::<IpAddr>().is_err() {
            errors.push(format!("web.bind '{}' is not an IP address", self.web.bind));
        }
        if self.sync_buffer_capacity == 0 {
            errors.push("sync_buffer_capacity must be positive".to_string());
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            errors.push(format!(
                "utc_offset_hours {} out of range [-12, 14]",
                self.utc_offset_hours
            ));
        }

        if self.sensor_backend == SensorBackend::Sim {
            if !cfg!(feature = "sim") {
                errors.push("sensor_backend = \"sim\" needs the `sim` feature".to_string());
            }
            if self.gpio.enabled {
                errors.push(
                    "sensor_backend = \"sim\" observes mock relays; set gpio.enabled = false"
                        .to_string(),
                );
            }
        }
        if self.gpio.enabled && !cfg!(feature = "gpio") {
            errors.push("gpio.enabled = true needs the `gpio` feature".to_string());
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        for (name, value) in [
            ("sampling_period_seconds", self.sampling_period_seconds),
            ("max_irrigation_seconds", self.max_irrigation_seconds),
            ("metering_interval_seconds", self.metering_interval_seconds),
            ("network_timeout_seconds", self.network_timeout_seconds),
            ("stale_timeout_seconds", self.stale_timeout_seconds),
            ("busy_retry_seconds", self.busy_retry_seconds),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be positive, got 0"));
            }
        }

        if self.metering_interval_seconds > 0
            && self.max_irrigation_seconds > 0
            && self.metering_interval_seconds >= self.max_irrigation_seconds
        {
            errors.push(format!(
                "metering_interval_seconds ({}) must be less than max_irrigation_seconds ({})",
                self.metering_interval_seconds, self.max_irrigation_seconds
            ));
        }
        if self.network_timeout_seconds > 0
            && self.sampling_period_seconds > 0
            && self.network_timeout_seconds >= self.sampling_period_seconds
        {
            errors.push(format!(
                "network_timeout_seconds ({}) must be less than sampling_period_seconds ({})",
                self.network_timeout_seconds, self.sampling_period_seconds
            ));
        }
    }

    fn validate_flow(&self, errors: &mut Vec<String>) {
        if !(self.flow_tolerance > 0.0 && self.flow_tolerance <= 1.0) {
            errors.push(format!(
                "flow_tolerance {} out of range (0.0, 1.0]",
                self.flow_tolerance
            ));
        }
        if !(self.minimal_flow_threshold >= 0.0 && self.minimal_flow_threshold.is_finite()) {
            errors.push(format!(
                "minimal_flow_threshold must be >= 0, got {}",
                self.minimal_flow_threshold
            ));
        }
        if !(self.nominal_flow_lpm > 0.0 && self.nominal_flow_lpm.is_finite()) {
            errors.push(format!(
                "nominal_flow_lpm must be positive, got {}",
                self.nominal_flow_lpm
            ));
        }
    }

    fn validate_gpio(&self, errors: &mut Vec<String>) {
        let pins = self.gpio.pins();
        let mut seen_pins: HashSet<u8> = HashSet::new();

        for id in ActuatorId::ALL {
            let pin = pins.pin(id);
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "gpio.{}: pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)",
                    id.as_str()
                ));
            } else if !seen_pins.insert(pin) {
                errors.push(format!(
                    "gpio.{}: pin {pin} is already used by another actuator",
                    id.as_str()
                ));
            }
        }
    }

    fn validate_schedule(&self, errors: &mut Vec<String>) {
        for (season, times) in &self.schedule {
            if let Err(e) = season.parse::<Season>() {
                errors.push(format!("schedule.{season}: {e}"));
            }
            for t in times {
                if let Err(e) = parse_time_of_day(t) {
                    errors.push(format!("schedule.{season}: {e}"));
                }
            }
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        for (season, table) in &self.thresholds {
            if let Err(e) = season.parse::<Season>() {
                errors.push(format!("thresholds.{season}: {e}"));
            }
            for kind in SensorKind::ALL {
                let band = table.band(kind);
                if !(band.min.is_finite() && band.max.is_finite()) {
                    errors.push(format!("thresholds.{season}.{kind}: bounds must be finite"));
                } else if band.min >= band.max {
                    errors.push(format!(
                        "thresholds.{season}.{kind}: min ({}) must be less than max ({})",
                        band.min, band.max
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Derived settings
// ---------------------------------------------------------------------------

impl Config {
    pub fn sampling_period(&self) -> Duration {
        Duration::from_secs(self.sampling_period_seconds)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_seconds)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_seconds)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_seconds)
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        UtcOffset::from_hms(self.utc_offset_hours, 0, 0)
            .with_context(|| format!("invalid utc_offset_hours {}", self.utc_offset_hours))
    }

    pub fn web_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .web
            .bind
            .parse()
            .with_context(|| format!("invalid web.bind '{}'", self.web.bind))?;
        Ok(SocketAddr::new(ip, self.web.port))
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            max_irrigation: Duration::from_secs(self.max_irrigation_seconds),
            metering_interval: Duration::from_secs(self.metering_interval_seconds),
            busy_retry: Duration::from_secs(self.busy_retry_seconds),
            busy_retries: self.busy_retries,
        }
    }

    /// Built-in times with the configured seasons replaced.
    pub fn schedule_table(&self) -> Result<ScheduleTable> {
        let builtin = ScheduleTable::default();
        let mut times: HashMap<_, _> = Season::ALL
            .into_iter()
            .map(|s| (s, builtin.times(s).to_vec()))
            .collect();
        for (key, list) in &self.schedule {
            let season: Season = key
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("schedule.{key}"))?;
            let parsed = list
                .iter()
                .map(|t| parse_time_of_day(t))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("schedule.{season}"))?;
            times.insert(season, parsed);
        }
        Ok(ScheduleTable::new(times))
    }

    pub fn threshold_table(&self) -> Result<ThresholdTable> {
        let mut table = ThresholdTable::default();
        for (key, bands) in &self.thresholds {
            let season: Season = key
                .parse()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("thresholds.{key}"))?;
            table.set(season, *bands);
        }
        Ok(table)
    }

    /// Apply `MQTT_HOST`, `MQTT_PORT`, `DB_URL` and `WEB_PORT` from `lookup`.
    /// Unparseable ports are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(url) = lookup("DB_URL") {
            self.db_url = url;
        }
        if let Some(port) = lookup("WEB_PORT").and_then(|s| s.parse().ok()) {
            self.web.port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file, apply environment overrides, and
/// validate the result.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env_overrides(|k| std::env::var(k).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
