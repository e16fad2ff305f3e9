//! Sensor seam, snapshot acquisition, and the MQTT telemetry cache.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, warn};

use crate::conditioning;
use crate::error::{ControlError, ControlResult};
use crate::season::{Hemisphere, Season};
use crate::snapshot::{Reading, SensorKind, SensorSnapshot};

#[async_trait]
pub trait Sensor: Send + Sync {
    fn kind(&self) -> SensorKind;
    async fn read(&self) -> ControlResult<Reading>;
}

// ---------------------------------------------------------------------------
// Suite: one sensor per quantity plus the smoothing histories
// ---------------------------------------------------------------------------

pub struct SensorSuite {
    sensors: HashMap<SensorKind, Arc<dyn Sensor>>,
    histories: HashMap<SensorKind, VecDeque<f64>>,
    hemisphere: Hemisphere,
    offset: UtcOffset,
    read_timeout: Duration,
}

impl SensorSuite {
    /// Needs exactly one sensor for every quantity.
    pub fn new(
        sensors: Vec<Arc<dyn Sensor>>,
        hemisphere: Hemisphere,
        offset: UtcOffset,
        read_timeout: Duration,
    ) -> Result<Self> {
        let mut by_kind: HashMap<SensorKind, Arc<dyn Sensor>> = HashMap::new();
        for s in sensors {
            if by_kind.insert(s.kind(), Arc::clone(&s)).is_some() {
                bail!("more than one sensor registered for {}", s.kind());
            }
        }
        let missing: Vec<&str> = SensorKind::ALL
            .iter()
            .filter(|k| !by_kind.contains_key(k))
            .map(|k| k.as_str())
            .collect();
        if !missing.is_empty() {
            bail!("no sensor registered for: {}", missing.join(", "));
        }

        Ok(Self {
            sensors: by_kind,
            histories: HashMap::new(),
            hemisphere,
            offset,
            read_timeout,
        })
    }

    pub fn sensor(&self, kind: SensorKind) -> Option<Arc<dyn Sensor>> {
        self.sensors.get(&kind).cloned()
    }

    /// Season for a UTC instant, in the controller's local calendar.
    pub fn season_at(&self, now: OffsetDateTime) -> Season {
        let local = now.to_offset(self.offset);
        Season::from_month(u8::from(local.month()), self.hemisphere)
    }

    /// Read every quantity, smooth it, and freeze the result.  Flow is kept
    /// raw: the anomaly check compares it with the relays' current state.
    ///
    /// The first failing sensor aborts the acquisition; no history is
    /// updated in that case.
    pub async fn acquire(&mut self, now: OffsetDateTime) -> ControlResult<SensorSnapshot> {
        let mut raw = HashMap::with_capacity(SensorKind::ALL.len());
        for kind in SensorKind::ALL {
            let sensor = self.sensors.get(&kind).ok_or_else(|| ControlError::SensorUnavailable {
                kind,
                detail: "not registered".into(),
            })?;
            let reading = match tokio::time::timeout(self.read_timeout, sensor.read()).await {
                Ok(r) => r?,
                Err(_) => {
                    return Err(ControlError::TransientIo(format!(
                        "{kind} read timed out after {:?}",
                        self.read_timeout
                    )))
                }
            };
            raw.insert(kind, reading.value);
        }

        let season = self.season_at(now);
        let mut smooth = |kind: SensorKind| {
            let history = self.histories.entry(kind).or_default();
            conditioning::smooth(history, raw[&kind])
        };
        let snapshot = SensorSnapshot {
            timestamp: now,
            humidity: smooth(SensorKind::Humidity),
            temperature: smooth(SensorKind::Temperature),
            ph: smooth(SensorKind::Ph),
            ce: smooth(SensorKind::Ce),
            water_level: smooth(SensorKind::WaterLevel),
            flow_rate: raw[&SensorKind::FlowRate],
            season,
        };
        debug!(?snapshot, "snapshot acquired");
        Ok(snapshot)
    }
}

// ---------------------------------------------------------------------------
// Telemetry published by field nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TelemetryValue {
    pub kind: SensorKind,
    pub value: f64,
}

/// Payload of `tele/<node_id>/reading`.
#[derive(Debug, Deserialize)]
pub struct TelemetryMsg {
    pub ts: i64,
    pub readings: Vec<TelemetryValue>,
}

/// Latest reading per quantity as reported over MQTT.
pub struct TelemetryFeed {
    latest: RwLock<HashMap<SensorKind, Reading>>,
    stale_after: Duration,
}

impl TelemetryFeed {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            latest: RwLock::new(HashMap::new()),
            stale_after,
        }
    }

    pub fn ingest(&self, node_id: &str, msg: &TelemetryMsg) {
        let mut latest = self.latest.write().unwrap_or_else(|e| e.into_inner());
        for r in &msg.readings {
            if !r.value.is_finite() {
                warn!(node = %node_id, kind = %r.kind, "non-finite telemetry value dropped");
                continue;
            }
            // Out-of-order messages must not roll a quantity back in time.
            let newer = latest.get(&r.kind).map_or(true, |prev| msg.ts >= prev.ts);
            if newer {
                latest.insert(
                    r.kind,
                    Reading {
                        value: r.value,
                        ts: msg.ts,
                    },
                );
            }
        }
    }

    pub fn latest(&self, kind: SensorKind, now_unix: i64) -> ControlResult<Reading> {
        let latest = self.latest.read().unwrap_or_else(|e| e.into_inner());
        let reading = latest.get(&kind).copied().ok_or_else(|| ControlError::SensorUnavailable {
            kind,
            detail: "no telemetry received".into(),
        })?;
        let age = now_unix - reading.ts;
        if age > self.stale_after.as_secs() as i64 {
            return Err(ControlError::SensorUnavailable {
                kind,
                detail: format!("last reading is {age}s old"),
            });
        }
        Ok(reading)
    }
}

pub struct TelemetrySensor {
    kind: SensorKind,
    feed: Arc<TelemetryFeed>,
}

impl TelemetrySensor {
    pub fn new(kind: SensorKind, feed: Arc<TelemetryFeed>) -> Self {
        Self { kind, feed }
    }

    /// One sensor per quantity, all backed by `feed`.
    pub fn all(feed: &Arc<TelemetryFeed>) -> Vec<Arc<dyn Sensor>> {
        SensorKind::ALL
            .into_iter()
            .map(|k| Arc::new(TelemetrySensor::new(k, Arc::clone(feed))) as Arc<dyn Sensor>)
            .collect()
    }
}

#[async_trait]
impl Sensor for TelemetrySensor {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    async fn read(&self) -> ControlResult<Reading> {
        self.feed
            .latest(self.kind, OffsetDateTime::now_utc().unix_timestamp())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
