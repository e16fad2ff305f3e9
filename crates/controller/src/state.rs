use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::anomaly::Anomaly;
use crate::arbiter::{ControlMode, Decision};
use crate::budget::DailyBudget;
use crate::registry::{ActuatorCommand, ActuatorState};
use crate::snapshot::SensorSnapshot;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub controller_id: String,
    pub mqtt_connected: bool,
    /// Mode the operator asked for; the arbiter decides whether it is taken.
    pub requested_mode: ControlMode,
    /// Mode in effect for the last evaluation.
    pub mode: ControlMode,
    pub manual: ActuatorCommand,
    pub snapshot: Option<SensorSnapshot>,
    pub decision: Option<Decision>,
    pub actuators: ActuatorState,
    pub budget: Option<DailyBudget>,
    pub anomaly: Option<Anomaly>,
    pub buffered_uploads: usize,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Decision,
    Actuator,
    Irrigation,
    Anomaly,
    Error,
    System,
}

#[derive(Serialize)]
pub struct HostStats {
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub load_avg_1m: Option<f64>,
}

impl HostStats {
    pub fn sample() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        let load = System::load_average();
        Self {
            total_memory_bytes: system.total_memory(),
            used_memory_bytes: system.used_memory(),
            load_avg_1m: (load.one >= 0.0).then_some(load.one),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub controller_id: String,
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub mode: ControlMode,
    pub requested_mode: ControlMode,
    pub snapshot: Option<SensorSnapshot>,
    pub decision: Option<Decision>,
    pub actuators: ActuatorState,
    pub budget: Option<DailyBudget>,
    pub anomaly: Option<Anomaly>,
    pub buffered_uploads: usize,
    pub host: HostStats,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new(controller_id: impl Into<String>) -> Self {
        Self {
            started_at: Instant::now(),
            controller_id: controller_id.into(),
            mqtt_connected: false,
            requested_mode: ControlMode::Automatic,
            mode: ControlMode::Automatic,
            manual: ActuatorCommand::default(),
            snapshot: None,
            decision: None,
            actuators: ActuatorState::default(),
            budget: None,
            anomaly: None,
            buffered_uploads: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn shared(controller_id: impl Into<String>) -> SharedState {
        Arc::new(RwLock::new(Self::new(controller_id)))
    }

    /// Record a decision that was acted upon or skipped.
    pub fn record_decision(&mut self, decision: &Decision, applied: bool) {
        let verb = if applied { "applied" } else { "skipped" };
        self.push_event(
            EventKind::Decision,
            format!("{} decision {verb} ({})", decision.source.as_str(), decision.mode),
        );
    }

    /// Record an actuator state change.
    pub fn record_actuators(&mut self, state: ActuatorState) {
        if state != self.actuators {
            self.push_event(
                EventKind::Actuator,
                format!(
                    "pump={} irrigation={} fertilizer={} alt_supply={}",
                    on_off(state.pump),
                    on_off(state.irrigation_valve),
                    on_off(state.fertilizer_valve),
                    on_off(state.alt_supply_valve)
                ),
            );
        }
        self.actuators = state;
    }

    /// Track the current anomaly, logging only transitions.
    pub fn record_anomaly(&mut self, anomaly: Option<Anomaly>) {
        if anomaly != self.anomaly {
            let detail = match anomaly {
                Some(a) => format!("flow anomaly: {a}"),
                None => "flow back to normal".to_string(),
            };
            self.push_event(EventKind::Anomaly, detail);
        }
        self.anomaly = anomaly;
    }

    pub fn record_irrigation(&mut self, detail: String) {
        self.push_event(EventKind::Irrigation, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            controller_id: self.controller_id.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            mode: self.mode,
            requested_mode: self.requested_mode,
            snapshot: self.snapshot.clone(),
            decision: self.decision.clone(),
            actuators: self.actuators,
            budget: self.budget.clone(),
            anomaly: self.anomaly,
            buffered_uploads: self.buffered_uploads,
            host: HostStats::sample(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_is_bounded_and_newest_first() {
        let mut st = SystemState::new("c1");
        for i in 0..(MAX_EVENTS + 10) {
            st.record_system(format!("e{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        let status = st.to_status();
        assert_eq!(status.events[0].detail, format!("e{}", MAX_EVENTS + 9));
    }

    #[test]
    fn actuator_event_only_on_change() {
        let mut st = SystemState::new("c1");
        st.record_actuators(ActuatorState::default());
        assert!(st.events.is_empty());
        let on = ActuatorState {
            pump: true,
            irrigation_valve: true,
            ..ActuatorState::default()
        };
        st.record_actuators(on);
        st.record_actuators(on);
        assert_eq!(st.events.len(), 1);
        assert_eq!(st.events[0].kind, EventKind::Actuator);
    }

    #[test]
    fn anomaly_transitions_are_logged() {
        let mut st = SystemState::new("c1");
        st.record_anomaly(Some(Anomaly::Leak));
        st.record_anomaly(Some(Anomaly::Leak));
        st.record_anomaly(None);
        let details: Vec<_> = st.events.iter().map(|e| e.detail.as_str()).collect();
        assert_eq!(details, ["flow anomaly: leak", "flow back to normal"]);
    }

    #[test]
    fn status_serializes() {
        let st = SystemState::new("c1");
        let json = serde_json::to_value(st.to_status()).unwrap();
        assert_eq!(json["controller_id"], "c1");
        assert_eq!(json["mode"], "automatic");
        assert_eq!(json["actuators"]["pump"], false);
    }
}
