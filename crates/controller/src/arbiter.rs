//! Decision arbitration: manual commands, emergency policy, model, and the
//! degraded rule set, in that order of precedence.
//!
//! The arbiter never touches actuators.  It turns a snapshot into a
//! [`Decision`]; the supervisor decides whether to apply it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::critical::{CriticalAction, CriticalSection};
use crate::db::Recorder;
use crate::model::{DecisionModel, Prediction};
use crate::registry::ActuatorCommand;
use crate::season::{BandCheck, Season, SeasonThresholds, ThresholdTable};
use crate::snapshot::{SensorKind, SensorSnapshot};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    #[default]
    Automatic,
    Manual,
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlMode::Automatic => "automatic",
            ControlMode::Manual => "manual",
        })
    }
}

impl FromStr for ControlMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "automatic" | "auto" => Ok(ControlMode::Automatic),
            "manual" => Ok(ControlMode::Manual),
            other => Err(format!("unknown control mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Manual,
    Emergency,
    Model,
    /// Model unavailable; default rule set.
    Fallback,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Manual => "manual",
            DecisionSource::Emergency => "emergency",
            DecisionSource::Model => "model",
            DecisionSource::Fallback => "fallback",
        }
    }
}

/// What automatic mode would have done, shown to the operator in manual mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub recommended: ActuatorCommand,
    pub source: DecisionSource,
    pub comments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub mode: ControlMode,
    pub source: DecisionSource,
    pub command: ActuatorCommand,
    /// Quantities whose emergency rule fired, in evaluation order.
    pub emergency: Vec<SensorKind>,
    pub prediction: Option<Prediction>,
    pub suggestion: Option<Suggestion>,
}

impl Decision {
    pub fn new(mode: ControlMode, source: DecisionSource, command: ActuatorCommand) -> Self {
        Self {
            mode,
            source,
            command,
            emergency: Vec::new(),
            prediction: None,
            suggestion: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rule sets
// ---------------------------------------------------------------------------

/// Order in which emergency rules run; later rules overwrite fields an
/// earlier rule also owns.
const EMERGENCY_ORDER: [SensorKind; 5] = [
    SensorKind::Humidity,
    SensorKind::Temperature,
    SensorKind::Ph,
    SensorKind::Ce,
    SensorKind::WaterLevel,
];

/// Every quantity outside its band, with the side it left on.
pub fn out_of_band(snap: &SensorSnapshot, bands: &SeasonThresholds) -> Vec<(SensorKind, BandCheck)> {
    SensorKind::ALL
        .into_iter()
        .filter_map(|kind| match bands.band(kind).check(snap.value(kind)) {
            BandCheck::Within => None,
            side => Some((kind, side)),
        })
        .collect()
}

/// Apply one quantity's emergency rule.  Returns false if the quantity has
/// no rule (flow is left to the anomaly detector).
fn emergency_rule(kind: SensorKind, side: BandCheck, cmd: &mut ActuatorCommand) -> bool {
    use BandCheck::{Above, Below};
    match (kind, side) {
        (SensorKind::Humidity, Below) => cmd.set_irrigation(true),
        (SensorKind::Humidity, Above) => cmd.set_irrigation(false),
        // Heat stress is relieved by watering; cold soil is left alone.
        (SensorKind::Temperature, Above) => cmd.set_irrigation(true),
        (SensorKind::Temperature, Below) => cmd.set_irrigation(false),
        // Corrective solution goes through the injector on both sides.
        (SensorKind::Ph, Below | Above) => cmd.inject_fertilizer = Some(true),
        (SensorKind::Ce, Below) => cmd.inject_fertilizer = Some(true),
        // Dilute with alternate supply water.
        (SensorKind::Ce, Above) => cmd.open_alt_supply_valve = Some(true),
        (SensorKind::WaterLevel, Below) => cmd.open_alt_supply_valve = Some(true),
        (SensorKind::WaterLevel, Above) => cmd.open_alt_supply_valve = Some(false),
        _ => return false,
    }
    true
}

/// Emergency policy: each out-of-band quantity's rule, in fixed order.
pub fn emergency_command(
    snap: &SensorSnapshot,
    bands: &SeasonThresholds,
) -> (ActuatorCommand, Vec<SensorKind>) {
    let violations = out_of_band(snap, bands);
    let mut cmd = ActuatorCommand::default();
    let mut fired = Vec::new();
    for kind in EMERGENCY_ORDER {
        if let Some((_, side)) = violations.iter().find(|(k, _)| *k == kind) {
            if emergency_rule(kind, *side, &mut cmd) {
                info!(quantity = %kind, value = snap.value(kind), ?side, "emergency rule fired");
                fired.push(kind);
            }
        }
    }
    (cmd, fired)
}

/// Model output to command, clamping negative predictions to zero.
pub fn model_command(
    prediction: Prediction,
    snap: &SensorSnapshot,
    bands: &SeasonThresholds,
) -> ActuatorCommand {
    let water = prediction.water_amount.max(0.0);
    let fertilizer = prediction.fertilizer_percent.max(0.0);

    let mut cmd = ActuatorCommand {
        fertilizer_percent: fertilizer,
        water_amount: water,
        inject_fertilizer: Some(fertilizer > 0.0),
        open_alt_supply_valve: Some(snap.water_level < bands.water_level.min),
        ..ActuatorCommand::default()
    };
    cmd.set_irrigation(water > 0.0 && snap.humidity < bands.humidity.max);
    cmd
}

/// Degraded rules: humidity, CE and water level against the default table.
pub fn default_rules(snap: &SensorSnapshot, table: &SeasonThresholds) -> ActuatorCommand {
    let mut cmd = ActuatorCommand {
        inject_fertilizer: Some(snap.ce < table.ce.min),
        open_alt_supply_valve: Some(snap.water_level < table.water_level.min),
        ..ActuatorCommand::default()
    };
    cmd.set_irrigation(snap.humidity < table.humidity.min);
    cmd
}

/// Operator-facing remarks for every quantity outside its band.
pub fn threshold_comments(snap: &SensorSnapshot, bands: &SeasonThresholds) -> Vec<String> {
    out_of_band(snap, bands)
        .into_iter()
        .map(|(kind, side)| {
            let band = bands.band(kind);
            match side {
                BandCheck::Below => format!(
                    "{kind} {:.2} is below the minimum of {:.2}",
                    snap.value(kind),
                    band.min
                ),
                _ => format!(
                    "{kind} {:.2} is above the maximum of {:.2}",
                    snap.value(kind),
                    band.max
                ),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Arbiter
// ---------------------------------------------------------------------------

pub struct Arbiter {
    model: Arc<dyn DecisionModel>,
    thresholds: ThresholdTable,
    section: CriticalSection,
    recorder: Arc<dyn Recorder>,
    mode: Mutex<ControlMode>,
}

impl Arbiter {
    pub fn new(
        model: Arc<dyn DecisionModel>,
        thresholds: ThresholdTable,
        section: CriticalSection,
        recorder: Arc<dyn Recorder>,
    ) -> Self {
        Self {
            model,
            thresholds,
            section,
            recorder,
            mode: Mutex::new(ControlMode::default()),
        }
    }

    pub fn mode(&self) -> ControlMode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Switch to `requested` if the critical section is free.  A switch
    /// while busy is dropped and logged; the current mode is returned.
    pub fn request_mode(&self, requested: ControlMode) -> ControlMode {
        let current = self.mode();
        if requested == current {
            return current;
        }
        match self.section.try_enter(CriticalAction::ModeSwitch) {
            Ok(_guard) => {
                *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = requested;
                info!(from = %current, to = %requested, "control mode switched");
                requested
            }
            Err(e) => {
                warn!(from = %current, to = %requested, "mode switch dropped: {e}");
                current
            }
        }
    }

    /// What automatic mode decides for `snap`.  Never fails.
    pub fn decide_automatic(&self, snap: &SensorSnapshot) -> Decision {
        let bands = self.thresholds.get(snap.season);

        // Flow has no emergency rule, so a flow-only excursion goes on to
        // the model and is left to the anomaly detector.
        let (cmd, fired) = emergency_command(snap, &bands);
        if !fired.is_empty() {
            warn!(season = %snap.season, "readings out of band, emergency policy applied");
            let mut d = Decision::new(ControlMode::Automatic, DecisionSource::Emergency, cmd);
            d.emergency = fired;
            return d;
        }

        match self.model.predict(&snap.features()) {
            Ok(prediction) => {
                let cmd = model_command(prediction, snap, &bands);
                debug!(?prediction, "model decision");
                let mut d = Decision::new(ControlMode::Automatic, DecisionSource::Model, cmd);
                d.prediction = Some(prediction);
                d
            }
            Err(e) => {
                warn!("model unusable, falling back to default rules: {e}");
                let table = self.thresholds.get(Season::Default);
                Decision::new(
                    ControlMode::Automatic,
                    DecisionSource::Fallback,
                    default_rules(snap, &table),
                )
            }
        }
    }

    /// One evaluation for the cycle.  The result is recorded before return.
    pub async fn evaluate(
        &self,
        snap: &SensorSnapshot,
        requested_mode: ControlMode,
        manual: ActuatorCommand,
    ) -> Decision {
        let mode = self.request_mode(requested_mode);

        let decision = match mode {
            ControlMode::Automatic => self.decide_automatic(snap),
            ControlMode::Manual => {
                let command = if self.section.is_busy() {
                    warn!("manual command rejected: critical section busy");
                    ActuatorCommand::default()
                } else {
                    manual
                };
                let auto = self.decide_automatic(snap);
                let bands = self.thresholds.get(snap.season);
                let mut d = Decision::new(ControlMode::Manual, DecisionSource::Manual, command);
                d.suggestion = Some(Suggestion {
                    recommended: auto.command,
                    source: auto.source,
                    comments: threshold_comments(snap, &bands),
                });
                d
            }
        };

        if let Err(e) = self.recorder.record_decision(snap, &decision).await {
            warn!("failed to record decision: {e:#}");
        }
        decision
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRecorder;
    use crate::error::{ControlError, ControlResult};
    use crate::model::Features;
    use crate::snapshot::fixtures::calm_summer;

    struct FixedModel(ControlResult<Prediction>);

    impl DecisionModel for FixedModel {
        fn predict(&self, _: &Features) -> ControlResult<Prediction> {
            self.0.clone()
        }
    }

    fn predicting(water: f64, fert: f64) -> Arc<dyn DecisionModel> {
        Arc::new(FixedModel(Ok(Prediction {
            fertilizer_percent: fert,
            water_amount: water,
        })))
    }

    fn unavailable() -> Arc<dyn DecisionModel> {
        Arc::new(FixedModel(Err(ControlError::ModelUnavailable("none".into()))))
    }

    fn arbiter(model: Arc<dyn DecisionModel>) -> (Arbiter, CriticalSection, Arc<MemoryRecorder>) {
        let cs = CriticalSection::new();
        let rec = Arc::new(MemoryRecorder::default());
        let a = Arbiter::new(model, ThresholdTable::default(), cs.clone(), rec.clone());
        (a, cs, rec)
    }

    fn set(snap: &mut SensorSnapshot, kind: SensorKind, v: f64) {
        match kind {
            SensorKind::Humidity => snap.humidity = v,
            SensorKind::Temperature => snap.temperature = v,
            SensorKind::Ph => snap.ph = v,
            SensorKind::Ce => snap.ce = v,
            SensorKind::WaterLevel => snap.water_level = v,
            SensorKind::FlowRate => snap.flow_rate = v,
        }
    }

    /// A snapshot sitting at the centre of every band for `season`.
    fn centred(season: Season) -> SensorSnapshot {
        let bands = SeasonThresholds::builtin(season);
        let mut snap = calm_summer();
        snap.season = season;
        for kind in SensorKind::ALL {
            let b = bands.band(kind);
            set(&mut snap, kind, (b.min + b.max) / 2.0);
        }
        snap
    }

    // -- Emergency policy ---------------------------------------------------

    #[test]
    fn in_band_snapshot_fires_nothing() {
        for season in Season::ALL {
            let snap = centred(season);
            let (cmd, fired) = emergency_command(&snap, &SeasonThresholds::builtin(season));
            assert!(fired.is_empty(), "{season}");
            assert!(cmd.is_empty());
        }
    }

    #[test]
    fn each_field_fires_only_its_own_rule() {
        for season in Season::ALL {
            let bands = SeasonThresholds::builtin(season);
            for kind in EMERGENCY_ORDER {
                let band = bands.band(kind);
                for value in [band.min - 1.0, band.max + 1.0] {
                    let mut snap = centred(season);
                    set(&mut snap, kind, value);
                    let (_, fired) = emergency_command(&snap, &bands);
                    assert_eq!(fired, vec![kind], "{season} {kind}={value}");
                }
            }
        }
    }

    #[test]
    fn low_humidity_turns_irrigation_on() {
        let mut snap = calm_summer();
        snap.humidity = 15.0;
        let (cmd, _) = emergency_command(&snap, &SeasonThresholds::builtin(Season::Summer));
        assert_eq!(cmd.activate_pump, Some(true));
        assert_eq!(cmd.open_irrigation_valve, Some(true));
        assert_eq!(cmd.inject_fertilizer, None);
    }

    #[test]
    fn high_ce_opens_alt_supply() {
        let mut snap = calm_summer();
        snap.ce = 3.0;
        let (cmd, fired) = emergency_command(&snap, &SeasonThresholds::builtin(Season::Summer));
        assert_eq!(fired, vec![SensorKind::Ce]);
        assert_eq!(cmd.open_alt_supply_valve, Some(true));
        assert_eq!(cmd.activate_pump, None);
    }

    #[test]
    fn later_rule_overwrites_shared_field() {
        let bands = SeasonThresholds::builtin(Season::Summer);
        let mut snap = calm_summer();
        snap.ce = bands.ce.max + 1.0; // alt supply on
        snap.water_level = bands.water_level.max + 1.0; // alt supply off
        let (cmd, fired) = emergency_command(&snap, &bands);
        assert_eq!(fired, vec![SensorKind::Ce, SensorKind::WaterLevel]);
        assert_eq!(cmd.open_alt_supply_valve, Some(false));
    }

    #[test]
    fn flow_out_of_band_has_no_rule() {
        let bands = SeasonThresholds::builtin(Season::Summer);
        let mut snap = calm_summer();
        snap.flow_rate = bands.flow_rate.max + 1.0;
        let (cmd, fired) = emergency_command(&snap, &bands);
        assert!(fired.is_empty());
        assert!(cmd.is_empty());
        assert_eq!(out_of_band(&snap, &bands).len(), 1);
    }

    // -- Model path ---------------------------------------------------------

    #[test]
    fn model_prediction_drives_command() {
        let (a, _, _) = arbiter(predicting(20.0, 1.5));
        let d = a.decide_automatic(&calm_summer());
        assert_eq!(d.source, DecisionSource::Model);
        assert_eq!(d.command.activate_pump, Some(true));
        assert_eq!(d.command.inject_fertilizer, Some(true));
        assert_eq!(d.command.open_alt_supply_valve, Some(false));
        assert_eq!(d.command.water_amount, 20.0);
    }

    #[test]
    fn flow_only_excursion_still_asks_the_model() {
        let (a, _, _) = arbiter(predicting(20.0, 0.0));
        let mut snap = calm_summer();
        snap.season = Season::Winter;
        snap.temperature = 15.0;
        snap.flow_rate = SeasonThresholds::builtin(Season::Winter).flow_rate.max + 5.0;
        let d = a.decide_automatic(&snap);
        assert_eq!(d.source, DecisionSource::Model);
        assert!(d.emergency.is_empty());
        assert_eq!(d.command.activate_pump, Some(true));
    }

    #[test]
    fn negative_prediction_is_clamped() {
        let (a, _, _) = arbiter(predicting(-4.0, -1.0));
        let d = a.decide_automatic(&calm_summer());
        assert_eq!(d.command.water_amount, 0.0);
        assert_eq!(d.command.fertilizer_percent, 0.0);
        assert_eq!(d.command.activate_pump, Some(false));
        assert_eq!(d.command.inject_fertilizer, Some(false));
    }

    #[test]
    fn model_failure_falls_back_to_default_rules() {
        let (a, _, _) = arbiter(unavailable());
        let d = a.decide_automatic(&calm_summer());
        assert_eq!(d.source, DecisionSource::Fallback);
        assert_eq!(d.command, ActuatorCommand::all_off());
    }

    #[test]
    fn emergency_wins_regardless_of_model() {
        for model in [predicting(0.0, 0.0), unavailable()] {
            let (a, _, _) = arbiter(model);
            let mut snap = calm_summer();
            snap.humidity = 15.0;
            snap.ce = 2.0;
            let d = a.decide_automatic(&snap);
            assert_eq!(d.source, DecisionSource::Emergency);
            assert_eq!(d.command.activate_pump, Some(true));
            assert_eq!(d.command.open_irrigation_valve, Some(true));
        }
    }

    // -- Modes --------------------------------------------------------------

    #[tokio::test]
    async fn manual_mode_passes_operator_command_through() {
        let (a, _, rec) = arbiter(predicting(10.0, 0.0));
        let mut manual = ActuatorCommand::default();
        manual.open_alt_supply_valve = Some(true);

        let d = a.evaluate(&calm_summer(), ControlMode::Manual, manual.clone()).await;
        assert_eq!(d.mode, ControlMode::Manual);
        assert_eq!(d.command, manual);
        let s = d.suggestion.expect("suggestion in manual mode");
        assert_eq!(s.source, DecisionSource::Model);
        assert_eq!(rec.decisions().len(), 1);
    }

    #[tokio::test]
    async fn manual_command_while_busy_is_empty() {
        let (a, cs, _) = arbiter(predicting(10.0, 0.0));
        a.request_mode(ControlMode::Manual);
        let _g = cs.try_enter(CriticalAction::Dosing).unwrap();

        let mut manual = ActuatorCommand::default();
        manual.set_irrigation(true);
        let d = a.evaluate(&calm_summer(), ControlMode::Manual, manual).await;
        assert!(d.command.is_empty());
    }

    #[test]
    fn mode_switch_while_busy_is_dropped() {
        let (a, cs, _) = arbiter(unavailable());
        let g = cs.try_enter(CriticalAction::ScheduledIrrigation).unwrap();
        assert_eq!(a.request_mode(ControlMode::Manual), ControlMode::Automatic);
        drop(g);
        assert_eq!(a.request_mode(ControlMode::Manual), ControlMode::Manual);
        assert!(!cs.is_busy());
    }

    #[test]
    fn comments_name_out_of_band_quantities() {
        let mut snap = calm_summer();
        snap.ph = 9.0;
        let comments = threshold_comments(&snap, &SeasonThresholds::builtin(Season::Summer));
        assert_eq!(comments.len(), 1);
        assert!(comments[0].starts_with("ph 9.00 is above"));
    }

    #[test]
    fn mode_parses_short_form() {
        assert_eq!("auto".parse::<ControlMode>(), Ok(ControlMode::Automatic));
        assert_eq!("Manual".parse::<ControlMode>(), Ok(ControlMode::Manual));
        assert!("off".parse::<ControlMode>().is_err());
    }
}
