//! Scheduled irrigation: maps times of day per season to budgeted, metered
//! irrigation runs.
//!
//! Triggers are polled by the supervisor at the start of every cycle.  A
//! due trigger is spawned as its own task which:
//!
//! ```text
//! share ──▶ enter critical section ──▶ allot ──▶ pump+valve ON
//!                (retry while busy)                   │
//!                                                     ▼
//!              release ◀── pump+valve OFF ◀── meter flow until
//!                                             allotment or ceiling
//! ```
//!
//! The share is computed before the section is entered so the model is never
//! consulted while holding it.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::budget::{BudgetTracker, SplitPolicy};
use crate::critical::{BusyGuard, CriticalAction, CriticalSection};
use crate::db::Recorder;
use crate::error::{ControlError, ControlResult};
use crate::model::DecisionModel;
use crate::registry::{ActuatorCommand, ActuatorRegistry};
use crate::season::Season;
use crate::sensors::Sensor;
use crate::snapshot::SensorSnapshot;
use crate::state::SharedState;
use crate::supervisor::shutdown_requested;

// ---------------------------------------------------------------------------
// Times of day
// ---------------------------------------------------------------------------

/// Parse "HH:MM" (24h).
pub fn parse_time_of_day(s: &str) -> Result<Time, String> {
    let (h, m) = s
        .trim()
        .split_once(':')
        .ok_or_else(|| format!("'{s}' is not HH:MM"))?;
    let h: u8 = h.parse().map_err(|_| format!("'{s}': bad hour"))?;
    let m: u8 = m.parse().map_err(|_| format!("'{s}': bad minute"))?;
    Time::from_hms(h, m, 0).map_err(|e| format!("'{s}': {e}"))
}

/// Irrigation times per season.  A season without times uses the
/// default season's.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleTable {
    times: HashMap<Season, Vec<Time>>,
}

impl ScheduleTable {
    pub fn new(mut times: HashMap<Season, Vec<Time>>) -> Self {
        for list in times.values_mut() {
            list.sort();
            list.dedup();
        }
        Self { times }
    }

    pub fn times(&self, season: Season) -> &[Time] {
        match self.times.get(&season) {
            Some(list) if !list.is_empty() => list,
            _ => self
                .times
                .get(&Season::Default)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        }
    }
}

impl Default for ScheduleTable {
    fn default() -> Self {
        let t = |h: u8, m: u8| Time::from_hms(h, m, 0).unwrap_or(Time::MIDNIGHT);
        Self::new(HashMap::from([
            (Season::Summer, vec![t(6, 0), t(12, 0), t(18, 30)]),
            (Season::Autumn, vec![t(7, 0), t(17, 30)]),
            (Season::Winter, vec![t(10, 30)]),
            (Season::Spring, vec![t(6, 30), t(18, 0)]),
            (Season::Default, vec![t(7, 0), t(18, 0)]),
        ]))
    }
}

// ---------------------------------------------------------------------------
// Triggers and run records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub season: Season,
    pub time_of_day: Time,
    #[serde(with = "time::serde::rfc3339")]
    pub due: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IrrigationOutcome {
    Completed,
    /// Daily budget already used up.
    NoBudget,
    SafetyCeiling,
    /// Shutdown requested mid-run.
    Interrupted,
    /// Critical section stayed busy through every retry.
    SkippedBusy,
    Failed,
}

impl IrrigationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IrrigationOutcome::Completed => "completed",
            IrrigationOutcome::NoBudget => "no_budget",
            IrrigationOutcome::SafetyCeiling => "safety_ceiling",
            IrrigationOutcome::Interrupted => "interrupted",
            IrrigationOutcome::SkippedBusy => "skipped_busy",
            IrrigationOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationRecord {
    pub trigger: ScheduleEntry,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub ended_at: OffsetDateTime,
    pub allotted_l: f64,
    pub delivered_l: f64,
    pub outcome: IrrigationOutcome,
    pub detail: Option<String>,
}

struct Delivery {
    allotted_l: f64,
    delivered_l: f64,
    outcome: IrrigationOutcome,
    detail: Option<String>,
}

impl Delivery {
    fn new(allotted_l: f64, outcome: IrrigationOutcome) -> Self {
        Self {
            allotted_l,
            delivered_l: 0.0,
            outcome,
            detail: None,
        }
    }

    fn failed(allotted_l: f64, e: &ControlError) -> Self {
        Self {
            detail: Some(e.to_string()),
            ..Self::new(allotted_l, IrrigationOutcome::Failed)
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    /// Hard limit on one run's duration.
    pub max_irrigation: Duration,
    pub metering_interval: Duration,
    /// Wait between attempts to enter a busy critical section.
    pub busy_retry: Duration,
    pub busy_retries: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_irrigation: Duration::from_secs(30 * 60),
            metering_interval: Duration::from_secs(1),
            busy_retry: Duration::from_secs(5),
            busy_retries: 12,
        }
    }
}

/// Collaborators the scheduler drives.
pub struct SchedulerParts {
    pub section: CriticalSection,
    pub registry: Arc<ActuatorRegistry>,
    pub budget: Arc<BudgetTracker>,
    pub model: Arc<dyn DecisionModel>,
    pub flow: Arc<dyn Sensor>,
    pub recorder: Arc<dyn Recorder>,
    pub shared: SharedState,
}

struct Installed {
    entry: ScheduleEntry,
    fired: bool,
}

#[derive(Default)]
struct Plan {
    date: Option<Date>,
    season: Option<Season>,
    entries: Vec<Installed>,
}

pub struct IrrigationScheduler {
    parts: SchedulerParts,
    table: ScheduleTable,
    settings: RunSettings,
    offset: UtcOffset,
    plan: Mutex<Plan>,
    latest: Mutex<Option<SensorSnapshot>>,
    shutdown: watch::Receiver<bool>,
}

impl IrrigationScheduler {
    pub fn new(
        parts: SchedulerParts,
        table: ScheduleTable,
        settings: RunSettings,
        offset: UtcOffset,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            parts,
            table,
            settings,
            offset,
            plan: Mutex::new(Plan::default()),
            latest: Mutex::new(None),
            shutdown,
        }
    }

    fn plan(&self) -> MutexGuard<'_, Plan> {
        self.plan.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Most recent snapshot, used for fresh per-event predictions.
    pub fn observe(&self, snapshot: &SensorSnapshot) {
        *self.latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
    }

    pub fn needs_plan(&self, date: Date, season: Season) -> bool {
        let plan = self.plan();
        plan.date != Some(date) || plan.season != Some(season)
    }

    /// Drop every installed trigger.  Returns how many were still pending.
    pub fn cancel_all(&self) -> usize {
        let mut plan = self.plan();
        let pending = plan.entries.iter().filter(|e| !e.fired).count();
        plan.entries.clear();
        plan.date = None;
        plan.season = None;
        if pending > 0 {
            info!(pending, "scheduled triggers cancelled");
        }
        pending
    }

    /// Install the triggers for `date` that are still ahead of `now`.
    /// Fails if a previous set was not cancelled first.
    pub fn install(&self, date: Date, season: Season, now: OffsetDateTime) -> ControlResult<usize> {
        let mut plan = self.plan();
        if !plan.entries.is_empty() {
            return Err(ControlError::InvariantViolation(format!(
                "installing triggers over {} uncancelled ones",
                plan.entries.len()
            )));
        }

        plan.entries = self
            .table
            .times(season)
            .iter()
            .map(|&t| ScheduleEntry {
                season,
                time_of_day: t,
                due: PrimitiveDateTime::new(date, t).assume_offset(self.offset),
            })
            .filter(|e| e.due > now)
            .map(|entry| Installed {
                entry,
                fired: false,
            })
            .collect();
        plan.date = Some(date);
        plan.season = Some(season);

        let count = plan.entries.len();
        info!(%date, %season, triggers = count, "irrigation schedule installed");
        Ok(count)
    }

    /// Cancel, then install.
    pub fn replan(&self, date: Date, season: Season, now: OffsetDateTime) -> ControlResult<usize> {
        self.cancel_all();
        self.install(date, season, now)
    }

    /// Triggers not yet fired.
    pub fn pending(&self) -> Vec<ScheduleEntry> {
        self.plan()
            .entries
            .iter()
            .filter(|e| !e.fired)
            .map(|e| e.entry)
            .collect()
    }

    /// Spawn a run for every trigger due at `now`.  Each trigger fires once.
    pub fn run_pending(self: &Arc<Self>, now: OffsetDateTime) -> Vec<JoinHandle<IrrigationRecord>> {
        let due: Vec<ScheduleEntry> = {
            let mut plan = self.plan();
            plan.entries
                .iter_mut()
                .filter(|e| !e.fired && e.entry.due <= now)
                .map(|e| {
                    e.fired = true;
                    e.entry
                })
                .collect()
        };

        due.into_iter()
            .map(|entry| {
                info!(at = %entry.time_of_day, season = %entry.season, "scheduled irrigation due");
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_event(entry).await })
            })
            .collect()
    }

    // -- One run ------------------------------------------------------------

    fn event_share(&self) -> f64 {
        let equal = self
            .parts
            .budget
            .current()
            .map(|b| b.equal_share())
            .unwrap_or(0.0);

        match self.parts.budget.policy() {
            SplitPolicy::EqualSplit => equal,
            SplitPolicy::FreshPrediction => {
                let latest = self.latest.lock().unwrap_or_else(|e| e.into_inner()).clone();
                let Some(snapshot) = latest else {
                    warn!("no snapshot yet for a fresh prediction; using equal share");
                    return equal;
                };
                match self.parts.model.predict(&snapshot.features()) {
                    Ok(p) => p.water_amount.max(0.0),
                    Err(e) => {
                        warn!("fresh prediction failed, using equal share: {e}");
                        equal
                    }
                }
            }
        }
    }

    async fn enter(&self) -> ControlResult<BusyGuard> {
        let mut attempt = 0;
        loop {
            match self.parts.section.try_enter(CriticalAction::ScheduledIrrigation) {
                Ok(guard) => return Ok(guard),
                Err(e) if attempt < self.settings.busy_retries => {
                    attempt += 1;
                    debug!(attempt, "scheduled irrigation deferred: {e}");
                    tokio::time::sleep(self.settings.busy_retry).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Execute one trigger end to end.  Never leaves pump or valve on.
    pub async fn run_event(&self, trigger: ScheduleEntry) -> IrrigationRecord {
        let started_at = OffsetDateTime::now_utc();
        let share = self.event_share();

        let delivery = match self.enter().await {
            Ok(guard) => {
                let delivery = self.deliver(&guard, share).await;
                self.stop(&guard);
                info!(
                    allotted_l = delivery.allotted_l,
                    delivered_l = format!("{:.2}", delivery.delivered_l),
                    outcome = delivery.outcome.as_str(),
                    "scheduled irrigation finished"
                );
                delivery
            }
            Err(e) => {
                warn!("scheduled irrigation skipped: {e}");
                Delivery {
                    detail: Some(e.to_string()),
                    ..Delivery::new(0.0, IrrigationOutcome::SkippedBusy)
                }
            }
        };

        let record = IrrigationRecord {
            trigger,
            started_at,
            ended_at: OffsetDateTime::now_utc(),
            allotted_l: delivery.allotted_l,
            delivered_l: delivery.delivered_l,
            outcome: delivery.outcome,
            detail: delivery.detail,
        };
        self.publish(&record).await;
        record
    }

    async fn deliver(&self, guard: &BusyGuard, share: f64) -> Delivery {
        let allotted = match self.parts.budget.allot(share, guard) {
            Ok(a) => a,
            Err(e) => return Delivery::failed(0.0, &e),
        };
        if allotted <= 0.0 {
            return Delivery::new(0.0, IrrigationOutcome::NoBudget);
        }

        let current = self.parts.registry.state();
        let fertilizer_percent = self
            .parts
            .budget
            .current()
            .map(|b| b.fertilizer_percent)
            .unwrap_or(0.0);
        let mut cmd = ActuatorCommand {
            water_amount: allotted,
            fertilizer_percent,
            inject_fertilizer: Some(fertilizer_percent > 0.0),
            open_alt_supply_valve: Some(current.alt_supply_valve),
            ..ActuatorCommand::default()
        };
        cmd.set_irrigation(true);
        if let Err(e) = self.parts.registry.apply(cmd, guard) {
            error!("could not start irrigation: {e}");
            return Delivery::failed(allotted, &e);
        }

        let mut delivery = Delivery::new(allotted, IrrigationOutcome::Completed);
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.settings.metering_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let start = Instant::now();
        let mut last = start;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown) => {
                    delivery.outcome = IrrigationOutcome::Interrupted;
                    return delivery;
                }
            }

            let now = Instant::now();
            let dt = now.duration_since(last);
            last = now;

            let flow = match self.parts.flow.read().await {
                Ok(r) => r.value.max(0.0),
                Err(e) => {
                    warn!("flow read failed during metering: {e}");
                    0.0
                }
            };
            delivery.delivered_l += flow / 60.0 * dt.as_secs_f64();

            if delivery.delivered_l >= allotted {
                return delivery;
            }
            if now.duration_since(start) >= self.settings.max_irrigation {
                let err = ControlError::SafetyCeilingExceeded {
                    limit_secs: self.settings.max_irrigation.as_secs(),
                    delivered_l: delivery.delivered_l,
                };
                warn!(allotted_l = allotted, "{err}");
                delivery.outcome = IrrigationOutcome::SafetyCeiling;
                delivery.detail = Some(err.to_string());
                return delivery;
            }
        }
    }

    /// Pump, irrigation valve and injector off; alternate supply untouched.
    fn stop(&self, guard: &BusyGuard) {
        let mut cmd = ActuatorCommand::all_off();
        cmd.open_alt_supply_valve = Some(self.parts.registry.state().alt_supply_valve);
        if let Err(e) = self.parts.registry.apply(cmd, guard) {
            error!("failed to stop irrigation cleanly: {e}");
        }
    }

    async fn publish(&self, record: &IrrigationRecord) {
        if let Err(e) = self.parts.recorder.record_irrigation(record).await {
            warn!("failed to record irrigation event: {e:#}");
        }
        let mut st = self.parts.shared.write().await;
        st.record_actuators(self.parts.registry.state());
        st.budget = self.parts.budget.current();
        st.record_irrigation(format!(
            "{} run at {}: {:.2} of {:.2} L ({})",
            record.trigger.season,
            record.trigger.time_of_day,
            record.delivered_l,
            record.allotted_l,
            record.outcome.as_str()
        ));
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{ActuatorBank, ActuatorId, MockRelays, PinMap, RelayHandle};
    use crate::db::MemoryRecorder;
    use crate::model::{Features, Prediction};
    use crate::snapshot::fixtures::calm_summer;
    use crate::snapshot::{Reading, SensorKind};
    use crate::state::SystemState;
    use async_trait::async_trait;
    use time::macros::{date, datetime, time};

    /// Flow meter that reads `rate` whenever pump and valve are both on.
    struct RelayFlow {
        pump: RelayHandle,
        valve: RelayHandle,
        rate: f64,
    }

    #[async_trait]
    impl Sensor for RelayFlow {
        fn kind(&self) -> SensorKind {
            SensorKind::FlowRate
        }

        async fn read(&self) -> ControlResult<Reading> {
            let on = self.pump.is_on() && self.valve.is_on();
            Ok(Reading {
                value: if on { self.rate } else { 0.0 },
                ts: 0,
            })
        }
    }

    struct FixedModel(f64);

    impl DecisionModel for FixedModel {
        fn predict(&self, _: &Features) -> ControlResult<Prediction> {
            Ok(Prediction {
                fertilizer_percent: 0.0,
                water_amount: self.0,
            })
        }
    }

    struct Rig {
        scheduler: Arc<IrrigationScheduler>,
        section: CriticalSection,
        registry: Arc<ActuatorRegistry>,
        budget: Arc<BudgetTracker>,
        relays: MockRelays,
        recorder: Arc<MemoryRecorder>,
        _shutdown: watch::Sender<bool>,
    }

    struct NoModel;

    impl DecisionModel for NoModel {
        fn predict(&self, _: &Features) -> ControlResult<Prediction> {
            Err(ControlError::ModelUnavailable("not trained yet".into()))
        }
    }

    fn rig(flow_rate: f64, policy: SplitPolicy) -> Rig {
        rig_with(flow_rate, policy, Arc::new(FixedModel(4.0)))
    }

    fn rig_with(flow_rate: f64, policy: SplitPolicy, model: Arc<dyn DecisionModel>) -> Rig {
        let section = CriticalSection::new();
        let (bank, relays) = ActuatorBank::mock(&PinMap::default());
        let registry = Arc::new(ActuatorRegistry::new(bank, section.clone()));
        let budget = Arc::new(BudgetTracker::new(section.clone(), policy));
        let recorder = Arc::new(MemoryRecorder::default());
        let (tx, rx) = watch::channel(false);
        let flow = Arc::new(RelayFlow {
            pump: relays.get(ActuatorId::Pump),
            valve: relays.get(ActuatorId::IrrigationValve),
            rate: flow_rate,
        });
        let parts = SchedulerParts {
            section: section.clone(),
            registry: Arc::clone(&registry),
            budget: Arc::clone(&budget),
            model,
            flow,
            recorder: recorder.clone(),
            shared: SystemState::shared("test"),
        };
        let settings = RunSettings {
            max_irrigation: Duration::from_secs(60),
            metering_interval: Duration::from_secs(1),
            busy_retry: Duration::from_secs(1),
            busy_retries: 3,
        };
        let scheduler = Arc::new(IrrigationScheduler::new(
            parts,
            ScheduleTable::default(),
            settings,
            UtcOffset::UTC,
            rx,
        ));
        Rig {
            scheduler,
            section,
            registry,
            budget,
            relays,
            recorder,
            _shutdown: tx,
        }
    }

    fn plan_budget(r: &Rig, total: f64, events: usize) {
        let g = r.section.try_enter(CriticalAction::ControlCycle).unwrap();
        r.budget
            .replan(total, 0.0, date!(2024 - 01 - 10), events, &g)
            .unwrap();
    }

    fn trigger() -> ScheduleEntry {
        ScheduleEntry {
            season: Season::Summer,
            time_of_day: time!(6:00),
            due: datetime!(2024-01-10 06:00 UTC),
        }
    }

    // -- Time parsing -------------------------------------------------------

    #[test]
    fn parses_time_of_day() {
        assert_eq!(parse_time_of_day("06:30"), Ok(time!(6:30)));
        assert_eq!(parse_time_of_day(" 18:05 "), Ok(time!(18:05)));
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("0630").is_err());
        assert!(parse_time_of_day("ab:cd").is_err());
    }

    #[test]
    fn empty_season_uses_default_times() {
        let table = ScheduleTable::new(HashMap::from([
            (Season::Default, vec![time!(9:00), time!(7:00), time!(9:00)]),
            (Season::Winter, vec![]),
        ]));
        assert_eq!(table.times(Season::Winter), &[time!(7:00), time!(9:00)]);
        assert_eq!(table.times(Season::Summer), &[time!(7:00), time!(9:00)]);
    }

    // -- Planning -----------------------------------------------------------

    #[tokio::test]
    async fn install_over_uncancelled_triggers_is_rejected() {
        let r = rig(30.0, SplitPolicy::EqualSplit);
        let morning = datetime!(2024-01-10 00:00 UTC);
        r.scheduler
            .install(date!(2024 - 01 - 10), Season::Summer, morning)
            .unwrap();
        let err = r
            .scheduler
            .install(date!(2024 - 01 - 10), Season::Summer, morning)
            .unwrap_err();
        assert!(matches!(err, ControlError::InvariantViolation(_)));

        assert_eq!(
            r.scheduler
                .replan(date!(2024 - 01 - 10), Season::Summer, morning)
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn past_triggers_are_not_installed() {
        let r = rig(30.0, SplitPolicy::EqualSplit);
        let n = r
            .scheduler
            .replan(
                date!(2024 - 01 - 10),
                Season::Summer,
                datetime!(2024-01-10 13:00 UTC),
            )
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(r.scheduler.pending()[0].time_of_day, time!(18:30));
    }

    #[tokio::test]
    async fn needs_plan_tracks_date_and_season() {
        let r = rig(30.0, SplitPolicy::EqualSplit);
        let d = date!(2024 - 03 - 01);
        assert!(r.scheduler.needs_plan(d, Season::Autumn));
        r.scheduler
            .replan(d, Season::Autumn, datetime!(2024-03-01 00:00 UTC))
            .unwrap();
        assert!(!r.scheduler.needs_plan(d, Season::Autumn));
        assert!(r.scheduler.needs_plan(d, Season::Winter));
        assert!(r.scheduler.needs_plan(date!(2024 - 03 - 02), Season::Autumn));
    }

    // -- Runs ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn run_delivers_allotment_then_stops() {
        let r = rig(30.0, SplitPolicy::EqualSplit);
        plan_budget(&r, 30.0, 3);

        let rec = r.scheduler.run_event(trigger()).await;
        assert_eq!(rec.outcome, IrrigationOutcome::Completed);
        assert_eq!(rec.allotted_l, 10.0);
        // 30 L/min = 0.5 L/s; 20 one-second ticks
        assert!((rec.delivered_l - 10.0).abs() < 1e-6, "{}", rec.delivered_l);
        assert!(!r.registry.state().irrigating());
        assert!(!r.relays.get(ActuatorId::Pump).is_on());
        assert!(!r.section.is_busy());
        assert_eq!(r.budget.current().unwrap().remaining_water, 20.0);
        assert_eq!(r.recorder.irrigations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_line_hits_safety_ceiling() {
        let r = rig(0.0, SplitPolicy::EqualSplit);
        plan_budget(&r, 30.0, 3);

        let rec = r.scheduler.run_event(trigger()).await;
        assert_eq!(rec.outcome, IrrigationOutcome::SafetyCeiling);
        assert_eq!(rec.delivered_l, 0.0);
        assert!(!r.registry.state().irrigating());
        assert!(!r.section.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_a_no_op() {
        let r = rig(30.0, SplitPolicy::EqualSplit);
        plan_budget(&r, 0.0, 3);

        let rec = r.scheduler.run_event(trigger()).await;
        assert_eq!(rec.outcome, IrrigationOutcome::NoBudget);
        assert_eq!(r.relays.total_switches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_section_defers_then_skips() {
        let r = rig(30.0, SplitPolicy::EqualSplit);
        plan_budget(&r, 30.0, 3);
        let _held = r.section.try_enter(CriticalAction::Dosing).unwrap();

        let rec = r.scheduler.run_event(trigger()).await;
        assert_eq!(rec.outcome, IrrigationOutcome::SkippedBusy);
        assert_eq!(r.budget.current().unwrap().remaining_water, 30.0);
        assert_eq!(r.relays.total_switches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_prediction_sets_share() {
        let r = rig(30.0, SplitPolicy::FreshPrediction);
        plan_budget(&r, 30.0, 3);
        r.scheduler.observe(&calm_summer());

        let rec = r.scheduler.run_event(trigger()).await;
        assert_eq!(rec.allotted_l, 4.0);
        assert_eq!(r.budget.current().unwrap().remaining_water, 26.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fresh_prediction_uses_equal_share() {
        let r = rig_with(30.0, SplitPolicy::FreshPrediction, Arc::new(NoModel));
        plan_budget(&r, 30.0, 3);
        r.scheduler.observe(&calm_summer());

        let rec = r.scheduler.run_event(trigger()).await;
        assert_eq!(rec.outcome, IrrigationOutcome::Completed);
        assert_eq!(rec.allotted_l, 10.0);
        assert_eq!(r.budget.current().unwrap().remaining_water, 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn alt_supply_survives_a_run() {
        let r = rig(30.0, SplitPolicy::EqualSplit);
        plan_budget(&r, 3.0, 1);
        {
            let g = r.section.try_enter(CriticalAction::ControlCycle).unwrap();
            let mut cmd = ActuatorCommand::default();
            cmd.open_alt_supply_valve = Some(true);
            r.registry.apply(cmd, &g).unwrap();
        }
        r.scheduler.run_event(trigger()).await;
        assert!(r.registry.state().alt_supply_valve);
    }

    #[tokio::test(start_paused = true)]
    async fn due_triggers_fire_once() {
        let r = rig(30.0, SplitPolicy::EqualSplit);
        plan_budget(&r, 30.0, 3);
        r.scheduler
            .replan(
                date!(2024 - 01 - 10),
                Season::Summer,
                datetime!(2024-01-10 00:00 UTC),
            )
            .unwrap();

        let handles = r.scheduler.run_pending(datetime!(2024-01-10 06:01 UTC));
        assert_eq!(handles.len(), 1);
        for h in handles {
            h.await.unwrap();
        }
        assert!(r
            .scheduler
            .run_pending(datetime!(2024-01-10 06:02 UTC))
            .is_empty());
        assert_eq!(r.scheduler.pending().len(), 2);
    }
}
