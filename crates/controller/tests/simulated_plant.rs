//! Whole-controller runs against the simulated plant and an in-memory
//! SQLite history.

#![cfg(feature = "sim")]

use std::sync::Arc;
use std::time::Duration;
use time::macros::datetime;
use time::UtcOffset;
use tokio::sync::watch;

use irrigation_controller::actuator::{ActuatorBank, ActuatorId, MockRelays, PinMap};
use irrigation_controller::anomaly::AnomalyDetector;
use irrigation_controller::arbiter::{Arbiter, ControlMode};
use irrigation_controller::budget::{BudgetTracker, SplitPolicy};
use irrigation_controller::critical::{CriticalAction, CriticalSection};
use irrigation_controller::db::{Db, Recorder};
use irrigation_controller::error::ControlError;
use irrigation_controller::model::{DecisionModel, LinearModel};
use irrigation_controller::panel::LocalPanel;
use irrigation_controller::registry::ActuatorRegistry;
use irrigation_controller::scheduler::{IrrigationScheduler, RunSettings, ScheduleTable, SchedulerParts};
use irrigation_controller::season::{Hemisphere, ThresholdTable};
use irrigation_controller::sensors::SensorSuite;
use irrigation_controller::sim::{PlantState, SimPlant, SimSensor};
use irrigation_controller::snapshot::SensorKind;
use irrigation_controller::state::{SharedState, SystemState};
use irrigation_controller::supervisor::{Supervisor, SupervisorParts, SupervisorSettings};

struct Plant {
    supervisor: Supervisor,
    arbiter: Arc<Arbiter>,
    section: CriticalSection,
    relays: MockRelays,
    db: Arc<Db>,
    shared: SharedState,
    _shutdown: watch::Sender<bool>,
}

async fn plant(initial: PlantState) -> Plant {
    let db = Arc::new(Db::connect("sqlite::memory:").await.unwrap());
    db.migrate().await.unwrap();
    let recorder: Arc<dyn Recorder> = db.clone();

    let section = CriticalSection::new();
    let (bank, relays) = ActuatorBank::mock(&PinMap::default());
    let registry = Arc::new(ActuatorRegistry::new(bank, section.clone()));
    let budget = Arc::new(BudgetTracker::new(section.clone(), SplitPolicy::EqualSplit));
    let model: Arc<dyn DecisionModel> = Arc::new(LinearModel::open("/nonexistent/model.json"));
    let shared = SystemState::shared("sim-test");
    let (tx, rx) = watch::channel(false);

    let sim = Arc::new(SimPlant::new(&relays, initial, 30.0, 0.0));
    let suite = SensorSuite::new(
        SimSensor::all(&sim),
        Hemisphere::South,
        UtcOffset::UTC,
        Duration::from_secs(1),
    )
    .unwrap();
    let flow = suite.sensor(SensorKind::FlowRate).unwrap();

    let scheduler = Arc::new(IrrigationScheduler::new(
        SchedulerParts {
            section: section.clone(),
            registry: Arc::clone(&registry),
            budget: Arc::clone(&budget),
            model: Arc::clone(&model),
            flow,
            recorder: Arc::clone(&recorder),
            shared: shared.clone(),
        },
        ScheduleTable::default(),
        RunSettings::default(),
        UtcOffset::UTC,
        rx,
    ));
    let arbiter = Arc::new(Arbiter::new(
        model,
        ThresholdTable::default(),
        section.clone(),
        recorder,
    ));

    let supervisor = Supervisor::new(
        SupervisorParts {
            suite,
            arbiter: Arc::clone(&arbiter),
            registry,
            section: section.clone(),
            budget,
            scheduler,
            detector: AnomalyDetector::default(),
            panel: Arc::new(LocalPanel::new(shared.clone())),
            sync: None,
            shared: shared.clone(),
        },
        SupervisorSettings {
            sampling_period: Duration::from_secs(60),
            error_cooldown: Duration::from_secs(5),
            network_timeout: Duration::from_secs(1),
            flow_tolerance: 0.2,
            offset: UtcOffset::UTC,
        },
    );

    Plant {
        supervisor,
        arbiter,
        section,
        relays,
        db,
        shared,
        _shutdown: tx,
    }
}

// -- Emergency irrigation ---------------------------------------------------

#[tokio::test]
async fn dry_summer_soil_is_irrigated_and_recorded() {
    let mut p = plant(PlantState {
        humidity: 15.0,
        ph: 6.5,
        ce: 2.0,
        water_level: 50.0,
        ..PlantState::default()
    })
    .await;

    p.supervisor
        .cycle(datetime!(2024-01-15 09:00 UTC))
        .await
        .unwrap();

    assert!(p.relays.get(ActuatorId::Pump).is_on());
    assert!(p.relays.get(ActuatorId::IrrigationValve).is_on());
    assert!(!p.relays.get(ActuatorId::FertilizerValve).is_on());
    assert!(!p.section.is_busy());

    let rows = p.db.recent_decisions(10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].season, "summer");
    assert_eq!(rows[0].source, "emergency");
    assert!(rows[0].emergency.contains("humidity"));
    assert!(rows[0].humidity < 20.0);
}

#[tokio::test]
async fn watered_soil_stops_being_an_emergency() {
    let mut p = plant(PlantState {
        humidity: 19.0,
        ..PlantState::default()
    })
    .await;

    let mut now = datetime!(2024-01-15 09:00 UTC);
    p.supervisor.cycle(now).await.unwrap();
    assert!(p.relays.get(ActuatorId::Pump).is_on());

    // Each read while irrigating adds moisture until the band is reached.
    for _ in 0..5 {
        now += time::Duration::minutes(1);
        p.supervisor.cycle(now).await.unwrap();
    }

    let rows = p.db.recent_decisions(1).await.unwrap();
    assert_ne!(rows[0].source, "emergency");
    assert!(rows[0].humidity >= 20.0);
}

// -- Flow --------------------------------------------------------------------

#[tokio::test]
async fn steady_irrigation_reads_as_normal_flow() {
    let mut p = plant(PlantState {
        humidity: 0.0,
        ..PlantState::default()
    })
    .await;

    // The first reads after the pump starts are still ramping up.
    let mut now = datetime!(2024-01-15 09:00 UTC);
    for _ in 0..8 {
        p.supervisor.cycle(now).await.unwrap();
        now += time::Duration::minutes(1);
    }

    assert!(p.relays.get(ActuatorId::Pump).is_on());
    assert!(p.relays.get(ActuatorId::IrrigationValve).is_on());
    let st = p.shared.read().await;
    assert_eq!(st.snapshot.as_ref().map(|s| s.flow_rate), Some(30.0));
    assert_eq!(st.anomaly, None);
}

// -- Critical section -------------------------------------------------------

#[tokio::test]
async fn scheduled_irrigation_holds_off_emergency_and_dosing() {
    let mut p = plant(PlantState {
        humidity: 15.0,
        ph: 4.0,
        ..PlantState::default()
    })
    .await;

    let running = p.section.try_enter(CriticalAction::ScheduledIrrigation).unwrap();
    p.supervisor
        .cycle(datetime!(2024-01-15 09:00 UTC))
        .await
        .unwrap();
    assert_eq!(p.relays.total_switches(), 0);
    assert!(!p.relays.get(ActuatorId::Pump).is_on());
    assert!(!p.relays.get(ActuatorId::FertilizerValve).is_on());
    drop(running);

    p.supervisor
        .cycle(datetime!(2024-01-15 09:01 UTC))
        .await
        .unwrap();
    assert!(p.relays.get(ActuatorId::Pump).is_on());
    assert!(p.relays.get(ActuatorId::FertilizerValve).is_on());
    assert!(!p.section.is_busy());
}

#[tokio::test]
async fn running_irrigation_blocks_dosing_and_mode_switch() {
    let p = plant(PlantState::default()).await;

    let running = p.section.try_enter(CriticalAction::ScheduledIrrigation).unwrap();
    assert_eq!(
        p.section.try_enter(CriticalAction::Dosing).unwrap_err(),
        ControlError::Busy(CriticalAction::ScheduledIrrigation)
    );
    assert_eq!(p.arbiter.request_mode(ControlMode::Manual), ControlMode::Automatic);
    assert_eq!(p.arbiter.mode(), ControlMode::Automatic);
    drop(running);

    let dosing = p.section.try_enter(CriticalAction::Dosing).unwrap();
    assert_eq!(p.arbiter.request_mode(ControlMode::Manual), ControlMode::Automatic);
    drop(dosing);

    assert_eq!(p.arbiter.request_mode(ControlMode::Manual), ControlMode::Manual);
    assert!(!p.section.is_busy());
}
