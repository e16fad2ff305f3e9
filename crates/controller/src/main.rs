use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_controller::actuator::{ActuatorBank, MockRelays};
use irrigation_controller::anomaly::AnomalyDetector;
use irrigation_controller::arbiter::Arbiter;
use irrigation_controller::budget::BudgetTracker;
use irrigation_controller::cloud::{self, CloudSyncer, MqttCloud};
use irrigation_controller::config::{self, Config, SensorBackend};
use irrigation_controller::critical::CriticalSection;
use irrigation_controller::db::{Db, Recorder};
use irrigation_controller::model::{DecisionModel, LinearModel};
use irrigation_controller::panel::LocalPanel;
use irrigation_controller::registry::ActuatorRegistry;
use irrigation_controller::scheduler::{IrrigationScheduler, SchedulerParts};
use irrigation_controller::sensors::{Sensor, SensorSuite, TelemetryFeed, TelemetrySensor};
use irrigation_controller::snapshot::SensorKind;
use irrigation_controller::state::SystemState;
use irrigation_controller::supervisor::{Supervisor, SupervisorParts, SupervisorSettings};
use irrigation_controller::web;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let offset = cfg.utc_offset()?;
    info!(
        controller = %cfg.controller_id,
        backend = ?cfg.sensor_backend,
        policy = ?cfg.per_event_split_policy,
        "config loaded from {config_path}"
    );

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&cfg.db_url).await?;
    db.migrate().await?;
    let recorder: Arc<dyn Recorder> = Arc::new(db.clone());

    // ── Shared state (for the operator API) ─────────────────────────
    let shared = SystemState::shared(cfg.controller_id.clone());
    shared
        .write()
        .await
        .record_system("controller started".to_string());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Actuators ───────────────────────────────────────────────────
    let section = CriticalSection::new();
    let (bank, relays) = actuator_bank(&cfg)?;
    let registry = Arc::new(ActuatorRegistry::new(bank, section.clone()));
    {
        let guard = section.try_enter(irrigation_controller::critical::CriticalAction::Shutdown)?;
        registry.force_all_off(&guard)?;
    }

    // ── Model ───────────────────────────────────────────────────────
    let linear = LinearModel::open(&cfg.model_path);
    if !linear.is_loaded() {
        warn!("running on emergency and default rules until a model is available");
    }
    let model: Arc<dyn DecisionModel> = Arc::new(linear);

    // ── MQTT / cloud ────────────────────────────────────────────────
    let feed = (cfg.sensor_backend == SensorBackend::Telemetry)
        .then(|| Arc::new(TelemetryFeed::new(cfg.stale_timeout())));
    let (mqtt, eventloop) = MqttCloud::new(
        &cfg.mqtt,
        &cfg.controller_id,
        feed.is_some(),
        cfg.network_timeout(),
    );
    tokio::spawn(cloud::pump_events(
        Arc::clone(&mqtt),
        eventloop,
        feed.clone(),
        shared.clone(),
        shutdown_rx.clone(),
    ));
    let syncer = Arc::new(CloudSyncer::new(
        mqtt,
        Arc::clone(&model),
        cfg.sync_buffer_capacity,
    ));

    // ── Sensors ─────────────────────────────────────────────────────
    let sensors = match (&cfg.sensor_backend, &feed) {
        (SensorBackend::Telemetry, Some(feed)) => TelemetrySensor::all(feed),
        _ => sim_sensors(relays.as_ref(), cfg.nominal_flow_lpm)?,
    };
    let suite = SensorSuite::new(sensors, cfg.hemisphere, offset, cfg.network_timeout())?;
    let flow = suite
        .sensor(SensorKind::FlowRate)
        .context("no flow sensor registered")?;

    // ── Budget, scheduler, arbiter ──────────────────────────────────
    let budget = Arc::new(BudgetTracker::new(section.clone(), cfg.per_event_split_policy));
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
        cfg.schedule_table()?,
        cfg.run_settings(),
        offset,
        shutdown_rx.clone(),
    ));
    let arbiter = Arc::new(Arbiter::new(
        model,
        cfg.threshold_table()?,
        section.clone(),
        recorder,
    ));

    // ── Operator API ────────────────────────────────────────────────
    let addr = cfg.web_addr()?;
    let web_state = shared.clone();
    let web_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, db, addr, web_shutdown).await {
            error!("operator api stopped: {e:#}");
        }
    });

    // ── Control loop ────────────────────────────────────────────────
    let supervisor = Supervisor::new(
        SupervisorParts {
            suite,
            arbiter,
            registry,
            section,
            budget,
            scheduler,
            detector: AnomalyDetector::new(cfg.nominal_flow_lpm, cfg.minimal_flow_threshold),
            panel: Arc::new(LocalPanel::new(shared.clone())),
            sync: Some(syncer),
            shared,
        },
        SupervisorSettings {
            sampling_period: cfg.sampling_period(),
            error_cooldown: cfg.error_cooldown(),
            network_timeout: cfg.network_timeout(),
            flow_tolerance: cfg.flow_tolerance,
            offset,
        },
    );
    let control = tokio::spawn(supervisor.run(shutdown_rx));

    shutdown_signal().await;
    info!("shutdown requested");
    if shutdown_tx.send(true).is_err() {
        warn!("no task was listening for shutdown");
    }
    control.await.context("control loop panicked")?;
    info!("controller stopped");
    Ok(())
}

/// Mock relays also hand back their handles so the simulated plant can observe them.
fn actuator_bank(cfg: &Config) -> Result<(ActuatorBank, Option<MockRelays>)> {
    if cfg.gpio.enabled {
        return Ok((gpio_bank(cfg)?, None));
    }
    let (bank, relays) = ActuatorBank::mock(&cfg.gpio.pins());
    Ok((bank, Some(relays)))
}

#[cfg(feature = "gpio")]
fn gpio_bank(cfg: &Config) -> Result<ActuatorBank> {
    ActuatorBank::gpio(&cfg.gpio.pins(), cfg.gpio.active_low).context("failed to open GPIO relays")
}

#[cfg(not(feature = "gpio"))]
fn gpio_bank(_: &Config) -> Result<ActuatorBank> {
    anyhow::bail!("gpio.enabled = true, but this build has no `gpio` feature")
}

#[cfg(feature = "sim")]
fn sim_sensors(relays: Option<&MockRelays>, nominal_flow: f64) -> Result<Vec<Arc<dyn Sensor>>> {
    use irrigation_controller::sim::{PlantState, SimPlant, SimSensor};

    let relays = relays.context("simulated sensors need mock relays")?;
    let plant = Arc::new(SimPlant::new(relays, PlantState::default(), nominal_flow, 1.0));
    info!("[sim] simulated plant attached to mock relays");
    Ok(SimSensor::all(&plant))
}

#[cfg(not(feature = "sim"))]
fn sim_sensors(_: Option<&MockRelays>, _: f64) -> Result<Vec<Arc<dyn Sensor>>> {
    anyhow::bail!("sensor_backend = \"sim\", but this build has no `sim` feature")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
