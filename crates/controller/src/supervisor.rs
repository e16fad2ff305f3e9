//! The control loop.
//!
//! Each cycle runs, in order:
//!
//! 1. due scheduled irrigation triggers (spawned)
//! 2. snapshot acquisition
//! 3. cloud sync when online (spawned, fire-and-forget)
//! 4. arbitration, then applying the command if the critical section is free
//! 5. flow anomaly check
//! 6. status push to the operator panel
//!
//! A failed cycle is logged and followed by a cooldown.  Only the shutdown
//! signal ends the loop, after which every actuator is driven off.

use std::sync::Arc;
use std::time::Duration;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::anomaly::AnomalyDetector;
use crate::arbiter::{Arbiter, ControlMode, Decision, DecisionSource};
use crate::budget::BudgetTracker;
use crate::cloud::CloudSyncer;
use crate::critical::{CriticalAction, CriticalSection};
use crate::error::{ControlError, ControlResult};
use crate::panel::OperatorPanel;
use crate::registry::{ActuatorCommand, ActuatorRegistry, ActuatorState};
use crate::scheduler::IrrigationScheduler;
use crate::sensors::SensorSuite;
use crate::snapshot::SensorSnapshot;
use crate::state::SharedState;

/// Resolves once `true` is published on `rx`.  A dropped sender means no
/// shutdown will ever be requested, so this then never resolves.
pub async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Wait after the n-th consecutive acquisition failure: the cooldown,
/// doubled per failure, capped at the sampling period.
pub fn acquisition_backoff(failures: u32, cooldown: Duration, period: Duration) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    cooldown.saturating_mul(factor).min(period.max(cooldown))
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub sampling_period: Duration,
    pub error_cooldown: Duration,
    pub network_timeout: Duration,
    pub flow_tolerance: f64,
    pub offset: UtcOffset,
}

pub struct SupervisorParts {
    pub suite: SensorSuite,
    pub arbiter: Arc<Arbiter>,
    pub registry: Arc<ActuatorRegistry>,
    pub section: CriticalSection,
    pub budget: Arc<BudgetTracker>,
    pub scheduler: Arc<IrrigationScheduler>,
    pub detector: AnomalyDetector,
    pub panel: Arc<dyn OperatorPanel>,
    pub sync: Option<Arc<CloudSyncer>>,
    pub shared: SharedState,
}

pub struct Supervisor {
    parts: SupervisorParts,
    settings: SupervisorSettings,
    acquire_failures: u32,
}

impl Supervisor {
    pub fn new(parts: SupervisorParts, settings: SupervisorSettings) -> Self {
        Self {
            parts,
            settings,
            acquire_failures: 0,
        }
    }

    /// Run cycles until shutdown, then drive every actuator off.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(period = ?self.settings.sampling_period, "control loop started");
        self.parts
            .shared
            .write()
            .await
            .record_system("control loop started".to_string());

        loop {
            let pause = match self.cycle(OffsetDateTime::now_utc()).await {
                Ok(()) => {
                    self.acquire_failures = 0;
                    self.settings.sampling_period
                }
                Err(e) => self.on_cycle_error(e).await,
            };

            tokio::select! {
                _ = sleep(pause) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        self.shutdown().await;
    }

    async fn on_cycle_error(&mut self, e: ControlError) -> Duration {
        let pause = match &e {
            ControlError::SensorUnavailable { .. } | ControlError::TransientIo(_) => {
                self.acquire_failures += 1;
                let wait = acquisition_backoff(
                    self.acquire_failures,
                    self.settings.error_cooldown,
                    self.settings.sampling_period,
                );
                warn!(failures = self.acquire_failures, retry_in = ?wait, "snapshot acquisition failed: {e}");
                wait
            }
            _ if e.is_recoverable() => {
                warn!("control cycle failed: {e}");
                self.settings.error_cooldown
            }
            _ => {
                error!("control cycle hit a programming fault: {e}");
                self.settings.error_cooldown
            }
        };
        self.parts
            .shared
            .write()
            .await
            .record_error(format!("cycle failed: {e}"));
        pause
    }

    /// One pass of the loop at `now`.
    pub async fn cycle(&mut self, now: OffsetDateTime) -> ControlResult<()> {
        let started = self.parts.scheduler.run_pending(now);
        if !started.is_empty() {
            debug!(runs = started.len(), "scheduled irrigation started");
        }

        let snapshot = self.parts.suite.acquire(now).await?;
        let observed = self.parts.registry.state();
        self.parts.scheduler.observe(&snapshot);

        let buffered = self.sync(&snapshot);

        let (requested, manual) = self.read_panel().await;
        let decision = self
            .parts
            .arbiter
            .evaluate(&snapshot, requested, manual)
            .await;
        let applied = self.apply(&decision)?;
        self.plan_day(&decision, &snapshot, now)?;

        let anomaly = self.parts.detector.classify(
            Some(snapshot.flow_rate),
            observed.pump,
            observed.irrigation_valve,
            self.settings.flow_tolerance,
        );
        if let Some(a) = anomaly {
            warn!(
                anomaly = %a,
                flow = snapshot.flow_rate,
                pump = observed.pump,
                valve = observed.irrigation_valve,
                "flow anomaly detected"
            );
        }

        {
            let mut st = self.parts.shared.write().await;
            st.record_decision(&decision, applied);
            st.record_actuators(self.parts.registry.state());
            st.record_anomaly(anomaly);
            st.budget = self.parts.budget.current();
            if let Some(n) = buffered {
                st.buffered_uploads = n;
            }
        }

        match timeout(
            self.settings.network_timeout,
            self.parts
                .panel
                .push_status(&snapshot, decision.mode, Some(&decision)),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("status push failed: {e}"),
            Err(_) => warn!("status push timed out"),
        }

        Ok(())
    }

    /// Buffer the snapshot and start a sync if online.  Returns the buffer
    /// depth, or `None` without cloud sync.
    fn sync(&self, snapshot: &SensorSnapshot) -> Option<usize> {
        let sync = self.parts.sync.as_ref()?;
        sync.enqueue(snapshot.clone());
        if sync.is_online() {
            sync.spawn_sync();
        } else {
            debug!(buffered = sync.buffered(), "offline, snapshot buffered");
        }
        Some(sync.buffered())
    }

    /// Requested mode and manual command; the current mode and an empty
    /// command when the panel does not answer.
    async fn read_panel(&self) -> (ControlMode, ActuatorCommand) {
        let panel = &self.parts.panel;
        let mode = match timeout(self.settings.network_timeout, panel.get_control_mode()).await {
            Ok(Ok(m)) => m,
            Ok(Err(e)) => {
                warn!("control mode unavailable: {e}");
                self.parts.arbiter.mode()
            }
            Err(_) => {
                warn!("control mode request timed out");
                self.parts.arbiter.mode()
            }
        };
        let manual = match timeout(self.settings.network_timeout, panel.get_manual_commands()).await
        {
            Ok(Ok(cmd)) => cmd,
            Ok(Err(e)) => {
                warn!("manual commands unavailable: {e}");
                ActuatorCommand::default()
            }
            Err(_) => {
                warn!("manual commands request timed out");
                ActuatorCommand::default()
            }
        };
        (mode, manual)
    }

    /// Apply a non-empty command if the critical section is free.  Returns
    /// whether it was applied.  Driver failures are logged, not propagated.
    fn apply(&self, decision: &Decision) -> ControlResult<bool> {
        let cmd = &decision.command;
        if cmd.is_empty() {
            return Ok(false);
        }

        let action = if cmd.inject_fertilizer == Some(true) {
            CriticalAction::Dosing
        } else {
            CriticalAction::ControlCycle
        };
        let guard = match self.parts.section.try_enter(action) {
            Ok(g) => g,
            Err(ControlError::Busy(holder)) => {
                info!(%holder, source = decision.source.as_str(), "decision skipped, critical section busy");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match self.parts.registry.apply(cmd.clone(), &guard) {
            Ok(state) => {
                debug!(?state, "decision applied");
                Ok(true)
            }
            Err(e @ ControlError::Actuator { .. }) => {
                error!("decision partly applied: {e}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Plan the day's budget and triggers from the first model decision of
    /// the day, and re-derive triggers when the season changes.
    fn plan_day(
        &self,
        decision: &Decision,
        snapshot: &SensorSnapshot,
        now: OffsetDateTime,
    ) -> ControlResult<()> {
        let date = now.to_offset(self.settings.offset).date();
        let season = snapshot.season;
        let budget = &self.parts.budget;
        let scheduler = &self.parts.scheduler;

        if let (DecisionSource::Model, Some(p)) = (decision.source, decision.prediction) {
            if budget.needs_replan(date) {
                let guard = match self.parts.section.try_enter(CriticalAction::ControlCycle) {
                    Ok(g) => g,
                    Err(e) => {
                        debug!("daily plan deferred: {e}");
                        return Ok(());
                    }
                };
                let events = scheduler.replan(date, season, now)?;
                budget.replan(p.water_amount, p.fertilizer_percent, date, events.max(1), &guard)?;
                return Ok(());
            }
        }

        let planned_today = budget.current().is_some_and(|b| b.date == date);
        if planned_today && scheduler.needs_plan(date, season) {
            info!(%season, "season changed, re-deriving irrigation triggers");
            scheduler.replan(date, season, now)?;
        }
        Ok(())
    }

    /// Drive everything off.  Waits briefly for a running critical action
    /// to notice the shutdown and release the section.
    async fn shutdown(&self) {
        info!("control loop stopping");
        self.parts.scheduler.cancel_all();

        let mut state: Option<ActuatorState> = None;
        for _ in 0..50 {
            match self.parts.section.try_enter(CriticalAction::Shutdown) {
                Ok(guard) => {
                    match self.parts.registry.force_all_off(&guard) {
                        Ok(s) => state = Some(s),
                        Err(e) => error!("fail-safe shutdown incomplete: {e}"),
                    }
                    break;
                }
                Err(e) => {
                    debug!("waiting to shut down: {e}");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }

        let mut st = self.parts.shared.write().await;
        match state {
            Some(s) => {
                st.record_actuators(s);
                st.record_system("controller stopped, actuators off".to_string());
                info!("all actuators off");
            }
            None => {
                error!("critical section never released; actuators may still be on");
                st.record_error("shutdown could not reach actuators".to_string());
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
