//! Decision and irrigation history.
//!
//! Components write through the [`Recorder`] trait; [`Db`] persists to
//! SQLite and [`MemoryRecorder`] keeps everything in memory for tests and
//! for running without a database.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use std::sync::Mutex;

use crate::arbiter::Decision;
use crate::scheduler::IrrigationRecord;
use crate::snapshot::SensorSnapshot;

// ---------------------------------------------------------------------------
// Recorder seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Recorder: Send + Sync {
    async fn record_decision(&self, snapshot: &SensorSnapshot, decision: &Decision) -> Result<()>;

    async fn record_irrigation(&self, record: &IrrigationRecord) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryRecorder {
    decisions: Mutex<Vec<(SensorSnapshot, Decision)>>,
    irrigations: Mutex<Vec<IrrigationRecord>>,
}

impl MemoryRecorder {
    pub fn decisions(&self) -> Vec<(SensorSnapshot, Decision)> {
        self.decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn irrigations(&self) -> Vec<IrrigationRecord> {
        self.irrigations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Recorder for MemoryRecorder {
    async fn record_decision(&self, snapshot: &SensorSnapshot, decision: &Decision) -> Result<()> {
        self.decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((snapshot.clone(), decision.clone()));
        Ok(())
    }

    async fn record_irrigation(&self, record: &IrrigationRecord) -> Result<()> {
        self.irrigations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct DecisionRow {
    pub ts: i64,
    pub season: String,
    pub humidity: f64,
    pub mode: String,
    pub source: String,
    /// Comma-separated quantities whose emergency rule fired.
    pub emergency: String,
    pub command_json: String,
    pub predicted_water: Option<f64>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct IrrigationRow {
    pub ts_start: i64,
    pub ts_end: i64,
    pub season: String,
    pub allotted_l: f64,
    pub delivered_l: f64,
    pub outcome: String,
    pub detail: Option<String>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/controller.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        // Every connection to an in-memory database is a separate database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Decisions
    // ----------------------------

    pub async fn insert_decision(&self, snap: &SensorSnapshot, decision: &Decision) -> Result<()> {
        let command_json =
            serde_json::to_string(&decision.command).context("encode command failed")?;
        let emergency = decision
            .emergency
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(",");

        sqlx::query(
            r#"
            INSERT INTO decisions (
              ts, season,
              humidity, temperature, ph, ce, water_level, flow_rate,
              mode, source, emergency, command_json,
              predicted_water, predicted_fertilizer
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(snap.timestamp.unix_timestamp())
        .bind(snap.season.as_str())
        .bind(snap.humidity)
        .bind(snap.temperature)
        .bind(snap.ph)
        .bind(snap.ce)
        .bind(snap.water_level)
        .bind(snap.flow_rate)
        .bind(decision.mode.to_string())
        .bind(decision.source.as_str())
        .bind(emergency)
        .bind(command_json)
        .bind(decision.prediction.map(|p| p.water_amount))
        .bind(decision.prediction.map(|p| p.fertilizer_percent))
        .execute(&self.pool)
        .await
        .context("insert_decision failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_decisions(&self, limit: i64) -> Result<Vec<DecisionRow>> {
        sqlx::query_as::<_, DecisionRow>(
            r#"
            SELECT ts, season, humidity, mode, source, emergency, command_json, predicted_water
            FROM decisions
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_decisions failed")
    }

    // ----------------------------
    // Irrigation events
    // ----------------------------

    pub async fn insert_irrigation(&self, r: &IrrigationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO irrigation_events (
              ts_due, ts_start, ts_end, season,
              allotted_l, delivered_l, outcome, detail
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(r.trigger.due.unix_timestamp())
        .bind(r.started_at.unix_timestamp())
        .bind(r.ended_at.unix_timestamp())
        .bind(r.trigger.season.as_str())
        .bind(r.allotted_l)
        .bind(r.delivered_l)
        .bind(r.outcome.as_str())
        .bind(r.detail.as_deref())
        .execute(&self.pool)
        .await
        .context("insert_irrigation failed")?;
        Ok(())
    }

    /// Newest first.
    pub async fn recent_irrigations(&self, limit: i64) -> Result<Vec<IrrigationRow>> {
        sqlx::query_as::<_, IrrigationRow>(
            r#"
            SELECT ts_start, ts_end, season, allotted_l, delivered_l, outcome, detail
            FROM irrigation_events
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_irrigations failed")
    }

    /// Litres delivered by runs that started in `[from, to)` (unix seconds).
    pub async fn delivered_between(&self, from: i64, to: i64) -> Result<f64> {
        let total: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT SUM(delivered_l)
            FROM irrigation_events
            WHERE ts_start >= ? AND ts_start < ?
            "#,
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .context("delivered_between failed")?;
        Ok(total.unwrap_or(0.0))
    }
}

#[async_trait]
impl Recorder for Db {
    async fn record_decision(&self, snapshot: &SensorSnapshot, decision: &Decision) -> Result<()> {
        self.insert_decision(snapshot, decision).await
    }

    async fn record_irrigation(&self, record: &IrrigationRecord) -> Result<()> {
        self.insert_irrigation(record).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
