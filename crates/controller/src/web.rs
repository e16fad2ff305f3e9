use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, put};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::arbiter::ControlMode;
use crate::db::{Db, DecisionRow, IrrigationRow};
use crate::registry::ActuatorCommand;
use crate::state::SharedState;
use crate::supervisor::shutdown_requested;

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/mode", get(get_mode).put(put_mode))
        .route("/api/manual", put(put_manual))
        .with_state(state)
}

#[derive(Debug, Serialize, Deserialize)]
struct ModeBody {
    mode: ControlMode,
}

#[derive(Debug, Serialize)]
struct ModeStatus {
    /// Mode in effect for the last control cycle.
    mode: ControlMode,
    requested_mode: ControlMode,
}

async fn api_status(State(state): State<SharedState>) -> impl IntoResponse {
    let st = state.read().await;
    Json(st.to_status())
}

async fn get_mode(State(state): State<SharedState>) -> Json<ModeStatus> {
    let st = state.read().await;
    Json(ModeStatus {
        mode: st.mode,
        requested_mode: st.requested_mode,
    })
}

/// The request takes effect at the next control cycle, and only if no
/// critical action is running then.
async fn put_mode(
    State(state): State<SharedState>,
    Json(body): Json<ModeBody>,
) -> Json<ModeStatus> {
    let mut st = state.write().await;
    if st.requested_mode != body.mode {
        info!(mode = %body.mode, "operator requested mode change");
        st.record_system(format!("operator requested {} mode", body.mode));
    }
    st.requested_mode = body.mode;
    Json(ModeStatus {
        mode: st.mode,
        requested_mode: st.requested_mode,
    })
}

async fn put_manual(
    State(state): State<SharedState>,
    Json(cmd): Json<ActuatorCommand>,
) -> Json<ActuatorCommand> {
    let mut st = state.write().await;
    info!(?cmd, "operator set manual command");
    st.manual = cmd.clone();
    st.record_system("manual command updated".to_string());
    Json(cmd)
}

// ---------------------------------------------------------------------------
// History (read-only, from the database)
// ---------------------------------------------------------------------------

const MAX_HISTORY_ROWS: i64 = 500;

pub fn history_router(db: Db) -> Router {
    Router::new()
        .route("/api/history/decisions", get(history_decisions))
        .route("/api/history/irrigations", get(history_irrigations))
        .with_state(db)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    50
}

impl HistoryQuery {
    fn limit(&self) -> i64 {
        self.limit.clamp(1, MAX_HISTORY_ROWS)
    }
}

#[derive(Debug, Serialize)]
struct IrrigationHistory {
    /// Litres delivered by runs started in the last 24 hours.
    delivered_last_24h_l: f64,
    events: Vec<IrrigationRow>,
}

fn db_error(e: anyhow::Error) -> (StatusCode, String) {
    warn!("history query failed: {e:#}");
    (StatusCode::INTERNAL_SERVER_ERROR, "history unavailable".to_string())
}

async fn history_decisions(
    State(db): State<Db>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Vec<DecisionRow>>, (StatusCode, String)> {
    db.recent_decisions(q.limit()).await.map(Json).map_err(db_error)
}

async fn history_irrigations(
    State(db): State<Db>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<IrrigationHistory>, (StatusCode, String)> {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let delivered = db
        .delivered_between(now - 24 * 3600, now + 1)
        .await
        .map_err(db_error)?;
    let events = db.recent_irrigations(q.limit()).await.map_err(db_error)?;
    Ok(Json(IrrigationHistory {
        delivered_last_24h_l: delivered,
        events,
    }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(
    state: SharedState,
    db: Db,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    info!("operator api listening on http://{addr}");

    axum::serve(listener, router(state).merge(history_router(db)))
        .with_graceful_shutdown(async move { shutdown_requested(&mut shutdown).await })
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
