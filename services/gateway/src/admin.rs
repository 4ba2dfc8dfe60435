//! Operational endpoints for credential inspection and manual rotation
//!
//! `POST /tokens/cycle` forces the pool to the next credential regardless of
//! backoff state, for operators who want to move off a credential before the
//! gateway would on its own. `GET /tokens/status` is a read-only snapshot
//! and never mutates rotation or backoff state.

use axum::Json;
use axum::extract::State;
use copilot_pool::{CycleReport, PoolStatus};
use tracing::info;

use crate::AppState;

pub async fn cycle_handler(State(state): State<AppState>) -> Json<CycleReport> {
    let report = state.proxy.pool.cycle();
    info!(
        previous = report.previous_index,
        current = report.current_index,
        "manual credential cycle"
    );
    Json(report)
}

pub async fn status_handler(State(state): State<AppState>) -> Json<PoolStatus> {
    Json(state.proxy.pool.status())
}
