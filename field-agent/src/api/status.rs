//! Aggregated agent status.

use super::AppState;
use crate::resilience::PoolHealth;
use crate::supervisor::{SupervisorHandle, SupervisorState, SupervisorStats};
use crate::ws::bridge::SyncTotalsSnapshot;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub state: SupervisorState,
    pub stats: SupervisorStats,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub agent_id: String,
    pub version: String,
    pub online: bool,
    pub peer: PoolHealth,
    pub queued_operations: usize,
    pub sync: TaskStatus,
    pub mount: Option<TaskStatus>,
    pub totals: SyncTotalsSnapshot,
}

async fn task_status(task: &dyn SupervisorHandle) -> TaskStatus {
    let stats = task.stats().await;
    TaskStatus {
        name: task.name().to_string(),
        state: task.state(),
        success_rate: stats.success_rate(),
        stats,
    }
}

pub async fn collect(state: &AppState) -> StatusReport {
    let mount = match &state.mount {
        Some(task) => Some(task_status(task.as_ref()).await),
        None => None,
    };

    StatusReport {
        agent_id: state.agent_id.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        online: state.resilience.is_online(),
        peer: state.resilience.pool().health().await,
        queued_operations: state.resilience.queue().len().await,
        sync: task_status(state.sync.as_ref()).await,
        mount,
        totals: state.totals.snapshot(),
    }
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(collect(&state).await)
}
