use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;

use super::super::{IPCServer, StatsResponse};

/// GET /api/stats - host CPU/RAM plus server counts
pub async fn stats(State(state): State<IPCServer>) -> impl IntoResponse {
    let host = crate::process_monitor::system_stats_async().await;
    let (servers_total, servers_running) = state.supervisor.counts().await;
    Json(StatsResponse {
        cpu_percent: host.cpu_percent,
        ram_percent: host.ram_percent,
        servers_total,
        servers_running,
    })
}

/// GET /ping
pub async fn ping() -> &'static str {
    "alive"
}

/// GET /json
pub async fn ping_json() -> impl IntoResponse {
    Json(json!({ "status": "alive" }))
}
