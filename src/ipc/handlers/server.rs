use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use super::super::{
    CreateServerRequest, IPCServer, InputRequest, InstallRequest, LogsResponse, ServerListResponse,
};
use crate::supervisor::{SettingsUpdate, SupervisorError};

/// GET /api/servers
pub async fn list_servers(State(state): State<IPCServer>) -> impl IntoResponse {
    let servers = state.supervisor.list().await;
    Json(ServerListResponse { servers })
}

/// POST /api/servers
pub async fn create_server(
    State(state): State<IPCServer>,
    Json(payload): Json<CreateServerRequest>,
) -> Result<Response, SupervisorError> {
    let summary = state
        .supervisor
        .create(&payload.id, &payload.command, payload.path)
        .await?;
    Ok((StatusCode::CREATED, Json(summary)).into_response())
}

/// POST /api/server/:id/:action - start | stop | restart | delete
pub async fn server_action(
    Path((id, action)): Path<(String, String)>,
    State(state): State<IPCServer>,
) -> Result<Response, SupervisorError> {
    let sup = &state.supervisor;
    let response = match action.as_str() {
        "start" => Json(sup.start(&id).await?).into_response(),
        "restart" => Json(sup.restart(&id).await?).into_response(),
        "stop" => {
            sup.stop(&id).await?;
            Json(json!({ "success": true })).into_response()
        }
        "delete" => {
            sup.delete(&id).await?;
            Json(json!({ "success": true })).into_response()
        }
        other => {
            return Err(SupervisorError::InvalidConfig(format!(
                "unknown action '{}'",
                other
            )))
        }
    };
    Ok(response)
}

/// GET /api/server/:id/logs
pub async fn get_logs(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
) -> Result<Json<LogsResponse>, SupervisorError> {
    let lines = state.supervisor.logs(&id).await?;
    Ok(Json(LogsResponse {
        logs: lines.join("\n"),
    }))
}

/// POST /api/server/:id/input
pub async fn send_input(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
    Json(payload): Json<InputRequest>,
) -> impl IntoResponse {
    match state.supervisor.send_input(&id, &payload.command).await {
        Ok(()) => Json(json!({ "status": "ok" })),
        Err(e) => {
            tracing::debug!("Input to '{}' rejected: {}", id, e);
            Json(json!({ "status": "error", "error": e.to_string() }))
        }
    }
}

/// PATCH /api/server/:id/settings
pub async fn update_settings(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
    Json(payload): Json<SettingsUpdate>,
) -> Result<Response, SupervisorError> {
    let summary = state.supervisor.update_settings(&id, payload).await?;
    Ok(Json(summary).into_response())
}

/// POST /api/server/:id/install - runs in the background; progress shows up in the logs
pub async fn install_package(
    Path(id): Path<String>,
    State(state): State<IPCServer>,
    Json(payload): Json<InstallRequest>,
) -> Result<Response, SupervisorError> {
    state
        .supervisor
        .install_package(&id, payload.kind, &payload.name)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "ok" }))).into_response())
}
