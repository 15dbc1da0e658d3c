//! HTTP surface over the supervisor.
//!
//! Every handler is a thin translation from a request to one supervisor
//! operation; errors render through `SupervisorError`'s `IntoResponse`.

pub mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, patch, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::supervisor::{PackageKind, ServerSummary, Supervisor};

// ─── Request / Response types ────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateServerRequest {
    pub id: String,
    #[serde(alias = "cmd")]
    pub command: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InputRequest {
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallRequest {
    #[serde(rename = "type")]
    pub kind: PackageKind,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerListResponse {
    pub servers: Vec<ServerSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub cpu_percent: f32,
    pub ram_percent: f32,
    pub servers_total: usize,
    pub servers_running: usize,
}

// ─── Server ──────────────────────────────────────────────────

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(supervisor: Arc<Supervisor>, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        use handlers::{server, system};

        Router::new()
            .route("/api/servers", get(server::list_servers).post(server::create_server))
            .route("/api/server/:id/logs", get(server::get_logs))
            .route("/api/server/:id/input", post(server::send_input))
            .route("/api/server/:id/settings", patch(server::update_settings))
            .route("/api/server/:id/install", post(server::install_package))
            .route("/api/server/:id/:action", post(server::server_action))
            .route("/api/stats", get(system::stats))
            .route("/ping", get(system::ping))
            .route("/json", get(system::ping_json))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Serve until `shutdown` fires.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::MemoryRegistryStore;
    use crate::supervisor::managed_process::{ProcessHandle, ProcessSpawner, SpawnRequest};
    use crate::supervisor::SupervisorOptions;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    /// Processes that run until the test ends and accept any input.
    #[derive(Default)]
    struct IdleSpawner {
        held: Mutex<Vec<(mpsc::Sender<String>, tokio::io::DuplexStream)>>,
    }

    impl ProcessSpawner for IdleSpawner {
        fn spawn(&self, _request: &SpawnRequest<'_>) -> anyhow::Result<ProcessHandle> {
            let (tx, rx) = mpsc::channel(16);
            let (ours, theirs) = tokio::io::duplex(4096);
            self.held.lock().unwrap().push((tx, theirs));
            Ok(ProcessHandle::from_parts(None, rx, Some(Box::new(ours))))
        }
    }

    fn app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(MemoryRegistryStore::new()),
            Arc::new(IdleSpawner::default()),
            SupervisorOptions {
                servers_dir: dir.path().to_path_buf(),
                termination_grace: Duration::from_millis(100),
            },
        ));
        (IPCServer::new(supervisor, "127.0.0.1:0").router(), dir)
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, value)
    }

    #[tokio::test]
    async fn test_create_list_and_logs() {
        let (app, _dir) = app();
        let (status, body) = call(&app, Method::POST, "/api/servers", Some(json!({"id": "my server", "command": "run.sh"}))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "my_server");
        assert_eq!(body["status"], "stopped");

        let (status, body) = call(&app, Method::POST, "/api/servers", Some(json!({"id": "my_server", "command": "x"}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_code"], "DUPLICATE_ID");

        let (_, body) = call(&app, Method::GET, "/api/servers", None).await;
        assert_eq!(body["servers"].as_array().unwrap().len(), 1);

        let (status, body) = call(&app, Method::GET, "/api/server/my_server/logs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logs"], "Server Created.");
    }

    #[tokio::test]
    async fn test_create_rejects_foreign_root() {
        let (app, dir) = app();
        let outside = tempfile::tempdir().unwrap();
        let (status, body) = call(
            &app,
            Method::POST,
            "/api/servers",
            Some(json!({"id": "evil", "command": "run.sh", "path": outside.path()})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "INVALID_CONFIG");

        let shared = dir.path().join("shared");
        let (status, _) = call(&app, Method::POST, "/api/servers", Some(json!({"id": "a", "command": "run.sh", "path": shared}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&app, Method::POST, "/api/servers", Some(json!({"id": "b", "command": "run.sh", "path": shared}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_lifecycle_actions() {
        let (app, _dir) = app();
        call(&app, Method::POST, "/api/servers", Some(json!({"id": "mc", "command": "run.sh"}))).await;

        let (status, body) = call(&app, Method::POST, "/api/server/mc/start", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "started");

        let (_, body) = call(&app, Method::POST, "/api/server/mc/start", None).await;
        assert_eq!(body["result"], "already_running");

        let (_, body) = call(&app, Method::POST, "/api/server/mc/restart", None).await;
        assert_eq!(body["result"], "started");

        let (status, _) = call(&app, Method::POST, "/api/server/mc/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, Method::GET, "/api/server/mc/logs", None).await;
        assert!(body["logs"].as_str().unwrap().ends_with(">>> Stopped by User"));

        let (status, body) = call(&app, Method::POST, "/api/server/mc/explode", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], "INVALID_CONFIG");

        let (status, _) = call(&app, Method::POST, "/api/server/mc/delete", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, Method::POST, "/api/server/mc/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_input_reports_status() {
        let (app, _dir) = app();
        call(&app, Method::POST, "/api/servers", Some(json!({"id": "mc", "command": "run.sh"}))).await;

        let (_, body) = call(&app, Method::POST, "/api/server/mc/input", Some(json!({"command": "say hi"}))).await;
        assert_eq!(body["status"], "error");

        call(&app, Method::POST, "/api/server/mc/start", None).await;
        let (status, body) = call(&app, Method::POST, "/api/server/mc/input", Some(json!({"command": "say hi"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (_, body) = call(&app, Method::POST, "/api/server/ghost/input", Some(json!({"command": "x"}))).await;
        assert_eq!(body["status"], "error");
    }

    #[tokio::test]
    async fn test_settings_and_install_validation() {
        let (app, _dir) = app();
        call(&app, Method::POST, "/api/servers", Some(json!({"id": "bot", "command": "python bot.py"}))).await;

        let (status, body) = call(
            &app,
            Method::PATCH,
            "/api/server/bot/settings",
            Some(json!({"cmd": "python main.py", "cwd": "src", "auto_restart": true, "restart_interval": "6h"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["command"], "python main.py");
        assert_eq!(body["restart_interval"], "6h");

        let (status, _) = call(&app, Method::POST, "/api/server/bot/install", Some(json!({"type": "pip", "name": "x; rm -rf /"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(&app, Method::POST, "/api/server/bot/install", Some(json!({"type": "pip", "name": "requests"}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_liveness_and_stats() {
        let (app, _dir) = app();
        let (status, body) = call(&app, Method::GET, "/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("alive".into()));

        let (_, body) = call(&app, Method::GET, "/json", None).await;
        assert_eq!(body["status"], "alive");

        let (status, body) = call(&app, Method::GET, "/api/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["servers_total"], 0);
        assert!(body.get("ram_percent").is_some());
    }
}
