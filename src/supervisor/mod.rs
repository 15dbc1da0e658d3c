pub mod console;
pub mod entry;
pub mod error;
pub mod managed_process;
pub mod process;
pub mod scheduler;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::GlobalConfig;
use crate::instance::{JsonRegistryStore, RegistryStore, RestartInterval, ServerRecord};
use console::clean_line;
use entry::ServerEntry;
pub use entry::{ServerStatus, ServerSummary};
pub use error::SupervisorError;
use managed_process::{OsSpawner, ProcessHandle, ProcessSpawner, SpawnRequest};

/// id → server state, behind the single registry lock.
pub(crate) type Registry = Arc<Mutex<HashMap<String, ServerEntry>>>;

pub const CREATED_MARKER: &str = "Server Created.";
pub const RESTORED_MARKER: &str = "Restored...";
pub const STOPPED_MARKER: &str = ">>> Stopped by User";
pub const RESTART_MARKER: &str = ">>> Manual Restart Triggered...";
pub const INSTALL_FINISHED_MARKER: &str = ">>> Installation Finished.";

/// How long `send_input` waits on a process that is not draining its stdin.
const INPUT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of a `start` call that found its server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { pid: Option<u32> },
    AlreadyRunning,
    /// The OS refused the command; the reason is also in the server log.
    SpawnFailed { reason: String },
}

/// New configuration for a server; takes effect on the next start.
#[derive(Debug, Clone, Deserialize)]
pub struct SettingsUpdate {
    #[serde(alias = "cmd")]
    pub command: String,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default)]
    pub restart_interval: RestartInterval,
}

/// Package managers reachable through `install_package`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    Pip,
    Pkg,
}

impl PackageKind {
    pub fn install_command(&self, package: &str) -> String {
        match self {
            Self::Pip => format!("pip install {}", package),
            Self::Pkg => format!("pkg install -y {}", package),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Parent of the per-server root directories
    pub servers_dir: PathBuf,
    /// Grace period before force-kill
    pub termination_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            servers_dir: PathBuf::from("user_files"),
            termination_grace: process::DEFAULT_GRACE,
        }
    }
}

/// Owns the registry of managed servers and every lifecycle operation on it.
///
/// At most one process is attached per server id. Each attach gets a fresh
/// token; the log monitor of a detached process sees its token go stale and
/// stops without touching the server again.
pub struct Supervisor {
    registry: Registry,
    store: Arc<dyn RegistryStore>,
    spawner: Arc<dyn ProcessSpawner>,
    options: SupervisorOptions,
    next_token: AtomicU64,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        spawner: Arc<dyn ProcessSpawner>,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            store,
            spawner,
            options,
            next_token: AtomicU64::new(1),
        }
    }

    /// JSON-file persistence and real OS processes, as configured.
    pub fn from_config(cfg: &GlobalConfig) -> Self {
        Self::new(
            Arc::new(JsonRegistryStore::new(&cfg.db_file)),
            Arc::new(OsSpawner),
            SupervisorOptions {
                servers_dir: cfg.servers_dir.clone(),
                termination_grace: cfg.termination_grace(),
            },
        )
    }

    /// Populate the registry from the store. Every server comes back stopped;
    /// processes left over from a previous daemon run are not adopted.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let records = self.store.load()?;
        let mut map = self.registry.lock().await;
        for record in records {
            if map.contains_key(&record.id) {
                continue;
            }
            map.insert(record.id.clone(), ServerEntry::new(record, RESTORED_MARKER));
        }
        tracing::info!("Restored {} servers", map.len());
        Ok(map.len())
    }

    // ── Queries ──────────────────────────────────────────────

    pub async fn list(&self) -> Vec<ServerSummary> {
        let map = self.registry.lock().await;
        let mut servers: Vec<ServerSummary> = map.values().map(|e| e.summary()).collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }

    pub async fn get(&self, id: &str) -> Result<ServerSummary, SupervisorError> {
        let map = self.registry.lock().await;
        map.get(id)
            .map(|e| e.summary())
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    pub async fn logs(&self, id: &str) -> Result<Vec<String>, SupervisorError> {
        let map = self.registry.lock().await;
        map.get(id)
            .map(|e| e.logs.lines())
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    /// (total, running) server counts.
    pub async fn counts(&self) -> (usize, usize) {
        let map = self.registry.lock().await;
        let running = map.values().filter(|e| e.status() == ServerStatus::Running).count();
        (map.len(), running)
    }

    // ── Lifecycle ────────────────────────────────────────────

    /// Register a new server in the stopped state and create its root directory.
    ///
    /// Spaces in `id` become underscores. `root_path` defaults to `servers_dir/<id>`;
    /// an explicit one must lie inside `servers_dir` and must not overlap the
    /// root of any other server, since `delete` removes it recursively.
    pub async fn create(
        &self,
        id: &str,
        command: &str,
        root_path: Option<PathBuf>,
    ) -> Result<ServerSummary, SupervisorError> {
        let id = normalize_id(id)?;
        let command = command.trim();
        if command.is_empty() {
            return Err(SupervisorError::InvalidConfig("start command is empty".into()));
        }
        let explicit_root = root_path.is_some();
        let root_path = match root_path {
            Some(path) => confine_root(&self.options.servers_dir, &path)?,
            None => self.options.servers_dir.join(&id),
        };

        check_available(&*self.registry.lock().await, &id, &root_path)?;

        // The directory is created without holding the registry lock.
        tokio::fs::create_dir_all(&root_path).await.map_err(|e| {
            anyhow::anyhow!("Failed to create server directory {}: {}", root_path.display(), e)
        })?;
        if explicit_root {
            ensure_no_escape(&self.options.servers_dir, &root_path).await?;
        }

        let mut map = self.registry.lock().await;
        check_available(&map, &id, &root_path)?;

        let record = ServerRecord {
            id: id.clone(),
            command: command.to_string(),
            cwd: String::new(),
            root_path,
            auto_restart: false,
            restart_interval: RestartInterval::default(),
        };
        let entry = ServerEntry::new(record, CREATED_MARKER);
        let summary = entry.summary();
        map.insert(id.clone(), entry);
        self.persist(&map);

        tracing::info!("Created server '{}'", id);
        Ok(summary)
    }

    /// Start the server's command. A running server is left alone.
    ///
    /// Spawn failures do not surface as `Err`; they are written to the server
    /// log and reported as `StartOutcome::SpawnFailed`.
    pub async fn start(&self, id: &str) -> Result<StartOutcome, SupervisorError> {
        let mut map = self.registry.lock().await;
        let entry = live_entry(&mut map, id)?;
        Ok(self.start_locked(id, entry))
    }

    fn start_locked(&self, id: &str, entry: &mut ServerEntry) -> StartOutcome {
        if entry.status() == ServerStatus::Running {
            tracing::debug!("Server '{}' is already running", id);
            return StartOutcome::AlreadyRunning;
        }

        let work_dir = crate::utils::resolve_working_dir(&entry.record.root_path, &entry.record.cwd);
        let request = SpawnRequest::server(&entry.record.command, &work_dir);
        let mut handle = match self.spawner.spawn(&request) {
            Ok(handle) => handle,
            Err(e) => {
                let err = SupervisorError::SpawnFailure {
                    command: entry.record.command.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!("Server '{}': {}", id, err);
                entry.logs.push(format!(">>> Failed to start: {}", e));
                return StartOutcome::SpawnFailed { reason: e.to_string() };
            }
        };

        let pid = handle.pid();
        let output = handle.take_output();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        entry.attach(token, handle, cancel.clone());
        entry.logs.push(match pid {
            Some(pid) => format!(">>> Process started (PID {}).", pid),
            None => ">>> Process started.".to_string(),
        });
        tracing::info!("Started server '{}' (PID {:?})", id, pid);

        match output {
            Some(output) => {
                tokio::spawn(console::run_monitor(
                    self.registry.clone(),
                    id.to_string(),
                    token,
                    output,
                    cancel,
                    self.options.termination_grace,
                ));
            }
            None => tracing::warn!("Server '{}' has no output stream; exit will not be observed", id),
        }

        StartOutcome::Started { pid }
    }

    /// Tree-terminate the attached process, if any.
    pub async fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        let detached = {
            let mut map = self.registry.lock().await;
            let entry = live_entry(&mut map, id)?;
            let handle = entry.detach();
            if handle.is_some() {
                entry.logs.push(STOPPED_MARKER);
                tracing::info!("Stopping server '{}'", id);
            }
            handle
        };

        if let Some(handle) = detached {
            process::terminate_tree(handle, self.options.termination_grace, id).await;
        }
        Ok(())
    }

    /// Stop immediately followed by start.
    pub async fn restart(&self, id: &str) -> Result<StartOutcome, SupervisorError> {
        let detached = {
            let mut map = self.registry.lock().await;
            let entry = live_entry(&mut map, id)?;
            tracing::info!("Restarting server '{}'", id);
            begin_restart(entry, RESTART_MARKER)
        };
        self.finish_restart(id, detached).await
    }

    /// Scheduler entry point: restart `id` if its interval has elapsed at `now`.
    ///
    /// Re-checks the condition under the lock, so a server deleted, stopped or
    /// reconfigured since the scheduler's snapshot is skipped (`Ok(None)`).
    pub async fn auto_restart(
        &self,
        id: &str,
        now: Instant,
    ) -> Result<Option<StartOutcome>, SupervisorError> {
        let detached = {
            let mut map = self.registry.lock().await;
            let Some(entry) = map.get_mut(id) else {
                return Ok(None);
            };
            if !entry.restart_due(now) {
                return Ok(None);
            }
            let marker = format!(
                ">>> Auto-restarting server (Interval: {})...",
                entry.record.restart_interval
            );
            tracing::info!("Auto-restarting server '{}' (interval {})", id, entry.record.restart_interval);
            begin_restart(entry, &marker)
        };
        self.finish_restart(id, detached).await.map(Some)
    }

    async fn finish_restart(
        &self,
        id: &str,
        detached: Option<ProcessHandle>,
    ) -> Result<StartOutcome, SupervisorError> {
        if let Some(handle) = detached {
            process::terminate_tree(handle, self.options.termination_grace, id).await;
        }
        self.start(id).await
    }

    /// Ids whose auto-restart interval has elapsed at `now`.
    pub async fn due_for_restart(&self, now: Instant) -> Vec<String> {
        let map = self.registry.lock().await;
        map.iter()
            .filter(|(_, e)| e.restart_due(now))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Terminate, remove the root directory, then drop the registry entry.
    ///
    /// Termination and filesystem errors are logged and swallowed; the entry
    /// is removed regardless.
    pub async fn delete(&self, id: &str) -> Result<(), SupervisorError> {
        let (detached, root) = {
            let mut map = self.registry.lock().await;
            let entry = live_entry(&mut map, id)?;
            entry.deleting = true;
            (entry.detach(), entry.record.root_path.clone())
        };
        tracing::info!("Deleting server '{}'", id);

        if let Some(handle) = detached {
            process::terminate_tree(handle, self.options.termination_grace, id).await;
        }

        remove_root(id, &root).await;

        let mut map = self.registry.lock().await;
        map.remove(id);
        self.persist(&map);
        Ok(())
    }

    /// Write `text` plus a newline to the attached process's stdin and flush.
    pub async fn send_input(&self, id: &str, text: &str) -> Result<(), SupervisorError> {
        let (stdin, token) = {
            let mut map = self.registry.lock().await;
            let entry = live_entry(&mut map, id)?;
            match (entry.stdin(), entry.current_token()) {
                (Some(stdin), Some(token)) => (stdin, token),
                _ => {
                    return Err(SupervisorError::WriteFailure {
                        id: id.to_string(),
                        reason: "no process attached".into(),
                    })
                }
            }
        };

        let data = format!("{}\n", text);
        let write = async {
            let mut writer = stdin.lock().await;
            writer.write_all(data.as_bytes()).await?;
            writer.flush().await
        };
        let reason = match tokio::time::timeout(INPUT_WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "timed out waiting for the process to accept input".to_string(),
        };

        let mut map = self.registry.lock().await;
        if let Some(entry) = map.get_mut(id) {
            if entry.is_current(token) {
                entry.logs.push(format!(">>> Input failed: {}", reason));
            }
        }
        tracing::warn!("Input to server '{}' failed: {}", id, reason);
        Err(SupervisorError::WriteFailure {
            id: id.to_string(),
            reason,
        })
    }

    /// Replace the server's command, working directory and restart policy.
    /// A running process is not affected.
    pub async fn update_settings(
        &self,
        id: &str,
        settings: SettingsUpdate,
    ) -> Result<ServerSummary, SupervisorError> {
        let command = settings.command.trim();
        if command.is_empty() {
            return Err(SupervisorError::InvalidConfig("start command is empty".into()));
        }

        let mut map = self.registry.lock().await;
        let entry = live_entry(&mut map, id)?;
        entry.record.command = command.to_string();
        entry.record.cwd = settings.cwd.trim().to_string();
        entry.record.auto_restart = settings.auto_restart;
        entry.record.restart_interval = settings.restart_interval;
        let summary = entry.summary();
        self.persist(&map);

        tracing::info!(
            "Updated settings of '{}' (auto_restart={}, interval={})",
            id,
            settings.auto_restart,
            settings.restart_interval
        );
        Ok(summary)
    }

    /// Run a side job (e.g. a package install) in the server's working
    /// directory, streaming its output into the server log until it exits.
    ///
    /// Returns once the job is launched; await the handle to wait for it.
    pub async fn run_one_shot(
        &self,
        id: &str,
        command: &str,
    ) -> Result<JoinHandle<()>, SupervisorError> {
        let work_dir = {
            let mut map = self.registry.lock().await;
            let entry = live_entry(&mut map, id)?;
            entry.logs.push(format!(">>> Installing: {}", command));
            crate::utils::resolve_working_dir(&entry.record.root_path, &entry.record.cwd)
        };

        let registry = self.registry.clone();
        let spawner = self.spawner.clone();
        let id = id.to_string();
        let command = command.to_string();
        Ok(tokio::spawn(async move {
            run_one_shot_job(registry, spawner, id, command, work_dir).await;
        }))
    }

    /// `pip install <name>` / `pkg install -y <name>` through `run_one_shot`.
    pub async fn install_package(
        &self,
        id: &str,
        kind: PackageKind,
        package: &str,
    ) -> Result<JoinHandle<()>, SupervisorError> {
        let package = package.trim();
        if !is_valid_package_name(package) {
            return Err(SupervisorError::InvalidConfig(format!(
                "invalid package name '{}'",
                package
            )));
        }
        self.run_one_shot(id, &kind.install_command(package)).await
    }

    /// Terminate every attached process. Used on daemon shutdown.
    pub async fn shutdown(&self) {
        let detached: Vec<(String, ProcessHandle)> = {
            let mut map = self.registry.lock().await;
            map.iter_mut()
                .filter_map(|(id, e)| e.detach().map(|h| (id.clone(), h)))
                .collect()
        };
        tracing::info!("Stopping {} running servers", detached.len());

        let grace = self.options.termination_grace;
        let mut set = JoinSet::new();
        for (id, handle) in detached {
            set.spawn(async move { process::terminate_tree(handle, grace, &id).await });
        }
        while set.join_next().await.is_some() {}
    }

    fn persist(&self, map: &HashMap<String, ServerEntry>) {
        let mut records: Vec<ServerRecord> = map.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        if let Err(e) = self.store.save(&records) {
            tracing::error!("Failed to save server registry: {}", e);
        }
    }
}

/// Detach the old process and write the restart marker; termination happens
/// after the lock is released.
fn begin_restart(entry: &mut ServerEntry, marker: &str) -> Option<ProcessHandle> {
    let handle = entry.detach();
    entry.logs.push(marker);
    handle
}

/// Look up an entry that is not being deleted.
fn live_entry<'a>(
    map: &'a mut HashMap<String, ServerEntry>,
    id: &str,
) -> Result<&'a mut ServerEntry, SupervisorError> {
    match map.get_mut(id) {
        Some(entry) if !entry.deleting => Ok(entry),
        _ => Err(SupervisorError::NotFound(id.to_string())),
    }
}

async fn run_one_shot_job(
    registry: Registry,
    spawner: Arc<dyn ProcessSpawner>,
    id: String,
    command: String,
    work_dir: PathBuf,
) {
    let request = SpawnRequest::one_shot(&command, &work_dir);
    let mut handle = match spawner.spawn(&request) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!("One-shot '{}' for '{}' failed to spawn: {}", command, id, e);
            append_log(&registry, &id, format!("Install Error: {}", e)).await;
            return;
        }
    };

    if let Some(mut output) = handle.take_output() {
        while let Some(raw) = output.recv().await {
            let Some(line) = clean_line(&raw) else { continue };
            if !append_log(&registry, &id, line.to_string()).await {
                tracing::debug!("Server '{}' deleted during one-shot job, dropping output", id);
                break;
            }
        }
    }

    if let Some(status) = handle.wait().await {
        tracing::info!("One-shot '{}' for '{}' finished with {}", command, id, status);
    }
    append_log(&registry, &id, INSTALL_FINISHED_MARKER.to_string()).await;
}

/// Append to a server's log; `false` if the server no longer exists.
async fn append_log(registry: &Registry, id: &str, line: String) -> bool {
    let mut map = registry.lock().await;
    match map.get_mut(id) {
        Some(entry) => {
            entry.logs.push(line);
            true
        }
        None => false,
    }
}

/// Best-effort recursive removal of a server root.
async fn remove_root(id: &str, root: &Path) {
    if root.parent().is_none() || root.as_os_str().is_empty() {
        tracing::warn!("Refusing to remove root path '{}' of server '{}'", root.display(), id);
        return;
    }
    match tokio::fs::remove_dir_all(root).await {
        Ok(()) => tracing::debug!("Removed {}", root.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {} for server '{}': {}", root.display(), id, e),
    }
}

/// Reject `id` if it is taken, and `root` if it equals, contains or lies inside
/// another server's root.
fn check_available(
    map: &HashMap<String, ServerEntry>,
    id: &str,
    root: &Path,
) -> Result<(), SupervisorError> {
    if map.contains_key(id) {
        return Err(SupervisorError::DuplicateId(id.to_string()));
    }
    if let Some(other) = map
        .values()
        .find(|e| root.starts_with(&e.record.root_path) || e.record.root_path.starts_with(root))
    {
        return Err(SupervisorError::InvalidConfig(format!(
            "root path '{}' overlaps server '{}' at '{}'",
            root.display(),
            other.record.id,
            other.record.root_path.display()
        )));
    }
    Ok(())
}

/// Resolve a caller-supplied root against `servers_dir` and require it to stay
/// strictly inside it. Relative paths are taken relative to `servers_dir`.
fn confine_root(servers_dir: &Path, requested: &Path) -> Result<PathBuf, SupervisorError> {
    use std::path::Component;

    let outside = || {
        SupervisorError::InvalidConfig(format!(
            "root path '{}' must be inside '{}'",
            requested.display(),
            servers_dir.display()
        ))
    };
    if requested
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
    {
        return Err(outside());
    }

    let resolved = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        servers_dir.join(requested)
    };
    match resolved.strip_prefix(servers_dir) {
        Ok(rest) if rest.components().next().is_some() => Ok(resolved),
        _ => Err(outside()),
    }
}

/// A lexically confined root can still leave `servers_dir` through a symlink.
async fn ensure_no_escape(servers_dir: &Path, root: &Path) -> Result<(), SupervisorError> {
    let real_dir = tokio::fs::canonicalize(servers_dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to resolve {}: {}", servers_dir.display(), e))?;
    let real_root = tokio::fs::canonicalize(root)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to resolve {}: {}", root.display(), e))?;
    if real_root.starts_with(&real_dir) && real_root != real_dir {
        Ok(())
    } else {
        Err(SupervisorError::InvalidConfig(format!(
            "root path '{}' resolves outside '{}'",
            root.display(),
            servers_dir.display()
        )))
    }
}

/// Trimmed id with spaces replaced by underscores. Must be usable as a directory name.
fn normalize_id(raw: &str) -> Result<String, SupervisorError> {
    let id = raw.trim().replace(' ', "_");
    if id.is_empty() {
        return Err(SupervisorError::InvalidConfig("server id is empty".into()));
    }
    if id == "." || id == ".." || id.contains('/') || id.contains('\\') {
        return Err(SupervisorError::InvalidConfig(format!("invalid server id '{}'", id)));
    }
    Ok(id)
}

fn is_valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.=<>[],+~".contains(c))
}
