use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::console::LogBuffer;
use super::managed_process::{InputStream, ProcessHandle};
use crate::instance::{RestartInterval, ServerRecord};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Stopped,
    Running,
}

/// The process currently attached to a server, tagged with its attach token.
struct AttachedProcess {
    token: u64,
    handle: ProcessHandle,
    cancel: CancellationToken,
}

/// Registry state of one server.
pub(crate) struct ServerEntry {
    pub record: ServerRecord,
    pub logs: LogBuffer,
    attached: Option<AttachedProcess>,
    /// Monotonic start time, read by the auto-restart scheduler
    pub last_start: Option<Instant>,
    /// Wall-clock start time, for display
    pub started_at: Option<SystemTime>,
    /// Set once delete has begun; the entry accepts no new process.
    pub deleting: bool,
}

impl ServerEntry {
    pub fn new(record: ServerRecord, marker: &str) -> Self {
        Self {
            record,
            logs: LogBuffer::with_marker(marker),
            attached: None,
            last_start: None,
            started_at: None,
            deleting: false,
        }
    }

    /// Derived from whether a process is attached.
    pub fn status(&self) -> ServerStatus {
        if self.attached.is_some() {
            ServerStatus::Running
        } else {
            ServerStatus::Stopped
        }
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.attached.as_ref().map(|a| a.token == token).unwrap_or(false)
    }

    pub fn current_token(&self) -> Option<u64> {
        self.attached.as_ref().map(|a| a.token)
    }

    pub fn pid(&self) -> Option<u32> {
        self.attached.as_ref().and_then(|a| a.handle.pid())
    }

    pub fn stdin(&self) -> Option<Arc<Mutex<InputStream>>> {
        self.attached.as_ref().and_then(|a| a.handle.stdin())
    }

    /// Attach `handle` as the current process. The caller has checked that none is attached.
    pub fn attach(&mut self, token: u64, handle: ProcessHandle, cancel: CancellationToken) {
        debug_assert!(self.attached.is_none(), "attach over a live process");
        self.attached = Some(AttachedProcess {
            token,
            handle,
            cancel,
        });
        self.last_start = Some(Instant::now());
        self.started_at = Some(SystemTime::now());
    }

    /// Detach the current process, signalling its monitor to stop.
    pub fn detach(&mut self) -> Option<ProcessHandle> {
        self.attached.take().map(|a| {
            a.cancel.cancel();
            a.handle
        })
    }

    /// Whether the auto-restart interval has elapsed at `now`.
    pub fn restart_due(&self, now: Instant) -> bool {
        if self.deleting || !self.record.auto_restart || self.status() != ServerStatus::Running {
            return false;
        }
        match self.last_start {
            Some(started) => now.saturating_duration_since(started) >= self.record.restart_interval.as_duration(),
            None => false,
        }
    }

    pub fn summary(&self) -> ServerSummary {
        let uptime_secs = match (self.status(), self.started_at) {
            (ServerStatus::Running, Some(t)) => SystemTime::now().duration_since(t).ok().map(|d| d.as_secs()),
            _ => None,
        };
        ServerSummary {
            id: self.record.id.clone(),
            status: self.status(),
            command: self.record.command.clone(),
            cwd: self.record.cwd.clone(),
            root_path: self.record.root_path.clone(),
            auto_restart: self.record.auto_restart,
            restart_interval: self.record.restart_interval,
            pid: self.pid(),
            uptime_secs,
        }
    }
}

/// Read-only view of a server for callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerSummary {
    pub id: String,
    pub status: ServerStatus,
    pub command: String,
    pub cwd: String,
    pub root_path: PathBuf,
    pub auto_restart: bool,
    pub restart_interval: RestartInterval,
    pub pid: Option<u32>,
    pub uptime_secs: Option<u64>,
}
