//! Console capture: the bounded per-server log buffer and the background
//! monitor that feeds it from the attached process's output stream.

use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::managed_process::OutputStream;
use super::Registry;

/// Hard cap on retained lines per server.
pub const LOG_CAPACITY: usize = 500;

pub const EXITED_MARKER: &str = ">>> Process Exited.";

// ─── Log Buffer ──────────────────────────────────────────────

/// Append-only ring of console lines. Oldest lines are evicted first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    max_size: usize,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_size.min(LOG_CAPACITY)),
            max_size: max_size.max(1),
        }
    }

    /// Seed a fresh buffer with a single marker line.
    pub fn with_marker(marker: &str) -> Self {
        let mut buf = Self::new();
        buf.push(marker);
        buf
    }

    pub fn push(&mut self, line: impl Into<String>) {
        while self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalise one raw output line; `None` for blank lines.
pub fn clean_line(raw: &str) -> Option<&str> {
    let line = raw.trim_end();
    if line.is_empty() {
        None
    } else {
        Some(line)
    }
}

// ─── Log Monitor ─────────────────────────────────────────────

/// Drain `output` into server `id`'s log for as long as attach `token` is current.
///
/// Stops without touching state once the server is deleted, once another
/// process has been attached, or once `cancel` fires. At EOF, if this process
/// is still the attached one, it is detached, the exit is recorded and its
/// tree is terminated: a process can close its output and keep running.
pub(crate) async fn run_monitor(
    registry: Registry,
    id: String,
    token: u64,
    mut output: OutputStream,
    cancel: CancellationToken,
    grace: Duration,
) {
    loop {
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("[{}] Log monitor #{} cancelled", id, token);
                return;
            }
            raw = output.recv() => raw,
        };
        let Some(raw) = raw else { break };
        let Some(line) = clean_line(&raw) else { continue };

        // Identity check and append happen under one lock hold.
        let mut map = registry.lock().await;
        match map.get_mut(&id) {
            Some(entry) if entry.is_current(token) => entry.logs.push(line),
            _ => {
                tracing::debug!("[{}] Log monitor #{} superseded, exiting", id, token);
                return;
            }
        }
    }

    let detached = {
        let mut map = registry.lock().await;
        match map.get_mut(&id) {
            Some(entry) if entry.is_current(token) => {
                let handle = entry.detach();
                entry.logs.push(EXITED_MARKER);
                tracing::info!("Server '{}' exited", id);
                handle
            }
            _ => None,
        }
    };

    // Outside the registry lock. An already exited process is just reaped.
    if let Some(handle) = detached {
        super::process::terminate_tree(handle, grace, &id).await;
    }
}
