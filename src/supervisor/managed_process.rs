//! Managed Process - thin ownership unit around one spawned child
//!
//! A `ProcessHandle` owns:
//! - the merged stdout/stderr line stream (taken by the log monitor)
//! - the writable stdin stream (shared with `send_input`)
//! - the OS child, kept so termination can signal and reap it
//!
//! Spawning goes through the `ProcessSpawner` seam so the supervisor can be
//! driven by scripted handles in tests.

use anyhow::Result;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};

/// Lines buffered between the pipe readers and the log monitor.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// Merged stdout+stderr, one line per message. Closed at EOF of both pipes.
pub type OutputStream = mpsc::Receiver<String>;

/// Writable half of a process's stdin.
pub type InputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Everything the spawner needs to launch a command.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    /// Shell-invocable command line
    pub command: &'a str,
    pub working_dir: &'a Path,
    /// Extra environment on top of the daemon's own
    pub env: Vec<(String, String)>,
    /// Pipe stdin (long-running servers) or leave it null (one-shot jobs)
    pub interactive: bool,
}

impl<'a> SpawnRequest<'a> {
    pub fn server(command: &'a str, working_dir: &'a Path) -> Self {
        Self {
            command,
            working_dir,
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
            interactive: true,
        }
    }

    pub fn one_shot(command: &'a str, working_dir: &'a Path) -> Self {
        Self {
            command,
            working_dir,
            env: vec![("PYTHONUNBUFFERED".to_string(), "1".to_string())],
            interactive: false,
        }
    }
}

/// One OS-level child process plus its standard streams.
pub struct ProcessHandle {
    pid: Option<u32>,
    output: Option<OutputStream>,
    stdin: Option<Arc<Mutex<InputStream>>>,
    child: Option<Child>,
}

impl ProcessHandle {
    /// Assemble a handle from raw parts. Handles without a PID are never signalled.
    pub fn from_parts(pid: Option<u32>, output: OutputStream, stdin: Option<InputStream>) -> Self {
        Self {
            pid,
            output: Some(output),
            stdin: stdin.map(|s| Arc::new(Mutex::new(s))),
            child: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the output stream. Only the first caller gets it.
    pub fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    pub fn stdin(&self) -> Option<Arc<Mutex<InputStream>>> {
        self.stdin.clone()
    }

    /// Wait for the owned child to exit. `None` for handles without one.
    pub async fn wait(&mut self) -> Option<std::process::ExitStatus> {
        match self.child.as_mut() {
            Some(child) => child.wait().await.ok(),
            None => None,
        }
    }

    pub(crate) fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("has_output", &self.output.is_some())
            .field("has_stdin", &self.stdin.is_some())
            .finish()
    }
}

/// The one OS-facing abstraction the supervisor depends on.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<ProcessHandle>;
}

/// Spawns real children through the platform shell, each in its own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSpawner;

impl ProcessSpawner for OsSpawner {
    fn spawn(&self, request: &SpawnRequest<'_>) -> Result<ProcessHandle> {
        let mut cmd = crate::utils::shell_command(request.command);
        cmd.current_dir(request.working_dir)
            .stdin(if request.interactive { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        crate::utils::detach_process_group(&mut cmd);
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("Failed to spawn process '{}': {}", request.command, e))?;

        let pid = child.id();
        let (tx, rx) = mpsc::channel::<String>(OUTPUT_CHANNEL_CAPACITY);

        // ── stdout / stderr readers ──────────────────────────
        // Both forward into the same channel; it closes once both pipes hit EOF.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let stdin = child
            .stdin
            .take()
            .map(|s| Arc::new(Mutex::new(Box::new(s) as InputStream)));

        tracing::debug!("Spawned '{}' with PID {:?}", request.command, pid);

        Ok(ProcessHandle {
            pid,
            output: Some(rx),
            stdin,
            child: Some(child),
        })
    }
}

/// Read `reader` line by line (lossy UTF-8) into `tx` until EOF or the receiver goes away.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Output pipe read error: {}", e);
                break;
            }
        }
    }
}
