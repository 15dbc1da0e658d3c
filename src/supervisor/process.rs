//! Process tree termination.
//!
//! The one termination path shared by stop, restart, delete and the
//! auto-restart scheduler: SIGTERM to every descendant and then the parent,
//! a bounded grace wait, SIGKILL for whatever is left. Every step is
//! best-effort; individual failures are logged and never reach the caller.

use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use super::error::SupervisorError;
use super::managed_process::ProcessHandle;
use crate::process_monitor;

/// Default grace period between the graceful and the forced signal.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermSignal {
    /// SIGTERM (or the platform's closest equivalent)
    Graceful,
    /// SIGKILL
    Force,
}

/// Terminate `handle`'s process and all of its descendants, then reap it.
pub async fn terminate_tree(mut handle: ProcessHandle, grace: Duration, label: &str) {
    let Some(pid) = handle.pid() else {
        tracing::debug!("[{}] Process handle has no PID, nothing to signal", label);
        return;
    };
    if pid == 0 || pid == std::process::id() {
        tracing::warn!("[{}] Refusing to signal PID {}", label, pid);
        return;
    }

    let descendants = process_monitor::descendants_async(pid).await;
    tracing::info!(
        "[{}] Terminating process tree of PID {} ({} descendants)",
        label,
        pid,
        descendants.len()
    );

    for child_pid in &descendants {
        report(label, send_signal(*child_pid, TermSignal::Graceful));
    }
    report(label, send_signal(pid, TermSignal::Graceful));
    #[cfg(unix)]
    report(label, signal_group(pid, TermSignal::Graceful));

    let deadline = Instant::now() + grace;
    let mut alive = survivors(&mut handle, pid, &descendants).await;
    while !alive.is_empty() && Instant::now() < deadline {
        sleep(POLL_INTERVAL).await;
        alive = survivors(&mut handle, pid, &descendants).await;
    }

    if !alive.is_empty() {
        tracing::warn!(
            "[{}] {} process(es) still alive after {:?}, force-killing",
            label,
            alive.len(),
            grace
        );
        for survivor in &alive {
            report(label, send_signal(*survivor, TermSignal::Force));
        }
        #[cfg(unix)]
        report(label, signal_group(pid, TermSignal::Force));
        if let Some(child) = handle.child_mut() {
            let _ = child.start_kill();
        }
    }

    if let Some(child) = handle.child_mut() {
        match timeout(REAP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("[{}] PID {} exited with {}", label, pid, status),
            Ok(Err(e)) => tracing::warn!("[{}] Failed to reap PID {}: {}", label, pid, e),
            Err(_) => tracing::warn!("[{}] Timed out reaping PID {}", label, pid),
        }
    }
}

/// Parent (via the owned child when present) plus descendants that are still alive.
async fn survivors(handle: &mut ProcessHandle, pid: u32, descendants: &[u32]) -> Vec<u32> {
    let mut scan = descendants.to_vec();
    let parent_alive = match handle.child_mut() {
        // try_wait also reaps, so an exited parent never lingers as a zombie
        Some(child) => matches!(child.try_wait(), Ok(None)),
        None => {
            scan.push(pid);
            false
        }
    };
    let mut alive = process_monitor::alive_among_async(scan).await;
    if parent_alive {
        alive.push(pid);
    }
    alive
}

fn report(label: &str, result: Result<(), SupervisorError>) {
    if let Err(e) = result {
        tracing::warn!("[{}] {}", label, e);
    }
}

/// Signal a single PID. A PID that is already gone counts as success.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: TermSignal) -> Result<(), SupervisorError> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), unix_signal(signal)) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::TerminationFailure {
            pid,
            reason: format!("{:?}: {}", signal, e),
        }),
    }
}

/// Signal the process group led by `pgid`.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: TermSignal) -> Result<(), SupervisorError> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), unix_signal(signal)) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(SupervisorError::TerminationFailure {
            pid: pgid,
            reason: format!("{:?} to group: {}", signal, e),
        }),
    }
}

#[cfg(unix)]
fn unix_signal(signal: TermSignal) -> nix::sys::signal::Signal {
    match signal {
        TermSignal::Graceful => nix::sys::signal::Signal::SIGTERM,
        TermSignal::Force => nix::sys::signal::Signal::SIGKILL,
    }
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: TermSignal) -> Result<(), SupervisorError> {
    use sysinfo::{Pid, Signal, System};

    let mut sys = System::new();
    sys.refresh_processes();
    let Some(process) = sys.process(Pid::from_u32(pid)) else {
        return Ok(());
    };
    let delivered = match signal {
        TermSignal::Graceful => process.kill_with(Signal::Term).unwrap_or_else(|| process.kill()),
        TermSignal::Force => process.kill(),
    };
    if delivered {
        Ok(())
    } else {
        Err(SupervisorError::TerminationFailure {
            pid,
            reason: format!("{:?} was not delivered", signal),
        })
    }
}
