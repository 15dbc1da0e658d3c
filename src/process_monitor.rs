use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use sysinfo::{Pid, System};

/// Host resource usage for the dashboard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SystemStats {
    pub cpu_percent: f32,
    pub ram_percent: f32,
}

/// Every descendant of `root` (children, grandchildren, ...), deepest first.
///
/// The root itself is not included. Processes that re-parented away (e.g. a
/// double-forked daemon) are out of reach, which is why children are also
/// started in their own process group.
pub fn descendants(root: u32) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes();

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut out = Vec::new();
    collect_descendants(&children, Pid::from_u32(root), &mut out);
    out.into_iter().map(|p| p.as_u32()).collect()
}

fn collect_descendants(children: &HashMap<Pid, Vec<Pid>>, pid: Pid, out: &mut Vec<Pid>) {
    if let Some(kids) = children.get(&pid) {
        for kid in kids {
            // guard against pid reuse cycles
            if out.contains(kid) {
                continue;
            }
            collect_descendants(children, *kid, out);
            out.push(*kid);
        }
    }
}

/// The subset of `pids` still alive (zombies excluded), from a single process-table scan.
pub fn alive_among(pids: &[u32]) -> Vec<u32> {
    if pids.is_empty() {
        return Vec::new();
    }
    let mut sys = System::new();
    sys.refresh_processes();
    pids.iter()
        .copied()
        .filter(|pid| match sys.process(Pid::from_u32(*pid)) {
            Some(process) => !matches!(process.status(), sysinfo::ProcessStatus::Zombie),
            None => false,
        })
        .collect()
}

/// Sample CPU and RAM usage. Blocks for the minimum CPU sampling interval.
pub fn system_stats() -> SystemStats {
    let mut sys = System::new();
    sys.refresh_cpu();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_cpu();
    sys.refresh_memory();

    let total = sys.total_memory();
    let ram_percent = if total == 0 {
        0.0
    } else {
        (sys.used_memory() as f64 / total as f64 * 100.0) as f32
    };

    SystemStats {
        cpu_percent: sys.global_cpu_info().cpu_usage(),
        ram_percent,
    }
}

// ── Async wrappers ─────────────────────────────────────────
// Process-table scans are synchronous; keep them off the runtime workers.

pub async fn descendants_async(root: u32) -> Vec<u32> {
    tokio::task::spawn_blocking(move || descendants(root))
        .await
        .unwrap_or_default()
}

pub async fn alive_among_async(pids: Vec<u32>) -> Vec<u32> {
    tokio::task::spawn_blocking(move || alive_among(&pids))
        .await
        .unwrap_or_default()
}

pub async fn system_stats_async() -> SystemStats {
    tokio::task::spawn_blocking(system_stats)
        .await
        .unwrap_or(SystemStats {
            cpu_percent: 0.0,
            ram_percent: 0.0,
        })
}
