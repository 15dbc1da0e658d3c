use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// Auto-restart period of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RestartInterval {
    Secs30,
    Min1,
    Min5,
    Min10,
    Min30,
    Hour1,
    Hour2,
    Hour3,
    Hour6,
    Hour12,
    Hour24,
}

impl RestartInterval {
    pub const ALL: [RestartInterval; 11] = [
        Self::Secs30,
        Self::Min1,
        Self::Min5,
        Self::Min10,
        Self::Min30,
        Self::Hour1,
        Self::Hour2,
        Self::Hour3,
        Self::Hour6,
        Self::Hour12,
        Self::Hour24,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Secs30 => "30s",
            Self::Min1 => "1m",
            Self::Min5 => "5m",
            Self::Min10 => "10m",
            Self::Min30 => "30m",
            Self::Hour1 => "1h",
            Self::Hour2 => "2h",
            Self::Hour3 => "3h",
            Self::Hour6 => "6h",
            Self::Hour12 => "12h",
            Self::Hour24 => "24h",
        }
    }

    pub fn as_secs(&self) -> u64 {
        match self {
            Self::Secs30 => 30,
            Self::Min1 => 60,
            Self::Min5 => 300,
            Self::Min10 => 600,
            Self::Min30 => 1800,
            Self::Hour1 => 3600,
            Self::Hour2 => 7200,
            Self::Hour3 => 10_800,
            Self::Hour6 => 21_600,
            Self::Hour12 => 43_200,
            Self::Hour24 => 86_400,
        }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.as_secs())
    }

    /// Parse a label such as `"30s"` or `"6h"`; anything unrecognised maps to one hour.
    pub fn parse_lenient(label: &str) -> Self {
        let label = label.trim();
        match Self::ALL.iter().find(|i| i.label() == label) {
            Some(interval) => *interval,
            None => {
                tracing::warn!("Unknown restart interval '{}', using 1h", label);
                Self::Hour1
            }
        }
    }
}

impl Default for RestartInterval {
    fn default() -> Self {
        Self::Hour1
    }
}

impl fmt::Display for RestartInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<String> for RestartInterval {
    fn from(s: String) -> Self {
        Self::parse_lenient(&s)
    }
}

impl From<RestartInterval> for String {
    fn from(i: RestartInterval) -> Self {
        i.label().to_string()
    }
}

/// Reconstructible configuration of one managed server.
///
/// Never carries runtime state (process handle, logs, status).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    pub id: String,
    pub command: String,
    /// Working directory relative to `root_path`
    pub cwd: String,
    pub root_path: PathBuf,
    pub auto_restart: bool,
    pub restart_interval: RestartInterval,
}

/// On-disk shape, keyed by server id in the enclosing map.
#[derive(Debug, Serialize, Deserialize)]
struct StoredServer {
    cmd: String,
    #[serde(default)]
    cwd: String,
    path: PathBuf,
    #[serde(default)]
    auto_restart: bool,
    #[serde(default)]
    restart_interval: RestartInterval,
    #[serde(default = "stopped")]
    status: String,
}

fn stopped() -> String {
    "stopped".to_string()
}

/// Load/save boundary for the server registry.
pub trait RegistryStore: Send + Sync {
    fn load(&self) -> Result<Vec<ServerRecord>>;
    fn save(&self, records: &[ServerRecord]) -> Result<()>;
}

/// Registry store backed by a single JSON file (`servers_db.json`).
pub struct JsonRegistryStore {
    file_path: PathBuf,
}

impl JsonRegistryStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .file_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "servers_db.json".into());
        name.push(".tmp");
        self.file_path.with_file_name(name)
    }
}

impl RegistryStore for JsonRegistryStore {
    fn load(&self) -> Result<Vec<ServerRecord>> {
        if !self.file_path.exists() {
            tracing::info!("Registry file {} does not exist, starting empty", self.file_path.display());
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.file_path)?;
        let stored: BTreeMap<String, StoredServer> = serde_json::from_str(&content)?;
        let records: Vec<ServerRecord> = stored
            .into_iter()
            .map(|(id, s)| ServerRecord {
                id,
                command: s.cmd,
                cwd: s.cwd,
                root_path: s.path,
                auto_restart: s.auto_restart,
                restart_interval: s.restart_interval,
            })
            .collect();
        tracing::info!("Loaded {} servers", records.len());
        Ok(records)
    }

    fn save(&self, records: &[ServerRecord]) -> Result<()> {
        let stored: BTreeMap<&str, StoredServer> = records
            .iter()
            .map(|r| {
                (
                    r.id.as_str(),
                    StoredServer {
                        cmd: r.command.clone(),
                        cwd: r.cwd.clone(),
                        path: r.root_path.clone(),
                        auto_restart: r.auto_restart,
                        restart_interval: r.restart_interval,
                        status: stopped(),
                    },
                )
            })
            .collect();
        let content = serde_json::to_string_pretty(&stored)?;

        // Write beside the target, then rename over it.
        let tmp_path = self.tmp_path();
        fs::write(&tmp_path, content)?;
        if let Err(e) = fs::rename(&tmp_path, &self.file_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        tracing::debug!("Saved {} servers", records.len());
        Ok(())
    }
}

/// In-memory store, used when no persistence is wanted (tests, dry runs).
#[derive(Default)]
pub struct MemoryRegistryStore {
    records: Mutex<Vec<ServerRecord>>,
    saves: Mutex<usize>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<ServerRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: Mutex::new(0),
        }
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<ServerRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn load(&self) -> Result<Vec<ServerRecord>> {
        Ok(self.snapshot())
    }

    fn save(&self, records: &[ServerRecord]) -> Result<()> {
        let mut guard = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        *guard = records.to_vec();
        if let Ok(mut n) = self.saves.lock() {
            *n += 1;
        }
        Ok(())
    }
}
