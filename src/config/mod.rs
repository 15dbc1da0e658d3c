use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/global.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    /// HTTP bind address. `PORT` overrides the port part.
    pub listen_addr: String,
    /// Parent directory for every server's root folder
    pub servers_dir: PathBuf,
    /// Registry persistence file
    pub db_file: PathBuf,
    /// Auto-restart scheduler wake-up period (seconds)
    pub scheduler_tick_secs: u64,
    /// Grace period between SIGTERM and SIGKILL (seconds)
    pub termination_grace_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            servers_dir: PathBuf::from("user_files"),
            db_file: PathBuf::from("servers_db.json"),
            scheduler_tick_secs: 5,
            termination_grace_secs: 3,
        }
    }
}

impl GlobalConfig {
    /// Load from `HANGAR_CONFIG` (or `config/global.toml`), then apply env overrides.
    ///
    /// A missing or unreadable file is not an error; defaults are used instead.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("HANGAR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::load_from(Path::new(&path));
        if let Ok(port) = std::env::var("PORT") {
            cfg.apply_port_override(&port)?;
        }
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Self {
        let s = std::fs::read_to_string(path).unwrap_or_default();
        match toml::from_str::<Self>(&s) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("Invalid config file {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    fn apply_port_override(&mut self, port: &str) -> anyhow::Result<()> {
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid PORT '{}': {}", port, e))?;
        let host = self
            .listen_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        self.listen_addr = format!("{}:{}", host, port);
        Ok(())
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs.max(1))
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }
}
