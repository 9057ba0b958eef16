use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Daemon configuration, loaded from a TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// TCP addresses to accept connections on.
    #[serde(default = "default_listen")]
    pub listen: Vec<SocketAddr>,
    /// Path to the method configuration (ACLs, backends, filters).
    pub methods: PathBuf,
    /// Seconds between keepalive pings to announced workers.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Seconds a peer has to answer a ping before it is disconnected.
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    /// Largest accepted JSON frame; bigger frames drop the connection.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub json_log: bool,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    /// Authentication methods usable in `rpcswitch.hello`, keyed by name.
    #[serde(default)]
    pub auth: HashMap<String, AuthMethodConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthMethodConfig {
    /// Principal name to token.
    pub tokens: HashMap<String, String>,
}

fn default_listen() -> Vec<SocketAddr> {
    vec!["127.0.0.1:6551".parse().expect("valid default address")]
}

fn default_ping_interval() -> u64 {
    60
}

fn default_pong_timeout() -> u64 {
    10
}

fn default_max_frame_bytes() -> usize {
    1024 * 1024
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }
}
