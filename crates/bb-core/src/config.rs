use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{BbError, BbResult, PEER_MAX_MESSAGE_BYTES};

/// Top-level daemon configuration (loaded from bb.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BbConfig {
    pub daemon: DaemonConfig,
    pub tor: TorConfig,
    pub pool: PoolConfig,
    pub peer: PeerConfig,
}

impl BbConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> BbResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| BbError::Config(format!("parsing config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> BbResult<()> {
        let nonzero = [
            ("pool.evict_interval_secs", self.pool.evict_interval_secs),
            ("pool.dial_timeout_secs", self.pool.dial_timeout_secs),
            ("tor.start_timeout_secs", self.tor.start_timeout_secs),
            ("peer.max_message_bytes", self.peer.max_message_bytes as u64),
        ];
        for (key, value) in nonzero {
            if value == 0 {
                return Err(BbError::Config(format!("{key} must be greater than zero")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Base directory for keys, fingerprint and Tor state (default: ~/.barterbackup)
    pub data_dir: PathBuf,
    /// Loopback address of the control-plane listener (default: 127.0.0.1:9911)
    pub cli_addr: String,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

impl DaemonConfig {
    /// Directory holding the per-session control-plane keys and lock file.
    pub fn cli_keys_dir(&self) -> PathBuf {
        expand_tilde(&self.data_dir).join("cli-keys")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    /// Tor executable (looked up in $PATH unless absolute)
    pub binary: PathBuf,
    /// Virtual port published on the onion service
    pub onion_port: u16,
    /// Upper bound for starting Tor and publishing the onion service
    pub start_timeout_secs: u64,
}

impl TorConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Pooled connections unused for this long are closed (default: 300)
    pub idle_timeout_secs: u64,
    /// How often the pool is scanned for idle connections (default: 60)
    pub evict_interval_secs: u64,
    /// Bound for dialing a peer including the TLS handshake (default: 60)
    pub dial_timeout_secs: u64,
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn evict_interval(&self) -> Duration {
        Duration::from_secs(self.evict_interval_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Maximum encoded/decoded peer RPC message size in bytes
    pub max_message_bytes: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("~/.barterbackup"),
            cli_addr: "127.0.0.1:9911".into(),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("tor"),
            onion_port: 80,
            start_timeout_secs: 180,
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            evict_interval_secs: 60,
            dial_timeout_secs: 60,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: PEER_MAX_MESSAGE_BYTES,
        }
    }
}

/// Expand a leading `~` to the user's home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if s == "~" || s.starts_with("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(s.trim_start_matches('~').trim_start_matches('/'))
    } else {
        path.to_path_buf()
    }
}
