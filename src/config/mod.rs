//! Broker configuration.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for a [`Broker`](crate::Broker).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub limits: LimitsConfig,
    pub timing: TimingConfig,
    pub mux: MuxConfig,
}

/// Memory bounds for windows and subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Scrollback capacity per window, in bytes.
    pub scrollback_bytes: usize,

    /// Per-subscriber queue capacity, in chunks.
    pub queue_chunks: usize,

    /// Dropped-byte threshold after which a subscriber is evicted.
    pub evict_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            scrollback_bytes: 64 * 1024,
            queue_chunks: 256,
            evict_bytes: 1024 * 1024,
        }
    }
}

/// Deadlines and grace periods, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long a child gets between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,

    /// Deadline on synchronous write/resize/kill operations.
    pub op_timeout_ms: u64,

    /// Grace period for draining subscriber queues after a window exits.
    pub drain_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            kill_grace_ms: 500,
            op_timeout_ms: 1000,
            drain_ms: 200,
        }
    }
}

impl TimingConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }
}

/// External session multiplexer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Delegate windows to the external multiplexer when it is runnable.
    pub enabled: bool,

    /// Binary used to drive the external multiplexer.
    pub program: String,

    /// Prefix isolating broker-owned sessions from user sessions.
    pub session_prefix: String,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "tmux".to_string(),
            session_prefix: "mobile-".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Load config from file, or return defaults if not found.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: BrokerConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(BrokerConfig::default())
        }
    }

    /// Get the config file path.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("termhub")
            .join("config.toml")
    }
}
