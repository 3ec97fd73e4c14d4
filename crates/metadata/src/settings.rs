use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::MetadataError;

fn default_batch_threshold() -> usize {
    5000
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Multiplexer tunables. The values here are operational defaults observed
/// in production, not contract; every one can be overridden in YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MuxSettings {
    /// Snapshot rows buffered before a partial batch is flushed.
    #[serde(default = "default_batch_threshold")]
    pub batch_threshold: usize,
    /// How often the liveness sweep runs.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Idle time after which a client channel is considered dead.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Outbound buffer per client channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Upper bound on the upstream handshake.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            batch_threshold: default_batch_threshold(),
            sweep_interval_secs: default_sweep_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            channel_capacity: default_channel_capacity(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl MuxSettings {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path)?;
        let settings: MuxSettings = serde_yaml::from_str(&content)?;
        Ok(settings)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
