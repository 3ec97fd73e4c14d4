use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::MetadataError;

fn default_accept_version() -> String {
    "1.2".to_string()
}

fn default_handshake_delay_ms() -> u64 {
    250
}

/// A trigger the provider fires after subscribing: one SEND frame carrying
/// `body` to `destination`, asking the feed to start its snapshot cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerSpec {
    pub destination: String,
    pub body: String,
}

/// One subscription destination on the upstream feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Destination {
    pub destination: String,
    #[serde(default)]
    pub trigger: Option<TriggerSpec>,
}

/// Configuration for one logical data source.
///
/// Distinct configurations never share a physical connection, even when
/// their `url` is identical; identity lives in the provider id keyed by the
/// store, not here. A config with no destinations is a connect-only
/// provider used for reachability checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    /// WebSocket endpoint of the upstream feed.
    pub url: String,
    /// Protocol version sent in the handshake `accept-version` header.
    #[serde(default = "default_accept_version")]
    pub accept_version: String,
    #[serde(default)]
    pub destinations: Vec<Destination>,
    /// Exact end-of-snapshot marker body, when the feed documents one.
    /// Absent, the session falls back to phrase matching.
    #[serde(default)]
    pub snapshot_end_token: Option<String>,
    /// Delay between the CONNECT frame and the subscribe/trigger pair,
    /// giving the upstream time to register the session.
    #[serde(default = "default_handshake_delay_ms")]
    pub handshake_delay_ms: u64,
}

impl ProviderConfig {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path)?;
        let config: ProviderConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn is_connect_only(&self) -> bool {
        self.destinations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_provider_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
url: wss://feed.example.com/ws
destinations:
  - destination: /topic/positions
    trigger:
      destination: /queue/control
      body: '{{"action":"snapshot"}}'
snapshot_end_token: END_OF_SNAPSHOT
"#
        )
        .unwrap();

        let config = ProviderConfig::load(file.path()).unwrap();
        assert_eq!(config.url, "wss://feed.example.com/ws");
        assert_eq!(config.accept_version, "1.2");
        assert_eq!(config.handshake_delay_ms, 250);
        assert_eq!(config.destinations.len(), 1);
        assert_eq!(config.destinations[0].destination, "/topic/positions");
        let trigger = config.destinations[0].trigger.as_ref().unwrap();
        assert_eq!(trigger.destination, "/queue/control");
        assert_eq!(
            config.snapshot_end_token.as_deref(),
            Some("END_OF_SNAPSHOT")
        );
        assert!(!config.is_connect_only());
    }

    #[test]
    fn test_connect_only_config() {
        let config: ProviderConfig =
            serde_yaml::from_str("url: wss://feed.example.com/ws").unwrap();
        assert!(config.is_connect_only());
        assert!(config.snapshot_end_token.is_none());
    }

    #[test]
    fn test_load_missing_file() {
        let err = ProviderConfig::load(Path::new("/nonexistent/provider.yaml")).unwrap_err();
        assert!(matches!(err, MetadataError::Io(_)));
    }
}
