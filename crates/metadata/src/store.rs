use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::MetadataError;
use crate::provider::ProviderConfig;

/// Key/value store of provider configurations, keyed by provider id.
///
/// The multiplexer only consumes this interface; the backing store is an
/// external collaborator (the workspace's persistence layer in production,
/// an in-memory map in tests and single-process deployments).
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn save(&self, id: &str, config: ProviderConfig) -> Result<(), MetadataError>;

    async fn get(&self, id: &str) -> Result<ProviderConfig, MetadataError>;

    async fn list(&self) -> Result<Vec<String>, MetadataError>;

    async fn delete(&self, id: &str) -> Result<(), MetadataError>;
}

/// In-process store backed by a map.
#[derive(Default)]
pub struct MemoryStore {
    configs: RwLock<HashMap<String, ProviderConfig>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn save(&self, id: &str, config: ProviderConfig) -> Result<(), MetadataError> {
        self.configs.write().await.insert(id.to_string(), config);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<ProviderConfig, MetadataError> {
        self.configs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, MetadataError> {
        let mut ids: Vec<String> = self.configs.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, id: &str) -> Result<(), MetadataError> {
        self.configs
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| MetadataError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ProviderConfig {
        serde_yaml::from_str("url: wss://feed.example.com/ws").unwrap()
    }

    #[tokio::test]
    async fn test_save_get_list_delete() {
        let store = MemoryStore::new();

        store.save("p1", sample_config()).await.unwrap();
        store.save("p2", sample_config()).await.unwrap();

        let config = store.get("p1").await.unwrap();
        assert_eq!(config.url, "wss://feed.example.com/ws");

        assert_eq!(store.list().await.unwrap(), vec!["p1", "p2"]);

        store.delete("p1").await.unwrap();
        assert!(matches!(
            store.get("p1").await.unwrap_err(),
            MetadataError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.delete("nope").await.unwrap_err(),
            MetadataError::NotFound(_)
        ));
    }
}
