use crate::core::connection::{ConnectionManager, SubscriptionToken};
use crate::core::transport::{Connector, DefaultConnector};
use crate::domain::config::EndpointConfig;
use crate::domain::error::PortLinkResult;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct Entry {
    manager: ConnectionManager,
    refs: usize,
}

/// Shares one connection manager between all users of an endpoint.
///
/// Endpoints are keyed by structural equality of their configuration, so two
/// independently built but identical configs map to the same manager.
pub struct EndpointRegistry {
    connector: Arc<dyn Connector>,
    entries: Mutex<HashMap<EndpointConfig, Entry>>,
}

impl EndpointRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Get the manager for `config`, creating it on first use
    pub async fn acquire(&self, config: &EndpointConfig) -> PortLinkResult<ConnectionManager> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(config) {
            entry.refs += 1;
            debug!("Reusing manager for {} ({} users)", config.target(), entry.refs);
            return Ok(entry.manager.clone());
        }

        let manager = ConnectionManager::new(config.clone(), Arc::clone(&self.connector))?;
        info!("Registered endpoint {}", config.target());
        entries.insert(
            config.clone(),
            Entry {
                manager: manager.clone(),
                refs: 1,
            },
        );
        Ok(manager)
    }

    /// Drop one reference to `manager`, unsubscribing `token` if given.
    ///
    /// The last release removes the entry and shuts the manager down. The
    /// registry stays locked until the transport is closed, so an `acquire`
    /// racing the teardown cannot open the endpoint a second time. Returns
    /// false when the manager is not (or no longer) registered.
    pub async fn release(
        &self,
        manager: &ConnectionManager,
        token: Option<SubscriptionToken>,
    ) -> bool {
        if let Some(token) = token {
            manager.unsubscribe(token);
        }

        let mut entries = self.entries.lock().await;
        let key = manager.config();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        if entry.manager.id() != manager.id() {
            return false;
        }

        entry.refs -= 1;
        if entry.refs > 0 {
            debug!("Released {} ({} users left)", key.target(), entry.refs);
            return true;
        }

        if let Some(entry) = entries.remove(key) {
            info!("Unregistered endpoint {}", key.target());
            entry.manager.shutdown().await;
        }
        true
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn contains(&self, config: &EndpointConfig) -> bool {
        self.entries.lock().await.contains_key(config)
    }

    /// Users currently holding the manager for `config`
    pub async fn ref_count(&self, config: &EndpointConfig) -> usize {
        self.entries
            .lock()
            .await
            .get(config)
            .map_or(0, |entry| entry.refs)
    }

    /// Remove and shut down every manager regardless of outstanding users
    pub async fn shutdown_all(&self) {
        let mut entries = self.entries.lock().await;
        info!("Shutting down {} endpoints", entries.len());

        for (_, entry) in entries.drain() {
            entry.manager.shutdown().await;
        }
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new(Arc::new(DefaultConnector))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::PortLinkError;

    #[tokio::test]
    async fn test_identical_configs_share_a_manager() {
        let registry = EndpointRegistry::default();
        let a = EndpointConfig::tcp_client("127.0.0.1", 7001).with_split_char(b'\r');
        let b = EndpointConfig::tcp_client("127.0.0.1", 7001).with_split_char(b'\r');

        let first = registry.acquire(&a).await.unwrap();
        let second = registry.acquire(&b).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.ref_count(&a).await, 2);

        let other = registry
            .acquire(&EndpointConfig::tcp_client("127.0.0.1", 7002))
            .await
            .unwrap();
        assert_ne!(other.id(), first.id());
        assert_eq!(registry.len().await, 2);

        registry.shutdown_all().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_last_release_removes_entry() {
        let registry = EndpointRegistry::default();
        let config = EndpointConfig::tcp_client("127.0.0.1", 7003);

        let first = registry.acquire(&config).await.unwrap();
        let second = registry.acquire(&config).await.unwrap();

        assert!(registry.release(&first, None).await);
        assert!(registry.contains(&config).await);
        assert!(registry.release(&second, None).await);
        assert!(!registry.contains(&config).await);
        assert!(!registry.release(&second, None).await);
    }

    #[tokio::test]
    async fn test_invalid_config_is_not_registered() {
        let registry = EndpointRegistry::default();
        let config = EndpointConfig::tcp_client("127.0.0.1", 0);

        let result = registry.acquire(&config).await;
        assert!(matches!(result, Err(PortLinkError::Config { .. })));
        assert!(registry.is_empty().await);
    }
}
