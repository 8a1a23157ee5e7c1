//! Service repository.
//!
//! Published services are immutable `Arc<Service>` values. Publishing a
//! re-imported service swaps the whole value under the key, so a reader
//! sees either the complete previous service or the complete new one and
//! never holds the lock while serving.

use crate::model::{Service, ServiceKey};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Storage of published services.
#[async_trait]
pub trait ServiceRepository: Send + Sync {
    async fn get(&self, key: &ServiceKey) -> Option<Arc<Service>>;

    /// Publish `service`, replacing any service with the same key.
    /// Returns the replaced service.
    async fn publish(&self, service: Service) -> Option<Arc<Service>>;

    async fn remove(&self, key: &ServiceKey) -> Option<Arc<Service>>;

    /// Keys of all published services, sorted.
    async fn keys(&self) -> Vec<ServiceKey>;
}

/// In-memory repository.
#[derive(Default)]
pub struct InMemoryServiceStore {
    services: RwLock<HashMap<ServiceKey, Arc<Service>>>,
}

impl InMemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceRepository for InMemoryServiceStore {
    async fn get(&self, key: &ServiceKey) -> Option<Arc<Service>> {
        self.services.read().await.get(key).cloned()
    }

    async fn publish(&self, service: Service) -> Option<Arc<Service>> {
        let key = service.key();
        let operations = service.operations.len();
        let previous = self.services.write().await.insert(key.clone(), Arc::new(service));
        info!(
            service = %key,
            operations,
            replaced = previous.is_some(),
            "Service published"
        );
        previous
    }

    async fn remove(&self, key: &ServiceKey) -> Option<Arc<Service>> {
        self.services.write().await.remove(key)
    }

    async fn keys(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<ServiceKey> = self.services.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}
