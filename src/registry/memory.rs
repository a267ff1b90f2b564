use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use super::{Registry, RegistryError, ServiceInstance, Watcher};
use crate::cluster::Kind;

/// Process-local registry for single-process deployments and tests.
#[derive(Debug)]
pub struct MemoryRegistry {
    tx: watch::Sender<BTreeMap<String, ServiceInstance>>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BTreeMap::new());
        Self { tx }
    }
}

fn of_kind(all: &BTreeMap<String, ServiceInstance>, kind: Kind) -> Vec<ServiceInstance> {
    all.values().filter(|s| s.kind == kind).cloned().collect()
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        if instance.id.is_empty() {
            return Err(RegistryError::InvalidInstance("empty id".to_string()));
        }

        debug!(id = %instance.id, kind = %instance.kind, "Registering service instance");
        self.tx.send_modify(|all| {
            all.insert(instance.id.clone(), instance.clone());
        });
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        debug!(id = %instance.id, kind = %instance.kind, "Deregistering service instance");
        self.tx.send_if_modified(|all| all.remove(&instance.id).is_some());
        Ok(())
    }

    async fn services(&self, kind: Kind) -> Result<Vec<ServiceInstance>, RegistryError> {
        Ok(of_kind(&self.tx.borrow(), kind))
    }

    async fn watch(&self, kind: Kind) -> Result<Box<dyn Watcher>, RegistryError> {
        let mut rx = self.tx.subscribe();
        rx.mark_changed();
        Ok(Box::new(MemoryWatcher { kind, rx }))
    }
}

struct MemoryWatcher {
    kind: Kind,
    rx: watch::Receiver<BTreeMap<String, ServiceInstance>>,
}

#[async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, RegistryError> {
        self.rx.changed().await.map_err(|_| RegistryError::Closed)?;
        Ok(of_kind(&self.rx.borrow_and_update(), self.kind))
    }
}
