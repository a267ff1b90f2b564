use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::trace;

use super::{LocateError, Locator};

/// Process-local locator for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryLocator {
    gates: RwLock<HashMap<i64, String>>,
    nodes: RwLock<HashMap<i64, String>>,
}

impl MemoryLocator {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_uid(uid: i64) -> Result<(), LocateError> {
    if uid <= 0 {
        return Err(LocateError::InvalidUid(uid));
    }
    Ok(())
}

async fn release(table: &RwLock<HashMap<i64, String>>, uid: i64, id: &str) {
    let mut table = table.write().await;
    if table.get(&uid).is_some_and(|current| current == id) {
        table.remove(&uid);
    }
}

#[async_trait]
impl Locator for MemoryLocator {
    async fn locate_gate(&self, uid: i64) -> Result<Option<String>, LocateError> {
        Ok(self.gates.read().await.get(&uid).cloned())
    }

    async fn locate_node(&self, uid: i64) -> Result<Option<String>, LocateError> {
        Ok(self.nodes.read().await.get(&uid).cloned())
    }

    async fn bind_gate(&self, uid: i64, gid: &str) -> Result<(), LocateError> {
        check_uid(uid)?;
        trace!(uid, gid, "Binding gate");
        self.gates.write().await.insert(uid, gid.to_string());
        Ok(())
    }

    async fn bind_node(&self, uid: i64, nid: &str) -> Result<(), LocateError> {
        check_uid(uid)?;
        trace!(uid, nid, "Binding node");
        self.nodes.write().await.insert(uid, nid.to_string());
        Ok(())
    }

    async fn unbind_gate(&self, uid: i64, gid: &str) -> Result<(), LocateError> {
        release(&self.gates, uid, gid).await;
        Ok(())
    }

    async fn unbind_node(&self, uid: i64, nid: &str) -> Result<(), LocateError> {
        release(&self.nodes, uid, nid).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_and_locate() {
        let locator = MemoryLocator::new();
        locator.bind_gate(100, "g1").await.unwrap();
        locator.bind_node(100, "n1").await.unwrap();

        assert_eq!(locator.locate_gate(100).await.unwrap().as_deref(), Some("g1"));
        assert_eq!(locator.locate_node(100).await.unwrap().as_deref(), Some("n1"));
        assert_eq!(locator.locate_node(101).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unbind_is_idempotent() {
        let locator = MemoryLocator::new();
        locator.bind_node(100, "n1").await.unwrap();

        locator.unbind_node(100, "n1").await.unwrap();
        locator.unbind_node(100, "n1").await.unwrap();
        assert_eq!(locator.locate_node(100).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_unbind_keeps_newer_binding() {
        let locator = MemoryLocator::new();
        locator.bind_gate(100, "g1").await.unwrap();
        locator.bind_gate(100, "g2").await.unwrap();

        locator.unbind_gate(100, "g1").await.unwrap();
        assert_eq!(locator.locate_gate(100).await.unwrap().as_deref(), Some("g2"));
    }

    #[tokio::test]
    async fn test_rejects_unbound_uid() {
        let locator = MemoryLocator::new();
        assert!(matches!(
            locator.bind_node(0, "n1").await,
            Err(LocateError::InvalidUid(0))
        ));
    }
}
