//! Service instance model and the discovery contract.

mod endpoint;
mod memory;

pub use endpoint::{advertise_address, detect_local_ip, Endpoint, EndpointError};
pub use memory::MemoryRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{Event, Kind, State};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry is closed")]
    Closed,
    #[error("invalid service instance: {0}")]
    InvalidInstance(String),
}

/// A route advertised by a node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Route {
    pub id: i32,
    pub stateful: bool,
}

/// A published process in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceInstance {
    pub id: String,
    pub kind: Kind,
    pub name: String,
    pub alias: String,
    pub state: State,
    /// `scheme://address` of the instance's RPC server
    pub endpoint: String,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub events: Vec<Event>,
}

/// Service discovery backend.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    /// Current instances of one kind.
    async fn services(&self, kind: Kind) -> Result<Vec<ServiceInstance>, RegistryError>;

    /// Watch instances of one kind. Every notification is a full snapshot.
    async fn watch(&self, kind: Kind) -> Result<Box<dyn Watcher>, RegistryError>;
}

#[async_trait]
pub trait Watcher: Send {
    /// Wait for the next snapshot. The first call returns the current one.
    async fn next(&mut self) -> Result<Vec<ServiceInstance>, RegistryError>;
}
