//! Shared test helpers for `#[cfg(test)]` modules across the crate.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::network::{Conn, ConnState, NetworkError};
use crate::registry::{Endpoint, Route, ServiceInstance};
use crate::cluster::{Event, Kind, State};

/// In-memory [`Conn`] that records everything written to it.
pub struct MockConn {
    id: i64,
    uid: AtomicI64,
    state: AtomicU8,
    sent: Mutex<Vec<Bytes>>,
}

impl MockConn {
    pub fn new(id: i64) -> Arc<Self> {
        Arc::new(Self {
            id,
            uid: AtomicI64::new(0),
            state: AtomicU8::new(ConnState::Opened as u8),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Messages written so far, in order.
    pub async fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Conn for MockConn {
    fn id(&self) -> i64 {
        self.id
    }

    fn uid(&self) -> i64 {
        self.uid.load(Ordering::SeqCst)
    }

    fn bind(&self, uid: i64) {
        self.uid.store(uid, Ordering::SeqCst);
    }

    fn unbind(&self) {
        self.uid.store(0, Ordering::SeqCst);
    }

    async fn send(&self, msg: Bytes) -> Result<(), NetworkError> {
        self.push(msg)
    }

    fn push(&self, msg: Bytes) -> Result<(), NetworkError> {
        if self.state() != ConnState::Opened {
            return Err(NetworkError::ConnectionClosed);
        }
        // Tests never contend on this lock.
        match self.sent.try_lock() {
            Ok(mut sent) => {
                sent.push(msg);
                Ok(())
            }
            Err(_) => Err(NetworkError::SendQueueFull),
        }
    }

    fn close(&self, force: bool) -> Result<(), NetworkError> {
        let next = if force {
            ConnState::Closed
        } else {
            ConnState::Hanged
        };
        self.state.store(next as u8, Ordering::SeqCst);
        Ok(())
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// A node instance advertising the given routes as `(id, stateful)` pairs.
pub fn node_instance(id: &str, address: &str, routes: &[(i32, bool)], events: &[Event]) -> ServiceInstance {
    ServiceInstance {
        id: id.to_string(),
        kind: Kind::Node,
        name: Kind::Node.to_string(),
        alias: "node".to_string(),
        state: State::Work,
        endpoint: Endpoint::new("tcp", address).to_string(),
        routes: routes
            .iter()
            .map(|&(id, stateful)| Route { id, stateful })
            .collect(),
        events: events.to_vec(),
    }
}

/// A gate instance reachable at `address`.
pub fn gate_instance(id: &str, address: &str) -> ServiceInstance {
    ServiceInstance {
        id: id.to_string(),
        kind: Kind::Gate,
        name: Kind::Gate.to_string(),
        alias: "gate".to_string(),
        state: State::Work,
        endpoint: Endpoint::new("tcp", address).to_string(),
        routes: Vec::new(),
        events: Vec::new(),
    }
}
