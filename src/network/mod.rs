//! Client-facing connection transport.
//!
//! A [`Server`] accepts client connections and reports their lifecycle to a
//! [`Handler`]. Each accepted connection is exposed as a [`Conn`].

pub mod tcp;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub use tcp::{TcpServer, TcpServerOptions};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("connection is hanged")]
    ConnectionHanged,
    #[error("send queue is full")]
    SendQueueFull,
    #[error("server is already started")]
    AlreadyStarted,
    #[error("server is not started")]
    NotStarted,
}

/// Lifecycle state of a client connection.
///
/// `Opened -> Hanged -> Closed` on graceful close, `Opened -> Closed` on a
/// forced close or a transport failure. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Opened = 0,
    Hanged = 1,
    Closed = 2,
}

impl ConnState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Opened,
            1 => ConnState::Hanged,
            _ => ConnState::Closed,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Opened => "opened",
            ConnState::Hanged => "hanged",
            ConnState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A client connection.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Process-local connection id, assigned on accept.
    fn id(&self) -> i64;

    /// Bound user id, 0 when unbound.
    fn uid(&self) -> i64;

    fn bind(&self, uid: i64);

    fn unbind(&self);

    /// Queue a message, waiting for space in the write queue.
    async fn send(&self, msg: Bytes) -> Result<(), NetworkError>;

    /// Queue a message, failing immediately when the write queue is full.
    fn push(&self, msg: Bytes) -> Result<(), NetworkError>;

    /// Close the connection. A graceful close drains queued writes first.
    fn close(&self, force: bool) -> Result<(), NetworkError>;

    fn state(&self) -> ConnState;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;
}

/// Connection lifecycle hooks.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn on_connect(&self, conn: Arc<dyn Conn>);

    /// Called exactly once per connection, after it reached `Closed`.
    async fn on_disconnect(&self, conn: Arc<dyn Conn>);

    /// Called for every inbound frame body, in arrival order per connection.
    async fn on_receive(&self, conn: Arc<dyn Conn>, data: Bytes);
}

/// A client-facing listener.
#[async_trait]
pub trait Server: Send + Sync {
    /// Listen address; the bound address once started.
    fn addr(&self) -> String;

    fn protocol(&self) -> &'static str;

    async fn start(&self, handler: Arc<dyn Handler>) -> Result<(), NetworkError>;

    async fn stop(&self) -> Result<(), NetworkError>;
}
