//! Inter-tier RPC transport.
//!
//! A [`Transporter`] builds the RPC server each tier exposes and the clients
//! it uses to reach the other tier. Gates serve [`GateProvider`] calls and
//! nodes serve [`NodeProvider`] calls; wire encoding is up to the
//! implementation.

pub mod tcp;

pub use tcp::{TcpTransporter, TcpTransporterOptions};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::Event;
use crate::locate::LocateError;
use crate::packet::Message;
use crate::registry::Endpoint;
use crate::service::{CallContext, ServiceError};
use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(std::io::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("Deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Connection closed by peer")]
    ConnectionClosed,
    #[error("Request timed out")]
    Timeout,
    #[error("Unexpected reply from peer")]
    UnexpectedReply,
    #[error("Remote error: {0}")]
    Remote(ProviderError),
    #[error("server is not started")]
    NotStarted,
    #[error("server is already started")]
    AlreadyStarted,
    #[error("unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),
}

/// Failure category carried over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Code {
    InvalidArgument,
    NotFoundRoute,
    NotFoundSession,
    NotFoundService,
    NotFoundMethod,
    DeadlineExceeded,
    Unavailable,
    Internal,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error returned by a provider and relayed to the remote caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Deserialize, Serialize)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: Code,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<SessionError> for ProviderError {
    fn from(e: SessionError) -> Self {
        let code = match e {
            SessionError::NotFound { .. } => Code::NotFoundSession,
            SessionError::Network(_) => Code::Internal,
        };
        ProviderError::new(code, e.to_string())
    }
}

impl From<LocateError> for ProviderError {
    fn from(e: LocateError) -> Self {
        let code = match e {
            LocateError::InvalidUid(_) => Code::InvalidArgument,
            LocateError::Backend(_) => Code::Internal,
        };
        ProviderError::new(code, e.to_string())
    }
}

impl From<ServiceError> for ProviderError {
    fn from(e: ServiceError) -> Self {
        let code = match e {
            ServiceError::NotFoundService(_) => Code::NotFoundService,
            ServiceError::NotFoundMethod { .. } => Code::NotFoundMethod,
            ServiceError::InvalidArguments { .. } | ServiceError::Decode(_) => {
                Code::InvalidArgument
            }
            ServiceError::DeadlineExceeded => Code::DeadlineExceeded,
            _ => Code::Internal,
        };
        ProviderError::new(code, e.to_string())
    }
}

/// Addressee of a gate-side push or disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Target {
    Conn(i64),
    User(i64),
}

/// A client message forwarded to a node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeliverArgs {
    pub gid: String,
    pub nid: String,
    pub cid: i64,
    pub uid: i64,
    pub message: Message,
}

/// A lifecycle event forwarded to a node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TriggerArgs {
    pub event: Event,
    pub gid: String,
    pub cid: i64,
    pub uid: i64,
}

/// Operations a gate serves to the node tier.
#[async_trait]
pub trait GateProvider: Send + Sync {
    async fn bind(&self, cid: i64, uid: i64) -> Result<(), ProviderError>;

    async fn unbind(&self, uid: i64) -> Result<(), ProviderError>;

    async fn push(&self, target: Target, message: Message) -> Result<(), ProviderError>;

    async fn broadcast(&self, message: Message) -> Result<u64, ProviderError>;

    async fn disconnect(&self, target: Target, force: bool) -> Result<(), ProviderError>;
}

/// Operations a node serves to gates and other nodes.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    async fn deliver(&self, args: DeliverArgs) -> Result<(), ProviderError>;

    async fn trigger(&self, args: TriggerArgs) -> Result<(), ProviderError>;

    async fn invoke(
        &self,
        ctx: CallContext,
        service: &str,
        method: &str,
        args: Bytes,
    ) -> Result<Bytes, ProviderError>;
}

/// Client side of [`GateProvider`].
#[async_trait]
pub trait GateClient: Send + Sync {
    async fn bind(&self, cid: i64, uid: i64) -> Result<(), TransportError>;

    async fn unbind(&self, uid: i64) -> Result<(), TransportError>;

    async fn push(&self, target: Target, message: Message) -> Result<(), TransportError>;

    async fn broadcast(&self, message: Message) -> Result<u64, TransportError>;

    async fn disconnect(&self, target: Target, force: bool) -> Result<(), TransportError>;
}

/// Client side of [`NodeProvider`].
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn deliver(&self, args: DeliverArgs) -> Result<(), TransportError>;

    async fn trigger(&self, args: TriggerArgs) -> Result<(), TransportError>;

    async fn invoke(
        &self,
        ctx: CallContext,
        service: &str,
        method: &str,
        args: Bytes,
    ) -> Result<Bytes, TransportError>;
}

/// An RPC listener.
#[async_trait]
pub trait Server: Send + Sync {
    /// Listen address; the bound address once started.
    fn addr(&self) -> String;

    fn scheme(&self) -> &'static str;

    /// Endpoint peers should dial. Available once started.
    fn endpoint(&self) -> Result<Endpoint, TransportError>;

    async fn start(&self) -> Result<(), TransportError>;

    async fn stop(&self) -> Result<(), TransportError>;
}

pub trait Transporter: Send + Sync {
    fn new_gate_server(&self, provider: Arc<dyn GateProvider>) -> Box<dyn Server>;

    fn new_node_server(&self, provider: Arc<dyn NodeProvider>) -> Box<dyn Server>;

    fn new_gate_client(&self, endpoint: &Endpoint) -> Result<Arc<dyn GateClient>, TransportError>;

    fn new_node_client(&self, endpoint: &Endpoint) -> Result<Arc<dyn NodeClient>, TransportError>;
}
