//! Service invocation registry.
//!
//! Providers describe their callable methods once, at registration time,
//! through a [`MethodRegistrar`]. Each method becomes a typed adapter that is
//! reachable by `(service, method)` name either with in-process arguments or
//! with MessagePack-encoded arguments arriving over the RPC transport.

mod manager;
mod provider;

pub use manager::ServiceManager;
pub(crate) use manager::panic_message;
pub use provider::{BoxError, CallContext, MethodRegistrar, ServiceProvider};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("not found service: {0}")]
    NotFoundService(String),
    #[error("not found method: {service}.{method}")]
    NotFoundMethod { service: String, method: String },
    #[error("type {0} has no callable methods")]
    NoCallableMethods(String),
    #[error("invalid arguments for {method}: expected {expected}")]
    InvalidArguments {
        method: String,
        expected: &'static str,
    },
    #[error("invalid reply type: expected {0}")]
    InvalidReply(&'static str),
    #[error("Deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("Serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("method failed: {0}")]
    Method(BoxError),
    #[error("method panicked: {0}")]
    Panicked(String),
    #[error("deadline exceeded")]
    DeadlineExceeded,
}
