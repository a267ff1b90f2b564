//! User location: which gate and which node currently own a user.

mod memory;

pub use memory::MemoryLocator;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocateError {
    #[error("invalid user id: {0}")]
    InvalidUid(i64),
    #[error("locator backend failure: {0}")]
    Backend(String),
}

/// Affinity store shared by every gate and node.
///
/// Unbinding only takes effect when the stored instance id matches the
/// caller's, so a stale release never clobbers a newer binding. Unbinding an
/// absent user is a no-op.
#[async_trait]
pub trait Locator: Send + Sync {
    async fn locate_gate(&self, uid: i64) -> Result<Option<String>, LocateError>;

    async fn locate_node(&self, uid: i64) -> Result<Option<String>, LocateError>;

    async fn bind_gate(&self, uid: i64, gid: &str) -> Result<(), LocateError>;

    async fn bind_node(&self, uid: i64, nid: &str) -> Result<(), LocateError>;

    async fn unbind_gate(&self, uid: i64, gid: &str) -> Result<(), LocateError>;

    async fn unbind_node(&self, uid: i64, nid: &str) -> Result<(), LocateError>;
}
