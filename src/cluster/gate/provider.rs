//! RPC surface a gate serves to the node tier.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::GateInner;
use crate::cluster::ProxyError;
use crate::packet::{pack, Message};
use crate::session::{SessionError, SessionKey};
use crate::transport::{Code, GateProvider, ProviderError, Target};

pub(super) struct GateService {
    inner: Arc<GateInner>,
}

impl GateService {
    pub(super) fn new(inner: Arc<GateInner>) -> Self {
        Self { inner }
    }
}

fn session_key(target: Target) -> (SessionKey, i64) {
    match target {
        Target::Conn(cid) => (SessionKey::Conn, cid),
        Target::User(uid) => (SessionKey::User, uid),
    }
}

fn proxy_failure(e: ProxyError) -> ProviderError {
    match e {
        ProxyError::Locate(e) => e.into(),
        other => ProviderError::new(Code::Internal, other.to_string()),
    }
}

#[async_trait]
impl GateProvider for GateService {
    async fn bind(&self, cid: i64, uid: i64) -> Result<(), ProviderError> {
        if uid <= 0 {
            return Err(ProviderError::new(
                Code::InvalidArgument,
                format!("invalid uid: {uid}"),
            ));
        }

        self.inner.group.bind(cid, uid).await?;

        if let Err(e) = self.inner.proxy.bind_gate(uid).await {
            warn!(cid, uid, error = %e, "Failed to record gate affinity, rolling back");
            self.inner.group.unbind(uid).await;
            return Err(proxy_failure(e));
        }

        debug!(cid, uid, "User bound");
        Ok(())
    }

    async fn unbind(&self, uid: i64) -> Result<(), ProviderError> {
        if self.inner.group.unbind(uid).await.is_some() {
            debug!(uid, "User unbound");
        }
        self.inner.proxy.unbind_gate(uid).await.map_err(proxy_failure)
    }

    async fn push(&self, target: Target, message: Message) -> Result<(), ProviderError> {
        let (key, id) = session_key(target);
        Ok(self.inner.group.push(key, id, pack(&message)).await?)
    }

    async fn broadcast(&self, message: Message) -> Result<u64, ProviderError> {
        Ok(self.inner.group.broadcast(pack(&message)).await as u64)
    }

    async fn disconnect(&self, target: Target, force: bool) -> Result<(), ProviderError> {
        let (key, id) = session_key(target);
        let session = self.inner.group.session(key, id).await?;
        session.close(force).map_err(SessionError::from)?;
        Ok(())
    }
}
