use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::NodeInner;
use crate::cluster::{resolve_node, with_timeout, ProxyError};
use crate::packet::Message;
use crate::router::RouterError;
use crate::service::CallContext;
use crate::transport::{DeliverArgs, GateClient, NodeClient, Target, TransportError};

/// Calls from a node toward gates, peer nodes and the locator.
///
/// Every remote call is bounded by the node's configured timeout.
#[derive(Clone)]
pub struct NodeProxy {
    inner: Arc<NodeInner>,
}

impl NodeProxy {
    pub(super) fn new(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    /// Id of the node owning this proxy.
    pub fn node_id(&self) -> &str {
        &self.inner.config.id
    }

    fn gate_client(&self, gid: &str) -> Result<Arc<dyn GateClient>, ProxyError> {
        let endpoint = self.inner.gates.find_endpoint(gid)?;
        Ok(self.inner.transporter.new_gate_client(&endpoint)?)
    }

    fn node_client(&self, nid: &str) -> Result<Arc<dyn NodeClient>, ProxyError> {
        let endpoint = self.inner.nodes.find_endpoint(nid)?;
        Ok(self.inner.transporter.new_node_client(&endpoint)?)
    }

    pub async fn locate_gate(&self, uid: i64) -> Result<Option<String>, ProxyError> {
        Ok(self.inner.locator.locate_gate(uid).await?)
    }

    pub async fn locate_node(&self, uid: i64) -> Result<Option<String>, ProxyError> {
        Ok(self.inner.locator.locate_node(uid).await?)
    }

    /// Bind `uid` to connection `cid` on gate `gid`.
    pub async fn bind_gate(&self, gid: &str, cid: i64, uid: i64) -> Result<(), ProxyError> {
        let client = self.gate_client(gid)?;
        with_timeout(self.inner.config.timeout, async {
            Ok(client.bind(cid, uid).await?)
        })
        .await
    }

    /// Release `uid` from whichever gate holds it. Unbound users are a no-op.
    pub async fn unbind_gate(&self, uid: i64) -> Result<(), ProxyError> {
        let Some(gid) = self.locate_gate(uid).await? else {
            return Ok(());
        };

        let client = match self.gate_client(&gid) {
            Ok(client) => client,
            Err(ProxyError::Router(RouterError::NotFoundEndpoint(_))) => {
                // The gate left the cluster; only the stale record remains.
                debug!(uid, gid = %gid, "Releasing user bound to a departed gate");
                self.inner.locator.unbind_gate(uid, &gid).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        with_timeout(self.inner.config.timeout, async {
            Ok(client.unbind(uid).await?)
        })
        .await
    }

    /// Pin `uid` to this node for stateful routes.
    pub async fn bind_node(&self, uid: i64) -> Result<(), ProxyError> {
        Ok(self.inner.locator.bind_node(uid, &self.inner.config.id).await?)
    }

    /// Release `uid`'s pin to this node, if it has one.
    pub async fn unbind_node(&self, uid: i64) -> Result<(), ProxyError> {
        Ok(self.inner.locator.unbind_node(uid, &self.inner.config.id).await?)
    }

    pub async fn push(&self, gid: &str, target: Target, message: Message) -> Result<(), ProxyError> {
        let client = self.gate_client(gid)?;
        with_timeout(self.inner.config.timeout, async {
            Ok(client.push(target, message).await?)
        })
        .await
    }

    /// Push to `uid` on whichever gate holds it.
    pub async fn push_to_user(&self, uid: i64, message: Message) -> Result<(), ProxyError> {
        let gid = self
            .locate_gate(uid)
            .await?
            .ok_or(ProxyError::NotFoundUserGate(uid))?;
        self.push(&gid, Target::User(uid), message).await
    }

    /// Push to every session on every gate. Returns the number of sessions
    /// reached; gates that fail are logged and skipped.
    pub async fn broadcast(&self, message: Message) -> Result<u64, ProxyError> {
        let mut total = 0;

        for gid in self.inner.gates.instances() {
            let client = match self.gate_client(&gid) {
                Ok(client) => client,
                Err(e) => {
                    warn!(gid = %gid, error = %e, "Broadcast skipped gate");
                    continue;
                }
            };

            let result = with_timeout(self.inner.config.timeout, async {
                Ok(client.broadcast(message.clone()).await?)
            })
            .await;

            match result {
                Ok(n) => total += n,
                Err(e) => warn!(gid = %gid, error = %e, "Broadcast failed"),
            }
        }

        Ok(total)
    }

    pub async fn disconnect(&self, gid: &str, target: Target, force: bool) -> Result<(), ProxyError> {
        let client = self.gate_client(gid)?;
        with_timeout(self.inner.config.timeout, async {
            Ok(client.disconnect(target, force).await?)
        })
        .await
    }

    pub async fn disconnect_user(&self, uid: i64, force: bool) -> Result<(), ProxyError> {
        let gid = self
            .locate_gate(uid)
            .await?
            .ok_or(ProxyError::NotFoundUserGate(uid))?;
        self.disconnect(&gid, Target::User(uid), force).await
    }

    /// Forward a client message to the node that should handle its route.
    pub async fn deliver(&self, gid: &str, cid: i64, uid: i64, message: Message) -> Result<(), ProxyError> {
        let inner = &self.inner;
        with_timeout(inner.config.timeout, async {
            let (nid, endpoint) =
                resolve_node(&inner.nodes, inner.locator.as_ref(), message.route, uid).await?;
            let client = inner.transporter.new_node_client(&endpoint)?;
            client
                .deliver(DeliverArgs {
                    gid: gid.to_string(),
                    nid,
                    cid,
                    uid,
                    message,
                })
                .await?;
            Ok(())
        })
        .await
    }

    /// Call `service.method` on node `nid`.
    pub async fn invoke<A, R>(&self, nid: &str, service: &str, method: &str, args: &A) -> Result<R, ProxyError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let client = self.node_client(nid)?;
        let args = Bytes::from(rmp_serde::to_vec_named(args).map_err(TransportError::from)?);
        let ctx = CallContext::with_timeout(self.inner.config.timeout).caller(self.node_id());

        let reply = with_timeout(self.inner.config.timeout, async {
            Ok(client.invoke(ctx, service, method, args).await?)
        })
        .await?;

        Ok(rmp_serde::from_slice(&reply).map_err(TransportError::from)?)
    }
}

impl fmt::Debug for NodeProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeProxy")
            .field("nid", &self.inner.config.id)
            .finish()
    }
}
