//! RPC surface a node serves to gates and peer nodes.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use super::{EventArgs, NodeInner, NodeProxy, Request};
use crate::cluster::Event;
use crate::service::CallContext;
use crate::transport::{Code, DeliverArgs, NodeProvider, ProviderError, TriggerArgs};

pub(super) struct NodeService {
    inner: Arc<NodeInner>,
}

impl NodeService {
    pub(super) fn new(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    fn proxy(&self) -> NodeProxy {
        NodeProxy::new(Arc::clone(&self.inner))
    }
}

fn unavailable() -> ProviderError {
    ProviderError::new(Code::Unavailable, "node is shutting down")
}

#[async_trait]
impl NodeProvider for NodeService {
    /// Queue a client message for dispatch. Waits while the queue is full.
    async fn deliver(&self, args: DeliverArgs) -> Result<(), ProviderError> {
        let route = args.message.route;

        match self.inner.route_stateful(route).await {
            None => {
                warn!(route, gid = %args.gid, cid = args.cid, "Deliver for unknown route");
                return Err(ProviderError::new(
                    Code::NotFoundRoute,
                    format!("not found route: {route}"),
                ));
            }
            Some(true) if args.nid != self.inner.config.id => {
                warn!(route, uid = args.uid, nid = %args.nid, "Stateful route delivered to the wrong node");
                return Err(ProviderError::new(
                    Code::NotFoundRoute,
                    format!("route {route} for node {} delivered to {}", args.nid, self.inner.config.id),
                ));
            }
            Some(_) => {}
        }

        self.inner
            .request_tx
            .send(Request::new(args, self.proxy()))
            .await
            .map_err(|_| unavailable())
    }

    /// Queue a lifecycle event. A disconnect first releases the user's pin to
    /// this node.
    async fn trigger(&self, args: TriggerArgs) -> Result<(), ProviderError> {
        let mut released = Ok(());

        if args.event == Event::Disconnect && args.uid > 0 {
            if let Err(e) = self
                .inner
                .locator
                .unbind_node(args.uid, &self.inner.config.id)
                .await
            {
                warn!(uid = args.uid, error = %e, "Failed to release node affinity");
                released = Err(ProviderError::from(e));
            }
        }

        self.inner
            .event_tx
            .send(EventArgs {
                event: args.event,
                gid: args.gid,
                cid: args.cid,
                uid: args.uid,
                proxy: self.proxy(),
            })
            .await
            .map_err(|_| unavailable())?;

        released
    }

    async fn invoke(
        &self,
        ctx: CallContext,
        service: &str,
        method: &str,
        args: Bytes,
    ) -> Result<Bytes, ProviderError> {
        self.inner
            .services
            .read()
            .await
            .call_encoded(ctx, service, method, args)
            .await
            .map_err(|e| {
                warn!(service, method, error = %e, "Service invocation failed");
                ProviderError::from(e)
            })
    }
}
