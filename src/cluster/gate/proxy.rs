use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::cluster::{resolve_node, with_timeout, Event, ProxyError};
use crate::locate::Locator;
use crate::packet::Message;
use crate::registry::Endpoint;
use crate::router::{Router, RouterError};
use crate::transport::{DeliverArgs, Transporter, TriggerArgs};

/// Calls from a gate toward the node tier.
pub(crate) struct GateProxy {
    gid: String,
    timeout: Duration,
    nodes: Arc<Router>,
    locator: Arc<dyn Locator>,
    transporter: Arc<dyn Transporter>,
}

impl GateProxy {
    pub(super) fn new(
        gid: String,
        timeout: Duration,
        nodes: Arc<Router>,
        locator: Arc<dyn Locator>,
        transporter: Arc<dyn Transporter>,
    ) -> Self {
        Self {
            gid,
            timeout,
            nodes,
            locator,
            transporter,
        }
    }

    /// Forward a client message to the node owning its route.
    pub(crate) async fn deliver(&self, cid: i64, uid: i64, message: Message) -> Result<(), ProxyError> {
        with_timeout(self.timeout, async {
            let (nid, endpoint) =
                resolve_node(&self.nodes, self.locator.as_ref(), message.route, uid).await?;
            let client = self.transporter.new_node_client(&endpoint)?;
            client
                .deliver(DeliverArgs {
                    gid: self.gid.clone(),
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

    /// Notify the node tier of a connection event.
    ///
    /// A bound user's affinity node always hears about it; otherwise any node
    /// listening for the event does. With no such node the event is dropped.
    pub(crate) async fn trigger(&self, event: Event, cid: i64, uid: i64) -> Result<(), ProxyError> {
        with_timeout(self.timeout, async {
            let Some((nid, endpoint)) = self.event_target(event, uid).await? else {
                debug!(event = %event, cid, uid, "No node listens for event");
                return Ok(());
            };

            let client = self.transporter.new_node_client(&endpoint)?;
            client
                .trigger(TriggerArgs {
                    event,
                    gid: self.gid.clone(),
                    cid,
                    uid,
                })
                .await?;
            debug!(event = %event, cid, uid, nid = %nid, "Event triggered");
            Ok(())
        })
        .await
    }

    async fn event_target(&self, event: Event, uid: i64) -> Result<Option<(String, Endpoint)>, ProxyError> {
        if uid > 0 {
            if let Some(nid) = self.locator.locate_node(uid).await? {
                match self.nodes.find_endpoint(&nid) {
                    Ok(endpoint) => return Ok(Some((nid, endpoint))),
                    Err(_) => {
                        // The node is gone; its pin on the user is stale.
                        debug!(uid, nid = %nid, "Releasing affinity to a departed node");
                        self.locator.unbind_node(uid, &nid).await?;
                    }
                }
            }
        }

        match self.nodes.find_event(event) {
            Ok(resolved) => Ok(Some(resolved.select()?)),
            Err(RouterError::NotFoundEvent(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub(crate) async fn bind_gate(&self, uid: i64) -> Result<(), ProxyError> {
        Ok(self.locator.bind_gate(uid, &self.gid).await?)
    }

    /// Release `uid`'s gate affinity if it still points here.
    pub(crate) async fn unbind_gate(&self, uid: i64) -> Result<(), ProxyError> {
        Ok(self.locator.unbind_gate(uid, &self.gid).await?)
    }
}
