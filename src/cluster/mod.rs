//! Gate/node cluster runtime.
//!
//! A [`Gate`] terminates client connections and forwards their messages to a
//! [`Node`], which dispatches them to registered route handlers on a single
//! sequential loop. Both tiers talk to each other through a proxy built on
//! the RPC [`Transporter`](crate::transport::Transporter) and learn about each
//! other from the [`Registry`](crate::registry::Registry).

pub mod gate;
pub mod node;

pub use gate::{Gate, GateBuilder, GateError};
pub use node::{EventArgs, Node, NodeBuilder, NodeError, NodeProxy, Request};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::locate::{LocateError, Locator};
use crate::registry::{Endpoint, Registry, RegistryError};
use crate::router::{Router, RouterError};
use crate::session::SessionError;
use crate::transport::TransportError;

/// Tier of a cluster process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Gate,
    Node,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Gate => f.write_str("gate"),
            Kind::Node => f.write_str("node"),
        }
    }
}

/// Advertised availability of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Work,
    Busy,
    Hang,
    Shut,
}

/// Client lifecycle event propagated from a gate to the node tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    Connect,
    Reconnect,
    Disconnect,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Connect => f.write_str("connect"),
            Event::Reconnect => f.write_str("reconnect"),
            Event::Disconnect => f.write_str("disconnect"),
        }
    }
}

/// Failure of a cross-tier proxy call.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Router error: {0}")]
    Router(#[from] RouterError),
    #[error("Locator error: {0}")]
    Locate(#[from] LocateError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("user {0} is not bound to any gate")]
    NotFoundUserGate(i64),
    #[error("rpc deadline exceeded")]
    DeadlineExceeded,
}

/// Run `fut` with the proxy's call timeout.
pub(crate) async fn with_timeout<T, F>(timeout: std::time::Duration, fut: F) -> Result<T, ProxyError>
where
    F: std::future::Future<Output = Result<T, ProxyError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ProxyError::DeadlineExceeded)?
}

/// Pick the node that should handle `route` for `uid`.
///
/// A stateful route goes to the user's affinity node when one is bound;
/// anything else goes to the next instance advertising the route.
pub(crate) async fn resolve_node(
    router: &Router,
    locator: &dyn Locator,
    route: i32,
    uid: i64,
) -> Result<(String, Endpoint), ProxyError> {
    let resolved = router.find_route(route)?;

    if resolved.stateful() && uid > 0 {
        if let Some(nid) = locator.locate_node(uid).await? {
            let endpoint = resolved.find_endpoint(&nid)?;
            return Ok((nid, endpoint));
        }
    }

    Ok(resolved.select()?)
}

const WATCH_RETRY: Duration = Duration::from_secs(1);

/// Keep `router` in sync with the registry's view of `kind`.
///
/// The first snapshot is applied before returning; later ones are applied by
/// a background task until `cancel` fires.
pub(crate) async fn watch_services(
    registry: &dyn Registry,
    kind: Kind,
    router: Arc<Router>,
    cancel: CancellationToken,
) -> Result<(), RegistryError> {
    let mut watcher = registry.watch(kind).await?;
    let services = watcher.next().await?;
    router.replace_services(&services);

    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = watcher.next() => next,
            };

            match next {
                Ok(services) => router.replace_services(&services),
                Err(RegistryError::Closed) => break,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Watch services failed");
                    tokio::time::sleep(WATCH_RETRY).await;
                }
            }
        }

        debug!(kind = %kind, "Service watcher exiting");
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_wire_names() {
        assert_eq!(Kind::Node.to_string(), "node");
        assert_eq!(Event::Disconnect.to_string(), "disconnect");

        let encoded = rmp_serde::to_vec(&Event::Reconnect).unwrap();
        let decoded: Event = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded, Event::Reconnect);
    }

    #[tokio::test]
    async fn test_resolve_node_honours_affinity() {
        use crate::locate::MemoryLocator;
        use crate::testutil::node_instance;

        let router = Router::new();
        router.replace_services(&[
            node_instance("n1", "127.0.0.1:7001", &[(1, true), (2, false)], &[]),
            node_instance("n2", "127.0.0.1:7002", &[(1, true), (2, false)], &[]),
        ]);
        let locator = MemoryLocator::new();
        locator.bind_node(100, "n2").await.unwrap();

        for _ in 0..4 {
            let (nid, _) = resolve_node(&router, &locator, 1, 100).await.unwrap();
            assert_eq!(nid, "n2");
        }

        // Stateless routes ignore affinity.
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            seen.insert(resolve_node(&router, &locator, 2, 100).await.unwrap().0);
        }
        assert_eq!(seen.len(), 2);

        // Unbound users on a stateful route get any instance.
        assert!(resolve_node(&router, &locator, 1, 200).await.is_ok());

        assert!(matches!(
            resolve_node(&router, &locator, 9, 100).await,
            Err(ProxyError::Router(RouterError::NotFoundRoute(9)))
        ));

        // Affinity to an instance that left the cluster is an error.
        locator.bind_node(300, "n9").await.unwrap();
        assert!(matches!(
            resolve_node(&router, &locator, 1, 300).await,
            Err(ProxyError::Router(RouterError::NotFoundEndpoint(_)))
        ));
    }
}
