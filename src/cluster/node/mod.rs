//! Logic tier.
//!
//! A [`Node`] serves [`NodeProvider`](crate::transport::NodeProvider) calls
//! from gates and peer nodes, queues them, and hands them one at a time to
//! the route and event handlers registered by the application.

mod dispatch;
mod provider;
mod proxy;
mod request;

pub use proxy::NodeProxy;
pub use request::{EventArgs, Request};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{watch_services, Event, Kind, State};
use crate::config::{ConfigError, NodeConfig};
use crate::container::Component;
use crate::locate::Locator;
use crate::registry::{Registry, RegistryError, Route, ServiceInstance};
use crate::router::Router;
use crate::service::{ServiceError, ServiceManager, ServiceProvider};
use crate::transport::{self, TransportError, Transporter};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),
    #[error("node is already started")]
    AlreadyStarted,
}

pub(crate) type RouteHandler = Arc<dyn Fn(Request) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type EventHandler = Arc<dyn Fn(EventArgs) -> BoxFuture<'static, ()> + Send + Sync>;

struct RouteEntry {
    stateful: bool,
    handler: RouteHandler,
}

/// Local route and event table.
#[derive(Default)]
struct Handlers {
    routes: HashMap<i32, RouteEntry>,
    default: Option<RouteHandler>,
    events: HashMap<Event, EventHandler>,
}

pub(crate) struct NodeInner {
    config: NodeConfig,
    handlers: RwLock<Handlers>,
    services: RwLock<ServiceManager>,
    event_tx: mpsc::Sender<EventArgs>,
    request_tx: mpsc::Sender<Request>,
    receivers: Mutex<Option<(mpsc::Receiver<EventArgs>, mpsc::Receiver<Request>)>>,
    /// Gates this node pushes to
    gates: Arc<Router>,
    /// Peer nodes, including this one
    nodes: Arc<Router>,
    locator: Arc<dyn Locator>,
    registry: Arc<dyn Registry>,
    transporter: Arc<dyn Transporter>,
    rpc: Mutex<Option<Box<dyn transport::Server>>>,
    instance: Mutex<Option<ServiceInstance>>,
    cancel: CancellationToken,
}

impl NodeInner {
    /// `Some(stateful)` when a handler would accept `route`.
    async fn route_stateful(&self, route: i32) -> Option<bool> {
        let handlers = self.handlers.read().await;
        match handlers.routes.get(&route) {
            Some(entry) => Some(entry.stateful),
            None => handlers.default.as_ref().map(|_| false),
        }
    }

    async fn build_instance(&self, endpoint: String) -> ServiceInstance {
        let handlers = self.handlers.read().await;

        let mut routes: Vec<Route> = handlers
            .routes
            .iter()
            .map(|(&id, entry)| Route {
                id,
                stateful: entry.stateful,
            })
            .collect();
        routes.sort_by_key(|route| route.id);

        let mut events: Vec<Event> = handlers.events.keys().copied().collect();
        events.sort();

        ServiceInstance {
            id: self.config.id.clone(),
            kind: Kind::Node,
            name: self.config.name.clone(),
            alias: self.config.name.clone(),
            state: State::Work,
            endpoint,
            routes,
            events,
        }
    }
}

/// A logic-tier process.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            locator: None,
            registry: None,
            transporter: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn proxy(&self) -> NodeProxy {
        NodeProxy::new(Arc::clone(&self.inner))
    }

    /// Register the handler for `route`, replacing any previous one.
    ///
    /// Requests for a stateful route are only accepted on the node holding
    /// the user's affinity.
    pub async fn add_route_handler<F, Fut>(&self, route: i32, stateful: bool, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: RouteHandler = Arc::new(move |req| handler(req).boxed());
        self.inner
            .handlers
            .write()
            .await
            .routes
            .insert(route, RouteEntry { stateful, handler });
    }

    /// Handler for requests whose route has no handler of its own.
    pub async fn set_default_route_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: RouteHandler = Arc::new(move |req| handler(req).boxed());
        self.inner.handlers.write().await.default = Some(handler);
    }

    pub async fn add_event_listener<F, Fut>(&self, event: Event, handler: F)
    where
        F: Fn(EventArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |args| handler(args).boxed());
        self.inner.handlers.write().await.events.insert(event, handler);
    }

    /// Expose `provider` to [`NodeProxy::invoke`] callers. Returns the
    /// service name.
    pub async fn register_service<P: ServiceProvider>(&self, provider: P) -> Result<String, NodeError> {
        Ok(self.inner.services.write().await.register(provider)?)
    }

    /// The instance published to the registry, once started.
    pub async fn instance(&self) -> Option<ServiceInstance> {
        self.inner.instance.lock().await.clone()
    }

    /// Start dispatching, serve RPC, publish this node and follow the gate
    /// and node tiers.
    pub async fn start(&self) -> Result<(), NodeError> {
        let inner = &self.inner;
        let (events, requests) = inner
            .receivers
            .lock()
            .await
            .take()
            .ok_or(NodeError::AlreadyStarted)?;

        tokio::spawn(dispatch::run(Arc::clone(inner), events, requests));

        let provider = Arc::new(provider::NodeService::new(Arc::clone(inner)));
        let rpc = inner.transporter.new_node_server(provider);
        rpc.start().await?;
        let endpoint = rpc.endpoint()?;
        info!(nid = %inner.config.id, addr = %rpc.addr(), protocol = rpc.scheme(), "Node RPC server listening");
        *inner.rpc.lock().await = Some(rpc);

        let instance = inner.build_instance(endpoint.to_string()).await;
        inner.registry.register(&instance).await?;
        *inner.instance.lock().await = Some(instance);

        watch_services(
            inner.registry.as_ref(),
            Kind::Gate,
            Arc::clone(&inner.gates),
            inner.cancel.clone(),
        )
        .await?;
        watch_services(
            inner.registry.as_ref(),
            Kind::Node,
            Arc::clone(&inner.nodes),
            inner.cancel.clone(),
        )
        .await?;

        debug!(nid = %inner.config.id, name = %inner.config.name, endpoint = %endpoint, "Node server startup successful");
        Ok(())
    }

    /// Withdraw from the registry, stop serving RPC and stop dispatching.
    pub async fn stop(&self) -> Result<(), NodeError> {
        let inner = &self.inner;

        if let Some(instance) = inner.instance.lock().await.take() {
            if let Err(e) = inner.registry.deregister(&instance).await {
                error!(nid = %inner.config.id, error = %e, "Failed to deregister node");
            }
        }

        if let Some(rpc) = inner.rpc.lock().await.take() {
            if let Err(e) = rpc.stop().await {
                error!(nid = %inner.config.id, error = %e, "Failed to stop node RPC server");
            }
        }

        inner.cancel.cancel();
        info!(nid = %inner.config.id, "Node stopped");
        Ok(())
    }
}

#[async_trait]
impl Component for Node {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(Node::start(self).await?)
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(self.stop().await?)
    }
}

pub struct NodeBuilder {
    config: NodeConfig,
    locator: Option<Arc<dyn Locator>>,
    registry: Option<Arc<dyn Registry>>,
    transporter: Option<Arc<dyn Transporter>>,
}

impl NodeBuilder {
    pub fn locator(mut self, locator: Arc<dyn Locator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn transporter(mut self, transporter: Arc<dyn Transporter>) -> Self {
        self.transporter = Some(transporter);
        self
    }

    pub fn build(self) -> Result<Node, ConfigError> {
        if self.config.id.is_empty() {
            return Err(ConfigError::Missing("node id"));
        }
        let locator = self.locator.ok_or(ConfigError::Missing("locator"))?;
        let registry = self.registry.ok_or(ConfigError::Missing("registry"))?;
        let transporter = self.transporter.ok_or(ConfigError::Missing("transporter"))?;

        let capacity = self.config.channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (request_tx, request_rx) = mpsc::channel(capacity);

        Ok(Node {
            inner: Arc::new(NodeInner {
                config: self.config,
                handlers: RwLock::new(Handlers::default()),
                services: RwLock::new(ServiceManager::new()),
                event_tx,
                request_tx,
                receivers: Mutex::new(Some((event_rx, request_rx))),
                gates: Arc::new(Router::new()),
                nodes: Arc::new(Router::new()),
                locator,
                registry,
                transporter,
                rpc: Mutex::new(None),
                instance: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        })
    }
}
