//! Edge tier.
//!
//! A [`Gate`] owns the client listener and a [`SessionGroup`]. Client frames
//! are forwarded to the node tier; node-initiated pushes arrive through the
//! gate's RPC server and are written to the addressed session.

mod provider;
mod proxy;

use proxy::GateProxy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{watch_services, Event, Kind, State};
use crate::config::{ConfigError, GateConfig};
use crate::container::Component;
use crate::locate::Locator;
use crate::network::{self, Conn, Handler, NetworkError};
use crate::packet;
use crate::registry::{Registry, RegistryError, ServiceInstance};
use crate::router::Router;
use crate::session::{SessionGroup, SessionKey};
use crate::transport::{self, TransportError, Transporter};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("gate is already started")]
    AlreadyStarted,
}

pub(crate) struct GateInner {
    config: GateConfig,
    group: SessionGroup,
    proxy: GateProxy,
    nodes: Arc<Router>,
    registry: Arc<dyn Registry>,
    transporter: Arc<dyn Transporter>,
    server: Arc<dyn network::Server>,
    rpc: Mutex<Option<Box<dyn transport::Server>>>,
    instance: Mutex<Option<ServiceInstance>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

#[async_trait]
impl Handler for GateInner {
    async fn on_connect(&self, conn: Arc<dyn Conn>) {
        let session = self.group.add_session(conn).await;
        let cid = session.cid();
        debug!(gid = %self.config.id, cid, "Client connected");

        if let Err(e) = self.proxy.trigger(Event::Connect, cid, 0).await {
            warn!(gid = %self.config.id, cid, error = %e, "Trigger connect event failed");
        }
    }

    async fn on_disconnect(&self, conn: Arc<dyn Conn>) {
        let cid = conn.id();
        let session = match self.group.remove_session(SessionKey::Conn, cid).await {
            Ok(session) => session,
            Err(e) => {
                error!(gid = %self.config.id, cid, error = %e, "Remove session failed");
                return;
            }
        };

        let uid = session.uid();
        debug!(gid = %self.config.id, cid, uid, "Client disconnected");

        if uid > 0 {
            if let Err(e) = self.proxy.unbind_gate(uid).await {
                warn!(gid = %self.config.id, uid, error = %e, "Unbind gate failed");
            }
            if let Err(e) = self.proxy.trigger(Event::Disconnect, cid, uid).await {
                warn!(gid = %self.config.id, cid, uid, error = %e, "Trigger disconnect event failed");
            }
        }

        self.group.recycle(session).await;
    }

    async fn on_receive(&self, conn: Arc<dyn Conn>, data: Bytes) {
        let cid = conn.id();
        let message = match packet::unpack(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!(gid = %self.config.id, cid, error = %e, "Unpack message failed");
                return;
            }
        };

        let route = message.route;
        if let Err(e) = self.proxy.deliver(cid, conn.uid(), message).await {
            warn!(gid = %self.config.id, cid, route, error = %e, "Deliver message failed");
        }
    }
}

/// An edge-tier process.
#[derive(Clone)]
pub struct Gate {
    inner: Arc<GateInner>,
}

impl Gate {
    pub fn builder(config: GateConfig) -> GateBuilder {
        GateBuilder {
            config,
            server: None,
            locator: None,
            registry: None,
            transporter: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn sessions(&self) -> &SessionGroup {
        &self.inner.group
    }

    /// The instance published to the registry, once started.
    pub async fn instance(&self) -> Option<ServiceInstance> {
        self.inner.instance.lock().await.clone()
    }

    /// Serve RPC, publish this gate, follow the node tier, then open the
    /// client listener.
    pub async fn start(&self) -> Result<(), GateError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(GateError::AlreadyStarted);
        }

        let provider = Arc::new(provider::GateService::new(Arc::clone(inner)));
        let rpc = inner.transporter.new_gate_server(provider);
        rpc.start().await?;
        let endpoint = rpc.endpoint()?;
        info!(gid = %inner.config.id, addr = %rpc.addr(), protocol = rpc.scheme(), "Gate RPC server listening");
        *inner.rpc.lock().await = Some(rpc);

        let instance = ServiceInstance {
            id: inner.config.id.clone(),
            kind: Kind::Gate,
            name: inner.config.name.clone(),
            alias: inner.config.name.clone(),
            state: State::Work,
            endpoint: endpoint.to_string(),
            routes: Vec::new(),
            events: Vec::new(),
        };
        inner.registry.register(&instance).await?;
        *inner.instance.lock().await = Some(instance);

        watch_services(
            inner.registry.as_ref(),
            Kind::Node,
            Arc::clone(&inner.nodes),
            inner.cancel.clone(),
        )
        .await?;

        let handler: Arc<dyn Handler> = Arc::clone(inner) as Arc<dyn Handler>;
        inner.server.start(handler).await?;

        debug!(
            gid = %inner.config.id,
            name = %inner.config.name,
            addr = %inner.server.addr(),
            protocol = inner.server.protocol(),
            "Gate server startup successful"
        );
        Ok(())
    }

    /// Close the client listener, withdraw from the registry and stop
    /// serving RPC.
    pub async fn stop(&self) -> Result<(), GateError> {
        let inner = &self.inner;

        if let Err(e) = inner.server.stop().await {
            error!(gid = %inner.config.id, error = %e, "Failed to stop client server");
        }

        if let Some(instance) = inner.instance.lock().await.take() {
            if let Err(e) = inner.registry.deregister(&instance).await {
                error!(gid = %inner.config.id, error = %e, "Failed to deregister gate");
            }
        }

        if let Some(rpc) = inner.rpc.lock().await.take() {
            if let Err(e) = rpc.stop().await {
                error!(gid = %inner.config.id, error = %e, "Failed to stop gate RPC server");
            }
        }

        inner.cancel.cancel();
        info!(gid = %inner.config.id, "Gate stopped");
        Ok(())
    }
}

#[async_trait]
impl Component for Gate {
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    async fn start(&self) -> anyhow::Result<()> {
        Ok(Gate::start(self).await?)
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        Ok(self.stop().await?)
    }
}

pub struct GateBuilder {
    config: GateConfig,
    server: Option<Arc<dyn network::Server>>,
    locator: Option<Arc<dyn Locator>>,
    registry: Option<Arc<dyn Registry>>,
    transporter: Option<Arc<dyn Transporter>>,
}

impl GateBuilder {
    /// Client-facing listener.
    pub fn server(mut self, server: Arc<dyn network::Server>) -> Self {
        self.server = Some(server);
        self
    }

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

    pub fn build(self) -> Result<Gate, ConfigError> {
        if self.config.id.is_empty() {
            return Err(ConfigError::Missing("gate id"));
        }
        let server = self.server.ok_or(ConfigError::Missing("server"))?;
        let locator = self.locator.ok_or(ConfigError::Missing("locator"))?;
        let registry = self.registry.ok_or(ConfigError::Missing("registry"))?;
        let transporter = self.transporter.ok_or(ConfigError::Missing("transporter"))?;

        let nodes = Arc::new(Router::new());
        let proxy = GateProxy::new(
            self.config.id.clone(),
            self.config.timeout,
            Arc::clone(&nodes),
            locator,
            Arc::clone(&transporter),
        );

        Ok(Gate {
            inner: Arc::new(GateInner {
                config: self.config,
                group: SessionGroup::new(),
                proxy,
                nodes,
                registry,
                transporter,
                server,
                rpc: Mutex::new(None),
                instance: Mutex::new(None),
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::locate::MemoryLocator;
    use crate::network::{ConnState, TcpServer, TcpServerOptions};
    use crate::packet::Message;
    use crate::registry::MemoryRegistry;
    use crate::session::SessionError;
    use crate::testutil::MockConn;
    use crate::transport::{Code, GateProvider, Target, TcpTransporter, TcpTransporterOptions};

    struct Fixture {
        gate: Gate,
        locator: Arc<MemoryLocator>,
        provider: provider::GateService,
    }

    fn fixture() -> Fixture {
        let locator = Arc::new(MemoryLocator::new());
        let transporter = Arc::new(TcpTransporter::new(TcpTransporterOptions {
            addr: "127.0.0.1:0".to_string(),
            io_timeout: Duration::from_millis(500),
            ..Default::default()
        }));

        let gate = Gate::builder(GateConfig {
            id: "g1".to_string(),
            timeout: Duration::from_secs(1),
            ..Default::default()
        })
        .server(Arc::new(TcpServer::new(TcpServerOptions {
            addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        })))
        .locator(locator.clone())
        .registry(Arc::new(MemoryRegistry::new()))
        .transporter(transporter)
        .build()
        .unwrap();

        let provider = provider::GateService::new(Arc::clone(&gate.inner));
        Fixture {
            gate,
            locator,
            provider,
        }
    }

    async fn connect(f: &Fixture, id: i64) -> Arc<MockConn> {
        let conn = MockConn::new(id);
        f.gate.inner.on_connect(conn.clone()).await;
        conn
    }

    #[test]
    fn test_build_requires_server() {
        let err = Gate::builder(GateConfig::default())
            .locator(Arc::new(MemoryLocator::new()))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Missing("server")));
    }

    #[tokio::test]
    async fn test_bind_records_affinity() {
        let f = fixture();
        connect(&f, 1).await;
        connect(&f, 2).await;

        f.provider.bind(1, 100).await.unwrap();
        assert_eq!(f.locator.locate_gate(100).await.unwrap().as_deref(), Some("g1"));
        assert_eq!(
            f.gate.sessions().session(SessionKey::User, 100).await.unwrap().cid(),
            1
        );

        // Rebinding moves the user; the old connection is released.
        f.provider.bind(2, 100).await.unwrap();
        assert_eq!(
            f.gate.sessions().session(SessionKey::User, 100).await.unwrap().cid(),
            2
        );
        assert_eq!(
            f.gate.sessions().session(SessionKey::Conn, 1).await.unwrap().uid(),
            0
        );

        let err = f.provider.bind(1, 0).await.unwrap_err();
        assert_eq!(err.code, Code::InvalidArgument);

        let err = f.provider.bind(9, 200).await.unwrap_err();
        assert_eq!(err.code, Code::NotFoundSession);
        assert_eq!(f.locator.locate_gate(200).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unbind_is_idempotent() {
        let f = fixture();
        connect(&f, 1).await;
        f.provider.bind(1, 100).await.unwrap();

        f.provider.unbind(100).await.unwrap();
        f.provider.unbind(100).await.unwrap();
        f.provider.unbind(555).await.unwrap();

        assert_eq!(f.locator.locate_gate(100).await.unwrap(), None);
        assert!(matches!(
            f.gate.sessions().session(SessionKey::User, 100).await,
            Err(SessionError::NotFound { .. })
        ));
        assert_eq!(f.gate.sessions().count().await, 1);
    }

    #[tokio::test]
    async fn test_push_and_broadcast() {
        let f = fixture();
        let c1 = connect(&f, 1).await;
        let c2 = connect(&f, 2).await;
        f.provider.bind(2, 100).await.unwrap();

        let message = Message::new(7, 3, &b"hi"[..]);
        f.provider
            .push(Target::Conn(1), message.clone())
            .await
            .unwrap();
        f.provider
            .push(Target::User(100), message.clone())
            .await
            .unwrap();

        let err = f
            .provider
            .push(Target::User(404), message.clone())
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::NotFoundSession);

        assert_eq!(f.provider.broadcast(message.clone()).await.unwrap(), 2);

        let sent = c1.sent().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(packet::unpack(&sent[0]).unwrap(), message);
        assert_eq!(c2.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_target() {
        let f = fixture();
        let c1 = connect(&f, 1).await;
        let c2 = connect(&f, 2).await;
        f.provider.bind(2, 100).await.unwrap();

        f.provider.disconnect(Target::Conn(1), true).await.unwrap();
        f.provider
            .disconnect(Target::User(100), false)
            .await
            .unwrap();

        assert_eq!(c1.state(), ConnState::Closed);
        assert_eq!(c2.state(), ConnState::Hanged);
    }

    #[tokio::test]
    async fn test_bad_frame_keeps_connection() {
        let f = fixture();
        let conn = connect(&f, 1).await;

        // Too short to carry a header.
        f.gate
            .inner
            .on_receive(conn.clone(), Bytes::from_static(b"abc"))
            .await;
        // Well-formed, but no node serves the route.
        f.gate
            .inner
            .on_receive(conn.clone(), packet::pack(&Message::new(42, 1, &b""[..])))
            .await;

        assert_eq!(conn.state(), ConnState::Opened);
        assert_eq!(f.gate.sessions().count().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_releases_and_recycles() {
        let f = fixture();
        let conn = connect(&f, 1).await;
        f.provider.bind(1, 100).await.unwrap();

        f.gate.inner.on_disconnect(conn.clone()).await;

        assert_eq!(f.locator.locate_gate(100).await.unwrap(), None);
        assert_eq!(f.gate.sessions().count().await, 0);
        assert_eq!(f.gate.sessions().pooled().await, 1);

        // A second notification for the same connection is harmless.
        f.gate.inner.on_disconnect(conn).await;
        assert_eq!(f.gate.sessions().pooled().await, 1);
    }

    #[tokio::test]
    async fn test_start_publishes_gate() {
        let f = fixture();
        f.gate.start().await.unwrap();

        let instance = f.gate.instance().await.unwrap();
        assert_eq!(instance.kind, Kind::Gate);
        assert!(instance.endpoint.starts_with("tcp://"));
        assert!(matches!(f.gate.start().await, Err(GateError::AlreadyStarted)));

        f.gate.stop().await.unwrap();
        assert!(f.gate.instance().await.is_none());
    }
}
