//! Length-delimited TCP client transport.
//!
//! Every frame is a 4-byte big-endian length followed by the frame body.
//! Each connection is served by one reader and one writer task; the writer
//! owns a bounded queue fed by [`Conn::send`](super::Conn::send) and
//! [`Conn::push`](super::Conn::push).

mod conn;

pub use conn::TcpConn;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Handler, NetworkError, Server};
use crate::config::NetworkConfig;

#[derive(Debug, Clone)]
pub struct TcpServerOptions {
    pub addr: String,
    pub max_conn_num: usize,
    pub max_msg_length: usize,
    /// Capacity of each connection's write queue
    pub write_queue_size: usize,
}

impl Default for TcpServerOptions {
    fn default() -> Self {
        Self::from(&NetworkConfig::default())
    }
}

impl From<&NetworkConfig> for TcpServerOptions {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            addr: config.bind_address.clone(),
            max_conn_num: config.max_conn_num,
            max_msg_length: config.max_msg_length,
            write_queue_size: 1024,
        }
    }
}

/// State shared between the accept loop and the connection tasks.
pub(super) struct Shared {
    conns: RwLock<HashMap<i64, Arc<TcpConn>>>,
    next_id: AtomicI64,
    opts: TcpServerOptions,
}

impl Shared {
    async fn remove(&self, id: i64) {
        self.conns.write().await.remove(&id);
    }
}

pub struct TcpServer {
    local_addr: OnceLock<SocketAddr>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl TcpServer {
    pub fn new(opts: TcpServerOptions) -> Self {
        Self {
            local_addr: OnceLock::new(),
            shared: Arc::new(Shared {
                conns: RwLock::new(HashMap::new()),
                next_id: AtomicI64::new(1),
                opts,
            }),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Number of live connections.
    pub async fn conn_count(&self) -> usize {
        self.shared.conns.read().await.len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }
}

#[async_trait]
impl Server for TcpServer {
    fn addr(&self) -> String {
        self.local_addr
            .get()
            .map(ToString::to_string)
            .unwrap_or_else(|| self.shared.opts.addr.clone())
    }

    fn protocol(&self) -> &'static str {
        "tcp"
    }

    async fn start(&self, handler: Arc<dyn Handler>) -> Result<(), NetworkError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NetworkError::AlreadyStarted);
        }

        let listener = match TcpListener::bind(&self.shared.opts.addr).await {
            Ok(l) => l,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let addr = listener.local_addr()?;
        let _ = self.local_addr.set(addr);
        info!(addr = %addr, "Client TCP server listening");

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.shared),
            handler,
            self.shutdown.clone(),
        ));

        Ok(())
    }

    async fn stop(&self) -> Result<(), NetworkError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(NetworkError::NotStarted);
        }

        self.shutdown.cancel();

        let conns: Vec<Arc<TcpConn>> = self.shared.conns.read().await.values().cloned().collect();
        for conn in conns {
            let _ = super::Conn::close(conn.as_ref(), true);
        }

        Ok(())
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept client connection");
                    continue;
                }
            },
        };

        let mut conns = shared.conns.write().await;
        if conns.len() >= shared.opts.max_conn_num {
            warn!(
                peer = %peer_addr,
                max_conn_num = shared.opts.max_conn_num,
                "Connection limit reached, rejecting client"
            );
            continue;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (conn, io) = TcpConn::new(id, stream, &shared.opts);
        conns.insert(id, Arc::clone(&conn));
        drop(conns);

        debug!(cid = id, peer = %peer_addr, "Accepted client connection");
        tokio::spawn(conn::run(conn, io, Arc::clone(&handler), Arc::clone(&shared)));
    }

    debug!("Client accept loop exiting");
}
