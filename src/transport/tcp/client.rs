//! Outbound side of the TCP transport.
//!
//! Each peer gets one connection driven by a writer task and a reader task.
//! Callers tag their request with an id, hand the frame to the writer via an
//! mpsc channel and await the matching reply via oneshot, so any number of
//! requests can be in flight to one peer and no lock is held during the
//! network round-trip.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::rpc::{
    BindRequest, BroadcastRequest, DisconnectRequest, Envelope, InvokeRequest, PushRequest, Reply,
    RpcMessage, UnbindRequest,
};
use crate::packet::Message;
use crate::service::CallContext;
use crate::transport::{
    DeliverArgs, GateClient, NodeClient, Target, TransportError, TriggerArgs,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// A framed TCP connection to a peer
type PeerConnection = Framed<TcpStream, LengthDelimitedCodec>;
type PeerSink = SplitSink<PeerConnection, Bytes>;
type PeerStream = SplitStream<PeerConnection>;

/// Callers waiting for a reply, keyed by request id
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcMessage>>>>;

/// A live connection to one peer.
struct PeerLink {
    tx: mpsc::Sender<Bytes>,
    pending: Pending,
    next_id: AtomicU64,
    /// Cancelled once either task exits; the link is then replaced
    closed: CancellationToken,
}

impl PeerLink {
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled()
    }
}

/// Outbound connections to RPC peers, keyed by address.
pub(crate) struct PeerPool {
    peers: RwLock<HashMap<String, Arc<PeerLink>>>,
    /// Upper bound on one request/reply exchange, connecting included
    io_timeout: Duration,
    max_frame_length: usize,
}

impl PeerPool {
    pub(crate) fn new(io_timeout: Duration, max_frame_length: usize) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            io_timeout,
            max_frame_length,
        })
    }

    /// Send a request to a peer and wait for its reply.
    ///
    /// Connects on first contact. A request is written at most once; a
    /// connection lost before the reply arrives fails the call.
    pub(crate) async fn call(&self, addr: &str, message: RpcMessage) -> Result<Reply, TransportError> {
        let deadline = Instant::now() + self.io_timeout;

        let link = tokio::time::timeout_at(deadline, self.get_or_connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let id = link.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = Bytes::from(rmp_serde::to_vec(&Envelope { id, message })?);

        let (reply_tx, reply_rx) = oneshot::channel();
        link.pending.lock().await.insert(id, reply_tx);

        let exchange = async {
            link.tx
                .send(payload)
                .await
                .map_err(|_| TransportError::ConnectionClosed)?;
            reply_rx.await.map_err(|_| TransportError::ConnectionClosed)
        };

        let response = match tokio::time::timeout_at(deadline, exchange).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                link.pending.lock().await.remove(&id);
                return Err(e);
            }
            Err(_) => {
                link.pending.lock().await.remove(&id);
                return Err(TransportError::Timeout);
            }
        };

        match response {
            RpcMessage::Reply(Reply::Failure(e)) => Err(TransportError::Remote(e)),
            RpcMessage::Reply(reply) => Ok(reply),
            _ => Err(TransportError::UnexpectedReply),
        }
    }

    async fn get_or_connect(&self, addr: &str) -> Result<Arc<PeerLink>, TransportError> {
        // Fast path: peer already connected (read lock only)
        {
            let peers = self.peers.read().await;
            if let Some(link) = peers.get(addr) {
                if link.is_open() {
                    return Ok(Arc::clone(link));
                }
            }
        }

        // Connect outside the lock so other peers are not held up.
        let conn = connect(addr, self.max_frame_length).await?;

        let mut peers = self.peers.write().await;

        // Double-check after acquiring write lock
        if let Some(link) = peers.get(addr) {
            if link.is_open() {
                return Ok(Arc::clone(link));
            }
        }

        let link = spawn_peer_tasks(addr.to_string(), conn);
        peers.insert(addr.to_string(), Arc::clone(&link));
        Ok(link)
    }
}

impl std::fmt::Debug for PeerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerPool")
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

/// Split a fresh connection into a writer task fed by the link's channel
/// and a reader task that routes replies to waiting callers.
fn spawn_peer_tasks(addr: String, conn: PeerConnection) -> Arc<PeerLink> {
    let (sink, stream) = conn.split::<Bytes>();
    let (tx, rx) = mpsc::channel::<Bytes>(256);

    let link = Arc::new(PeerLink {
        tx,
        pending: Arc::new(Mutex::new(HashMap::new())),
        next_id: AtomicU64::new(1),
        closed: CancellationToken::new(),
    });

    tokio::spawn(write_loop(addr.clone(), sink, rx, link.closed.clone()));
    tokio::spawn(read_loop(
        addr,
        stream,
        Arc::clone(&link.pending),
        link.closed.clone(),
    ));

    link
}

async fn write_loop(
    addr: String,
    mut sink: PeerSink,
    mut rx: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            _ = closed.cancelled() => break,
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        if let Err(e) = sink.send(payload).await {
            debug!(peer = %addr, error = %e, "Peer write failed");
            break;
        }
    }

    closed.cancel();
    debug!(peer = %addr, "Peer writer exiting");
}

async fn read_loop(addr: String, mut stream: PeerStream, pending: Pending, closed: CancellationToken) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = stream.next() => frame,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(peer = %addr, error = %e, "Peer read failed");
                break;
            }
            None => break,
        };

        match rmp_serde::from_slice::<Envelope>(&frame) {
            Ok(Envelope { id, message }) => match pending.lock().await.remove(&id) {
                Some(reply_tx) => {
                    let _ = reply_tx.send(message);
                }
                None => debug!(peer = %addr, id, "Reply for an abandoned request"),
            },
            Err(e) => warn!(peer = %addr, error = %e, "Malformed RPC reply"),
        }
    }

    closed.cancel();
    // Dropping the senders fails every caller still waiting on this link.
    pending.lock().await.clear();
    debug!(peer = %addr, "Peer reader exiting");
}

/// Create a new framed TCP connection to a peer
async fn connect(addr: &str, max_frame_length: usize) -> Result<PeerConnection, TransportError> {
    debug!(peer = %addr, "Connecting to peer");
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(TransportError::Connect)?;
    stream.set_nodelay(true).map_err(TransportError::Connect)?;

    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec();

    Ok(Framed::new(stream, codec))
}

fn expect_ack(reply: Reply) -> Result<(), TransportError> {
    match reply {
        Reply::Ack => Ok(()),
        _ => Err(TransportError::UnexpectedReply),
    }
}

/// Client for a gate's RPC server.
pub struct TcpGateClient {
    addr: String,
    pool: Arc<PeerPool>,
}

impl TcpGateClient {
    pub(crate) fn new(pool: Arc<PeerPool>, addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            pool,
        }
    }
}

#[async_trait]
impl GateClient for TcpGateClient {
    async fn bind(&self, cid: i64, uid: i64) -> Result<(), TransportError> {
        let reply = self
            .pool
            .call(&self.addr, RpcMessage::BindRequest(BindRequest { cid, uid }))
            .await?;
        expect_ack(reply)
    }

    async fn unbind(&self, uid: i64) -> Result<(), TransportError> {
        let reply = self
            .pool
            .call(&self.addr, RpcMessage::UnbindRequest(UnbindRequest { uid }))
            .await?;
        expect_ack(reply)
    }

    async fn push(&self, target: Target, message: Message) -> Result<(), TransportError> {
        let reply = self
            .pool
            .call(
                &self.addr,
                RpcMessage::PushRequest(PushRequest { message, target }),
            )
            .await?;
        expect_ack(reply)
    }

    async fn broadcast(&self, message: Message) -> Result<u64, TransportError> {
        match self
            .pool
            .call(
                &self.addr,
                RpcMessage::BroadcastRequest(BroadcastRequest { message }),
            )
            .await?
        {
            Reply::Total(total) => Ok(total),
            _ => Err(TransportError::UnexpectedReply),
        }
    }

    async fn disconnect(&self, target: Target, force: bool) -> Result<(), TransportError> {
        let reply = self
            .pool
            .call(
                &self.addr,
                RpcMessage::DisconnectRequest(DisconnectRequest { force, target }),
            )
            .await?;
        expect_ack(reply)
    }
}

/// Client for a node's RPC server.
pub struct TcpNodeClient {
    addr: String,
    pool: Arc<PeerPool>,
}

impl TcpNodeClient {
    pub(crate) fn new(pool: Arc<PeerPool>, addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            pool,
        }
    }
}

#[async_trait]
impl NodeClient for TcpNodeClient {
    async fn deliver(&self, args: DeliverArgs) -> Result<(), TransportError> {
        let reply = self
            .pool
            .call(&self.addr, RpcMessage::DeliverRequest(args))
            .await?;
        expect_ack(reply)
    }

    async fn trigger(&self, args: TriggerArgs) -> Result<(), TransportError> {
        let reply = self
            .pool
            .call(&self.addr, RpcMessage::TriggerRequest(args))
            .await?;
        expect_ack(reply)
    }

    async fn invoke(
        &self,
        ctx: CallContext,
        service: &str,
        method: &str,
        args: Bytes,
    ) -> Result<Bytes, TransportError> {
        let timeout_ms = ctx.deadline.map(|deadline| {
            deadline
                .saturating_duration_since(Instant::now())
                .as_millis() as u64
        });

        let request = InvokeRequest {
            args,
            caller: ctx.caller,
            method: method.to_string(),
            service: service.to_string(),
            timeout_ms,
        };

        match self
            .pool
            .call(&self.addr, RpcMessage::InvokeRequest(request))
            .await?
        {
            Reply::Invoked(reply) => Ok(reply),
            _ => Err(TransportError::UnexpectedReply),
        }
    }
}
