//! Inbound side of the TCP transport.
//!
//! Accepts connections from peers and dispatches each `RpcMessage` to the
//! gate or node provider this server was built for.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rpc::{Envelope, Reply, RpcMessage};
use crate::registry::{advertise_address, Endpoint};
use crate::service::CallContext;
use crate::transport::{Code, GateProvider, NodeProvider, ProviderError, Server, TransportError};

pub(super) const SCHEME: &str = "tcp";

/// Provider served by one RPC server.
#[derive(Clone)]
pub(super) enum Service {
    Gate(Arc<dyn GateProvider>),
    Node(Arc<dyn NodeProvider>),
}

pub struct TcpRpcServer {
    addr: String,
    advertise_host: Option<String>,
    local_addr: OnceLock<SocketAddr>,
    max_frame_length: usize,
    service: Service,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl TcpRpcServer {
    pub(super) fn new(
        addr: String,
        advertise_host: Option<String>,
        max_frame_length: usize,
        service: Service,
    ) -> Self {
        Self {
            addr,
            advertise_host,
            local_addr: OnceLock::new(),
            max_frame_length,
            service,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Server for TcpRpcServer {
    fn addr(&self) -> String {
        self.local_addr
            .get()
            .map(ToString::to_string)
            .unwrap_or_else(|| self.addr.clone())
    }

    fn scheme(&self) -> &'static str {
        SCHEME
    }

    fn endpoint(&self) -> Result<Endpoint, TransportError> {
        let bound = self.local_addr.get().ok_or(TransportError::NotStarted)?;
        Ok(Endpoint::new(
            SCHEME,
            advertise_address(*bound, self.advertise_host.as_deref()),
        ))
    }

    async fn start(&self) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        let listener = match TcpListener::bind(&self.addr).await {
            Ok(l) => l,
            Err(e) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let bound = listener.local_addr()?;
        let _ = self.local_addr.set(bound);
        info!(addr = %bound, "RPC TCP server listening");

        let service = self.service.clone();
        let shutdown = self.shutdown.clone();
        let max_frame_length = self.max_frame_length;

        tokio::spawn(async move {
            loop {
                let (stream, peer_addr) = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept RPC connection");
                            continue;
                        }
                    },
                };

                debug!(peer = %peer_addr, "Accepted RPC connection");
                let service = service.clone();
                let shutdown = shutdown.clone();

                tokio::spawn(async move {
                    if let Err(e) =
                        handle_connection(service, stream, max_frame_length, shutdown).await
                    {
                        debug!(peer = %peer_addr, error = %e, "RPC connection closed");
                    }
                });
            }

            debug!("RPC accept loop exiting");
        });

        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        self.shutdown.cancel();
        Ok(())
    }
}

/// Handle a single peer connection. Requests are served concurrently and
/// each reply is written as soon as it is ready, tagged with its request id.
async fn handle_connection(
    service: Service,
    stream: TcpStream,
    max_frame_length: usize,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;

    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec();

    let (mut sink, mut stream) = Framed::new(stream, codec).split::<Bytes>();
    let mut in_flight: FuturesUnordered<BoxFuture<'static, Option<Bytes>>> =
        FuturesUnordered::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(reply) = in_flight.next(), if !in_flight.is_empty() => {
                if let Some(reply) = reply {
                    sink.send(reply).await?;
                }
            }
            frame = stream.next() => match frame {
                Some(frame) => in_flight.push(serve(service.clone(), frame?).boxed()),
                None => break,
            },
        }
    }

    Ok(())
}

/// Decode one request, run it against the provider and encode the reply.
/// A frame that does not decode carries no usable id and gets no reply.
async fn serve(service: Service, frame: BytesMut) -> Option<Bytes> {
    let Envelope { id, message } = match rmp_serde::from_slice::<Envelope>(&frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "Malformed RPC request");
            return None;
        }
    };

    let reply = RpcMessage::Reply(dispatch(&service, message).await);
    match rmp_serde::to_vec(&Envelope { id, message: reply }) {
        Ok(payload) => Some(Bytes::from(payload)),
        Err(e) => {
            warn!(id, error = %e, "Failed to encode RPC reply");
            None
        }
    }
}

fn ack(result: Result<(), ProviderError>) -> Reply {
    match result {
        Ok(()) => Reply::Ack,
        Err(e) => Reply::Failure(e),
    }
}

fn unsupported(service: &str) -> Reply {
    Reply::Failure(ProviderError::new(
        Code::NotFoundMethod,
        format!("request not served by {service} server"),
    ))
}

/// Route an `RpcMessage` to the provider and wrap the result into a reply.
async fn dispatch(service: &Service, msg: RpcMessage) -> Reply {
    match (service, msg) {
        (Service::Gate(gate), RpcMessage::BindRequest(req)) => ack(gate.bind(req.cid, req.uid).await),
        (Service::Gate(gate), RpcMessage::UnbindRequest(req)) => ack(gate.unbind(req.uid).await),
        (Service::Gate(gate), RpcMessage::PushRequest(req)) => {
            ack(gate.push(req.target, req.message).await)
        }
        (Service::Gate(gate), RpcMessage::BroadcastRequest(req)) => {
            match gate.broadcast(req.message).await {
                Ok(total) => Reply::Total(total),
                Err(e) => Reply::Failure(e),
            }
        }
        (Service::Gate(gate), RpcMessage::DisconnectRequest(req)) => {
            ack(gate.disconnect(req.target, req.force).await)
        }
        (Service::Node(node), RpcMessage::DeliverRequest(args)) => ack(node.deliver(args).await),
        (Service::Node(node), RpcMessage::TriggerRequest(args)) => ack(node.trigger(args).await),
        (Service::Node(node), RpcMessage::InvokeRequest(req)) => {
            let mut ctx = match req.timeout_ms {
                Some(ms) => CallContext::with_timeout(Duration::from_millis(ms)),
                None => CallContext::default(),
            };
            ctx.caller = req.caller;

            match node.invoke(ctx, &req.service, &req.method, req.args).await {
                Ok(reply) => Reply::Invoked(reply),
                Err(e) => Reply::Failure(e),
            }
        }
        (Service::Gate(_), other) => {
            warn!(?other, "Unexpected message type received by gate server");
            unsupported("gate")
        }
        (Service::Node(_), other) => {
            warn!(?other, "Unexpected message type received by node server");
            unsupported("node")
        }
    }
}
