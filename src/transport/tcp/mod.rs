//! Length-delimited TCP transport with MessagePack envelopes.

mod client;
mod rpc;
mod server;

pub use client::{TcpGateClient, TcpNodeClient};
pub use server::TcpRpcServer;

use std::sync::Arc;
use std::time::Duration;

use client::PeerPool;
use server::{Service, SCHEME};

use super::{
    GateClient, GateProvider, NodeClient, NodeProvider, Server, TransportError, Transporter,
};
use crate::registry::Endpoint;

#[derive(Debug, Clone)]
pub struct TcpTransporterOptions {
    /// Address RPC servers bind to
    pub addr: String,
    /// Host advertised when `addr` has an unspecified host
    pub advertise_host: Option<String>,
    /// Bound on one request/reply exchange on a peer connection
    pub io_timeout: Duration,
    pub max_frame_length: usize,
}

impl Default for TcpTransporterOptions {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:0".to_string(),
            advertise_host: None,
            io_timeout: Duration::from_secs(10),
            max_frame_length: 64 * 1024 * 1024,
        }
    }
}

/// Builds TCP RPC servers and clients. Clients built by one transporter
/// share its peer connections.
#[derive(Debug)]
pub struct TcpTransporter {
    opts: TcpTransporterOptions,
    pool: Arc<PeerPool>,
}

impl TcpTransporter {
    pub fn new(opts: TcpTransporterOptions) -> Self {
        let pool = PeerPool::new(opts.io_timeout, opts.max_frame_length);
        Self { opts, pool }
    }

    fn server(&self, service: Service) -> Box<dyn Server> {
        Box::new(TcpRpcServer::new(
            self.opts.addr.clone(),
            self.opts.advertise_host.clone(),
            self.opts.max_frame_length,
            service,
        ))
    }

    fn check_scheme(endpoint: &Endpoint) -> Result<(), TransportError> {
        if endpoint.scheme() != SCHEME {
            return Err(TransportError::UnsupportedScheme(endpoint.scheme().to_string()));
        }
        Ok(())
    }
}

impl Transporter for TcpTransporter {
    fn new_gate_server(&self, provider: Arc<dyn GateProvider>) -> Box<dyn Server> {
        self.server(Service::Gate(provider))
    }

    fn new_node_server(&self, provider: Arc<dyn NodeProvider>) -> Box<dyn Server> {
        self.server(Service::Node(provider))
    }

    fn new_gate_client(&self, endpoint: &Endpoint) -> Result<Arc<dyn GateClient>, TransportError> {
        Self::check_scheme(endpoint)?;
        Ok(Arc::new(TcpGateClient::new(
            Arc::clone(&self.pool),
            endpoint.address(),
        )))
    }

    fn new_node_client(&self, endpoint: &Endpoint) -> Result<Arc<dyn NodeClient>, TransportError> {
        Self::check_scheme(endpoint)?;
        Ok(Arc::new(TcpNodeClient::new(
            Arc::clone(&self.pool),
            endpoint.address(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use tokio::sync::Mutex;
    use tokio_util::codec::{Framed, LengthDelimitedCodec};

    use super::*;
    use crate::cluster::Event;
    use crate::packet::Message;
    use crate::service::CallContext;
    use crate::transport::{Code, DeliverArgs, ProviderError, Target, TriggerArgs};

    #[derive(Default)]
    struct RecordingGate {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GateProvider for RecordingGate {
        async fn bind(&self, cid: i64, uid: i64) -> Result<(), ProviderError> {
            self.calls.lock().await.push(format!("bind {cid} {uid}"));
            Ok(())
        }

        async fn unbind(&self, uid: i64) -> Result<(), ProviderError> {
            self.calls.lock().await.push(format!("unbind {uid}"));
            Ok(())
        }

        async fn push(&self, target: Target, _message: Message) -> Result<(), ProviderError> {
            match target {
                Target::Conn(cid) => {
                    self.calls.lock().await.push(format!("push {cid}"));
                    Ok(())
                }
                Target::User(uid) => Err(ProviderError::new(
                    Code::NotFoundSession,
                    format!("session not found: uid={uid}"),
                )),
            }
        }

        async fn broadcast(&self, _message: Message) -> Result<u64, ProviderError> {
            Ok(3)
        }

        async fn disconnect(&self, _target: Target, _force: bool) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNode {
        delivered: Mutex<Vec<DeliverArgs>>,
        triggered: Mutex<Vec<TriggerArgs>>,
    }

    #[async_trait]
    impl NodeProvider for RecordingNode {
        async fn deliver(&self, args: DeliverArgs) -> Result<(), ProviderError> {
            self.delivered.lock().await.push(args);
            Ok(())
        }

        async fn trigger(&self, args: TriggerArgs) -> Result<(), ProviderError> {
            self.triggered.lock().await.push(args);
            Ok(())
        }

        async fn invoke(
            &self,
            ctx: CallContext,
            service: &str,
            method: &str,
            args: Bytes,
        ) -> Result<Bytes, ProviderError> {
            assert!(ctx.deadline.is_some());
            assert_eq!(ctx.caller.as_deref(), Some("n0"));
            if service != "echo" {
                return Err(ProviderError::new(Code::NotFoundService, service));
            }
            assert_eq!(method, "Echo");
            Ok(args)
        }
    }

    fn transporter() -> TcpTransporter {
        TcpTransporter::new(TcpTransporterOptions {
            addr: "127.0.0.1:0".to_string(),
            io_timeout: Duration::from_secs(2),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_gate_round_trip() {
        let t = transporter();
        let provider = Arc::new(RecordingGate::default());
        let server = t.new_gate_server(provider.clone());
        server.start().await.unwrap();

        let endpoint = server.endpoint().unwrap();
        assert_eq!(endpoint.scheme(), "tcp");
        let client = t.new_gate_client(&endpoint).unwrap();

        client.bind(7, 100).await.unwrap();
        client.unbind(100).await.unwrap();
        client
            .push(Target::Conn(7), Message::new(1, 1, &b"x"[..]))
            .await
            .unwrap();
        assert_eq!(client.broadcast(Message::default()).await.unwrap(), 3);

        let err = client
            .push(Target::User(5), Message::default())
            .await
            .unwrap_err();
        match err {
            TransportError::Remote(e) => assert_eq!(e.code, Code::NotFoundSession),
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(
            *provider.calls.lock().await,
            vec!["bind 7 100", "unbind 100", "push 7"]
        );

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_node_round_trip() {
        let t = transporter();
        let provider = Arc::new(RecordingNode::default());
        let server = t.new_node_server(provider.clone());
        server.start().await.unwrap();
        let client = t.new_node_client(&server.endpoint().unwrap()).unwrap();

        client
            .deliver(DeliverArgs {
                gid: "g1".to_string(),
                nid: "n1".to_string(),
                cid: 7,
                uid: 0,
                message: Message::new(42, 1, &b"hello"[..]),
            })
            .await
            .unwrap();
        client
            .trigger(TriggerArgs {
                event: Event::Disconnect,
                gid: "g1".to_string(),
                cid: 7,
                uid: 100,
            })
            .await
            .unwrap();

        let ctx = CallContext::with_timeout(Duration::from_secs(1)).caller("n0");
        let echoed = client
            .invoke(ctx.clone(), "echo", "Echo", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(&echoed[..], b"abc");

        let err = client
            .invoke(ctx, "missing", "Echo", Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Remote(ref e) if e.code == Code::NotFoundService));

        let delivered = provider.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message.route, 42);
        assert_eq!(provider.triggered.lock().await[0].event, Event::Disconnect);
    }

    #[tokio::test]
    async fn test_wrong_server_kind_is_rejected() {
        let t = transporter();
        let server = t.new_node_server(Arc::new(RecordingNode::default()));
        server.start().await.unwrap();

        // A gate client pointed at a node server.
        let client = t.new_gate_client(&server.endpoint().unwrap()).unwrap();
        let err = client.unbind(1).await.unwrap_err();
        assert!(matches!(err, TransportError::Remote(ref e) if e.code == Code::NotFoundMethod));
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let t = transporter();
        // Bind then drop a listener to get a port nobody listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let client = t
            .new_node_client(&Endpoint::new("tcp", addr.to_string()))
            .unwrap();

        let err = client
            .trigger(TriggerArgs {
                event: Event::Connect,
                gid: "g1".to_string(),
                cid: 1,
                uid: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::Connect(_) | TransportError::Timeout
        ));
    }

    #[tokio::test]
    async fn test_lost_connection_fails_call_without_resend() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

        // Reads one request per connection, then hangs up without replying.
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
                if let Some(Ok(frame)) = framed.next().await {
                    let _ = seen_tx.send(frame.len());
                }
            }
        });

        let t = transporter();
        let client = t
            .new_node_client(&Endpoint::new("tcp", addr.to_string()))
            .unwrap();
        let args = || TriggerArgs {
            event: Event::Connect,
            gid: "g1".to_string(),
            cid: 1,
            uid: 0,
        };

        let err = client.trigger(args()).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
        // The next call goes out on a fresh connection.
        let err = client.trigger(args()).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));

        seen_rx.recv().await.unwrap();
        seen_rx.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen_rx.try_recv().is_err(), "a request was sent twice");
    }

    #[test]
    fn test_unsupported_scheme() {
        let t = transporter();
        let err = t
            .new_node_client(&Endpoint::new("grpc", "127.0.0.1:1"))
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::UnsupportedScheme(_)));
    }
}
