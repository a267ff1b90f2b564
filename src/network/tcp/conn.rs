use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{Shared, TcpServerOptions};
use crate::network::{Conn, ConnState, Handler, NetworkError};

/// I/O halves handed to the connection tasks.
pub(super) struct ConnIo {
    reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    queue: mpsc::Receiver<Bytes>,
}

pub struct TcpConn {
    id: i64,
    uid: AtomicI64,
    state: AtomicU8,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    queue: mpsc::Sender<Bytes>,
    /// Cancelled on graceful close; the writer drains and exits
    hang: CancellationToken,
    /// Cancelled when either task stops or on forced close
    closed: CancellationToken,
}

impl TcpConn {
    pub(super) fn new(id: i64, stream: TcpStream, opts: &TcpServerOptions) -> (Arc<Self>, ConnIo) {
        let local_addr = stream.local_addr().ok();
        let remote_addr = stream.peer_addr().ok();
        let (read, write) = stream.into_split();

        let codec = || {
            LengthDelimitedCodec::builder()
                .max_frame_length(opts.max_msg_length)
                .new_codec()
        };

        let (tx, rx) = mpsc::channel(opts.write_queue_size.max(1));

        let conn = Arc::new(Self {
            id,
            uid: AtomicI64::new(0),
            state: AtomicU8::new(ConnState::Opened as u8),
            local_addr,
            remote_addr,
            queue: tx,
            hang: CancellationToken::new(),
            closed: CancellationToken::new(),
        });

        let io = ConnIo {
            reader: FramedRead::new(read, codec()),
            writer: FramedWrite::new(write, codec()),
            queue: rx,
        };

        (conn, io)
    }

    fn check_writable(&self) -> Result<(), NetworkError> {
        match self.state() {
            ConnState::Opened => Ok(()),
            ConnState::Hanged => Err(NetworkError::ConnectionHanged),
            ConnState::Closed => Err(NetworkError::ConnectionClosed),
        }
    }
}

#[async_trait]
impl Conn for TcpConn {
    fn id(&self) -> i64 {
        self.id
    }

    fn uid(&self) -> i64 {
        self.uid.load(Ordering::Acquire)
    }

    fn bind(&self, uid: i64) {
        self.uid.store(uid, Ordering::Release);
    }

    fn unbind(&self) {
        self.uid.store(0, Ordering::Release);
    }

    async fn send(&self, msg: Bytes) -> Result<(), NetworkError> {
        self.check_writable()?;
        self.queue
            .send(msg)
            .await
            .map_err(|_| NetworkError::ConnectionClosed)
    }

    fn push(&self, msg: Bytes) -> Result<(), NetworkError> {
        self.check_writable()?;
        self.queue.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => NetworkError::ConnectionClosed,
        })
    }

    fn close(&self, force: bool) -> Result<(), NetworkError> {
        if force {
            let prev = self.state.swap(ConnState::Closed as u8, Ordering::AcqRel);
            if prev == ConnState::Closed as u8 {
                return Err(NetworkError::ConnectionClosed);
            }
            self.closed.cancel();
            return Ok(());
        }

        match self.state.compare_exchange(
            ConnState::Opened as u8,
            ConnState::Hanged as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.hang.cancel();
                Ok(())
            }
            Err(s) if s == ConnState::Hanged as u8 => Ok(()),
            Err(_) => Err(NetworkError::ConnectionClosed),
        }
    }

    fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

/// Drive a connection from accept to disconnect.
///
/// The disconnect hook runs once, after both tasks have stopped.
pub(super) async fn run(
    conn: Arc<TcpConn>,
    io: ConnIo,
    handler: Arc<dyn Handler>,
    shared: Arc<Shared>,
) {
    let dyn_conn: Arc<dyn Conn> = conn.clone();
    handler.on_connect(Arc::clone(&dyn_conn)).await;

    let writer = tokio::spawn(write_loop(Arc::clone(&conn), io.writer, io.queue));
    read_loop(&conn, &dyn_conn, io.reader, handler.as_ref()).await;

    if let Err(e) = writer.await {
        debug!(cid = conn.id, error = %e, "Connection writer task failed");
    }

    conn.state.store(ConnState::Closed as u8, Ordering::Release);
    shared.remove(conn.id).await;
    debug!(cid = conn.id, "Client connection closed");

    handler.on_disconnect(dyn_conn).await;
}

async fn read_loop(
    conn: &TcpConn,
    dyn_conn: &Arc<dyn Conn>,
    mut reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    handler: &dyn Handler,
) {
    loop {
        let frame = tokio::select! {
            _ = conn.closed.cancelled() => break,
            frame = reader.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => {
                if conn.state() != ConnState::Opened {
                    trace!(cid = conn.id, "Discarding frame received while closing");
                    continue;
                }
                handler.on_receive(Arc::clone(dyn_conn), frame.freeze()).await;
            }
            Some(Err(e)) => {
                debug!(cid = conn.id, error = %e, "Client read failed");
                break;
            }
            None => break,
        }
    }

    conn.closed.cancel();
}

async fn write_loop(
    conn: Arc<TcpConn>,
    mut writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    mut queue: mpsc::Receiver<Bytes>,
) {
    loop {
        tokio::select! {
            biased;
            _ = conn.closed.cancelled() => break,
            _ = conn.hang.cancelled() => {
                while let Ok(msg) = queue.try_recv() {
                    if let Err(e) = writer.send(msg).await {
                        debug!(cid = conn.id, error = %e, "Client write failed while draining");
                        break;
                    }
                }
                break;
            }
            msg = queue.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = writer.send(msg).await {
                        debug!(cid = conn.id, error = %e, "Client write failed");
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = SinkExt::<Bytes>::close(&mut writer).await;
    conn.closed.cancel();
}
