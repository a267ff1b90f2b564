use std::fmt;

use bytes::Bytes;

use super::NodeProxy;
use crate::cluster::{Event, ProxyError};
use crate::packet::Message;
use crate::transport::{DeliverArgs, Target};

/// A client message handed to a route handler.
pub struct Request {
    gid: String,
    nid: String,
    cid: i64,
    uid: i64,
    message: Message,
    proxy: NodeProxy,
}

impl Request {
    pub(super) fn new(args: DeliverArgs, proxy: NodeProxy) -> Self {
        Self {
            gid: args.gid,
            nid: args.nid,
            cid: args.cid,
            uid: args.uid,
            message: args.message,
            proxy,
        }
    }

    /// Gate holding the originating connection.
    pub fn gid(&self) -> &str {
        &self.gid
    }

    /// Node the gate addressed.
    pub fn nid(&self) -> &str {
        &self.nid
    }

    pub fn cid(&self) -> i64 {
        self.cid
    }

    /// 0 when the connection is not bound to a user.
    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn route(&self) -> i32 {
        self.message.route
    }

    pub fn seq(&self) -> i32 {
        self.message.seq
    }

    pub fn buffer(&self) -> &Bytes {
        &self.message.buffer
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn proxy(&self) -> &NodeProxy {
        &self.proxy
    }

    /// Push `buffer` to the originating connection under the request's route
    /// and sequence number.
    pub async fn respond(&self, buffer: impl Into<Bytes>) -> Result<(), ProxyError> {
        let message = Message::new(self.route(), self.seq(), buffer);
        self.proxy
            .push(&self.gid, Target::Conn(self.cid), message)
            .await
    }

    /// Bind `uid` to the originating connection and pin the user to this
    /// node.
    pub async fn bind(&mut self, uid: i64) -> Result<(), ProxyError> {
        self.proxy.bind_gate(&self.gid, self.cid, uid).await?;
        self.proxy.bind_node(uid).await?;
        self.uid = uid;
        Ok(())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("gid", &self.gid)
            .field("nid", &self.nid)
            .field("cid", &self.cid)
            .field("uid", &self.uid)
            .field("route", &self.message.route)
            .field("seq", &self.message.seq)
            .finish()
    }
}

/// A client lifecycle event handed to an event listener.
pub struct EventArgs {
    pub event: Event,
    pub gid: String,
    pub cid: i64,
    pub uid: i64,
    pub proxy: NodeProxy,
}

impl fmt::Debug for EventArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventArgs")
            .field("event", &self.event)
            .field("gid", &self.gid)
            .field("cid", &self.cid)
            .field("uid", &self.uid)
            .finish()
    }
}
