//! Request/reply envelope for the TCP transport (MessagePack encoded).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::packet::Message;
use crate::transport::{DeliverArgs, ProviderError, Target, TriggerArgs};

/// One frame on a peer connection. A reply carries the id of the request it
/// answers, so several requests can be outstanding on one connection.
#[derive(Debug, Deserialize, Serialize)]
pub struct Envelope {
    pub id: u64,
    pub message: RpcMessage,
}

#[derive(Debug, Deserialize, Serialize)]
pub enum RpcMessage {
    // Served by gates
    BindRequest(BindRequest),
    UnbindRequest(UnbindRequest),
    PushRequest(PushRequest),
    BroadcastRequest(BroadcastRequest),
    DisconnectRequest(DisconnectRequest),
    // Served by nodes
    DeliverRequest(DeliverArgs),
    TriggerRequest(TriggerArgs),
    InvokeRequest(InvokeRequest),
    // Replies
    Reply(Reply),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BindRequest {
    pub cid: i64,
    pub uid: i64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct UnbindRequest {
    pub uid: i64,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PushRequest {
    pub message: Message,
    pub target: Target,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct BroadcastRequest {
    pub message: Message,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DisconnectRequest {
    pub force: bool,
    pub target: Target,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct InvokeRequest {
    pub args: Bytes,
    /// Instance id of the caller
    #[serde(default)]
    pub caller: Option<String>,
    pub method: String,
    pub service: String,
    /// Remaining caller budget in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
pub enum Reply {
    Ack,
    Total(u64),
    Invoked(Bytes),
    Failure(ProviderError),
}
