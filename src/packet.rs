//! Client frame body codec.
//!
//! The connection transport strips the 4-byte length prefix; what arrives here
//! is the frame body:
//!
//! ```text
//! +-------------+-------------+-----------------+
//! | route (i32) |  seq (i32)  |  payload (...)  |
//! +-------------+-------------+-----------------+
//! ```
//!
//! Both integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size of the fixed route + sequence header.
pub const HEADER_LEN: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Packet too short: {0} byte(s), need at least {HEADER_LEN}")]
    TooShort(usize),
}

/// A client message: route identifier, client sequence number and an
/// opaque payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Message {
    pub route: i32,
    pub seq: i32,
    pub buffer: Bytes,
}

impl Message {
    pub fn new(route: i32, seq: i32, buffer: impl Into<Bytes>) -> Self {
        Self {
            route,
            seq,
            buffer: buffer.into(),
        }
    }
}

/// Decode a frame body into a [`Message`].
pub fn unpack(data: &[u8]) -> Result<Message, PacketError> {
    if data.len() < HEADER_LEN {
        return Err(PacketError::TooShort(data.len()));
    }

    let mut buf = data;
    let route = buf.get_i32();
    let seq = buf.get_i32();

    Ok(Message {
        route,
        seq,
        buffer: Bytes::copy_from_slice(buf),
    })
}

/// Encode a [`Message`] into a frame body.
pub fn pack(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + message.buffer.len());
    buf.put_i32(message.route);
    buf.put_i32(message.seq);
    buf.put_slice(&message.buffer);
    buf.freeze()
}
