//! Stream protocol messages
//!
//! The request channel between a stream client and the server speaks
//! this scheme: a client asks for catch-up with [`Request`], the server
//! acknowledges with [`Reply`] and streams data, or reports [`Error`]
//! and disconnects. [`Block`] is a control message creating a named
//! block in the server's block index.
//!
//! Encoding is little-endian with u32-length-prefixed strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use wirelink_channel::error::{Error as ChannelError, Result};

pub const REQUEST: i32 = 10;
pub const REPLY: i32 = 20;
pub const ERROR: i32 = 30;
pub const BLOCK: i32 = 40;

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(data: &mut &[u8]) -> Result<String> {
    if data.remaining() < 4 {
        return Err(ChannelError::corrupt("truncated string"));
    }
    let len = data.get_u32_le() as usize;
    if data.remaining() < len {
        return Err(ChannelError::corrupt("truncated string"));
    }
    let s = String::from_utf8(data[..len].to_vec())
        .map_err(|_| ChannelError::corrupt("invalid utf-8"))?;
    data.advance(len);
    Ok(s)
}

/// Client -> server: replay from `seq`, or from the named block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub client: String,
    pub seq: i64,
    /// Symbolic block name (`day:2024-01-02`); empty when seeking by seq.
    pub block: String,
}

impl Request {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.client);
        buf.put_i64_le(self.seq);
        put_string(&mut buf, &self.block);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Request> {
        let client = get_string(&mut data)?;
        if data.remaining() < 8 {
            return Err(ChannelError::corrupt("truncated Request"));
        }
        let seq = data.get_i64_le();
        let block = get_string(&mut data)?;
        Ok(Request { client, seq, block })
    }
}

/// Server -> client: catch-up begins at `requested_seq`; the server's
/// last stored seq at the time of the request was `last_seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub last_seq: i64,
    pub requested_seq: i64,
}

impl Reply {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_i64_le(self.last_seq);
        buf.put_i64_le(self.requested_seq);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Reply> {
        if data.remaining() < 16 {
            return Err(ChannelError::corrupt("truncated Reply"));
        }
        Ok(Reply {
            last_seq: data.get_i64_le(),
            requested_seq: data.get_i64_le(),
        })
    }
}

pub fn encode_error(text: &str) -> Bytes {
    let mut buf = BytesMut::new();
    put_string(&mut buf, text);
    buf.freeze()
}

pub fn decode_error(mut data: &[u8]) -> Result<String> {
    get_string(&mut data)
}

/// Control payload: create a named block starting at the next sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub name: String,
}

impl Block {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.name);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Block> {
        Ok(Block {
            name: get_string(&mut data)?,
        })
    }
}
