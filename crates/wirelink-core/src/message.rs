//! Message type
//!
//! [`Msg`] is the unit of data passed through channels. It is a value type:
//! the payload is a cheaply-cloneable [`Bytes`], metadata travels alongside
//! it. Observers receive a borrowed `&Msg` and must not assume the payload
//! outlives the callback; a channel is free to reuse its buffers afterwards.
//!
//! Four message types share the struct:
//! - `Data` - application payload; `msgid` names the schema message (0 for
//!   unnamed byte streams), `seq` is the position in the logical stream.
//! - `Control` - out-of-band channel protocol (Connect, Disconnect, ...).
//! - `State` - lifecycle notifications; `msgid` is the state ordinal, or
//!   [`MSGID_UPDATE_DCAPS`] for demand-capability updates.
//! - `Channel` - child topology updates ([`MSGID_CHANNEL_ADD`] /
//!   [`MSGID_CHANNEL_DEL`]); the payload carries the child name.
//!
//! `addr` is an opaque 64-bit demultiplexer: servers use it to tell client
//! connections apart, and posts addressed to a server are routed by it.

use bytes::Bytes;

use crate::state::State;

/// Channel message: a child was attached.
pub const MSGID_CHANNEL_ADD: i32 = 1;
/// Channel message: a child was detached.
pub const MSGID_CHANNEL_DEL: i32 = 2;
/// State message: dcaps changed; payload is the new bits as LE u32.
pub const MSGID_UPDATE_DCAPS: i32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    Data,
    Control,
    State,
    Channel,
}

bitflags::bitflags! {
    /// Mask used when registering callbacks: which message types to receive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgMask: u32 {
        const DATA = 0x01;
        const CONTROL = 0x02;
        const STATE = 0x04;
        const CHANNEL = 0x08;
        const ALL = 0x0f;
    }
}

impl MsgType {
    pub fn mask(&self) -> MsgMask {
        match self {
            MsgType::Data => MsgMask::DATA,
            MsgType::Control => MsgMask::CONTROL,
            MsgType::State => MsgMask::STATE,
            MsgType::Channel => MsgMask::CHANNEL,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Msg {
    pub msg_type: MsgType,
    pub msgid: i32,
    pub seq: i64,
    /// Opaque address demultiplexer (client/connection id), 0 if unused.
    pub addr: u64,
    pub flags: u32,
    /// Receive timestamp in nanoseconds since the epoch, when available.
    pub time: Option<u64>,
    pub data: Bytes,
}

impl Msg {
    pub fn new(msg_type: MsgType, msgid: i32) -> Self {
        Self {
            msg_type,
            msgid,
            seq: 0,
            addr: 0,
            flags: 0,
            time: None,
            data: Bytes::new(),
        }
    }

    pub fn data(msgid: i32, seq: i64, data: impl Into<Bytes>) -> Self {
        Self {
            seq,
            data: data.into(),
            ..Self::new(MsgType::Data, msgid)
        }
    }

    pub fn control(msgid: i32) -> Self {
        Self::new(MsgType::Control, msgid)
    }

    pub fn state(state: State) -> Self {
        Self::new(MsgType::State, state as i32)
    }

    pub fn channel(msgid: i32, name: &str) -> Self {
        Self {
            data: Bytes::copy_from_slice(name.as_bytes()),
            ..Self::new(MsgType::Channel, msgid)
        }
    }

    pub fn with_addr(mut self, addr: u64) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// For State-type messages, the lifecycle state this message reports.
    pub fn as_state(&self) -> Option<State> {
        if self.msg_type != MsgType::State {
            return None;
        }
        State::from_msgid(self.msgid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_constructor() {
        let m = Msg::data(10, 42, &b"payload"[..]);
        assert_eq!(m.msg_type, MsgType::Data);
        assert_eq!(m.msgid, 10);
        assert_eq!(m.seq, 42);
        assert_eq!(m.addr, 0);
        assert_eq!(m.data.as_ref(), b"payload");
        assert!(m.time.is_none());
    }

    #[test]
    fn test_state_message_roundtrip() {
        let m = Msg::state(State::Active);
        assert_eq!(m.msg_type, MsgType::State);
        assert_eq!(m.as_state(), Some(State::Active));
        assert_eq!(Msg::data(2, 0, Bytes::new()).as_state(), None);
    }

    #[test]
    fn test_dcaps_update_is_not_a_state() {
        let m = Msg::new(MsgType::State, MSGID_UPDATE_DCAPS);
        assert_eq!(m.as_state(), None);
    }

    #[test]
    fn test_mask_matches_type() {
        assert!(MsgMask::ALL.contains(MsgType::Control.mask()));
        assert!(MsgMask::DATA.contains(MsgType::Data.mask()));
        assert!(!MsgMask::DATA.contains(MsgType::State.mask()));
    }

    #[test]
    fn test_addr_builder() {
        let m = Msg::control(20).with_addr(0xbeef);
        assert_eq!(m.addr, 0xbeef);
    }
}
