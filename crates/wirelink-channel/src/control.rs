//! `control://` - the control-plane fan-out logic
//!
//! Bridges a processor-side control channel to operator connections.
//! Three tags:
//!
//! - `input`: server channels operators connect through; Connect and
//!   Disconnect controls maintain the set of live operator addresses.
//! - `processor`: exactly one channel speaking the processor control
//!   scheme; when it turns Active the logic requests a state dump, and
//!   `StateUpdate`/`StateDumpEnd` messages stream back.
//! - `uplink`: optional upstream controllers receiving the same updates.
//!
//! Operator requests handled here: `ConfigGet` browses the context config
//! and answers with a `ConfigValue` per match followed by `ConfigEnd`.
//! Everything else is forwarded untouched.

use std::time::Duration;

use wirelink_config::Url;
use wirelink_core::{Msg, MsgType, State};

use crate::chan::{Base, Channel, ChannelImpl};
use crate::error::{Error, Result};
use crate::tagged::TaggedChannels;

/// Processor control scheme message ids.
pub mod scheme {
    use bytes::{Buf, BufMut, Bytes, BytesMut};

    use crate::error::{Error, Result};

    pub const CONFIG_GET: i32 = 10;
    pub const CONFIG_VALUE: i32 = 20;
    pub const CONFIG_END: i32 = 30;
    pub const OK: i32 = 40;
    pub const ERROR: i32 = 50;
    pub const SET_LOG_LEVEL: i32 = 60;
    pub const PING: i32 = 70;
    pub const PONG: i32 = 80;
    pub const HELLO: i32 = 90;
    pub const STATE_DUMP: i32 = 4096;
    pub const STATE_UPDATE: i32 = 4112;
    pub const STATE_DUMP_END: i32 = 4128;
    pub const MESSAGE_FORWARD: i32 = 4176;
    pub const CHANNEL_CLOSE: i32 = 4192;

    pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u32_le(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    pub(crate) fn get_string(data: &mut &[u8]) -> Result<String> {
        if data.remaining() < 4 {
            return Err(Error::corrupt("truncated string"));
        }
        let len = data.get_u32_le() as usize;
        if data.remaining() < len {
            return Err(Error::corrupt("truncated string"));
        }
        let s = String::from_utf8(data[..len].to_vec())
            .map_err(|_| Error::corrupt("invalid utf-8"))?;
        data.advance(len);
        Ok(s)
    }

    pub fn encode_config_get(path: &str) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, path);
        buf.freeze()
    }

    pub fn decode_config_get(mut data: &[u8]) -> Result<String> {
        get_string(&mut data)
    }

    pub fn encode_config_value(key: &str, value: &str) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, key);
        put_string(&mut buf, value);
        buf.freeze()
    }

    pub fn decode_config_value(mut data: &[u8]) -> Result<(String, String)> {
        let key = get_string(&mut data)?;
        let value = get_string(&mut data)?;
        Ok((key, value))
    }

    pub fn encode_state_update(channel: &str, state: u8) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, channel);
        buf.put_u8(state);
        buf.freeze()
    }

    pub fn decode_state_update(mut data: &[u8]) -> Result<(String, u8)> {
        let channel = get_string(&mut data)?;
        if data.remaining() < 1 {
            return Err(Error::corrupt("truncated StateUpdate"));
        }
        Ok((channel, data.get_u8()))
    }

    pub fn encode_hello(version: u16, service: &str) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16_le(version);
        put_string(&mut buf, service);
        buf.freeze()
    }

    pub fn decode_hello(mut data: &[u8]) -> Result<(u16, String)> {
        if data.remaining() < 2 {
            return Err(Error::corrupt("truncated Hello"));
        }
        let version = data.get_u16_le();
        let service = get_string(&mut data)?;
        Ok((version, service))
    }
}

pub struct Control {
    channels: Option<TaggedChannels>,
    /// Live operator connections: (addr, input channel).
    addrs: Vec<(u64, Channel)>,
}

impl Control {
    pub fn boxed() -> Box<dyn ChannelImpl> {
        Box::new(Control {
            channels: None,
            addrs: Vec::new(),
        })
    }

    fn channels(&self) -> &TaggedChannels {
        self.channels.as_ref().expect("initialized in init")
    }

    fn request_dump(&self, base: &mut Base) -> Result<()> {
        tracing::debug!(channel = %base.name(), "requesting state dump");
        let processor = self
            .channels()
            .first("processor")
            .ok_or_else(|| Error::failed("no processor channel"))?;
        processor.post(&Msg::data(scheme::STATE_DUMP, 0, bytes::Bytes::new()))
    }

    /// Push a processor message out to every operator and active uplink.
    fn forward(&self, msg: &Msg) {
        for (addr, channel) in &self.addrs {
            let mut m = msg.clone();
            m.addr = *addr;
            if let Err(e) = channel.post(&m) {
                tracing::warn!(addr, "failed to forward to operator: {}", e);
            }
        }
        for uplink in self.channels().get("uplink") {
            if uplink.state() != State::Active {
                continue;
            }
            let mut m = msg.clone();
            m.addr = 0;
            if let Err(e) = uplink.post(&m) {
                tracing::warn!(uplink = %uplink.name(), "failed to forward: {}", e);
            }
        }
    }

    /// An operator request from an input or uplink channel.
    fn on_external(&self, base: &mut Base, channel: &Channel, msg: &Msg) -> Result<()> {
        match msg.msgid {
            scheme::CONFIG_GET => {
                let path = scheme::decode_config_get(&msg.data)?;
                let values = base.context().config().browse_values(&path)?;
                for (key, value) in values {
                    let reply = Msg::data(
                        scheme::CONFIG_VALUE,
                        0,
                        scheme::encode_config_value(&key, &value),
                    )
                    .with_addr(msg.addr);
                    channel.post(&reply)?;
                }
                channel.post(
                    &Msg::data(scheme::CONFIG_END, 0, bytes::Bytes::new()).with_addr(msg.addr),
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_input(&mut self, base: &mut Base, child: &Channel, msg: &Msg) -> Result<()> {
        match msg.msg_type {
            MsgType::Control => {
                match msg.msgid {
                    crate::tcp::scheme::CONNECT => {
                        tracing::debug!(addr = msg.addr, from = %child.name(), "operator connected");
                        self.addrs.push((msg.addr, child.clone()));
                    }
                    crate::tcp::scheme::DISCONNECT => {
                        tracing::debug!(addr = msg.addr, from = %child.name(), "operator disconnected");
                        self.addrs
                            .retain(|(a, c)| !(*a == msg.addr && c.ptr_eq(child)));
                    }
                    _ => {}
                }
                Ok(())
            }
            MsgType::Data => self.on_external(base, child, msg),
            _ => Ok(()),
        }
    }

    fn on_processor(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        if msg.msg_type == MsgType::State {
            if msg.as_state() == Some(State::Active) {
                return self.request_dump(base);
            }
            return Ok(());
        }
        if msg.msg_type != MsgType::Data {
            return Ok(());
        }
        match msg.msgid {
            scheme::STATE_UPDATE => {
                if let Ok((channel, state)) = scheme::decode_state_update(&msg.data) {
                    tracing::debug!(channel, state, "state update");
                }
                self.forward(msg);
            }
            scheme::STATE_DUMP_END => self.forward(msg),
            _ => {}
        }
        Ok(())
    }

    fn on_uplink(&mut self, base: &mut Base, child: &Channel, msg: &Msg) -> Result<()> {
        if msg.msg_type == MsgType::State && msg.as_state() == Some(State::Active) {
            return self.request_dump(base);
        }
        if msg.msg_type != MsgType::Data {
            return Ok(());
        }
        self.on_external(base, child, msg)
    }
}

impl ChannelImpl for Control {
    fn init(&mut self, base: &mut Base, url: &Url, _master: Option<&Channel>) -> Result<()> {
        let channels = TaggedChannels::resolve(base, url, &["input", "processor", "uplink"])?;
        if channels.count("processor") != 1 {
            return Err(Error::failed(format!(
                "need exactly one 'processor', got {}",
                channels.count("processor")
            )));
        }
        self.channels = Some(channels);
        Ok(())
    }

    fn open(&mut self, base: &mut Base, _params: &wirelink_config::Config) -> Result<()> {
        self.addrs.clear();
        let processor_active = self
            .channels()
            .first("processor")
            .map(|c| c.state() == State::Active)
            .unwrap_or(false);
        if processor_active {
            self.request_dump(base)?;
        }
        Ok(())
    }

    fn process(&mut self, _base: &mut Base, _timeout: Duration, _flags: u32) -> Result<bool> {
        Ok(false)
    }

    fn on_child(&mut self, base: &mut Base, tag: &str, child: &Channel, msg: &Msg) -> Result<()> {
        let group = self.channels().tag_of(tag).to_string();
        match group.as_str() {
            "input" => self.on_input(base, child, msg),
            "processor" => self.on_processor(base, msg),
            "uplink" => self.on_uplink(base, child, msg),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use wirelink_config::Config;
    use wirelink_core::{Msg, MsgMask, MsgType};

    use super::*;
    use crate::context::Context;

    struct Fixture {
        ctx: Context,
        /// Test-side ends of the direct pairs.
        input: Channel,
        processor: Channel,
        _logic: Channel,
    }

    fn fixture() -> Fixture {
        let ctx = Context::new();
        let t_in = ctx.channel("direct://;name=test/input").unwrap();
        let t_proc = ctx.channel("direct://;name=test/proc").unwrap();
        let input = ctx.channel("direct://;name=input;master=test/input").unwrap();
        let proc_ = ctx.channel("direct://;name=proc;master=test/proc").unwrap();
        for c in [&t_in, &t_proc, &input, &proc_] {
            c.open(&Config::new()).unwrap();
        }
        let logic = ctx
            .channel(
                "control://;name=logic;wirelink.channel.input=input;wirelink.channel.processor=proc",
            )
            .unwrap();
        logic.open(&Config::new()).unwrap();
        Fixture {
            ctx,
            input: t_in,
            processor: t_proc,
            _logic: logic,
        }
    }

    #[test]
    fn test_config_get_browses_context_config() {
        let f = fixture();
        f.ctx.config().set("app.mode", "prod").unwrap();
        f.ctx.config().set("app.workers", "4").unwrap();

        let got: Rc<RefCell<Vec<(i32, Vec<u8>)>>> = Rc::default();
        let sink = got.clone();
        f.input.callback_add(
            move |m| sink.borrow_mut().push((m.msgid, m.data.to_vec())),
            MsgMask::DATA,
        );

        let req = Msg::data(scheme::CONFIG_GET, 0, scheme::encode_config_get("app.*"))
            .with_addr(7);
        f.input.post(&req).unwrap();

        let msgs = got.borrow();
        assert_eq!(msgs.len(), 3);
        assert_eq!(
            scheme::decode_config_value(&msgs[0].1).unwrap(),
            ("app.mode".to_string(), "prod".to_string())
        );
        assert_eq!(
            scheme::decode_config_value(&msgs[1].1).unwrap(),
            ("app.workers".to_string(), "4".to_string())
        );
        assert_eq!(msgs[2].0, scheme::CONFIG_END);
    }

    #[test]
    fn test_state_updates_forwarded_to_connected_operators() {
        let f = fixture();

        // Operator connects on the input channel.
        f.input
            .post(&Msg::control(crate::tcp::scheme::CONNECT).with_addr(0xbeef))
            .unwrap();

        let got: Rc<RefCell<Vec<(i32, u64)>>> = Rc::default();
        let sink = got.clone();
        f.input.callback_add(
            move |m| sink.borrow_mut().push((m.msgid, m.addr)),
            MsgMask::DATA,
        );

        let update = Msg::data(
            scheme::STATE_UPDATE,
            0,
            scheme::encode_state_update("worker/tcp", 2),
        );
        f.processor.post(&update).unwrap();
        f.processor
            .post(&Msg::data(scheme::STATE_DUMP_END, 0, bytes::Bytes::new()))
            .unwrap();

        assert_eq!(
            *got.borrow(),
            vec![
                (scheme::STATE_UPDATE, 0xbeef),
                (scheme::STATE_DUMP_END, 0xbeef)
            ]
        );
    }

    #[test]
    fn test_disconnect_stops_forwarding() {
        let f = fixture();
        f.input
            .post(&Msg::control(crate::tcp::scheme::CONNECT).with_addr(1))
            .unwrap();
        f.input
            .post(&Msg::control(crate::tcp::scheme::DISCONNECT).with_addr(1))
            .unwrap();

        let got: Rc<RefCell<Vec<i32>>> = Rc::default();
        let sink = got.clone();
        f.input
            .callback_add(move |m| sink.borrow_mut().push(m.msgid), MsgMask::DATA);

        f.processor
            .post(&Msg::data(
                scheme::STATE_UPDATE,
                0,
                scheme::encode_state_update("x", 0),
            ))
            .unwrap();
        assert!(got.borrow().is_empty());
    }

    #[test]
    fn test_control_requires_one_processor() {
        let ctx = Context::new();
        assert!(ctx.channel("control://;name=lonely").is_err());
    }

    #[test]
    fn test_scheme_roundtrips() {
        let (k, v) = scheme::decode_config_value(&scheme::encode_config_value("a.b", "1")).unwrap();
        assert_eq!((k.as_str(), v.as_str()), ("a.b", "1"));
        let (c, s) = scheme::decode_state_update(&scheme::encode_state_update("ch", 3)).unwrap();
        assert_eq!((c.as_str(), s), ("ch", 3));
        let (ver, svc) = scheme::decode_hello(&scheme::encode_hello(1, "wirelink")).unwrap();
        assert_eq!((ver, svc.as_str()), (1, "wirelink"));
        assert_eq!(
            scheme::decode_config_get(&scheme::encode_config_get("**")).unwrap(),
            "**"
        );
        assert!(scheme::decode_config_get(b"\xff\xff\xff\xff").is_err());
    }
}
