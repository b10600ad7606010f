//! Prefix channels
//!
//! A prefix wraps another channel and interposes on its data path. The URL
//! spells the composition: `busywait+tcp://host` builds a `busywait` prefix
//! whose inner channel is `tcp://host` (chains nest arbitrarily deep). The
//! inner channel is an ordinary child named `<name>/<prefix>`; the prefix
//! follows its state - Active when the inner channel turns Active, Error
//! when it fails, Closed when it finishes closing.
//!
//! Concrete prefixes implement [`PrefixHook`] and override only what they
//! interpose on; the default forwards everything untouched.

use std::time::Duration;

use wirelink_config::{Config, Url};
use wirelink_core::{Msg, MsgType, State};

use crate::chan::{Base, Channel, ChannelImpl, ClosePolicy, OpenPolicy, ProcessPolicy};
use crate::error::{Error, Result};

pub const CHILD_TAG: &str = "child";

pub trait PrefixHook: 'static {
    fn process_policy(&self) -> ProcessPolicy {
        ProcessPolicy::Never
    }

    /// Called after the inner channel has been created, before it is
    /// attached.
    fn init(&mut self, base: &mut Base, url: &Url) -> Result<()> {
        let _ = (base, url);
        Ok(())
    }

    fn open(&mut self, base: &mut Base, params: &Config) -> Result<()> {
        let _ = (base, params);
        Ok(())
    }

    fn close(&mut self, base: &mut Base, force: bool) -> Result<()> {
        let _ = (base, force);
        Ok(())
    }

    /// Data arriving from the inner channel. Default: forward as-is.
    fn on_data(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        base.callback_data(msg.clone());
        Ok(())
    }

    /// Outgoing post. Return the message to forward to the inner channel,
    /// or None to swallow it.
    fn on_post(&mut self, base: &mut Base, msg: &Msg) -> Result<Option<Msg>> {
        let _ = base;
        Ok(Some(msg.clone()))
    }

    fn process(&mut self, base: &mut Base, timeout: Duration, flags: u32) -> Result<bool> {
        let _ = (base, timeout, flags);
        Ok(false)
    }
}

pub struct Prefix<H: PrefixHook> {
    hook: H,
    inner: Option<Channel>,
}

impl<H: PrefixHook> Prefix<H> {
    pub fn new(hook: H) -> Self {
        Self { hook, inner: None }
    }

    fn inner(&self) -> Result<&Channel> {
        self.inner
            .as_ref()
            .ok_or_else(|| Error::failed("prefix has no inner channel"))
    }
}

impl<H: PrefixHook> ChannelImpl for Prefix<H> {
    fn process_policy(&self) -> ProcessPolicy {
        self.hook.process_policy()
    }

    fn init(&mut self, base: &mut Base, url: &Url, master: Option<&Channel>) -> Result<()> {
        base.open_policy = OpenPolicy::Manual;
        base.close_policy = ClosePolicy::Long;
        let (head, inner_url) = url
            .split_prefix()?
            .ok_or_else(|| Error::failed(format!("'{}' is not a prefix url", url.proto())))?;
        inner_url.set("name", &format!("{}/{}", base.name(), head))?;
        inner_url.set(wirelink_config::url::KEY_INTERNAL, "yes")?;
        let inner = base.context().channel_url(&inner_url, master)?;
        self.hook.init(base, url)?;
        base.child_add(&inner, CHILD_TAG)?;
        // Surface the inner channel's live values as our own.
        base.config().set_link("info", &format!("../{}/info", CHILD_TAG))?;
        self.inner = Some(inner);
        Ok(())
    }

    fn open(&mut self, base: &mut Base, params: &Config) -> Result<()> {
        self.hook.open(base, params)?;
        self.inner()?.open(params)
    }

    fn close(&mut self, base: &mut Base, force: bool) -> Result<()> {
        self.hook.close(base, force)?;
        if let Some(inner) = &self.inner {
            if inner.state() != State::Closed {
                inner.close(force);
            }
        }
        Ok(())
    }

    fn post(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        match self.hook.on_post(base, msg)? {
            Some(m) => self.inner()?.post(&m),
            None => Ok(()),
        }
    }

    fn process(&mut self, base: &mut Base, timeout: Duration, flags: u32) -> Result<bool> {
        self.hook.process(base, timeout, flags)
    }

    fn on_child(&mut self, base: &mut Base, _tag: &str, _child: &Channel, msg: &Msg) -> Result<()> {
        match msg.msg_type {
            MsgType::Data => self.hook.on_data(base, msg),
            MsgType::Control => {
                base.callback(msg.clone());
                Ok(())
            }
            MsgType::State => {
                match msg.as_state() {
                    Some(State::Active) => {
                        if base.state() == State::Opening {
                            base.set_state(State::Active)?;
                        }
                    }
                    Some(State::Error) => base.state_fail("inner channel failed"),
                    Some(State::Closing) => {
                        if matches!(base.state(), State::Opening | State::Active) {
                            base.set_state(State::Closing)?;
                        }
                    }
                    Some(State::Closed) => {
                        if base.state() == State::Closing {
                            base.set_state(State::Closed)?;
                        }
                    }
                    _ => {}
                }
                Ok(())
            }
            MsgType::Channel => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use wirelink_core::MsgMask;

    use super::*;
    use crate::context::Context;

    /// Identity prefix used to exercise the base behavior.
    #[derive(Default)]
    struct Pass;
    impl PrefixHook for Pass {}

    fn register_pass(ctx: &Context) {
        ctx.register("pass+", || Box::new(Prefix::new(Pass)) as Box<dyn ChannelImpl>)
            .unwrap();
    }

    #[test]
    fn test_prefix_follows_inner_state() {
        let ctx = Context::new();
        register_pass(&ctx);
        let c = ctx.channel("pass+null://;name=wrapped").unwrap();
        assert_eq!(c.state(), State::Closed);
        let kids = c.children();
        assert_eq!(kids.len(), 1);
        assert_eq!(kids[0].name(), "wrapped/pass");

        c.open(&Config::new()).unwrap();
        // null opens synchronously, so the prefix is already Active.
        assert_eq!(c.state(), State::Active);

        c.close(false);
        assert_eq!(c.state(), State::Closed);
    }

    #[test]
    fn test_prefix_forwards_posts_to_inner() {
        let ctx = Context::new();
        register_pass(&ctx);
        // Inner is the slave side of a direct pair, so posts surface on
        // the master.
        let master = ctx.channel("direct://;name=peer").unwrap();
        master.open(&Config::new()).unwrap();
        let got: Rc<RefCell<Vec<i64>>> = Rc::default();
        let sink = got.clone();
        master.callback_add(move |m| sink.borrow_mut().push(m.seq), MsgMask::DATA);

        let c = ctx.channel("pass+direct://;name=w;master=peer").unwrap();
        c.open(&Config::new()).unwrap();
        c.post(&Msg::data(0, 5, &b"x"[..])).unwrap();
        assert_eq!(*got.borrow(), vec![5]);
    }

    #[test]
    fn test_prefix_forwards_inner_data_out() {
        let ctx = Context::new();
        register_pass(&ctx);
        let master = ctx.channel("direct://;name=feed").unwrap();
        master.open(&Config::new()).unwrap();

        let c = ctx.channel("pass+direct://;name=w2;master=feed").unwrap();
        c.open(&Config::new()).unwrap();
        let got: Rc<RefCell<Vec<i64>>> = Rc::default();
        let sink = got.clone();
        c.callback_add(move |m| sink.borrow_mut().push(m.seq), MsgMask::DATA);

        master.post(&Msg::data(0, 9, &b"in"[..])).unwrap();
        assert_eq!(*got.borrow(), vec![9]);
    }

    #[test]
    fn test_prefix_requires_chain() {
        let ctx = Context::new();
        register_pass(&ctx);
        assert!(ctx.channel("pass+://;name=broken").is_err());
    }
}
