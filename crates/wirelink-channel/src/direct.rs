//! `direct://` - an in-process paired channel
//!
//! Two instances form a loopback: create the master first, then a slave
//! with `master=<name>` (or an explicit master handle). A post on either
//! side is delivered to the observers of the other side. The backbone of
//! logic and composition tests, and the simplest possible transport.

use std::rc::Weak;

use wirelink_config::Url;
use wirelink_core::Msg;

use crate::chan::{Base, Channel, ChannelImpl, ChannelShared};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct Direct {
    peer: Option<Weak<ChannelShared>>,
}

impl ChannelImpl for Direct {
    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        Some(self)
    }

    fn init(&mut self, base: &mut Base, _url: &Url, master: Option<&Channel>) -> Result<()> {
        let Some(master) = master else {
            // Master side: waits for a slave to pair with it.
            return Ok(());
        };
        {
            let inner = &mut *master.0.inner.borrow_mut();
            let peer = inner
                .imp
                .as_any_mut()
                .and_then(|a| a.downcast_mut::<Direct>())
                .ok_or_else(|| {
                    Error::failed(format!("master '{}' is not a direct channel", master.name()))
                })?;
            peer.peer = Some(base.self_weak());
        }
        self.peer = Some(std::rc::Rc::downgrade(&master.0));
        Ok(())
    }

    fn post(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        let Some(peer) = self.peer.as_ref().and_then(|w| w.upgrade()) else {
            // Unpaired side drops the message, like an unconnected socket.
            return Ok(());
        };
        base.context().emit_for(std::rc::Rc::downgrade(&peer), msg.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use wirelink_config::Config;
    use wirelink_core::{Msg, MsgMask};

    use crate::context::Context;

    #[test]
    fn test_direct_pair_delivery() {
        let ctx = Context::new();
        let a = ctx.channel("direct://;name=a").unwrap();
        let b = ctx.channel("direct://;name=b;master=a").unwrap();
        a.open(&Config::new()).unwrap();
        b.open(&Config::new()).unwrap();

        let got: Rc<RefCell<Vec<Msg>>> = Rc::default();
        let sink = got.clone();
        b.callback_add(move |m| sink.borrow_mut().push(m.clone()), MsgMask::DATA);

        a.post(&Msg::data(10, 7, &b"hello"[..])).unwrap();
        let msgs = got.borrow();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msgid, 10);
        assert_eq!(msgs[0].seq, 7);
        assert_eq!(msgs[0].data.as_ref(), b"hello");
    }

    #[test]
    fn test_direct_is_bidirectional() {
        let ctx = Context::new();
        let a = ctx.channel("direct://;name=a2").unwrap();
        let b = ctx.channel("direct://;name=b2;master=a2").unwrap();
        a.open(&Config::new()).unwrap();
        b.open(&Config::new()).unwrap();

        let got: Rc<RefCell<Vec<i64>>> = Rc::default();
        let sink = got.clone();
        a.callback_add(move |m| sink.borrow_mut().push(m.seq), MsgMask::DATA);

        b.post(&Msg::data(0, 1, &b"x"[..])).unwrap();
        b.post(&Msg::data(0, 2, &b"y"[..])).unwrap();
        assert_eq!(*got.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_direct_master_must_be_direct() {
        let ctx = Context::new();
        let n = ctx.channel("null://;name=notdirect").unwrap();
        let _ = n;
        assert!(ctx.channel("direct://;name=s;master=notdirect").is_err());
    }

    #[test]
    fn test_direct_unpaired_post_is_dropped() {
        let ctx = Context::new();
        let a = ctx.channel("direct://;name=lonely").unwrap();
        a.open(&Config::new()).unwrap();
        a.post(&Msg::data(0, 0, &b"void"[..])).unwrap();
    }
}
