//! `busywait+` - a delay prefix
//!
//! Holds every inner Data message for `delay` before forwarding it.
//! Sub-millisecond delays spin on the clock for precision; anything larger
//! sleeps. This is the documented exception to the no-blocking rule: the
//! prefix exists to shape load in benchmarks and latency experiments.

use std::time::{Duration, Instant};

use wirelink_config::Url;
use wirelink_core::Msg;

use crate::chan::{Base, ChannelImpl};
use crate::error::Result;
use crate::prefix::{Prefix, PrefixHook};

pub struct BusyWait {
    delay: Duration,
}

impl Default for BusyWait {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(1),
        }
    }
}

impl BusyWait {
    pub fn boxed() -> Box<dyn ChannelImpl> {
        Box::new(Prefix::new(Self::default()))
    }
}

impl PrefixHook for BusyWait {
    fn init(&mut self, _base: &mut Base, url: &Url) -> Result<()> {
        self.delay = url
            .config()
            .get_duration("delay", Duration::from_millis(1))?;
        Ok(())
    }

    fn on_data(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        if self.delay < Duration::from_millis(1) {
            let end = Instant::now() + self.delay;
            while Instant::now() < end {}
        } else {
            std::thread::sleep(self.delay);
        }
        base.callback_data(msg.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Instant;

    use wirelink_config::Config;
    use wirelink_core::{Msg, MsgMask};

    use crate::context::Context;

    #[test]
    fn test_busywait_delays_then_forwards() {
        let ctx = Context::new();
        let feed = ctx.channel("direct://;name=bw-feed").unwrap();
        feed.open(&Config::new()).unwrap();
        let c = ctx
            .channel("busywait+direct://;name=bw;master=bw-feed;delay=2ms")
            .unwrap();
        c.open(&Config::new()).unwrap();

        let got: Rc<RefCell<Vec<i64>>> = Rc::default();
        let sink = got.clone();
        c.callback_add(move |m| sink.borrow_mut().push(m.seq), MsgMask::DATA);

        let before = Instant::now();
        feed.post(&Msg::data(0, 1, &b"x"[..])).unwrap();
        assert!(before.elapsed() >= std::time::Duration::from_millis(2));
        assert_eq!(*got.borrow(), vec![1]);
    }

    #[test]
    fn test_busywait_spin_path() {
        let ctx = Context::new();
        let feed = ctx.channel("direct://;name=bw-feed2").unwrap();
        feed.open(&Config::new()).unwrap();
        let c = ctx
            .channel("busywait+direct://;name=bw2;master=bw-feed2;delay=100us")
            .unwrap();
        c.open(&Config::new()).unwrap();

        let got: Rc<RefCell<usize>> = Rc::default();
        let sink = got.clone();
        c.callback_add(move |_| *sink.borrow_mut() += 1, MsgMask::DATA);
        feed.post(&Msg::data(0, 0, &b"x"[..])).unwrap();
        assert_eq!(*got.borrow(), 1);
    }
}
