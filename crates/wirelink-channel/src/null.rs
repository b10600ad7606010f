//! `null://` - a sink channel
//!
//! Opens synchronously, accepts and discards every post, never produces
//! data. Useful as a placeholder child and in tests.

use wirelink_core::Msg;

use crate::chan::{Base, ChannelImpl};
use crate::error::Result;

#[derive(Default)]
pub struct Null;

impl ChannelImpl for Null {
    fn post(&mut self, _base: &mut Base, _msg: &Msg) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use wirelink_config::Config;
    use wirelink_core::{Msg, State};

    use crate::context::Context;

    #[test]
    fn test_null_lifecycle() {
        let ctx = Context::new();
        let c = ctx.channel("null://;name=sink").unwrap();
        assert_eq!(c.state(), State::Closed);
        c.open(&Config::new()).unwrap();
        assert_eq!(c.state(), State::Active);
        c.post(&Msg::data(0, 0, &b"dropped"[..])).unwrap();
        c.close(false);
        assert_eq!(c.state(), State::Closed);
    }

    #[test]
    fn test_null_post_requires_active() {
        let ctx = Context::new();
        let c = ctx.channel("null://;name=sink").unwrap();
        assert!(c.post(&Msg::data(0, 0, &b"x"[..])).is_err());
    }
}
