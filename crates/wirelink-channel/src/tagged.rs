//! Tagged logics
//!
//! A logic channel processes messages from several existing channels,
//! each attached under a compile-time tag. The wiring comes from URL
//! parameters: `wirelink.channel.<tag>=name[,name...]` names channels
//! already living in the context. [`TaggedChannels`] resolves the names,
//! attaches each as a child under `<tag>/<name>`, and maps child events
//! back to `(tag, channel)` for the logic's dispatch.

use wirelink_config::Url;

use crate::chan::{Base, Channel};
use crate::error::{Error, Result};

pub struct TaggedChannels {
    entries: Vec<(String, Channel)>,
}

impl TaggedChannels {
    /// Resolve and attach the channels named for each tag in `tags`.
    pub fn resolve(base: &mut Base, url: &Url, tags: &[&str]) -> Result<TaggedChannels> {
        let mut entries = Vec::new();
        for tag in tags {
            let Some(names) = url.get(&format!("wirelink.channel.{}", tag)) else {
                continue;
            };
            for name in names.split(',').filter(|s| !s.is_empty()) {
                let channel = base.context().get(name).ok_or_else(|| {
                    Error::failed(format!("channel '{}' for tag '{}' not found", name, tag))
                })?;
                base.child_add(&channel, &format!("{}/{}", tag, name))?;
                entries.push((tag.to_string(), channel));
            }
        }
        Ok(TaggedChannels { entries })
    }

    /// All channels attached under `tag`.
    pub fn get(&self, tag: &str) -> Vec<&Channel> {
        self.entries
            .iter()
            .filter(|(t, _)| t == tag)
            .map(|(_, c)| c)
            .collect()
    }

    pub fn first(&self, tag: &str) -> Option<&Channel> {
        self.entries.iter().find(|(t, _)| t == tag).map(|(_, c)| c)
    }

    pub fn count(&self, tag: &str) -> usize {
        self.entries.iter().filter(|(t, _)| t == tag).count()
    }

    /// The tag a child event arrived under (`<tag>/<name>` form).
    pub fn tag_of<'a>(&self, child_tag: &'a str) -> &'a str {
        child_tag.split_once('/').map(|(t, _)| t).unwrap_or(child_tag)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use wirelink_config::{Config, Url};
    use wirelink_core::{Msg, MsgMask, MsgType};

    use super::*;
    use crate::chan::ChannelImpl;
    use crate::context::Context;

    /// A forwarding logic: everything posted to `input` channels comes out
    /// of the `output` channel.
    struct Forward {
        channels: Option<TaggedChannels>,
    }

    impl ChannelImpl for Forward {
        fn init(&mut self, base: &mut Base, url: &Url, _master: Option<&Channel>) -> Result<()> {
            let channels = TaggedChannels::resolve(base, url, &["input", "output"])?;
            if channels.count("input") != 1 || channels.count("output") != 1 {
                return Err(Error::failed("need exactly one input and one output"));
            }
            self.channels = Some(channels);
            Ok(())
        }

        fn on_child(
            &mut self,
            _base: &mut Base,
            tag: &str,
            _child: &Channel,
            msg: &Msg,
        ) -> Result<()> {
            let channels = self.channels.as_ref().expect("initialized");
            if channels.tag_of(tag) != "input" || msg.msg_type != MsgType::Data {
                return Ok(());
            }
            let out = channels.first("output").expect("has output");
            out.post(msg)
        }

        fn process(
            &mut self,
            _base: &mut Base,
            _timeout: Duration,
            _flags: u32,
        ) -> Result<bool> {
            Ok(false)
        }
    }

    fn register_forward(ctx: &Context) {
        ctx.register("forward", || {
            Box::new(Forward { channels: None }) as Box<dyn ChannelImpl>
        })
        .unwrap();
    }

    #[test]
    fn test_logic_forwards_between_tagged_channels() {
        let ctx = Context::new();
        register_forward(&ctx);

        // Two direct pairs: the test holds the outer ends, the logic the
        // inner ones.
        let ti = ctx.channel("direct://;name=test/in").unwrap();
        let to = ctx.channel("direct://;name=test/out").unwrap();
        let li = ctx.channel("direct://;name=in;master=test/in").unwrap();
        let lo = ctx.channel("direct://;name=out;master=test/out").unwrap();
        for c in [&ti, &to, &li, &lo] {
            c.open(&Config::new()).unwrap();
        }

        let logic = ctx
            .channel("forward://;name=logic;wirelink.channel.input=in;wirelink.channel.output=out")
            .unwrap();
        logic.open(&Config::new()).unwrap();

        let got: Rc<RefCell<Vec<(i64, Vec<u8>)>>> = Rc::default();
        let sink = got.clone();
        to.callback_add(
            move |m| sink.borrow_mut().push((m.seq, m.data.to_vec())),
            MsgMask::DATA,
        );

        ti.post(&Msg::data(10, 1, &b"xxx"[..])).unwrap();
        ti.post(&Msg::data(10, 2, &b"zzz"[..])).unwrap();

        assert_eq!(
            *got.borrow(),
            vec![(1, b"xxx".to_vec()), (2, b"zzz".to_vec())]
        );
    }

    #[test]
    fn test_logic_requires_named_channels() {
        let ctx = Context::new();
        register_forward(&ctx);
        assert!(ctx
            .channel("forward://;name=logic;wirelink.channel.input=missing")
            .is_err());
    }

    #[test]
    fn test_logic_rejects_wrong_cardinality() {
        let ctx = Context::new();
        register_forward(&ctx);
        let i = ctx.channel("direct://;name=only-in").unwrap();
        let _ = i;
        assert!(ctx
            .channel("forward://;name=logic2;wirelink.channel.input=only-in")
            .is_err());
    }
}
