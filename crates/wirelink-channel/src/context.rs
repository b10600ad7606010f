//! Channel context
//!
//! The [`Context`] owns what channels share: the protocol registry, a
//! name -> channel lookup (used by logics wired with
//! `wirelink.channel.<tag>=name`), a root config, and the deferred
//! callback dispatch queue (see the module docs in `chan`).
//!
//! Protocols register a factory under their name; prefix protocols
//! register with a trailing `+` (`busywait+`) and are selected by the
//! first component of the URL's protocol chain, so `busywait+tcp://...`
//! resolves the `busywait+` factory which then builds the `tcp` inner
//! channel from the remainder.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use wirelink_config::{Config, Url};
use wirelink_core::Msg;

use crate::chan::{Channel, ChannelImpl, ChannelShared, Inner};
use crate::error::{Error, Result};

type Factory = Box<dyn Fn() -> Box<dyn ChannelImpl>>;

struct Event {
    source: Weak<ChannelShared>,
    msg: Msg,
}

pub(crate) struct ContextInner {
    protocols: RefCell<HashMap<String, Factory>>,
    names: RefCell<HashMap<String, Weak<ChannelShared>>>,
    config: Config,
    queue: RefCell<VecDeque<Event>>,
    depth: Cell<usize>,
    draining: Cell<bool>,
}

#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A fresh context with the built-in protocols registered.
    pub fn new() -> Context {
        let ctx = Context {
            inner: Rc::new(ContextInner {
                protocols: RefCell::new(HashMap::new()),
                names: RefCell::new(HashMap::new()),
                config: Config::new(),
                queue: RefCell::new(VecDeque::new()),
                depth: Cell::new(0),
                draining: Cell::new(false),
            }),
        };
        crate::register_builtins(&ctx);
        ctx
    }

    /// Shared context-level config; logics browse it to answer ConfigGet.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Register a protocol. Prefix protocols use a trailing `+` in `proto`.
    pub fn register(
        &self,
        proto: &str,
        factory: impl Fn() -> Box<dyn ChannelImpl> + 'static,
    ) -> Result<()> {
        let mut protocols = self.inner.protocols.borrow_mut();
        if protocols.contains_key(proto) {
            return Err(Error::failed(format!("protocol already registered: {}", proto)));
        }
        protocols.insert(proto.to_string(), Box::new(factory));
        Ok(())
    }

    pub fn unregister(&self, proto: &str) -> bool {
        self.inner.protocols.borrow_mut().remove(proto).is_some()
    }

    /// Look up a live channel by name.
    pub fn get(&self, name: &str) -> Option<Channel> {
        let shared = self.inner.names.borrow().get(name)?.upgrade()?;
        Some(Channel(shared))
    }

    /// Create a channel from a URL string.
    pub fn channel(&self, url: &str) -> Result<Channel> {
        self.channel_url(&Url::parse(url)?, None)
    }

    /// Create a channel from a parsed URL, with an optional master.
    pub fn channel_url(&self, url: &Url, master: Option<&Channel>) -> Result<Channel> {
        let proto = url.proto();
        let factory_key = match proto.split_once('+') {
            Some((head, _)) => format!("{}+", head),
            None => proto.clone(),
        };
        let imp = {
            let protocols = self.inner.protocols.borrow();
            let factory = protocols
                .get(&factory_key)
                .ok_or_else(|| Error::UnknownProtocol(proto.clone()))?;
            factory()
        };

        let name = url.get("name").unwrap_or_else(|| "noname".to_string());
        let master_by_name;
        let master = match master {
            Some(m) => Some(m),
            None => match url.get("master") {
                Some(mname) => {
                    master_by_name = self.get(&mname).ok_or_else(|| {
                        Error::failed(format!("master channel not found: {}", mname))
                    })?;
                    Some(&master_by_name)
                }
                None => None,
            },
        };

        let config = Config::new();
        let _ = config.set("state", wirelink_core::State::Closed.as_str());
        let _ = config.set("name", &name);
        let _ = config.set_config("init", &url.config().copy()?);

        let channel = Channel::create(self, name.clone(), config, imp);
        self.inner
            .names
            .borrow_mut()
            .insert(name, Rc::downgrade(&channel.0));

        self.enter();
        let r = {
            let inner = &mut *channel.0.inner.borrow_mut();
            let Inner { base, imp } = inner;
            imp.init(base, url, master)
        };
        self.exit();
        match r {
            Ok(()) => Ok(channel),
            Err(e) => {
                self.inner.names.borrow_mut().remove(channel.name());
                Err(e)
            }
        }
    }

    /// Create a channel around a prepared implementation. Composite
    /// channels use this for children that carry live resources (an
    /// accepted socket) which cannot travel through a URL; `init` is not
    /// called.
    pub(crate) fn spawn(&self, name: &str, imp: Box<dyn ChannelImpl>) -> Channel {
        let config = Config::new();
        let _ = config.set("state", wirelink_core::State::Closed.as_str());
        let _ = config.set("name", name);
        let channel = Channel::create(self, name.to_string(), config, imp);
        self.inner
            .names
            .borrow_mut()
            .insert(name.to_string(), Rc::downgrade(&channel.0));
        channel
    }

    pub(crate) fn push_event(&self, source: Weak<ChannelShared>, msg: Msg) {
        self.inner.queue.borrow_mut().push_back(Event { source, msg });
    }

    /// Queue a message for the observers of an arbitrary channel (the
    /// direct channel delivers into its peer this way).
    pub(crate) fn emit_for(&self, target: Weak<ChannelShared>, msg: Msg) {
        self.push_event(target, msg);
    }

    pub(crate) fn enter(&self) {
        self.inner.depth.set(self.inner.depth.get() + 1);
    }

    pub(crate) fn exit(&self) {
        let depth = self.inner.depth.get() - 1;
        self.inner.depth.set(depth);
        if depth == 0 {
            self.drain();
        }
    }

    /// Deliver queued messages to observers. Runs only at the outermost
    /// runtime call, when no channel is borrowed; re-entrant calls made by
    /// observers queue further events which this same loop picks up, so
    /// delivery stays FIFO.
    fn drain(&self) {
        if self.inner.draining.get() {
            return;
        }
        self.inner.draining.set(true);
        loop {
            let event = self.inner.queue.borrow_mut().pop_front();
            let Some(event) = event else { break };
            let Some(shared) = event.source.upgrade() else {
                continue;
            };
            let callbacks = shared.callbacks.borrow().snapshot(event.msg.msg_type);
            for f in callbacks {
                f(&event.msg);
            }
        }
        self.inner.draining.set(false);
    }
}
