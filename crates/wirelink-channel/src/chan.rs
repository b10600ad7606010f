//! Channel handle, implementation trait and shared base state
//!
//! A [`Channel`] is the public, cheaply-cloneable handle; the protocol
//! behavior lives in a [`ChannelImpl`] behind it. Both share a [`Base`]
//! holding what every channel owns: the lifecycle state, demand
//! capabilities, the config subtree, and the child list.
//!
//! ## Callback dispatch
//!
//! Observers register with a type mask and receive messages in insertion
//! order. Emission is *deferred*: `Base::callback` queues the message on
//! the context, and the queue is drained when the outermost runtime call
//! (`open`/`close`/`post`/`process`) unwinds. By the time an observer runs,
//! no channel is borrowed, so observers are free to post, close or
//! unregister - including into the channel that emitted the message.
//! Dispatch iterates a snapshot of the registry, so the set of observers
//! can change mid-dispatch. Per-channel delivery order is preserved
//! (single FIFO queue).
//!
//! ## Children
//!
//! `Base::child_add` attaches a sub-channel under a tag: the parent
//! observes every message of the child through [`ChannelImpl::on_child`],
//! the child's config is published in the parent's config under the tag,
//! and observers of the parent see `Channel` Add/Del messages. Composite
//! channels (tcp server, stream server, prefixes) are built from this.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use wirelink_config::{Config, Url};
use wirelink_core::{DCaps, Msg, MsgMask, MsgType, State, MSGID_CHANNEL_ADD, MSGID_CHANNEL_DEL, MSGID_UPDATE_DCAPS};

use crate::context::Context;
use crate::error::{Error, Result};

/// How the driver should schedule `process()` calls for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPolicy {
    /// Driven by fd readiness only.
    Never,
    /// Call `process()` on every driver turn.
    Always,
    /// The channel advertises its needs through dcaps.
    Custom,
}

/// Whether `open()` completes synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenPolicy {
    /// The runtime moves the channel to Active after a successful `open`.
    Auto,
    /// The implementation transitions to Active itself (possibly later,
    /// from `process` or a child notification).
    Manual,
}

/// Whether `close()` completes synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosePolicy {
    /// The runtime moves the channel to Closed after `close`.
    Normal,
    /// The implementation transitions to Closed itself.
    Long,
}

/// Protocol hooks. Implementations keep their own fields and receive the
/// shared [`Base`] explicitly, so a hook can both mutate itself and drive
/// the channel machinery.
pub trait ChannelImpl: 'static {
    fn process_policy(&self) -> ProcessPolicy {
        ProcessPolicy::Never
    }

    /// Downcast support for implementations that pair with a master
    /// instance (see the direct channel).
    fn as_any_mut(&mut self) -> Option<&mut dyn std::any::Any> {
        None
    }

    /// One-time setup from the init URL. A failure discards the channel.
    fn init(&mut self, base: &mut Base, url: &Url, master: Option<&Channel>) -> Result<()> {
        let _ = (base, url, master);
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

    fn post(&mut self, base: &mut Base, msg: &Msg) -> Result<()> {
        let _ = (base, msg);
        Err(Error::NotSupported)
    }

    /// Do one unit of work. `Ok(false)` means nothing to do (EAGAIN).
    fn process(&mut self, base: &mut Base, timeout: Duration, flags: u32) -> Result<bool> {
        let _ = (base, timeout, flags);
        Ok(false)
    }

    /// A message from a child added via `Base::child_add`.
    fn on_child(&mut self, base: &mut Base, tag: &str, child: &Channel, msg: &Msg) -> Result<()> {
        let _ = (base, tag, child, msg);
        Ok(())
    }
}

/// Stable handle for unregistering a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

struct CallbackEntry {
    id: u64,
    mask: MsgMask,
    f: Rc<dyn Fn(&Msg)>,
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    entries: Vec<CallbackEntry>,
}

impl Registry {
    fn add(&mut self, mask: MsgMask, f: Rc<dyn Fn(&Msg)>) -> CallbackId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(CallbackEntry { id, mask, f });
        CallbackId(id)
    }

    fn del(&mut self, id: CallbackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id.0);
        before != self.entries.len()
    }

    pub(crate) fn snapshot(&self, msg_type: MsgType) -> Vec<Rc<dyn Fn(&Msg)>> {
        let mask = msg_type.mask();
        self.entries
            .iter()
            .filter(|e| e.mask.contains(mask))
            .map(|e| e.f.clone())
            .collect()
    }
}

struct Child {
    tag: String,
    channel: Channel,
    watch: CallbackId,
}

/// State every channel owns, shared between the runtime and the impl.
pub struct Base {
    name: String,
    ctx: Context,
    selfw: Weak<ChannelShared>,
    state: State,
    dcaps: DCaps,
    fd: Option<i32>,
    config: Config,
    children: Vec<Child>,
    pub open_policy: OpenPolicy,
    pub close_policy: ClosePolicy,
}

impl Base {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn dcaps(&self) -> DCaps {
        self.dcaps
    }

    pub fn fd(&self) -> Option<i32> {
        self.fd
    }

    pub fn set_fd(&mut self, fd: Option<i32>) {
        self.fd = fd;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The `info` subtree of the channel config, for live values.
    pub fn config_info(&self) -> Config {
        self.config.sub_create("info").unwrap_or_default()
    }

    /// Transition the lifecycle state, emitting a State message.
    ///
    /// Illegal transitions are rejected and leave the state unchanged.
    pub fn set_state(&mut self, state: State) -> Result<()> {
        let new = self.state.transition(state)?;
        tracing::debug!(channel = %self.name, from = %self.state, to = %new, "state change");
        self.state = new;
        let _ = self.config.set("state", new.as_str());
        self.emit(Msg::state(new));
        Ok(())
    }

    /// Report a failure: log it and push the channel to Error.
    pub fn state_fail(&mut self, message: impl AsRef<str>) {
        tracing::error!(channel = %self.name, "{}", message.as_ref());
        if self.state.can_transition(State::Error) {
            let _ = self.set_state(State::Error);
        }
    }

    /// Update dcaps; a change is announced with a State-type message
    /// carrying [`MSGID_UPDATE_DCAPS`] so the driver can adjust its poll
    /// set.
    pub fn update_dcaps(&mut self, set: DCaps, clear: DCaps) {
        let new = (self.dcaps - clear) | set;
        if new == self.dcaps {
            return;
        }
        self.dcaps = new;
        let msg = Msg::new(MsgType::State, MSGID_UPDATE_DCAPS)
            .with_data(Bytes::copy_from_slice(&new.bits().to_le_bytes()));
        self.emit(msg);
    }

    /// Set or clear the Pending dcap.
    pub fn dcaps_pending(&mut self, pending: bool) {
        if pending {
            self.update_dcaps(DCaps::PENDING, DCaps::empty());
        } else {
            self.update_dcaps(DCaps::empty(), DCaps::PENDING);
        }
    }

    /// Queue a message for this channel's observers.
    pub fn callback(&mut self, msg: Msg) {
        self.emit(msg);
    }

    /// Queue a Data message for this channel's observers.
    pub fn callback_data(&mut self, msg: Msg) {
        debug_assert_eq!(msg.msg_type, MsgType::Data);
        self.emit(msg);
    }

    fn emit(&self, msg: Msg) {
        self.ctx.push_event(self.selfw.clone(), msg);
    }

    pub(crate) fn self_weak(&self) -> Weak<ChannelShared> {
        self.selfw.clone()
    }

    /// Attach a sub-channel. The parent starts observing every message of
    /// the child through [`ChannelImpl::on_child`]; the child config is
    /// published in the parent config under `tag`; parent observers get a
    /// Channel/Add message.
    pub fn child_add(&mut self, child: &Channel, tag: &str) -> Result<()> {
        if self.children.iter().any(|c| c.channel.ptr_eq(child)) {
            return Err(Error::DuplicateChild(child.name().to_string()));
        }
        let parentw = self.selfw.clone();
        let childw = Rc::downgrade(&child.0);
        let tag_owned = tag.to_string();
        let watch = child.callback_add_rc(
            MsgMask::ALL,
            Rc::new(move |msg: &Msg| {
                let (Some(parent), Some(child)) = (parentw.upgrade(), childw.upgrade()) else {
                    return;
                };
                let child = Channel(child);
                let r = {
                    let inner = &mut *parent.inner.borrow_mut();
                    inner.imp.on_child(&mut inner.base, &tag_owned, &child, msg)
                };
                if let Err(e) = r {
                    tracing::error!(child = %child.name(), "child callback failed: {}", e);
                }
            }),
        );
        if !tag.is_empty() {
            // Reopen of a long-lived composite republishes the same tag.
            let _ = self.config.remove(tag);
            self.config.set_config(tag, &child.config())?;
        }
        self.children.push(Child {
            tag: tag.to_string(),
            channel: child.clone(),
            watch,
        });
        self.emit(Msg::channel(MSGID_CHANNEL_ADD, child.name()));
        Ok(())
    }

    /// Detach a sub-channel; the inverse of [`Base::child_add`].
    pub fn child_del(&mut self, child: &Channel) -> Result<()> {
        let idx = self
            .children
            .iter()
            .position(|c| c.channel.ptr_eq(child))
            .ok_or_else(|| Error::failed(format!("not a child: {}", child.name())))?;
        let entry = self.children.remove(idx);
        entry.channel.callback_del(entry.watch);
        if !entry.tag.is_empty() {
            let _ = self.config.remove(&entry.tag);
        }
        self.emit(Msg::channel(MSGID_CHANNEL_DEL, child.name()));
        Ok(())
    }

    pub fn children(&self) -> Vec<Channel> {
        self.children.iter().map(|c| c.channel.clone()).collect()
    }
}

pub(crate) struct Inner {
    pub(crate) base: Base,
    pub(crate) imp: Box<dyn ChannelImpl>,
}

pub(crate) struct ChannelShared {
    pub(crate) name: String,
    pub(crate) config: Config,
    pub(crate) callbacks: RefCell<Registry>,
    pub(crate) inner: RefCell<Inner>,
}

/// Public channel handle.
#[derive(Clone)]
pub struct Channel(pub(crate) Rc<ChannelShared>);

impl Channel {
    pub(crate) fn create(
        ctx: &Context,
        name: String,
        config: Config,
        imp: Box<dyn ChannelImpl>,
    ) -> Channel {
        let ctx = ctx.clone();
        let shared = Rc::new_cyclic(|weak: &Weak<ChannelShared>| {
            let base = Base {
                name: name.clone(),
                ctx,
                selfw: weak.clone(),
                state: State::Closed,
                dcaps: DCaps::empty(),
                fd: None,
                config: config.clone(),
                children: Vec::new(),
                open_policy: OpenPolicy::Auto,
                close_policy: ClosePolicy::Normal,
            };
            ChannelShared {
                name,
                config,
                callbacks: RefCell::new(Registry::default()),
                inner: RefCell::new(Inner { base, imp }),
            }
        });
        Channel(shared)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn config(&self) -> Config {
        self.0.config.clone()
    }

    pub fn state(&self) -> State {
        self.0.inner.borrow().base.state
    }

    pub fn dcaps(&self) -> DCaps {
        self.0.inner.borrow().base.dcaps
    }

    pub fn fd(&self) -> Option<i32> {
        self.0.inner.borrow().base.fd
    }

    pub fn children(&self) -> Vec<Channel> {
        self.0.inner.borrow().base.children()
    }

    pub fn context(&self) -> Context {
        self.0.inner.borrow().base.ctx.clone()
    }

    pub fn ptr_eq(&self, other: &Channel) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn callback_add(&self, f: impl Fn(&Msg) + 'static, mask: MsgMask) -> CallbackId {
        self.callback_add_rc(mask, Rc::new(f))
    }

    pub(crate) fn callback_add_rc(&self, mask: MsgMask, f: Rc<dyn Fn(&Msg)>) -> CallbackId {
        self.0.callbacks.borrow_mut().add(mask, f)
    }

    pub fn callback_del(&self, id: CallbackId) -> bool {
        self.0.callbacks.borrow_mut().del(id)
    }

    /// Open the channel. Legal only in Closed state. The channel finishes
    /// in Active (synchronous open) or stays Opening with `process()`
    /// driving completion.
    pub fn open(&self, params: &Config) -> Result<()> {
        let ctx = self.context();
        ctx.enter();
        let r = self.open_inner(params);
        ctx.exit();
        r
    }

    /// `open()` with `k=v;k=v` parameters.
    pub fn open_props(&self, props: &str) -> Result<()> {
        let params = Config::from_props(props)?;
        self.open(&params)
    }

    fn open_inner(&self, params: &Config) -> Result<()> {
        let inner = &mut *self.0.inner.borrow_mut();
        if inner.base.state != State::Closed {
            return Err(Error::InvalidState {
                op: "open",
                state: inner.base.state,
            });
        }
        inner.base.set_state(State::Opening)?;
        let _ = inner.base.config.remove("open");
        let _ = inner.base.config.set_config("open", &params.copy()?);
        match inner.imp.open(&mut inner.base, params) {
            Ok(()) => {
                if inner.base.open_policy == OpenPolicy::Auto && inner.base.state == State::Opening
                {
                    inner.base.set_state(State::Active)?;
                }
                Ok(())
            }
            Err(e) => {
                inner.base.state_fail(format!("open failed: {}", e));
                Err(e)
            }
        }
    }

    /// Close the channel. `force` tears down immediately; a graceful close
    /// of a composite may stay in Closing until its children drain.
    pub fn close(&self, force: bool) {
        let ctx = self.context();
        ctx.enter();
        self.close_inner(force);
        ctx.exit();
    }

    fn close_inner(&self, force: bool) {
        let inner = &mut *self.0.inner.borrow_mut();
        match inner.base.state {
            State::Closed | State::Destroy => return,
            State::Closing if !force => return,
            _ => {}
        }
        if inner.base.state != State::Closing {
            if let Err(e) = inner.base.set_state(State::Closing) {
                tracing::error!(channel = %inner.base.name, "close: {}", e);
                return;
            }
        }
        if let Err(e) = inner.imp.close(&mut inner.base, force) {
            tracing::error!(channel = %inner.base.name, "close failed: {}", e);
        }
        if force || inner.base.close_policy == ClosePolicy::Normal {
            if inner.base.state == State::Closing {
                let _ = inner.base.set_state(State::Closed);
            }
        }
    }

    /// Post a message into the channel. Requires Active state; failures do
    /// not change the channel state.
    pub fn post(&self, msg: &Msg) -> Result<()> {
        let ctx = self.context();
        ctx.enter();
        let r = self.post_inner(msg);
        ctx.exit();
        r
    }

    fn post_inner(&self, msg: &Msg) -> Result<()> {
        let inner = &mut *self.0.inner.borrow_mut();
        if inner.base.state != State::Active {
            return Err(Error::InvalidState {
                op: "post",
                state: inner.base.state,
            });
        }
        inner.imp.post(&mut inner.base, msg)
    }

    /// Drive the channel: do one unit of work. `Ok(false)` means there was
    /// nothing to do. Errors push the channel to Error state.
    pub fn process(&self) -> Result<bool> {
        let ctx = self.context();
        ctx.enter();
        let r = self.process_inner();
        ctx.exit();
        r
    }

    fn process_inner(&self) -> Result<bool> {
        let inner = &mut *self.0.inner.borrow_mut();
        if inner.base.dcaps.contains(DCaps::SUSPEND) {
            return Ok(false);
        }
        if matches!(inner.base.state, State::Closed | State::Destroy) {
            return Ok(false);
        }
        match inner.imp.process(&mut inner.base, Duration::ZERO, 0) {
            Ok(did_work) => Ok(did_work),
            Err(e) => {
                inner.base.state_fail(format!("process failed: {}", e));
                Err(e)
            }
        }
    }

    /// Pause processing of this channel and its children.
    pub fn suspend(&self) {
        let ctx = self.context();
        ctx.enter();
        self.suspend_inner(true);
        ctx.exit();
    }

    fn suspend_inner(&self, permanent: bool) {
        let children = {
            let inner = &mut *self.0.inner.borrow_mut();
            let mut set = DCaps::SUSPEND;
            if permanent {
                set |= DCaps::SUSPEND_PERMANENT;
            }
            inner.base.update_dcaps(set, DCaps::empty());
            inner.base.children()
        };
        for child in children {
            child.suspend_inner(false);
        }
    }

    /// Resume a suspended channel. Children suspended explicitly stay
    /// suspended.
    pub fn resume(&self) {
        let ctx = self.context();
        ctx.enter();
        self.resume_inner(true);
        ctx.exit();
    }

    fn resume_inner(&self, explicit: bool) {
        let children = {
            let inner = &mut *self.0.inner.borrow_mut();
            if !explicit && inner.base.dcaps.contains(DCaps::SUSPEND_PERMANENT) {
                return;
            }
            inner
                .base
                .update_dcaps(DCaps::empty(), DCaps::SUSPEND | DCaps::SUSPEND_PERMANENT);
            inner.base.children()
        };
        for child in children {
            child.resume_inner(false);
        }
    }
}
