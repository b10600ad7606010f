//! Channel runtime for wirelink
//!
//! Channels are data-carrying endpoints with a uniform lifecycle
//! (`Closed -> Opening -> Active -> Closing -> Closed`, with `Error` as
//! the failure sink), a message-passing interface (`post` in,
//! callbacks out) and a composition model: channels own children, parents
//! observe child state, and URL protocol chains (`busywait+tcp://...`)
//! assemble wrappers declaratively.
//!
//! The runtime is single-threaded and cooperative: `process()`, `post()`
//! and all callbacks run on the owning thread, driven by an external
//! poller that watches each channel's fd and demand capabilities. No
//! operation blocks (the busywait prefix is the documented exception).
//!
//! ## Built-in protocols
//!
//! | protocol | description |
//! |---|---|
//! | `null://` | discard sink |
//! | `direct://` | in-process loopback pair |
//! | `file://path` | append-only block-indexed message log |
//! | `tcp://host:port` | non-blocking stream sockets, client or server |
//! | `busywait+` | delay prefix |
//! | `gen+` | sequence generator prefix |
//! | `control://` | control-plane fan-out logic |
//!
//! Custom protocols implement [`ChannelImpl`] and register on a
//! [`Context`].

pub mod busywait;
pub mod chan;
pub mod context;
pub mod control;
pub mod direct;
pub mod error;
pub mod file;
pub mod gen;
pub mod null;
pub mod prefix;
pub mod tagged;
pub mod tcp;

pub use chan::{
    Base, CallbackId, Channel, ChannelImpl, ClosePolicy, OpenPolicy, ProcessPolicy,
};
pub use context::Context;
pub use error::{Error, Result};
pub use prefix::{Prefix, PrefixHook};
pub use tagged::TaggedChannels;

/// Register the built-in protocols on a fresh context.
pub(crate) fn register_builtins(ctx: &Context) {
    let reg = |proto: &str, factory: fn() -> Box<dyn ChannelImpl>| {
        ctx.register(proto, factory)
            .expect("builtin protocols register once");
    };
    reg("null", || Box::new(null::Null));
    reg("direct", || Box::<direct::Direct>::default());
    reg("file", file::File::boxed);
    reg("tcp", tcp::Tcp::boxed);
    reg("busywait+", busywait::BusyWait::boxed);
    reg("gen+", gen::Gen::boxed);
    reg("control", control::Control::boxed);
}
