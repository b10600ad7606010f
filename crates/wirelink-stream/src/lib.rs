//! Durable stream replay for wirelink
//!
//! This crate adds two protocols to a channel context:
//!
//! - [`StreamServer`] (`stream+<child>://`) - publishes a live stream
//!   through its wrapped transport, persists every message in a storage
//!   channel, and serves historical catch-up to late-joining clients from
//!   arbitrary sequence numbers or named blocks, with per-client
//!   backpressure.
//! - [`Blocks`] (`blocks://path`) - the named block index used by the
//!   server to translate symbolic block names (`day:2024-01-02`) into
//!   sequence numbers.
//!
//! ```no_run
//! use wirelink_channel::Context;
//! use wirelink_config::Url;
//!
//! let ctx = Context::new();
//! wirelink_stream::register(&ctx);
//!
//! let url = Url::parse("stream+tcp://0.0.0.0:5555;mode=server;name=feed").unwrap();
//! url.set("request", "tcp://0.0.0.0:5556;mode=server").unwrap();
//! url.set("storage", "file:///var/lib/feed/storage.dat").unwrap();
//! url.set("blocks", "blocks:///var/lib/feed/blocks.idx").unwrap();
//! let server = ctx.channel_url(&url, None).unwrap();
//! ```

pub mod blocks;
pub mod scheme;
pub mod server;

pub use blocks::Blocks;
pub use server::StreamServer;

use wirelink_channel::Context;

/// Register the stream protocols on a context.
pub fn register(ctx: &Context) {
    let _ = ctx.register("stream+", server::StreamServer::boxed);
    let _ = ctx.register("blocks", blocks::Blocks::boxed);
}
