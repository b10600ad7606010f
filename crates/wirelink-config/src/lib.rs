//! Hierarchical configuration tree for wirelink
//!
//! A [`Config`] is a shared, mutable, ordered key tree. It backs three
//! different jobs in the library:
//!
//! 1. Channel URLs and their parameters ([`Url`] is a typed view over a
//!    subtree).
//! 2. Open parameters passed to `Channel::open`.
//! 3. The live per-channel config exposing `state`, `init`, `open` and
//!    `info.*` values, where `info` entries can be callbacks recomputed on
//!    every read (a channel publishes its last sequence number this way).
//!
//! ## Value kinds
//!
//! Each node holds one of: nothing, an inline string, a callback
//! `Fn() -> String`, or a symbolic link (a relative path of `..` hops
//! followed by names). Links are resolved transparently during `get`,
//! `browse` and path walks; resolution is bounded by
//! [`LINK_DEPTH_LIMIT`] hops and reports a link cycle beyond that.
//!
//! ## Sharing
//!
//! Nodes are reference counted; parents hold strong references to children
//! and children keep weak back-pointers, so a subtree can be published into
//! another tree (`set_config`) without copies. Every node carries its own
//! `RwLock`; locks are taken parent before child.

pub mod error;
pub mod tree;
pub mod url;

pub use error::{Error, Result};
pub use tree::{Config, LINK_DEPTH_LIMIT};
pub use url::Url;
