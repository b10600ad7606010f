//! Core types for wirelink
//!
//! This crate defines the vocabulary shared by every wirelink channel:
//!
//! - [`Msg`] - the unit of data flowing through a channel
//! - [`State`] - the channel lifecycle state machine
//! - [`DCaps`] - demand capabilities a channel advertises to its driver
//! - value parsing helpers for URL/config parameters (`1kb`, `10ms`, `yes`)
//!
//! Everything here is deliberately small and dependency-light: transports,
//! the config tree and the stream server all build on these types.

pub mod error;
pub mod message;
pub mod state;
pub mod value;

pub use error::{Error, Result};
pub use message::{Msg, MsgMask, MsgType, MSGID_CHANNEL_ADD, MSGID_CHANNEL_DEL, MSGID_UPDATE_DCAPS};
pub use state::{DCaps, State};
