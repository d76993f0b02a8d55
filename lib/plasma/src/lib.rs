//! An evented server runtime: a single-threaded reactor over the OS
//! readiness primitive, an incremental HTTP/1.1 stack, RFC 6455
//! WebSockets, Server-Sent-Events, and an in-process pub/sub bus feeding
//! upgraded connections. Application callbacks optionally run on a
//! bounded worker pool with per-connection ordering.

#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]

pub mod buffer;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod poll;
pub mod protocol;
pub mod pubsub;
pub mod reactor;
pub mod service;
pub mod signals;
pub mod sse;
pub mod timer;
pub mod url;
pub mod workers;
pub mod ws;

pub use crate::config::Config;
pub use crate::conn::{Chunk, ConnTx, Stream};
pub use crate::error::{HttpError, NetError, ServerError};
pub use crate::http::handle::{Cookie, Handle};
pub use crate::protocol::Protocol;
pub use crate::pubsub::{Bus, ChannelKey, Encoder, Message, Overflow};
pub use crate::reactor::{IoCtx, Reactor, Remote};
pub use crate::service::{Service, WsAccept};
