//! `arbor` is an in-process/network messaging fabric. Endpoint hosts
//! (leaves) own named, typed terminals; routing hubs (nodes) interconnect
//! any number of communicators; connections join two communicators either
//! in-process or over TCP. On top of that substrate the fabric implements
//! nine terminal messaging patterns, from simple existence detection
//! (deaf-mute) to cached master/slave state distribution and
//! scatter-gather RPC.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod base;
pub mod connections;
pub mod core;
pub mod errors;
pub mod identity;
pub mod logging;
pub mod msg;
pub mod objects;
pub mod scheduling;

/// Library version, exchanged during the TCP handshake. Peers must agree on
/// major.minor to interoperate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fixed size of the zero-padded version string on the wire.
pub const VERSION_INFO_SIZE: usize = 32;

/// Magic prefix opening every TCP handshake.
pub const MAGIC_PREFIX: [u8; 6] = *b"ARBOR ";

/// Upper bound on the identification blob exchanged during the handshake.
pub const MAX_IDENTIFICATION_SIZE: usize = 1024;

pub use crate::errors::{ErrorCode, Result};
pub use crate::identity::{Id, Identifier};
