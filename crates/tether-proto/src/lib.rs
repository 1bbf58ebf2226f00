//! # tether-proto
//!
//! IRC wire protocol support for the tetherd bouncer.
//!
//! The bouncer forwards most client traffic verbatim, so messages keep their
//! verb as an uppercase string rather than a fully typed command enum; a
//! numeric reply is just a three-digit verb. What the crate does provide:
//!
//! - [`Message`] with IRCv3 tags, an optional [`Prefix`], verb, and params,
//!   parsed with `FromStr` and serialized with `Display`
//! - tag value escaping per the IRCv3 message-tags spec
//! - RFC 1459 casemapping ([`irc_to_lower`]) used for buffer keys
//! - ISUPPORT token helpers (CHANTYPES lookup)
//! - [`LineCodec`], a newline-delimited tokio codec with the 512-byte limit

pub mod casemap;
pub mod codec;
pub mod error;
pub mod isupport;
pub mod message;
pub mod prefix;
pub mod tags;

pub use casemap::{irc_eq, irc_to_lower};
pub use codec::LineCodec;
pub use error::ProtocolError;
pub use isupport::{chantypes, is_channel_name, isupport_tokens};
pub use message::{Message, Tag};
pub use prefix::Prefix;
