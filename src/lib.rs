//! tetherd - a persistent IRC bouncer.
//!
//! tetherd keeps long-lived sessions to IRC networks on behalf of its
//! users. Clients connect with a `user/network:password` triple, attach to
//! the running upstream session, and can detach at will; the bouncer keeps
//! receiving, tracks channel membership, and logs traffic while nobody is
//! attached. Several clients can share one upstream and see each other's
//! messages.

pub mod config;
pub mod db;
pub mod handlers;
pub mod network;
pub mod shared;
pub mod state;
