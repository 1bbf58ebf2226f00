//! Socket handling: the client listener, per-client connection tasks, and
//! upstream network sessions.

pub mod downstream;
pub mod listener;
pub mod tls;
pub mod upstream;

pub use listener::Listener;
