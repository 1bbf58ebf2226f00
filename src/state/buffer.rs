//! Buffers: channels and private-message correspondents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A channel or query the user has state with on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    /// Display name; the owning map keys on its RFC 1459 lowercase form.
    pub name: String,
    /// Channel key, when one was used to join.
    pub key: String,
    /// Whether the user is currently in the channel.
    pub joined: bool,
    /// Last topic seen.
    pub topic: String,
    /// Channel vs. query, decided from CHANTYPES at creation time.
    pub is_channel: bool,
    /// Last time the user saw this buffer.
    pub last_seen: DateTime<Utc>,
}

impl Buffer {
    /// New buffer with the given name and channel-ness, everything else
    /// empty.
    pub fn new(name: &str, is_channel: bool) -> Self {
        Buffer {
            name: name.to_string(),
            key: String::new(),
            joined: false,
            topic: String::new(),
            is_channel,
            last_seen: Utc::now(),
        }
    }
}
