//! Per-session channel identifiers.
//!
//! A channel id is the opaque token `"<instance-tag>:<user-id>:<seq>"`
//! handed to every receiver session. Clients echo it back on publish; the
//! only structure they may rely on is that the owning user id is
//! recoverable by text parsing.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Parsed channel id. Unparseable input is kept verbatim with uid 0 so
/// validation downstream can reject it against the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelId {
    raw: String,
    uid: i32,
}

impl ChannelId {
    /// The user id encoded in the token, or 0 when the token is opaque
    /// garbage.
    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn parse(raw: String) -> Self {
        let uid = match raw.split(':').collect::<Vec<_>>()[..] {
            [_tag, uid, _seq] => uid.parse().unwrap_or(0),
            _ => 0,
        };
        Self { raw, uid }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for ChannelId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::parse(String::deserialize(deserializer)?))
    }
}

/// Process-local channel id mint: an instance tag unique per process start
/// plus a monotonically increasing session counter.
#[derive(Debug)]
pub struct ChannelIdGen {
    instance: String,
    seq: AtomicU64,
}

impl ChannelIdGen {
    pub fn new() -> Self {
        let mut instance = uuid::Uuid::new_v4().simple().to_string();
        instance.truncate(8);
        Self {
            instance,
            seq: AtomicU64::new(0),
        }
    }

    pub fn generate(&self, uid: i32) -> ChannelId {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        ChannelId {
            raw: format!("{}:{}:{}", self.instance, uid, seq),
            uid,
        }
    }
}

impl Default for ChannelIdGen {
    fn default() -> Self {
        Self::new()
    }
}
