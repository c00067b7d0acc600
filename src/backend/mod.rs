//! Pub/sub substrate shared by all nodes of the service.
//!
//! # Purpose
//! The backend distributes notify messages through a cluster-wide stream
//! and stores raw applause events in a sorted set. Engines talk to it
//! through the [`Backend`] trait; production uses [`RedisBackend`], tests
//! use [`MemoryBackend`].
use std::collections::HashMap;

use async_trait::async_trait;

mod memory;
mod redis;

pub use memory::MemoryBackend;
pub use redis::RedisBackend;

pub type Result<T> = std::result::Result<T, BackendError>;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("checkout redis connection: {0}")]
    Pool(#[from] mobc::Error<::redis::RedisError>),

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Appends a validated notify message to the shared stream.
    async fn notify_publish(&self, message: &[u8]) -> Result<()>;

    /// Blocking read of the next notify message after this process's own
    /// cursor. The cursor starts at "from now": messages appended before
    /// the first call are never returned. Only one consumer loop per
    /// process is expected.
    async fn notify_receive(&self) -> Result<Vec<u8>>;

    /// Registers applause from a user in a meeting. May be called any
    /// number of times; the store counts each `(meeting, user)` pair once
    /// within any score window because the score is overwritten.
    async fn applause_publish(&self, meeting_id: i32, user_id: i32, timestamp: i64) -> Result<()>;

    /// Number of distinct users with applause at or after `since`, per
    /// meeting.
    async fn applause_since(&self, since: i64) -> Result<HashMap<i32, usize>>;

    /// Drops applause entries with a score strictly below `older_than`.
    async fn applause_clean_old(&self, older_than: i64) -> Result<()>;
}

/// Sorted-set member for one `(meeting, user)` applause source.
fn encode_applause_member(meeting_id: i32, user_id: i32) -> String {
    format!("{meeting_id}:{user_id}")
}

fn decode_applause_member(member: &str) -> Option<i32> {
    let (meeting, _user) = member.split_once(':')?;
    meeting.parse().ok()
}
