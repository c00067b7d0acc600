//! In-memory broadcast log with blocking readers.
//!
//! # Purpose
//! One writer appends payloads with strictly increasing ids; any number of
//! readers block on a cursor and, once woken, drain the full suffix of
//! entries beyond it in one call. Entries expire by age through an explicit
//! prune sweep; ids are never reused.
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::watch;

pub type Result<T> = std::result::Result<T, TopicError>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopicError {
    /// The topic was closed while the reader was parked.
    #[error("topic is closed")]
    Closed,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    published_at: Instant,
    payload: String,
}

#[derive(Debug)]
struct State {
    // Oldest entries live at the front; pruned in publish order.
    entries: VecDeque<Entry>,
    last_id: u64,
    closed: bool,
}

/// Broadcast log shared between one publisher and many readers.
///
/// A reader resuming at cursor `t` observes every entry with id `> t` until
/// the topic is closed or the entry was pruned; pruned entries are skipped
/// silently and the cursor moves past the hole.
///
/// ```
/// use icc_service::topic::Topic;
///
/// let topic = Topic::new();
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let cursor = topic.last_id();
///     topic.publish("hello".to_string());
///     let (tid, payloads) = topic.receive(cursor).await.expect("receive");
///     assert_eq!(payloads, vec!["hello".to_string()]);
///     assert_eq!(tid, topic.last_id());
/// });
/// ```
#[derive(Debug)]
pub struct Topic {
    state: Mutex<State>,
    // Carries the latest assigned id; used purely as a wake-up signal so
    // readers re-inspect the log under the lock.
    wake: watch::Sender<u64>,
}

impl Topic {
    /// Creates the topic with a seed entry so `last_id() >= 1` before any
    /// real publish. A cursor of 0 is therefore always behind the log.
    pub fn new() -> Self {
        let topic = Self {
            state: Mutex::new(State {
                entries: VecDeque::new(),
                last_id: 0,
                closed: false,
            }),
            wake: watch::channel(0).0,
        };
        topic.publish(String::new());
        topic
    }

    /// Appends one entry and wakes every parked reader. Never blocks beyond
    /// the internal lock.
    pub fn publish(&self, payload: String) {
        let id = {
            let mut state = self.state.lock().expect("topic lock");
            state.last_id += 1;
            let id = state.last_id;
            state.entries.push_back(Entry {
                id,
                published_at: Instant::now(),
                payload,
            });
            id
        };
        self.wake.send_replace(id);
    }

    /// The most recently assigned id.
    pub fn last_id(&self) -> u64 {
        self.state.lock().expect("topic lock").last_id
    }

    /// Blocks until at least one entry with id beyond `cursor` exists, then
    /// returns all such entries in publish order together with the id of
    /// the last one. Returns [`TopicError::Closed`] once the topic is
    /// closed. Cancellation is dropping the returned future.
    pub async fn receive(&self, cursor: u64) -> Result<(u64, Vec<String>)> {
        // Subscribe before inspecting state so a publish between the check
        // and the await still flips `changed()`.
        let mut wake = self.wake.subscribe();
        loop {
            {
                let state = self.state.lock().expect("topic lock");
                if state.last_id > cursor {
                    let payloads: Vec<String> = state
                        .entries
                        .iter()
                        .filter(|entry| entry.id > cursor)
                        .map(|entry| entry.payload.clone())
                        .collect();
                    // Entries older than the retention window may be gone;
                    // the cursor still advances to the current tail.
                    return Ok((state.last_id, payloads));
                }
                if state.closed {
                    return Err(TopicError::Closed);
                }
            }
            if wake.changed().await.is_err() {
                return Err(TopicError::Closed);
            }
        }
    }

    /// Removes all entries published before `before`. Does not affect
    /// `last_id` or parked readers.
    pub fn prune(&self, before: Instant) {
        let mut state = self.state.lock().expect("topic lock");
        while state
            .entries
            .front()
            .map(|entry| entry.published_at < before)
            .unwrap_or(false)
        {
            state.entries.pop_front();
        }
    }

    /// Marks the topic closed and releases every parked reader with
    /// [`TopicError::Closed`]. Readers with unread entries still drain them
    /// first.
    pub fn close(&self) {
        let last_id = {
            let mut state = self.state.lock().expect("topic lock");
            state.closed = true;
            state.last_id
        };
        self.wake.send_replace(last_id);
    }
}

impl Default for Topic {
    fn default() -> Self {
        Self::new()
    }
}
