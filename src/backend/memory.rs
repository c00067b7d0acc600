//! In-process backend used by tests and single-node development.
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;

use super::{Backend, BackendError, Result};

/// Backend double with the same once-per-member applause semantics as the
/// sorted set. Notify messages flow through an unbounded channel, so
/// `notify_receive` naturally only sees messages published after startup.
pub struct MemoryBackend {
    notify_tx: mpsc::UnboundedSender<Vec<u8>>,
    notify_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    // member (meeting, user) -> latest score.
    applause: StdMutex<HashMap<(i32, i32), i64>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            notify_tx,
            notify_rx: Mutex::new(notify_rx),
            applause: StdMutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn notify_publish(&self, message: &[u8]) -> Result<()> {
        self.notify_tx
            .send(message.to_vec())
            .map_err(|_| BackendError::Other("notify channel closed".to_string()))
    }

    async fn notify_receive(&self) -> Result<Vec<u8>> {
        let mut rx = self.notify_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| BackendError::Other("notify channel closed".to_string()))
    }

    async fn applause_publish(&self, meeting_id: i32, user_id: i32, timestamp: i64) -> Result<()> {
        self.applause
            .lock()
            .expect("applause lock")
            .insert((meeting_id, user_id), timestamp);
        Ok(())
    }

    async fn applause_since(&self, since: i64) -> Result<HashMap<i32, usize>> {
        let applause = self.applause.lock().expect("applause lock");
        let mut counts = HashMap::new();
        for ((meeting_id, _user_id), score) in applause.iter() {
            if *score >= since {
                *counts.entry(*meeting_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn applause_clean_old(&self, older_than: i64) -> Result<()> {
        self.applause
            .lock()
            .expect("applause lock")
            .retain(|_, score| *score >= older_than);
        Ok(())
    }
}
