//! Applause engine: permission-checked sends and windowed aggregation.
//!
//! # Purpose
//! Raw applause events land in the backend's sorted set, keyed by
//! `(meeting, user)` so repeats inside the counting window collapse. A
//! one-second loop turns the set into per-meeting level deltas, enriches
//! them with the present-user count and publishes the changed meetings as
//! one topic entry. Receivers scan batches newest-first so a lagging client
//! only sees the freshest level.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::backend::Backend;
use crate::datastore::Datastore;
use crate::errors::{IccError, Result};
use crate::topic::{Topic, TopicError};

/// Message delivered to applause subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplauseMsg {
    pub level: usize,
    pub present_users: usize,
}

/// Tick cadences and retention windows. Tests shrink these to keep the
/// scenarios fast; production uses [`ApplauseConfig::default`].
#[derive(Debug, Clone, Copy)]
pub struct ApplauseConfig {
    /// Aggregation tick.
    pub interval: Duration,
    /// Applause counting window.
    pub count_window: Duration,
    /// Topic prune tick.
    pub prune_interval: Duration,
    /// Topic entry retention.
    pub prune_age: Duration,
    /// Sorted-set entries older than this are removed by the prune tick.
    pub clean_age: Duration,
}

impl Default for ApplauseConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            count_window: Duration::from_secs(5),
            prune_interval: Duration::from_secs(5 * 60),
            prune_age: Duration::from_secs(10 * 60),
            clean_age: Duration::from_secs(60),
        }
    }
}

pub struct Applause {
    backend: Arc<dyn Backend>,
    datastore: Arc<dyn Datastore>,
    topic: Arc<Topic>,
    config: ApplauseConfig,
}

impl Applause {
    pub fn new(backend: Arc<dyn Backend>, datastore: Arc<dyn Datastore>) -> Self {
        Self::with_config(backend, datastore, ApplauseConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn Backend>,
        datastore: Arc<dyn Datastore>,
        config: ApplauseConfig,
    ) -> Self {
        Self {
            backend,
            datastore,
            topic: Arc::new(Topic::new()),
            config,
        }
    }

    /// Spawns the aggregation loop and the prune ticker. The aggregation
    /// loop closes the topic on shutdown so parked receivers return.
    pub fn start_background(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let applause = Arc::clone(&self);
        let loop_shutdown = shutdown.clone();
        tokio::spawn(async move { applause.run_loop(loop_shutdown).await });

        tokio::spawn(async move { self.prune_loop(shutdown).await });
    }

    /// Registers that `uid` applauded in `meeting_id`.
    pub async fn send(&self, meeting_id: i32, uid: i32) -> Result<()> {
        if uid == 0 {
            return Err(IccError::not_allowed(
                "Anonymous is not allowed to applause. Please be quiet.",
            ));
        }

        let enabled = self
            .datastore
            .applause_enabled(meeting_id)
            .await
            .context("fetching applause enabled")?;
        if !enabled {
            return Err(IccError::not_allowed(format!(
                "applause is not enabled in meeting {meeting_id}. Please be quiet."
            )));
        }

        if !self.is_in_meeting(uid, meeting_id).await? {
            return Err(IccError::not_allowed(format!(
                "You are not part of meeting {meeting_id}. Please be quiet."
            )));
        }

        let now = unix_now();
        self.backend
            .applause_publish(meeting_id, uid, now)
            .await
            .context("publish applause in backend")?;
        metrics::counter!("icc_applause_sent_total").increment(1);
        Ok(())
    }

    /// Authorization gate for the applause stream: anonymous only where
    /// the meeting allows it, everyone else has to be a member.
    pub async fn can_receive(&self, meeting_id: i32, uid: i32) -> Result<()> {
        if uid == 0 {
            let anonymous = self
                .datastore
                .anonymous_enabled(meeting_id)
                .await
                .context("fetching anonymous enabled")?;
            if !anonymous {
                return Err(IccError::not_allowed("Anonymous is not enabled"));
            }
            return Ok(());
        }

        if !self.is_in_meeting(uid, meeting_id).await? {
            return Err(IccError::not_allowed(format!(
                "You are not part of meeting {meeting_id}."
            )));
        }
        Ok(())
    }

    /// Returns the next applause message for `meeting_id` at cursor `tid`.
    ///
    /// A cursor of 0 resolves immediately with a zero-level baseline so the
    /// client has something to render. Otherwise batches are scanned from
    /// newest to oldest and the freshest entry for the meeting wins.
    pub async fn receive(&self, tid: u64, meeting_id: i32) -> Result<(u64, ApplauseMsg)> {
        if tid == 0 {
            let present_users = self.present_users(meeting_id).await?;
            return Ok((
                self.topic.last_id(),
                ApplauseMsg {
                    level: 0,
                    present_users,
                },
            ));
        }

        let mut tid = tid;
        loop {
            let (next_tid, messages) = match self.topic.receive(tid).await {
                Ok(received) => received,
                Err(TopicError::Closed) => {
                    return Err(IccError::Internal(anyhow::anyhow!("topic is closed")))
                }
            };
            tid = next_tid;

            for raw in messages.iter().rev() {
                if raw.is_empty() {
                    continue;
                }
                let message: HashMap<i32, ApplauseMsg> =
                    serde_json::from_str(raw).context("decoding message from topic")?;
                if let Some(entry) = message.get(&meeting_id) {
                    return Ok((tid, *entry));
                }
            }
        }
    }

    pub fn last_id(&self) -> u64 {
        self.topic.last_id()
    }

    async fn is_in_meeting(&self, uid: i32, meeting_id: i32) -> Result<bool> {
        let level = self
            .datastore
            .organization_management_level(uid)
            .await
            .context("checking for superadmin")?;
        if level == "superadmin" {
            return Ok(true);
        }

        let in_groups = self
            .datastore
            .has_meeting_groups(uid, meeting_id)
            .await
            .context("checking for user groups")?;
        Ok(in_groups)
    }

    /// Present-user count, best effort: datastore misses count as zero.
    async fn present_users(&self, meeting_id: i32) -> Result<usize> {
        self.datastore
            .present_user_count(meeting_id)
            .await
            .context("get present users")
            .map_err(IccError::from)
    }

    /// Samples the backend and publishes the delta for every meeting whose
    /// level changed since the previous snapshot, including transitions to
    /// zero. Unchanged ticks publish nothing.
    async fn aggregate_once(&self, last_applause: &mut HashMap<i32, usize>) -> Result<()> {
        let window_start = unix_now() - self.config.count_window.as_secs() as i64;
        let mut applause = self
            .backend
            .applause_since(window_start)
            .await
            .context("fetching applause")?;

        // Meetings seen last tick but silent now get an explicit zero so
        // the transition is observable.
        for meeting_id in last_applause.keys() {
            applause.entry(*meeting_id).or_insert(0);
        }

        let mut message = HashMap::new();
        for (meeting_id, level) in applause {
            if last_applause.get(&meeting_id).copied().unwrap_or(0) == level {
                continue;
            }
            if level == 0 {
                last_applause.remove(&meeting_id);
            } else {
                last_applause.insert(meeting_id, level);
            }

            // One meeting's lookup failure must not swallow the other
            // deltas of this tick.
            let present_users = match self.present_users(meeting_id).await {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(error = %err, meeting_id, "fetching present users failed");
                    continue;
                }
            };
            message.insert(
                meeting_id,
                ApplauseMsg {
                    level,
                    present_users,
                },
            );
        }

        if message.is_empty() {
            return Ok(());
        }

        let payload = serde_json::to_string(&message).context("encoding message")?;
        self.topic.publish(payload);
        metrics::counter!("icc_applause_snapshots_total").increment(1);
        Ok(())
    }

    async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut last_applause = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.aggregate_once(&mut last_applause).await {
                        tracing::warn!(error = %err, "applause aggregation tick failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        self.topic.close();
    }

    async fn prune_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.prune_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.topic.prune(Instant::now() - self.config.prune_age);
                    let cutoff = unix_now() - self.config.clean_age.as_secs() as i64;
                    if let Err(err) = self.backend.applause_clean_old(cutoff).await {
                        tracing::warn!(error = %err, "cleaning old applause failed");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before unix epoch")
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::datastore::MemoryDatastore;

    fn engine() -> (Arc<MemoryBackend>, Arc<MemoryDatastore>, Applause) {
        let backend = Arc::new(MemoryBackend::new());
        let datastore = Arc::new(MemoryDatastore::new());
        let applause = Applause::new(
            backend.clone() as Arc<dyn Backend>,
            datastore.clone() as Arc<dyn Datastore>,
        );
        (backend, datastore, applause)
    }

    #[tokio::test]
    async fn send_rejects_anonymous() {
        let (_, _, applause) = engine();
        let err = applause.send(1, 0).await.expect_err("not allowed");
        assert_eq!(err.kind(), "not-allowed");
    }

    #[tokio::test]
    async fn send_requires_applause_enabled() {
        let (_, datastore, applause) = engine();
        datastore.add_to_meeting(5, 1);

        let err = applause.send(1, 5).await.expect_err("not allowed");
        assert_eq!(err.kind(), "not-allowed");

        datastore.set_applause_enabled(1, true);
        applause.send(1, 5).await.expect("allowed");
    }

    #[tokio::test]
    async fn send_requires_membership_or_superadmin() {
        let (backend, datastore, applause) = engine();
        datastore.set_applause_enabled(1, true);

        let err = applause.send(1, 5).await.expect_err("not allowed");
        assert_eq!(err.kind(), "not-allowed");

        datastore.set_management_level(5, "superadmin");
        applause.send(1, 5).await.expect("superadmin may applause");

        let counts = backend.applause_since(0).await.expect("since");
        assert_eq!(counts.get(&1), Some(&1));
    }

    #[tokio::test]
    async fn can_receive_gates_anonymous_on_meeting_flag() {
        let (_, datastore, applause) = engine();

        let err = applause.can_receive(1, 0).await.expect_err("not allowed");
        assert_eq!(err.kind(), "not-allowed");

        datastore.set_anonymous_enabled(1, true);
        applause.can_receive(1, 0).await.expect("anonymous ok");
    }

    #[tokio::test]
    async fn can_receive_requires_membership_for_users() {
        let (_, datastore, applause) = engine();

        let err = applause.can_receive(1, 5).await.expect_err("not allowed");
        assert_eq!(err.kind(), "not-allowed");

        datastore.add_to_meeting(5, 1);
        applause.can_receive(1, 5).await.expect("member ok");
    }

    #[tokio::test]
    async fn receive_with_zero_cursor_returns_baseline() {
        let (_, datastore, applause) = engine();
        datastore.set_present_users(1, 3);

        let (tid, msg) = applause.receive(0, 1).await.expect("baseline");
        assert_eq!(tid, applause.last_id());
        assert_eq!(
            msg,
            ApplauseMsg {
                level: 0,
                present_users: 3
            }
        );
    }

    #[tokio::test]
    async fn aggregation_emits_deltas_and_zero_transitions() {
        let (backend, datastore, applause) = engine();
        datastore.set_present_users(1, 4);
        let mut last = HashMap::new();

        // Two distinct users, user 5 twice: level 2.
        let now = unix_now();
        backend.applause_publish(1, 5, now).await.expect("publish");
        backend.applause_publish(1, 5, now).await.expect("publish");
        backend.applause_publish(1, 6, now).await.expect("publish");

        applause.aggregate_once(&mut last).await.expect("tick");
        let (tid, msg) = applause.receive(1, 1).await.expect("receive");
        assert_eq!(
            msg,
            ApplauseMsg {
                level: 2,
                present_users: 4
            }
        );

        // Unchanged tick publishes nothing.
        applause.aggregate_once(&mut last).await.expect("tick");
        assert_eq!(applause.last_id(), tid);

        // Window moved past the events: one explicit zero.
        backend.applause_clean_old(now + 10).await.expect("clean");
        applause.aggregate_once(&mut last).await.expect("tick");
        let (tid, msg) = applause.receive(tid, 1).await.expect("receive");
        assert_eq!(
            msg,
            ApplauseMsg {
                level: 0,
                present_users: 4
            }
        );

        // And only one: the next tick is silent again.
        applause.aggregate_once(&mut last).await.expect("tick");
        assert_eq!(applause.last_id(), tid);
    }

    #[tokio::test]
    async fn receive_takes_the_freshest_entry_for_the_meeting() {
        let (_, _, applause) = engine();
        let tid = applause.last_id();

        applause
            .topic
            .publish(r#"{"1":{"level":1,"present_users":2}}"#.to_string());
        applause
            .topic
            .publish(r#"{"2":{"level":9,"present_users":9}}"#.to_string());
        applause
            .topic
            .publish(r#"{"1":{"level":3,"present_users":2}}"#.to_string());

        let (_, msg) = applause.receive(tid, 1).await.expect("receive");
        assert_eq!(
            msg,
            ApplauseMsg {
                level: 3,
                present_users: 2
            }
        );
    }

    #[tokio::test]
    async fn receive_skips_batches_without_the_meeting() {
        let (_, _, applause) = engine();
        let tid = applause.last_id();
        applause
            .topic
            .publish(r#"{"2":{"level":1,"present_users":1}}"#.to_string());

        let pending = applause.receive(tid, 1);
        let waited =
            tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(waited.is_err(), "no entry for meeting 1 yet");
    }
}
