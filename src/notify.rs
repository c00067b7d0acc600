//! Notify engine: ingest, publish and per-receiver fan-out.
//!
//! # Purpose
//! A single ingest loop moves messages from the shared stream into the
//! local topic. Each receiver session drains the topic from its own cursor,
//! filters by the message's addressing tuple and writes matching messages
//! as newline-delimited JSON into its session channel. Publishing validates
//! the message against the authenticated user and appends it to the shared
//! stream, from where every node (including this one) ingests it.
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::{mpsc, watch};

use crate::backend::Backend;
use crate::channel_id::{ChannelId, ChannelIdGen};
use crate::errors::{IccError, Result};
use crate::topic::Topic;

/// Transient backend errors back off this long before the next read.
const RECEIVE_RETRY: Duration = Duration::from_secs(5);

/// How often expired topic entries are swept, and how long they live.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const PRUNE_AGE: Duration = Duration::from_secs(10 * 60);

/// Inbound notify message as published by a client.
#[derive(Debug, Serialize, Deserialize)]
pub struct NotifyMessage {
    #[serde(default)]
    pub channel_id: ChannelId,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub to_meeting: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_users: Vec<i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to_channels: Vec<String>,

    #[serde(default)]
    pub name: String,

    /// Opaque payload, re-encoded verbatim.
    #[serde(default)]
    pub message: Option<Box<RawValue>>,
}

fn is_zero(value: &i32) -> bool {
    *value == 0
}

impl NotifyMessage {
    /// Whether this message is addressed to the given session.
    fn for_me(&self, meeting_id: i32, uid: i32, cid: &ChannelId) -> bool {
        if self.to_meeting != 0 && self.to_meeting == meeting_id {
            return true;
        }
        if self.to_users.contains(&uid) {
            return true;
        }
        self.to_channels.iter().any(|c| c == cid.as_str())
    }
}

/// Delivered form of a notify message.
#[derive(Serialize)]
struct OutMessage<'a> {
    sender_user_id: i32,
    sender_channel_id: &'a str,
    name: &'a str,
    message: Option<&'a RawValue>,
}

pub struct Notify {
    backend: Arc<dyn Backend>,
    topic: Arc<Topic>,
    cid_gen: ChannelIdGen,
}

impl Notify {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            topic: Arc::new(Topic::new()),
            cid_gen: ChannelIdGen::new(),
        }
    }

    /// Spawns the ingest loop and the topic prune ticker. Both stop when
    /// `shutdown` flips; the ingest loop additionally closes the topic so
    /// parked receivers return.
    pub fn start_background(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let notify = Arc::clone(&self);
        let listen_shutdown = shutdown.clone();
        tokio::spawn(async move { notify.listen(listen_shutdown).await });

        let topic = Arc::clone(&self.topic);
        tokio::spawn(async move { prune_loop(topic, shutdown).await });
    }

    /// Moves messages from the shared stream into the local topic until
    /// shutdown. Transient backend errors are logged and retried after a
    /// fixed backoff; they never reach receiver sessions.
    async fn listen(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let message = tokio::select! {
                received = self.backend.notify_receive() => received,
                _ = shutdown.changed() => break,
            };

            match message {
                Ok(raw) => match String::from_utf8(raw) {
                    Ok(payload) => {
                        tracing::debug!(payload = %payload, "found notify message");
                        metrics::counter!("icc_notify_ingested_total").increment(1);
                        self.topic.publish(payload);
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "notify message is not utf-8, skipping");
                    }
                },
                Err(err) => {
                    tracing::info!(error = %err, "can not receive data from backend");
                    tokio::select! {
                        _ = tokio::time::sleep(RECEIVE_RETRY) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        self.topic.close();
    }

    /// Validates and forwards a notify message from `uid` to the shared
    /// stream. The payload is re-marshalled so only canonical JSON reaches
    /// the stream.
    pub async fn publish(&self, body: &[u8], uid: i32) -> Result<()> {
        let message: NotifyMessage = serde_json::from_slice(body)
            .map_err(|err| IccError::invalid(format!("invalid json: {err}")))?;

        validate_message(&message, uid)?;

        let canonical =
            serde_json::to_vec(&message).context("marshal notify message")?;
        tracing::debug!(message = %String::from_utf8_lossy(&canonical), "saving notify message");
        self.backend
            .notify_publish(&canonical)
            .await
            .context("saving message in backend")?;
        metrics::counter!("icc_notify_published_total").increment(1);
        Ok(())
    }

    /// Runs one receiver session: writes the channel-id header line, then
    /// every matching message as one JSON line into `tx`. Returns when the
    /// session channel closes (client gone) or the topic shuts down.
    pub async fn receive(
        &self,
        tx: mpsc::Sender<Bytes>,
        meeting_id: i32,
        uid: i32,
    ) -> Result<()> {
        let cid = self.cid_gen.generate(uid);

        let header = format!("{{\"channel_id\": \"{cid}\"}}\n");
        if tx.send(Bytes::from(header)).await.is_err() {
            return Ok(());
        }

        let mut tid = self.topic.last_id();
        loop {
            let received = tokio::select! {
                received = self.topic.receive(tid) => received,
                _ = tx.closed() => return Ok(()),
            };
            let Ok((next_tid, messages)) = received else {
                // Topic closed: the process is shutting down.
                return Ok(());
            };
            tid = next_tid;

            for raw in messages {
                if raw.is_empty() {
                    // Seed entry published at topic creation.
                    continue;
                }
                let message: NotifyMessage = serde_json::from_str(&raw)
                    .context("decoding message from topic")?;

                if !message.for_me(meeting_id, uid, &cid) {
                    continue;
                }

                let out = OutMessage {
                    sender_user_id: message.channel_id.uid(),
                    sender_channel_id: message.channel_id.as_str(),
                    name: &message.name,
                    message: message.message.as_deref(),
                };
                let mut line = serde_json::to_vec(&out).context("encoding message")?;
                line.push(b'\n');
                if tx.send(Bytes::from(line)).await.is_err() {
                    return Ok(());
                }
                metrics::counter!("icc_notify_delivered_total").increment(1);
            }
        }
    }
}

fn validate_message(message: &NotifyMessage, uid: i32) -> Result<()> {
    if message.channel_id.uid() != uid {
        return Err(IccError::invalid(format!(
            "invalid channel id `{}`",
            message.channel_id
        )));
    }
    if message.name.is_empty() {
        return Err(IccError::invalid(
            "notify message does not have required field `name`",
        ));
    }
    Ok(())
}

/// Sweeps expired entries out of a topic on a fixed cadence.
pub async fn prune_loop(topic: Arc<Topic>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => topic.prune(Instant::now() - PRUNE_AGE),
            _ = shutdown.changed() => return,
        }
    }
}
