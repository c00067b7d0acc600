//! Redis implementation of the backend.
//!
//! Notify messages travel through the stream `icc-notify` (single field
//! `content`); applause lives in the sorted set `applause` with member
//! `"<meeting_id>:<user_id>"` and score = unix seconds. Short operations
//! check a connection out of a pool and release it before returning; the
//! blocking stream read holds a dedicated connection instead, because it
//! parks for arbitrarily long.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use mobc::Pool;
use mobc_redis::RedisConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::Mutex;

use super::{decode_applause_member, encode_applause_member, Backend, BackendError, Result};

const NOTIFY_KEY: &str = "icc-notify";
const NOTIFY_FIELD: &str = "content";
const APPLAUSE_KEY: &str = "applause";

const POOL_MAX_OPEN: u64 = 100;
const POOL_MAX_IDLE: u64 = 10;
const POOL_GET_TIMEOUT: Duration = Duration::from_secs(10);

/// State of the single notify consumer loop.
///
/// The connection is taken out of the slot for the duration of a read and
/// only put back on success, so a cancelled read can never hand a desynced
/// connection to the next call.
#[derive(Default)]
struct NotifyReader {
    conn: Option<redis::aio::Connection>,
    last_id: Option<String>,
}

pub struct RedisBackend {
    client: redis::Client,
    pool: Pool<RedisConnectionManager>,
    reader: Mutex<NotifyReader>,
}

impl RedisBackend {
    pub fn new(addr: &str) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{addr}"))?;
        let manager = RedisConnectionManager::new(client.clone());
        let pool = Pool::builder()
            .max_open(POOL_MAX_OPEN)
            .max_idle(POOL_MAX_IDLE)
            .get_timeout(Some(POOL_GET_TIMEOUT))
            .build(manager);
        Ok(Self {
            client,
            pool,
            reader: Mutex::new(NotifyReader::default()),
        })
    }

    /// Blocks until a PING succeeds, retrying every 500 ms. Gives the
    /// service a usable backend before the listeners start.
    pub async fn wait(&self) {
        loop {
            match self.ping().await {
                Ok(()) => return,
                Err(err) => {
                    tracing::info!(error = %err, "waiting for redis");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        redis::cmd("PING").query_async::<_, ()>(&mut *conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn notify_publish(&self, message: &[u8]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.xadd::<_, _, _, _, ()>(NOTIFY_KEY, "*", &[(NOTIFY_FIELD, message)])
            .await?;
        Ok(())
    }

    async fn notify_receive(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        loop {
            let mut conn = match reader.conn.take() {
                Some(conn) => conn,
                None => self.client.get_async_connection().await?,
            };
            // "$" starts at "from now"; afterwards we resume at the last
            // delivered entry.
            let cursor = reader.last_id.clone().unwrap_or_else(|| "$".to_string());
            let options = StreamReadOptions::default().count(1).block(0);
            let reply: StreamReadReply = conn
                .xread_options(&[NOTIFY_KEY], &[cursor.as_str()], &options)
                .await?;

            let entry = reply
                .keys
                .into_iter()
                .find(|key| key.key == NOTIFY_KEY)
                .and_then(|key| key.ids.into_iter().next());
            let Some(entry) = entry else {
                // BLOCK 0 should not return empty; treat it as a spurious
                // wakeup and read again on the same connection.
                reader.conn = Some(conn);
                continue;
            };

            reader.last_id = Some(entry.id.clone());
            reader.conn = Some(conn);

            let Some(content) = entry.map.get(NOTIFY_FIELD) else {
                return Err(BackendError::Other(format!(
                    "stream entry {} has no `{NOTIFY_FIELD}` field",
                    entry.id
                )));
            };
            return Ok(redis::from_redis_value(content)?);
        }
    }

    async fn applause_publish(&self, meeting_id: i32, user_id: i32, timestamp: i64) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.zadd::<_, _, _, ()>(
            APPLAUSE_KEY,
            encode_applause_member(meeting_id, user_id),
            timestamp,
        )
        .await?;
        Ok(())
    }

    async fn applause_since(&self, since: i64) -> Result<HashMap<i32, usize>> {
        let mut conn = self.pool.get().await?;
        let members: Vec<String> = conn.zrangebyscore(APPLAUSE_KEY, since, "+inf").await?;

        let mut counts = HashMap::new();
        for member in &members {
            match decode_applause_member(member) {
                Some(meeting_id) => *counts.entry(meeting_id).or_insert(0) += 1,
                None => tracing::warn!(member, "malformed applause member"),
            }
        }
        Ok(counts)
    }

    async fn applause_clean_old(&self, older_than: i64) -> Result<()> {
        let mut conn = self.pool.get().await?;
        conn.zrembyscore::<_, _, _, ()>(APPLAUSE_KEY, 0, older_than - 1)
            .await?;
        Ok(())
    }
}
