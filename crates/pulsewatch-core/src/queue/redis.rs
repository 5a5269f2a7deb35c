//! Redis-backed queue
//!
//! Each queue is a sorted set of message ids ordered by send sequence plus
//! one hash per message. Receive, delete and visibility changes run as Lua
//! scripts so concurrent consumers never observe a half-applied state.
//!
//! A receive walks the set page by page from the oldest message until it has
//! collected `max` deliveries or reached the end, so messages queued behind
//! a long in-flight head are still delivered, dead-lettered and purged.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::Script;
use tracing::warn;

use super::{
    unknown, QueueAttributes, QueueService, QueueSettings, ReceiptHandle, ReceivedMessage,
    SendOptions,
};
use crate::config::RedisConfig;
use crate::error::{Error, Result};

/// Pause between receive attempts while long-polling
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Page size of a receive walk, as a multiple of the batch size
const PAGE_FACTOR: usize = 10;

/// Smallest page a receive walk reads
const MIN_PAGE: usize = 100;

const SEND_SCRIPT: &str = r#"
local seq = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[3],
    'body', ARGV[2],
    'attributes', ARGV[3],
    'group', ARGV[4],
    'sent_at', ARGV[5],
    'receives', 0,
    'visible_at', ARGV[5])
redis.call('ZADD', KEYS[1], seq, ARGV[1])
return seq
"#;

const RECEIVE_SCRIPT: &str = r#"
local pending = KEYS[1]
local dlq = KEYS[2]
local now = tonumber(ARGV[1])
local max = tonumber(ARGV[2])
local visibility = tonumber(ARGV[3])
local retention = tonumber(ARGV[4])
local max_receive = tonumber(ARGV[5])
local ordered = ARGV[6] == '1'
local page_size = tonumber(ARGV[7])
local prefix = ARGV[8]

local blocked = {}
local out = {}
local cursor = '-inf'
while #out < max do
    local page = redis.call('ZRANGEBYSCORE', pending, cursor, '+inf', 'WITHSCORES', 'LIMIT', 0, page_size)
    if #page == 0 then break end
    for i = 1, #page, 2 do
        if #out >= max then break end
        local id = page[i]
        cursor = '(' .. page[i + 1]
        local key = prefix .. id
        local f = redis.call('HMGET', key, 'body', 'attributes', 'group', 'sent_at', 'receives', 'visible_at')
        if not f[1] then
            redis.call('ZREM', pending, id)
        else
            local group = f[3]
            if not group or group == '' then group = 'default' end
            local sent_at = tonumber(f[4])
            local receives = tonumber(f[5])
            local visible_at = tonumber(f[6])
            if now - sent_at >= retention then
                redis.call('ZREM', pending, id)
                redis.call('DEL', key)
            elseif not (ordered and blocked[group]) then
                if visible_at > now then
                    if ordered then blocked[group] = true end
                elseif receives >= max_receive then
                    redis.call('ZREM', pending, id)
                    redis.call('RPUSH', dlq, f[1])
                    redis.call('DEL', key)
                else
                    receives = receives + 1
                    redis.call('HSET', key, 'receives', receives, 'visible_at', now + visibility)
                    table.insert(out, {id, f[1], f[2], f[4], tostring(receives)})
                    if ordered then blocked[group] = true end
                end
            end
        end
    end
end
return out
"#;

// Deletes or re-hides a delivery only while the handle is current and in flight
const SETTLE_SCRIPT: &str = r#"
local key = ARGV[4] .. ARGV[1]
local f = redis.call('HMGET', key, 'receives', 'visible_at')
if not f[1] or f[1] ~= ARGV[2] or tonumber(f[2]) <= tonumber(ARGV[3]) then
    return 0
end
if ARGV[5] == 'delete' then
    redis.call('ZREM', KEYS[1], ARGV[1])
    redis.call('DEL', key)
else
    redis.call('HSET', key, 'visible_at', tonumber(ARGV[3]) + tonumber(ARGV[6]))
end
return 1
"#;

const ATTRIBUTES_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local prefix = ARGV[2]
local visible, in_flight, oldest = 0, 0, -1
for _, id in ipairs(redis.call('ZRANGE', KEYS[1], 0, -1)) do
    local f = redis.call('HMGET', prefix .. id, 'sent_at', 'visible_at')
    if f[1] then
        if tonumber(f[2]) > now then in_flight = in_flight + 1 else visible = visible + 1 end
        if oldest < 0 or tonumber(f[1]) < oldest then oldest = tonumber(f[1]) end
    end
end
return {visible, in_flight, oldest, redis.call('LLEN', KEYS[2])}
"#;

struct QueueKeys {
    pending: String,
    dead_letter: String,
    sequence: String,
    message_prefix: String,
}

/// [`QueueService`] on Redis
pub struct RedisQueue {
    pool: Pool,
    prefix: String,
    queues: HashMap<String, QueueSettings>,
    send_script: Script,
    receive_script: Script,
    settle_script: Script,
    attributes_script: Script,
}

impl RedisQueue {
    /// Create a new Redis queue client
    pub fn new(config: &RedisConfig, queues: impl IntoIterator<Item = QueueSettings>) -> Result<Self> {
        let pool = PoolConfig::from_url(&config.url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::Redis(e.to_string()))?;

        Ok(Self {
            pool,
            prefix: config.key_prefix.clone(),
            queues: queues.into_iter().map(|s| (s.name.clone(), s)).collect(),
            send_script: Script::new(SEND_SCRIPT),
            receive_script: Script::new(RECEIVE_SCRIPT),
            settle_script: Script::new(SETTLE_SCRIPT),
            attributes_script: Script::new(ATTRIBUTES_SCRIPT),
        })
    }

    fn settings(&self, queue: &str) -> Result<&QueueSettings> {
        self.queues.get(queue).ok_or_else(|| unknown(queue))
    }

    fn keys(&self, settings: &QueueSettings) -> QueueKeys {
        let base = format!("{}:q:{}", self.prefix, settings.name);
        QueueKeys {
            pending: format!("{base}:pending"),
            dead_letter: format!("{}:q:{}:list", self.prefix, settings.dead_letter_name()),
            sequence: format!("{base}:seq"),
            message_prefix: format!("{base}:msg:"),
        }
    }

    async fn try_receive(&self, settings: &QueueSettings, max: usize) -> Result<Vec<ReceivedMessage>> {
        let keys = self.keys(settings);
        let mut conn = self.pool.get().await?;

        let rows: Vec<Vec<String>> = self
            .receive_script
            .key(&keys.pending)
            .key(&keys.dead_letter)
            .arg(now_millis())
            .arg(max)
            .arg(millis(settings.visibility_timeout))
            .arg(millis(settings.retention))
            .arg(settings.max_receive_count)
            .arg(if settings.ordered { "1" } else { "0" })
            .arg(page_size(max))
            .arg(&keys.message_prefix)
            .invoke_async(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| match decode_row(row) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(queue = %settings.name, error = %e, "Skipping malformed queue entry");
                    None
                }
            })
            .collect())
    }

    async fn settle(
        &self,
        queue: &str,
        handle: &ReceiptHandle,
        action: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let settings = self.settings(queue)?;
        let Some((id, count)) = handle.parts() else {
            return Ok(false);
        };
        let keys = self.keys(settings);
        let mut conn = self.pool.get().await?;

        let settled: i64 = self
            .settle_script
            .key(&keys.pending)
            .arg(id)
            .arg(count.to_string())
            .arg(now_millis())
            .arg(&keys.message_prefix)
            .arg(action)
            .arg(millis(timeout))
            .invoke_async(&mut conn)
            .await?;

        Ok(settled == 1)
    }
}

#[async_trait]
impl QueueService for RedisQueue {
    async fn send(&self, queue: &str, body: String, options: SendOptions) -> Result<String> {
        let settings = self.settings(queue)?;
        let keys = self.keys(settings);
        let id = uuid::Uuid::new_v4().to_string();
        let attributes = serde_json::to_string(&options.attributes)?;
        let mut conn = self.pool.get().await?;

        let _: i64 = self
            .send_script
            .key(&keys.pending)
            .key(&keys.sequence)
            .key(format!("{}{}", keys.message_prefix, id))
            .arg(&id)
            .arg(body)
            .arg(attributes)
            .arg(options.group_id.unwrap_or_default())
            .arg(now_millis())
            .invoke_async(&mut conn)
            .await?;

        Ok(id)
    }

    async fn receive_batch(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let settings = self.settings(queue)?;
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let batch = self.try_receive(settings, max).await?;
            let now = tokio::time::Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep((deadline - now).min(POLL_INTERVAL)).await;
        }
    }

    async fn delete(&self, queue: &str, handle: &ReceiptHandle) -> Result<bool> {
        self.settle(queue, handle, "delete", Duration::ZERO).await
    }

    async fn extend_visibility(
        &self,
        queue: &str,
        handle: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<bool> {
        self.settle(queue, handle, "extend", timeout).await
    }

    async fn attributes(&self, queue: &str) -> Result<QueueAttributes> {
        let settings = self.settings(queue)?;
        let keys = self.keys(settings);
        let mut conn = self.pool.get().await?;
        let now = now_millis();

        let (visible, in_flight, oldest, dead): (u64, u64, i64, u64) = self
            .attributes_script
            .key(&keys.pending)
            .key(&keys.dead_letter)
            .arg(now)
            .arg(&keys.message_prefix)
            .invoke_async(&mut conn)
            .await?;

        Ok(QueueAttributes {
            name: settings.name.clone(),
            depth: visible,
            in_flight,
            oldest_age_seconds: (oldest >= 0).then(|| ((now - oldest).max(0) / 1000) as u64),
            dead_lettered: dead,
        })
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

fn page_size(max: usize) -> usize {
    max.saturating_mul(PAGE_FACTOR).max(MIN_PAGE)
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn decode_row(row: Vec<String>) -> Result<ReceivedMessage> {
    let [id, body, attributes, sent_at, receives]: [String; 5] = row
        .try_into()
        .map_err(|_| Error::queue("unexpected receive row shape"))?;

    let receive_count: u32 = receives
        .parse()
        .map_err(|_| Error::queue(format!("bad receive count '{receives}'")))?;
    let sent_at = sent_at
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| Error::queue(format!("bad sent_at '{sent_at}'")))?;

    Ok(ReceivedMessage {
        receipt_handle: ReceiptHandle::new(&id, receive_count),
        message_id: id,
        body,
        attributes: serde_json::from_str(&attributes)?,
        receive_count,
        sent_at,
    })
}
