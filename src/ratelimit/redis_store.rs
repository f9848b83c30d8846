//! Redis implementation of [`WindowStore`].
//!
//! Each key is a sorted set whose members are unique insertion markers scored
//! by their Unix-nanosecond timestamp. The whole sliding window step runs as
//! one Lua script so concurrent callers on any instance cannot race past the
//! limit.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};

use super::distributed::{ScriptReply, WindowStore};
use crate::error::{GuardError, Result};

/// Prune, count, conditionally record. Returns `{allowed, remaining, reset_at_nanos}`.
///
/// KEYS[1] = namespaced key
/// ARGV = now_nanos, window_nanos, max_requests, member
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]
local window_start = now - window

redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)

local count = redis.call('ZCARD', key)

local reset_time = now + window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if #oldest > 0 then
    reset_time = tonumber(oldest[2]) + window
end

if count >= limit then
    return {0, limit - count, reset_time}
end

redis.call('ZADD', key, now, member)
redis.call('EXPIRE', key, math.ceil(window / 1000000000) + 60)

return {1, limit - count - 1, reset_time}
"#;

/// A connected Redis store.
pub struct RedisStore {
    /// Multiplexed connection, cloned per call; `None` once closed
    connection: Mutex<Option<MultiplexedConnection>>,
    /// The loaded sliding window script
    script: Script,
    /// Upper bound on any single command
    command_timeout: Duration,
}

impl RedisStore {
    /// Open a connection and ping it, each bounded by `connect_timeout`.
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self> {
        if url.is_empty() {
            return Err(GuardError::Config("Redis URL not configured".to_string()));
        }

        let client = redis::Client::open(url)
            .map_err(|e| GuardError::Config(format!("Failed to parse Redis URL: {}", e)))?;

        let mut connection = bounded(
            "connect",
            connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await?;

        let _pong: String = bounded(
            "ping",
            connect_timeout,
            redis::cmd("PING").query_async(&mut connection),
        )
        .await?;

        info!("Connected to Redis");

        Ok(Self {
            connection: Mutex::new(Some(connection)),
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            command_timeout,
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| GuardError::Config("Redis store already closed".to_string()))
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn check_and_record(
        &self,
        key: &str,
        now_nanos: i64,
        window_nanos: i64,
        max_requests: i64,
        member: &str,
    ) -> Result<ScriptReply> {
        let mut connection = self.connection()?;

        let mut invocation = self.script.key(key);
        invocation
            .arg(now_nanos)
            .arg(window_nanos)
            .arg(max_requests)
            .arg(member);

        let (allowed, remaining, reset_at_nanos): (i64, i64, i64) = bounded(
            "sliding_window",
            self.command_timeout,
            invocation.invoke_async(&mut connection),
        )
        .await?;

        Ok(ScriptReply {
            allowed: allowed == 1,
            remaining,
            reset_at_nanos,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut connection = self.connection()?;
        let _removed: i64 = bounded("delete", self.command_timeout, connection.del(key)).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.connection.lock().take().is_none() {
            debug!("Redis store already closed");
            return;
        }
        info!("Redis connection closed");
    }
}

/// Run a Redis future with a deadline.
async fn bounded<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(GuardError::StoreTimeout { operation, timeout }),
    }
}
