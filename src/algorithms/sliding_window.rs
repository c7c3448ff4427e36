//! Sliding window over a Redis sorted set.
//!
//! One sorted set per identifier; each admitted request is a member scored
//! by its arrival time in milliseconds. Prune, count, conditional insert and
//! TTL refresh run inside a single Lua script, so concurrent callers on any
//! instance observe a linear count per identifier.

use super::{AdmissionResult, SharedCounter, WindowSnapshot};
use crate::clock::Clock;
use crate::error::Result;
use crate::identifier::RequestIdentifier;
use crate::policy::RateLimitPolicy;
use crate::redis::RedisClient;
use async_trait::async_trait;
use redis::Script;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use uuid::Uuid;

// KEYS[1] window key
// ARGV    now_ms, window_ms, max_requests, member
// Returns {count_before, admitted, oldest_ms}
static ADMIT_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local key = KEYS[1]
        local now = tonumber(ARGV[1])
        local window = tonumber(ARGV[2])
        local limit = tonumber(ARGV[3])

        redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
        local count = redis.call('ZCARD', key)

        local admitted = 0
        if count < limit then
            redis.call('ZADD', key, now, ARGV[4])
            redis.call('PEXPIRE', key, window)
            admitted = 1
        end

        local oldest = now
        local first = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
        if first[2] then
            oldest = tonumber(first[2])
        end

        return {count, admitted, oldest}
        "#,
    )
});

pub struct RedisSlidingWindow {
    redis: Arc<RedisClient>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl RedisSlidingWindow {
    pub fn new(redis: Arc<RedisClient>, clock: Arc<dyn Clock>, key_prefix: &str) -> Self {
        Self {
            redis,
            clock,
            key_prefix: key_prefix.to_string(),
        }
    }

    pub fn window_key(&self, identifier: &RequestIdentifier) -> String {
        format!("{}{}", self.key_prefix, identifier)
    }

    /// Sorted-set member for an arrival. The random suffix keeps two arrivals
    /// in the same millisecond from overwriting each other.
    fn member(now_ms: u64) -> String {
        format!("{}-{}", now_ms, Uuid::new_v4().simple())
    }
}

#[async_trait]
impl SharedCounter for RedisSlidingWindow {
    async fn try_admit(
        &self,
        identifier: &RequestIdentifier,
        policy: &RateLimitPolicy,
    ) -> Result<AdmissionResult> {
        let now = self.clock.now_ms();
        let key = self.window_key(identifier);

        let mut invocation = ADMIT_SCRIPT.prepare_invoke();
        invocation
            .key(&key)
            .arg(now)
            .arg(policy.window_ms())
            .arg(policy.max_requests)
            .arg(Self::member(now));

        let (count_before, admitted, oldest_ms): (u64, u8, u64) =
            self.redis.invoke(&invocation).await?;

        Ok(WindowSnapshot {
            count_before,
            admitted: admitted == 1,
            oldest_ms,
        }
        .evaluate(policy, now, false))
    }

    async fn ping(&self) -> Result<Duration> {
        self.redis.ping().await
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
