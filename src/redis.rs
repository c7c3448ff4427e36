use crate::error::{Error, Result};
use redis::aio::MultiplexedConnection;
use redis::{Client, FromRedisValue, RedisError, ScriptInvocation};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{info, warn};

/// Lazily connected Redis client with a bounded timeout on every call.
///
/// The multiplexed connection is cloned out of its slot before each command,
/// so no lock is held across a network round trip. A connection that fails
/// at the transport level is discarded and re-established on the next call.
pub struct RedisClient {
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    timeout: Duration,
}

impl RedisClient {
    /// Parses the URL only; nothing is dialled until the first command.
    pub fn new(redis_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Failed to create Redis client: {}", e)))?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.cached_connection()? {
            return Ok(conn);
        }

        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| self.transport_error(e))?;

        let mut slot = self
            .connection
            .lock()
            .map_err(|_| Error::Internal("Failed to acquire connection lock".into()))?;
        if slot.is_none() {
            info!(target: "admission_gate::redis", "Connected to Redis");
        }
        *slot = Some(conn.clone());
        Ok(conn)
    }

    fn cached_connection(&self) -> Result<Option<MultiplexedConnection>> {
        let slot = self
            .connection
            .lock()
            .map_err(|_| Error::Internal("Failed to acquire connection lock".into()))?;
        Ok(slot.clone())
    }

    fn invalidate(&self) {
        if let Ok(mut slot) = self.connection.lock() {
            if slot.take().is_some() {
                warn!(target: "admission_gate::redis", "Dropped Redis connection");
            }
        }
    }

    fn transport_error(&self, err: RedisError) -> Error {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            self.invalidate();
        }
        err.into()
    }

    /// Run a whole store operation, connect included, within one timeout.
    async fn bounded<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match time::timeout(self.timeout, operation).await {
            Ok(result) => result,
            Err(_) => {
                self.invalidate();
                Err(Error::StoreTimeout(self.timeout.as_millis() as u64))
            }
        }
    }

    /// Run a prepared Lua script invocation.
    pub async fn invoke<T>(&self, invocation: &ScriptInvocation<'_>) -> Result<T>
    where
        T: FromRedisValue,
    {
        self.bounded(async {
            let mut conn = self.connection().await?;
            invocation
                .invoke_async(&mut conn)
                .await
                .map_err(|e| self.transport_error(e))
        })
        .await
    }

    /// `PING`, returning the observed round-trip time.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let reply: String = self
            .bounded(async {
                let mut conn = self.connection().await?;
                redis::cmd("PING")
                    .query_async::<_, String>(&mut conn)
                    .await
                    .map_err(|e| self.transport_error(e))
            })
            .await?;
        if reply != "PONG" {
            return Err(Error::Store(format!("Unexpected PING reply: {}", reply)));
        }
        Ok(started.elapsed())
    }
}

impl std::fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
