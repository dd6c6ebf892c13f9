//! Redis-backed tag store with retry logic and command metrics
//!
//! One multiplexed connection is shared by every caller. Commands run under a
//! timeout and transient failures are retried with exponential backoff.
//!
//! # Example
//!
//! ```rust,no_run
//! use tagbox::config::StoreConfig;
//! use tagbox::store::{RedisStore, TagStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStore::connect(&StoreConfig::default()).await?;
//! store.set("tags:vip", &[1, 2, 3]).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::util::{describe_redis_error, escape_glob, redact_url};
use super::TagStore;
use crate::config::StoreConfig;
use crate::error::StoreError;

/// Keys requested per SCAN round trip
const SCAN_COUNT: usize = 500;

/// First retry delay
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Upper bound on a single retry delay
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Largest fraction of a delay added as random jitter
const BACKOFF_JITTER: f64 = 0.25;

/// Doubling backoff between retries of one command
#[derive(Clone, Copy, Debug)]
pub(crate) struct Backoff {
    retries: u32,
    base: Duration,
    cap: Duration,
    jitter: bool,
}

impl Backoff {
    /// Backoff allowing `config.max_retries` retries
    pub(crate) fn from_config(config: &StoreConfig) -> Self {
        Self {
            retries: config.max_retries,
            base: BACKOFF_BASE,
            cap: BACKOFF_CAP,
            jitter: true,
        }
    }

    /// Whether a command that failed on `attempt` (0-based) gets another try
    fn allows(&self, attempt: u32) -> bool {
        attempt < self.retries
    }

    /// Pause before retrying after `attempt`
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self.base.saturating_mul(factor).min(self.cap);

        if self.jitter {
            capped.mul_f64(1.0 + rand::random::<f64>() * BACKOFF_JITTER)
        } else {
            capped
        }
    }
}

/// Command metrics
#[derive(Debug, Default)]
struct PoolMetrics {
    commands_executed: AtomicU64,
    command_failures: AtomicU64,
    retries: AtomicU64,
    total_latency_us: AtomicU64,
}

impl PoolMetrics {
    fn record_command(&self, latency: Duration) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolMetricsSnapshot {
        let total = self.total_latency_us.load(Ordering::Relaxed);
        let count = self.commands_executed.load(Ordering::Relaxed);
        PoolMetricsSnapshot {
            commands_executed: count,
            command_failures: self.command_failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            average_latency_us: if count == 0 {
                0.0
            } else {
                total as f64 / count as f64
            },
        }
    }
}

/// Snapshot of store metrics at a point in time
#[derive(Debug, Clone)]
pub struct PoolMetricsSnapshot {
    /// Total number of commands executed
    pub commands_executed: u64,
    /// Total number of command failures encountered
    pub command_failures: u64,
    /// Total number of retry attempts made for failed operations
    pub retries: u64,
    /// Average command latency in microseconds
    pub average_latency_us: f64,
}

/// Redis implementation of [`TagStore`]
pub struct RedisStore {
    /// Redis client for (re)creating the connection
    client: Client,

    /// Shared multiplexed connection, `None` until connected or after close
    connection: RwLock<Option<MultiplexedConnection>>,

    /// URL used for sanitized error messages
    url: String,

    connection_timeout: Duration,
    command_timeout: Duration,
    backoff: Backoff,
    metrics: PoolMetrics,
    closed: AtomicBool,
}

impl RedisStore {
    /// Connect to the store described by `config`
    ///
    /// Fails if the server cannot be reached or does not answer PING.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = config
            .connection_url()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let client = Client::open(url.as_str())
            .map_err(|e| StoreError::Connection(describe_redis_error(&url, &e)))?;

        let store = Self {
            client,
            connection: RwLock::new(None),
            url,
            connection_timeout: config.connection_timeout(),
            command_timeout: config.command_timeout(),
            backoff: Backoff::from_config(config),
            metrics: PoolMetrics::default(),
            closed: AtomicBool::new(false),
        };

        store.reconnect().await?;
        store.ping().await?;

        debug!(url = %redact_url(&store.url), "Redis store connected");
        Ok(store)
    }

    /// Command metrics
    pub fn metrics(&self) -> PoolMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Establish or re-establish the connection
    async fn reconnect(&self) -> Result<MultiplexedConnection, StoreError> {
        let start = Instant::now();

        let conn = tokio::time::timeout(
            self.connection_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Connection("Connection timeout".to_string()))?
        .map_err(|e| StoreError::Connection(describe_redis_error(&self.url, &e)))?;

        *self.connection.write().await = Some(conn.clone());

        debug!("Redis connection established in {:?}", start.elapsed());
        Ok(conn)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }

        let existing = self.connection.read().await.clone();
        match existing {
            Some(conn) => Ok(conn),
            None => self.reconnect().await,
        }
    }

    /// Execute a command with timeout and retry logic
    async fn execute<F, Fut, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = Result<T, RedisError>>,
    {
        let mut attempt = 0;

        loop {
            let conn = self.connection().await?;
            let start = Instant::now();

            match tokio::time::timeout(self.command_timeout, f(conn)).await {
                Ok(Ok(value)) => {
                    self.metrics.record_command(start.elapsed());
                    return Ok(value);
                },
                Ok(Err(e)) => {
                    self.metrics.command_failures.fetch_add(1, Ordering::Relaxed);

                    if self.backoff.allows(attempt) && is_retriable_error(&e) {
                        self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                        let delay = self.backoff.delay(attempt);
                        warn!(
                            "Redis command failed (attempt {}), retrying in {:?}: {}",
                            attempt + 1,
                            delay,
                            describe_redis_error(&self.url, &e)
                        );
                        tokio::time::sleep(delay).await;

                        if e.is_connection_dropped() || e.is_io_error() {
                            if let Err(re) = self.reconnect().await {
                                debug!(error = %re, "Reconnect before retry failed");
                            }
                        }

                        attempt += 1;
                        continue;
                    }

                    return Err(StoreError::Command(describe_redis_error(&self.url, &e)));
                },
                Err(_) => {
                    self.metrics.command_failures.fetch_add(1, Ordering::Relaxed);

                    if self.backoff.allows(attempt) {
                        self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                        let delay = self.backoff.delay(attempt);
                        warn!(
                            "Redis command timeout (attempt {}), retrying in {:?}",
                            attempt + 1,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(StoreError::Timeout(self.command_timeout.as_millis() as u64));
                },
            }
        }
    }
}

#[async_trait]
impl TagStore for RedisStore {
    fn store_id(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.execute(|mut conn| async move { conn.get::<_, Option<Vec<u8>>>(key).await })
            .await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.execute(|mut conn| async move { conn.set::<_, _, ()>(key, value).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.execute(|mut conn| async move { conn.del::<_, ()>(key).await })
            .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch) = self
                .execute(|mut conn| {
                    let pattern = pattern.clone();
                    async move {
                        redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(pattern)
                            .arg("COUNT")
                            .arg(SCAN_COUNT)
                            .query_async::<(u64, Vec<String>)>(&mut conn)
                            .await
                    }
                })
                .await?;

            keys.extend(batch.into_iter().filter(|key| key.starts_with(prefix)));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort_unstable();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.execute(|mut conn| async move {
            redis::cmd("PING").query_async::<String>(&mut conn).await
        })
        .await
        .map(|_| ())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the last handle closes the multiplexed connection
        self.connection.write().await.take();
        debug!("Redis store closed");
        Ok(())
    }
}

/// Check if an error is retriable
fn is_retriable_error(e: &RedisError) -> bool {
    e.is_connection_dropped()
        || e.is_timeout()
        || e.is_io_error()
        || matches!(e.kind(), redis::ErrorKind::BusyLoadingError)
}
