//! Redis state store for `turnstile` (companion crate).
//!
//! Buckets are Redis hashes with two numeric fields, `tokens` and `ts`, under a
//! key prefix. [`StateStore::apply`] runs the whole refill-then-consume step in
//! one Lua script, so every process sharing the Redis instance sees exact
//! accounting.
//!
//! Calls go through a [`ConnectionManager`], which reconnects on its own after
//! the link drops. The first connection is either made up front with
//! [`RedisStore::connect`] or dialled by a background task on first use. The
//! limiter bounds every store call with a short deadline; a handshake slower
//! than that deadline keeps running in the background and later calls pick up
//! the finished connection.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, OnceCell};
use turnstile::{BucketState, Policy, StateStore, StoreError, Transition};

/// Prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "turnstile:";

// KEYS[1] bucket; ARGV: now, capacity, refill_tokens, period_secs, cost, ttl_secs.
// Returns {allowed, tokens, ts, retry_after}; floats travel as strings because
// Lua numbers are truncated to integers in replies.
const APPLY_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill_tokens = tonumber(ARGV[3])
local period = tonumber(ARGV[4])
local cost = tonumber(ARGV[5])
local ttl = tonumber(ARGV[6])
local eps = 1e-9

local record = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(record[1])
local ts = tonumber(record[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

local elapsed = math.max(0, now - ts)
local refilled = math.min(capacity, math.max(0, tokens) + elapsed * refill_tokens / period)
local last = math.max(now, ts)
local allowed = 0
local retry = 0
if cost <= refilled + eps then
  allowed = 1
  tokens = math.min(capacity, math.max(0, refilled - cost))
else
  tokens = refilled
  retry = math.max(1, math.ceil((cost - refilled) * period / refill_tokens - eps))
end

redis.call('HSET', key, 'tokens', string.format('%.17g', tokens), 'ts', string.format('%.17g', last))
redis.call('EXPIRE', key, ttl)
return {allowed, string.format('%.17g', tokens), string.format('%.17g', last), retry}
"#;

/// Shared bucket store backed by Redis.
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
    script: redis::Script,
    link: Arc<Link>,
}

/// The connection slot, filled once by whichever dial succeeds first.
#[derive(Default)]
struct Link {
    manager: OnceCell<ConnectionManager>,
    dialing: AtomicBool,
    dialed: Notify,
    last_error: Mutex<Option<String>>,
}

impl Link {
    fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn set_last_error(&self, err: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = err;
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .field("client", &"<redis::Client>")
            .field("connected", &self.link.manager.initialized())
            .finish()
    }
}

impl RedisStore {
    /// Store for the Redis at `url` (e.g. `redis://127.0.0.1/`).
    ///
    /// Only the URL is validated here; the connection is dialled in the
    /// background on first use.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        Ok(Self::new(client))
    }

    /// Store for the Redis at `url`, connected before returning.
    ///
    /// Use at startup when Redis is expected to be up: the handshake runs
    /// without the per-call deadline.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let store = Self::open(url)?;
        let manager = ConnectionManager::new(store.client.clone()).await.map_err(map_redis_error)?;
        tracing::debug!(target: "turnstile::redis", "connected to redis");
        // The slot is fresh, so this cannot race another dial.
        let _ = store.link.manager.set(manager);
        Ok(store)
    }

    /// Store using an existing client and the default prefix.
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            prefix: DEFAULT_PREFIX.to_string(),
            script: redis::Script::new(APPLY_SCRIPT),
            link: Arc::new(Link::default()),
        }
    }

    /// Namespace every bucket key under `prefix`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// The key prefix in use.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// The shared connection, waiting on a dial if none exists yet.
    ///
    /// Dropping the returned future (a caller's deadline expiring) does not
    /// cancel the dial.
    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if let Some(conn) = self.link.manager.get() {
            return Ok(conn.clone());
        }
        let dialed = self.link.dialed.notified();
        tokio::pin!(dialed);
        // Register before re-checking so a dial finishing in between still wakes us.
        dialed.as_mut().enable();
        if let Some(conn) = self.link.manager.get() {
            return Ok(conn.clone());
        }
        self.dial();
        dialed.await;
        match self.link.manager.get() {
            Some(conn) => Ok(conn.clone()),
            None => Err(StoreError::Unavailable(
                self.link.last_error().unwrap_or_else(|| "redis connection not established".to_string()),
            )),
        }
    }

    /// Start a background dial unless one is already running.
    fn dial(&self) {
        if self.link.dialing.swap(true, Ordering::AcqRel) {
            return;
        }
        let client = self.client.clone();
        let link = self.link.clone();
        tokio::spawn(async move {
            match ConnectionManager::new(client).await {
                Ok(manager) => {
                    tracing::debug!(target: "turnstile::redis", "connected to redis");
                    link.set_last_error(None);
                    let _ = link.manager.set(manager);
                }
                Err(e) => {
                    tracing::warn!(target: "turnstile::redis", error = %e, "redis connection failed");
                    link.set_last_error(Some(e.to_string()));
                }
            }
            link.dialing.store(false, Ordering::Release);
            link.dialed.notify_waiters();
        });
    }

    async fn run<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        let conn = self.connection().await?;
        op(conn).await.map_err(map_redis_error)
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn load(&self, key: &str) -> Result<Option<BucketState>, StoreError> {
        let redis_key = self.redis_key(key);
        let cmd_key = redis_key.clone();
        let (tokens, ts): (Option<String>, Option<String>) = self
            .run(|mut conn| async move {
                redis::cmd("HMGET").arg(&cmd_key).arg("tokens").arg("ts").query_async(&mut conn).await
            })
            .await?;
        parse_record(&redis_key, tokens.as_deref(), ts.as_deref())
    }

    async fn save(&self, key: &str, state: BucketState, ttl: Duration) -> Result<(), StoreError> {
        let redis_key = self.redis_key(key);
        let fields = [("tokens", state.tokens.to_string()), ("ts", state.last_refill.to_string())];
        let ttl = ttl_secs(ttl);
        self.run(|mut conn| async move {
            redis::pipe()
                .atomic()
                .hset_multiple(&redis_key, &fields)
                .ignore()
                .expire(&redis_key, ttl)
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn apply(
        &self,
        key: &str,
        now: f64,
        policy: &Policy,
        cost: f64,
        ttl: Duration,
    ) -> Result<Transition, StoreError> {
        let redis_key = self.redis_key(key);
        let mut invocation = self.script.key(&redis_key);
        invocation
            .arg(now.to_string())
            .arg(policy.capacity().to_string())
            .arg(policy.refill_tokens().to_string())
            .arg(policy.refill_period().as_secs_f64().to_string())
            .arg(cost.to_string())
            .arg(ttl_secs(ttl));
        let reply: (i64, String, String, i64) =
            self.run(|mut conn| async move { invocation.invoke_async(&mut conn).await }).await?;
        parse_reply(&redis_key, reply)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let pong: String =
            self.run(|mut conn| async move { redis::cmd("PING").query_async(&mut conn).await }).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!("unexpected PING reply: {}", pong)))
        }
    }
}

/// Whole seconds, at least one: `EXPIRE 0` would delete the key.
fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

fn map_redis_error(err: redis::RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::backend(err)
    }
}

fn parse_f64(key: &str, field: &str, raw: &str) -> Result<f64, StoreError> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite()).ok_or_else(|| StoreError::Malformed {
        key: key.to_string(),
        reason: format!("{} is not a number: {:?}", field, raw),
    })
}

fn parse_record(key: &str, tokens: Option<&str>, ts: Option<&str>) -> Result<Option<BucketState>, StoreError> {
    match (tokens, ts) {
        (None, None) => Ok(None),
        (Some(tokens), Some(ts)) => Ok(Some(BucketState {
            tokens: parse_f64(key, "tokens", tokens)?,
            last_refill: parse_f64(key, "ts", ts)?,
        })),
        _ => Err(StoreError::Malformed { key: key.to_string(), reason: "partial bucket record".to_string() }),
    }
}

fn parse_reply(key: &str, reply: (i64, String, String, i64)) -> Result<Transition, StoreError> {
    let (allowed, tokens, ts, retry) = reply;
    let allowed = allowed == 1;
    Ok(Transition {
        state: BucketState { tokens: parse_f64(key, "tokens", &tokens)?, last_refill: parse_f64(key, "ts", &ts)? },
        allowed,
        retry_after: if allowed { None } else { Some(u64::try_from(retry).unwrap_or(1).max(1)) },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_record_is_none() {
        assert_eq!(parse_record("k", None, None).unwrap(), None);
    }

    #[test]
    fn record_round_trips_float_text() {
        let state = parse_record("k", Some("0.5"), Some("1700000000.25")).unwrap().unwrap();
        assert_eq!(state, BucketState { tokens: 0.5, last_refill: 1_700_000_000.25 });
    }

    #[test]
    fn partial_or_garbage_record_is_malformed() {
        assert!(matches!(parse_record("k", Some("1"), None), Err(StoreError::Malformed { .. })));
        assert!(matches!(parse_record("k", Some("x"), Some("1")), Err(StoreError::Malformed { .. })));
        assert!(matches!(parse_record("k", Some("inf"), Some("1")), Err(StoreError::Malformed { .. })));
    }

    #[test]
    fn script_reply_parsing() {
        let admitted = parse_reply("k", (1, "2".into(), "10".into(), 0)).unwrap();
        assert!(admitted.allowed);
        assert_eq!(admitted.retry_after, None);
        assert_eq!(admitted.tokens(), 2.0);

        let denied = parse_reply("k", (0, "0.25".into(), "10".into(), 45)).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(45));
        assert_eq!(denied.state.last_refill, 10.0);
    }

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(200)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(3600)), 3600);
    }

    #[test]
    fn open_rejects_bad_url_and_keys_are_prefixed() {
        assert!(RedisStore::open("not a url").is_err());
        let store = RedisStore::open("redis://127.0.0.1:6379/").unwrap().with_prefix("app:");
        assert_eq!(store.prefix(), "app:");
        assert_eq!(store.redis_key("tenant:a:burst"), "app:tenant:a:burst");
    }
}
