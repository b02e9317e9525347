use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError, Script};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use url::Url;

use crate::error::{Error, ErrorDetails};

/// Redis Lua script: increment, and set the expiry on the first increment of a key
const INCR_WITH_TTL_SCRIPT: &str = r"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return value
";

/// Backing store for daily usage counters.
///
/// Every backend exposes an atomic increment. Callers never read a counter
/// and then write it back.
#[derive(Clone)]
pub enum QuotaStore {
    Disabled,
    InMemory(InMemoryCounterStore),
    Redis(RedisCounterStore),
    RestKv(RestKvCounterStore),
}

impl QuotaStore {
    pub fn backend_name(&self) -> &'static str {
        match self {
            QuotaStore::Disabled => "disabled",
            QuotaStore::InMemory(_) => "memory",
            QuotaStore::Redis(_) => "redis",
            QuotaStore::RestKv(_) => "rest_kv",
        }
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, QuotaStore::Disabled)
    }

    /// Atomically increment `key` and return the post-increment value.
    /// `ttl` is applied when the key is created.
    pub async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
        match self {
            QuotaStore::Disabled => Err(ErrorDetails::QuotaStoreUnconfigured.into()),
            QuotaStore::InMemory(store) => Ok(store.incr(key, ttl)),
            QuotaStore::Redis(store) => store.incr(key, ttl).await,
            QuotaStore::RestKv(store) => store.incr(key, ttl).await,
        }
    }

    /// Atomically increment a counter that never expires
    pub async fn incr_persistent(&self, key: &str) -> Result<u64, Error> {
        match self {
            QuotaStore::Disabled => Err(ErrorDetails::QuotaStoreUnconfigured.into()),
            QuotaStore::InMemory(store) => Ok(store.incr_persistent(key)),
            QuotaStore::Redis(store) => store.incr_persistent(key).await,
            QuotaStore::RestKv(store) => store.incr_persistent(key).await,
        }
    }

    /// Current value of `key`, or 0 if it does not exist
    pub async fn get(&self, key: &str) -> Result<u64, Error> {
        match self {
            QuotaStore::Disabled => Err(ErrorDetails::QuotaStoreUnconfigured.into()),
            QuotaStore::InMemory(store) => Ok(store.get(key)),
            QuotaStore::Redis(store) => store.get(key).await,
            QuotaStore::RestKv(store) => store.get(key).await,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct MemoryCounter {
    value: u64,
    expires_at: Option<Instant>,
}

impl MemoryCounter {
    fn new(now: Instant, ttl: Option<Duration>) -> Self {
        Self {
            value: 0,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local counters. Suitable for a single gateway instance and tests.
#[derive(Clone, Debug, Default)]
pub struct InMemoryCounterStore {
    counters: Arc<DashMap<String, MemoryCounter>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, key: &str, ttl: Duration) -> u64 {
        self.bump(key, Some(ttl))
    }

    pub fn incr_persistent(&self, key: &str) -> u64 {
        self.bump(key, None)
    }

    fn bump(&self, key: &str, ttl: Option<Duration>) -> u64 {
        let now = Instant::now();
        // The entry guard holds the shard lock for the whole read-modify-write
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| MemoryCounter::new(now, ttl));
        if entry.is_expired(now) {
            *entry = MemoryCounter::new(now, ttl);
        }
        entry.value += 1;
        entry.value
    }

    pub fn get(&self, key: &str) -> u64 {
        let now = Instant::now();
        self.counters
            .get(key)
            .filter(|counter| !counter.is_expired(now))
            .map(|counter| counter.value)
            .unwrap_or(0)
    }

    /// Drop expired counters
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.counters.retain(|_, counter| !counter.is_expired(now));
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

/// Redis-backed counters over a lazily (re)established multiplexed connection
#[derive(Clone)]
pub struct RedisCounterStore {
    client: redis::Client,
    conn: Arc<RwLock<Option<MultiplexedConnection>>>,
    incr_script: Arc<Script>,
}

impl RedisCounterStore {
    /// Validates the URL but does not require the server to be reachable yet
    pub fn new(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        Ok(Self {
            client,
            conn: Arc::new(RwLock::new(None)),
            incr_script: Arc::new(Script::new(INCR_WITH_TTL_SCRIPT)),
        })
    }

    /// Try to connect now so startup logs show whether Redis is reachable
    pub async fn warm_up(&self) -> Result<(), Error> {
        self.connection().await.map(|_| ())
    }

    async fn connection(&self) -> Result<MultiplexedConnection, Error> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }
        let mut guard = self.conn.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| redis_error("connect", &e))?;
        tracing::info!("Connected to Redis for quota tracking");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn handle_error(&self, op: &str, e: RedisError) -> Error {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            // Reconnect on the next operation
            *self.conn.write().await = None;
        }
        redis_error(op, &e)
    }

    pub async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
        let mut conn = self.connection().await?;
        let result: Result<u64, RedisError> = self
            .incr_script
            .key(key)
            .arg(ttl.as_secs())
            .invoke_async(&mut conn)
            .await;
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.handle_error("INCR", e).await),
        }
    }

    pub async fn incr_persistent(&self, key: &str) -> Result<u64, Error> {
        let mut conn = self.connection().await?;
        match conn.incr::<_, _, u64>(key, 1).await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.handle_error("INCR", e).await),
        }
    }

    pub async fn get(&self, key: &str) -> Result<u64, Error> {
        let mut conn = self.connection().await?;
        match conn.get::<_, Option<u64>>(key).await {
            Ok(value) => Ok(value.unwrap_or(0)),
            Err(e) => Err(self.handle_error("GET", e).await),
        }
    }
}

fn redis_error(op: &str, e: &RedisError) -> Error {
    Error::new(ErrorDetails::QuotaStore {
        backend: "redis",
        message: format!("{op} failed: {e}"),
    })
}

#[derive(Debug, Deserialize)]
struct KvResponse {
    #[serde(default)]
    result: Value,
    error: Option<String>,
}

/// Counters in a hosted REST key-value store (Vercel KV / Upstash wire format).
///
/// Single commands are `GET {base}/{command}/{args..}` with a bearer token,
/// answering `{"result": ..}`. Transactions are `POST {base}/multi-exec` with a
/// JSON array of commands, answering one `{"result": ..}` per command.
#[derive(Clone)]
pub struct RestKvCounterStore {
    http_client: reqwest::Client,
    base_url: Url,
    token: Arc<SecretString>,
}

impl RestKvCounterStore {
    pub fn new(
        http_client: reqwest::Client,
        base_url: &str,
        token: SecretString,
    ) -> Result<Self, Error> {
        let base_url = Url::parse(base_url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid KV REST API URL: {e}"),
            })
        })?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(ErrorDetails::Config {
                message: format!("Invalid KV REST API URL: `{base_url}` is not an http(s) base URL"),
            }
            .into());
        }
        Ok(Self {
            http_client,
            base_url,
            token: Arc::new(token),
        })
    }

    fn command_url(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                Error::new(ErrorDetails::InternalError {
                    message: "KV REST API URL cannot be a base".to_string(),
                })
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(
        &self,
        command: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Value, Error> {
        let response = request
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|e| rest_kv_error(command, &e.without_url().to_string()))?;
        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            rest_kv_error(
                command,
                &format!("unreadable response (status {status}): {}", e.without_url()),
            )
        })?;
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            return Err(rest_kv_error(command, &format!("status {status}: {error}")));
        }
        if !status.is_success() {
            return Err(rest_kv_error(command, &format!("status {status}")));
        }
        Ok(body)
    }

    async fn command(&self, segments: &[&str]) -> Result<Value, Error> {
        let url = self.command_url(segments)?;
        let command = segments.first().copied().unwrap_or_default();
        let body = self.send(command, self.http_client.get(url)).await?;
        let body: KvResponse = serde_json::from_value(body)
            .map_err(|e| rest_kv_error(command, &format!("unexpected response: {e}")))?;
        Ok(body.result)
    }

    /// Run `commands` atomically and return each command's result
    async fn transaction(&self, commands: &[&[&str]]) -> Result<Vec<Value>, Error> {
        let url = self.command_url(&["multi-exec"])?;
        let body = self
            .send("multi-exec", self.http_client.post(url).json(commands))
            .await?;
        let replies: Vec<KvResponse> = serde_json::from_value(body)
            .map_err(|e| rest_kv_error("multi-exec", &format!("unexpected response: {e}")))?;
        if replies.len() != commands.len() {
            return Err(rest_kv_error(
                "multi-exec",
                &format!("expected {} replies, got {}", commands.len(), replies.len()),
            ));
        }
        replies
            .into_iter()
            .zip(commands)
            .map(|(reply, command)| {
                let name = command.first().copied().unwrap_or_default();
                match reply.error {
                    Some(error) => Err(rest_kv_error(name, &error)),
                    None => Ok(reply.result),
                }
            })
            .collect()
    }

    /// `INCR` and `EXPIRE .. NX` run in one transaction. A counter that somehow
    /// lacks a TTL gets one on its next increment, and an existing TTL is kept.
    pub async fn incr(&self, key: &str, ttl: Duration) -> Result<u64, Error> {
        let ttl = ttl.as_secs().to_string();
        let results = self
            .transaction(&[&["INCR", key], &["EXPIRE", key, &ttl, "NX"]])
            .await?;
        let value = results.first().unwrap_or(&Value::Null);
        parse_counter("incr", value)
    }

    pub async fn incr_persistent(&self, key: &str) -> Result<u64, Error> {
        let result = self.command(&["incr", key]).await?;
        parse_counter("incr", &result)
    }

    pub async fn get(&self, key: &str) -> Result<u64, Error> {
        let result = self.command(&["get", key]).await?;
        parse_counter("get", &result)
    }
}

fn rest_kv_error(command: &str, message: &str) -> Error {
    Error::new(ErrorDetails::QuotaStore {
        backend: "rest_kv",
        message: format!("{command} failed: {message}"),
    })
}

/// Counters come back as integers from INCR and as strings (or null) from GET
fn parse_counter(command: &str, value: &Value) -> Result<u64, Error> {
    match value {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| rest_kv_error(command, &format!("unexpected counter value {n}"))),
        Value::String(s) => s
            .parse()
            .map_err(|_| rest_kv_error(command, &format!("unexpected counter value `{s}`"))),
        other => Err(rest_kv_error(
            command,
            &format!("unexpected counter value {other}"),
        )),
    }
}


#[cfg(all(test, feature = "e2e_tests"))]
mod e2e_tests {
    use super::*;

    fn redis_url() -> String {
        std::env::var("AUTOPOST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_redis_concurrent_increments_are_not_lost() {
        let store = QuotaStore::Redis(RedisCounterStore::new(&redis_url()).unwrap());
        let key = format!("usage:e2e-{}:2026-03-02", std::process::id());
        let tasks = (0..200).map(|_| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.incr(&key, Duration::from_secs(60)).await })
        });
        let mut seen: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=200).collect::<Vec<u64>>());
        assert_eq!(store.get(&key).await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_redis_counter_gets_ttl_on_first_increment() -> anyhow::Result<()> {
        let url = redis_url();
        let store = RedisCounterStore::new(&url)?;
        let key = format!("usage:e2e-ttl-{}:2026-03-02", std::process::id());
        assert_eq!(store.incr(&key, Duration::from_secs(120)).await?, 1);
        assert_eq!(store.incr(&key, Duration::from_secs(120)).await?, 2);

        let client = redis::Client::open(url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await?;
        assert!((1..=120).contains(&ttl), "unexpected TTL {ttl}");
        Ok(())
    }

    #[tokio::test]
    async fn test_redis_persistent_counter_has_no_ttl() -> anyhow::Result<()> {
        let url = redis_url();
        let store = RedisCounterStore::new(&url)?;
        let key = format!("total:e2e-{}", std::process::id());
        assert_eq!(store.incr_persistent(&key).await?, 1);
        assert_eq!(store.get(&key).await?, 1);

        let client = redis::Client::open(url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let ttl: i64 = redis::cmd("TTL").arg(&key).query_async(&mut conn).await?;
        assert_eq!(ttl, -1);
        let _: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
        Ok(())
    }
}
