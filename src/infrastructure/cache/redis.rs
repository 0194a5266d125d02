//! Redis backend implementation

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tokio::sync::{Mutex, RwLock};

use crate::domain::cache::{
    CacheValue, CasToken, Deadline, DistributedCacheClient, Fetched, FetchedItem,
    LastResultCode, ReadThrough, ServerSpec, ServerStats, ValueTag,
};
use crate::domain::{CacheError, ResultCode};

use super::routing::ServerRouter;

/// Key holding the token counter on every server
const CAS_COUNTER_KEY: &str = "__object_cache:cas";

// Entries are hashes: v = raw bytes, t = type tag, c = token, d = "1" while a
// deferred delete is pending.

static STORE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local mode = ARGV[1]
local live = redis.call('EXISTS', KEYS[1]) == 1
local blocked = live and redis.call('HGET', KEYS[1], 'd') == '1'
if mode == 'add' and live then return {'NOT_STORED', 0} end
if mode == 'replace' and (not live or blocked) then return {'NOT_STORED', 0} end
if mode == 'cas' then
  if not live or blocked then return {'NOT_FOUND', 0} end
  if redis.call('HGET', KEYS[1], 'c') ~= ARGV[5] then return {'EXISTS', 0} end
end
local ttl = tonumber(ARGV[4])
redis.call('DEL', KEYS[1])
if ttl < 0 then return {'STORED', 0} end
local cas = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'v', ARGV[2], 't', ARGV[3], 'c', cas)
if ttl > 0 then redis.call('EXPIRE', KEYS[1], ttl) end
return {'STORED', cas}
",
    )
});

static COUNTER_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('EXISTS', KEYS[1]) == 0 or redis.call('HGET', KEYS[1], 'd') == '1' then
  return {'NOT_FOUND', 0}
end
local raw = redis.call('HGET', KEYS[1], 'v')
if not raw or not string.match(raw, '^%s*%-?%d+%s*$') then return {'NON_NUMERIC', 0} end
local next = tonumber(raw) + tonumber(ARGV[1])
if next < 0 then next = 0 end
local cas = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'v', string.format('%d', next), 'c', cas)
return {'STORED', next}
",
    )
});

static CONCAT_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('EXISTS', KEYS[1]) == 0 or redis.call('HGET', KEYS[1], 'd') == '1' then
  return {'NOT_STORED', 0}
end
local current = redis.call('HGET', KEYS[1], 'v') or ''
local combined
if ARGV[2] == 'append' then combined = current .. ARGV[1] else combined = ARGV[1] .. current end
local cas = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'v', combined, 'c', cas)
return {'STORED', cas}
",
    )
});

static DELETE_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('EXISTS', KEYS[1]) == 0 or redis.call('HGET', KEYS[1], 'd') == '1' then
  return {'NOT_FOUND', 0}
end
redis.call('DEL', KEYS[1])
local defer = tonumber(ARGV[1])
if defer > 0 then
  redis.call('HSET', KEYS[1], 'd', '1')
  redis.call('EXPIRE', KEYS[1], defer)
end
return {'DELETED', 0}
",
    )
});

/// Row returned by `HMGET key v t c d`
type EntryRow = (Option<Vec<u8>>, Option<String>, Option<u64>, Option<String>);

/// Configuration for the Redis backend
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    /// Servers in the pool
    pub servers: Vec<ServerSpec>,
    /// Logical database selected on every server
    pub database: i64,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            servers: vec![ServerSpec::new("127.0.0.1", 6379)],
            database: 0,
        }
    }
}

impl RedisBackendConfig {
    /// Creates a configuration for the given servers
    pub fn new(servers: Vec<ServerSpec>) -> Self {
        Self {
            servers,
            ..Default::default()
        }
    }

    /// Sets the logical database
    pub fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }
}

#[derive(Default)]
struct Pool {
    servers: Vec<ServerSpec>,
    connections: Vec<ConnectionManager>,
}

/// Redis backend over a weighted pool of servers.
///
/// Conditional writes, counters and concatenation run as Lua scripts so
/// they stay atomic on the server. Keys are routed by the server key when
/// one is given, by the item key otherwise.
pub struct RedisBackend {
    pool: RwLock<Pool>,
    pending: Mutex<VecDeque<FetchedItem>>,
    last_code: LastResultCode,
    config: RedisBackendConfig,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend")
            .field("config", &self.config)
            .field("pool", &"<ConnectionManager pool>")
            .finish()
    }
}

impl RedisBackend {
    /// Connects to every configured server
    pub async fn new(config: RedisBackendConfig) -> Result<Self, CacheError> {
        let backend = Self {
            pool: RwLock::new(Pool::default()),
            pending: Mutex::new(VecDeque::new()),
            last_code: LastResultCode::new(),
            config: config.clone(),
        };

        for server in config.servers {
            backend.add_server(server).await?;
        }

        Ok(backend)
    }

    async fn connect(&self, server: &ServerSpec) -> Result<ConnectionManager, CacheError> {
        let url = format!("redis://{}:{}/{}", server.host, server.port, self.config.database);

        let client = Client::open(url.as_str()).map_err(|e| {
            CacheError::backend(format!("Failed to create Redis client for {}: {}", url, e))
        })?;

        ConnectionManager::new(client).await.map_err(|e| {
            CacheError::backend(format!("Failed to connect to Redis at {}: {}", url, e))
        })
    }

    /// Connection for the server that owns `key`
    async fn connection(
        &self,
        server_key: Option<&str>,
        key: &str,
    ) -> Result<ConnectionManager, CacheError> {
        let route_key = server_key.unwrap_or(key);
        let pool = self.pool.read().await;
        let index = ServerRouter::select(&pool.servers, route_key).ok_or(CacheError::NoServers)?;
        tracing::trace!(
            route = %ServerRouter::fingerprint(route_key),
            server = %pool.servers[index].address(),
            "Routed key"
        );
        Ok(pool.connections[index].clone())
    }

    async fn all_connections(&self) -> Result<Vec<(ServerSpec, ConnectionManager)>, CacheError> {
        let pool = self.pool.read().await;
        if pool.servers.is_empty() {
            return Err(CacheError::NoServers);
        }
        Ok(pool
            .servers
            .iter()
            .cloned()
            .zip(pool.connections.iter().cloned())
            .collect())
    }

    async fn store(
        &self,
        server_key: Option<&str>,
        mode: &str,
        token: Option<CasToken>,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<u64, CacheError> {
        let mut conn = self.connection(server_key, key).await?;
        let ttl = ttl_seconds(expiration, Utc::now().timestamp());

        let (status, cas): (String, u64) = STORE_SCRIPT
            .key(key)
            .key(CAS_COUNTER_KEY)
            .arg(mode)
            .arg(value.to_raw())
            .arg(value.tag().as_str())
            .arg(ttl)
            .arg(token.map(|t| t.0.to_string()).unwrap_or_default())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend(format!("Failed to {} key '{}': {}", mode, key, e)))?;

        script_status(&status, key)?;
        Ok(cas)
    }

    async fn adjust(
        &self,
        server_key: Option<&str>,
        key: &str,
        delta: i64,
    ) -> Result<i64, CacheError> {
        let mut conn = self.connection(server_key, key).await?;

        let (status, value): (String, i64) = COUNTER_SCRIPT
            .key(key)
            .key(CAS_COUNTER_KEY)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend(format!("Failed to adjust key '{}': {}", key, e)))?;

        script_status(&status, key)?;
        Ok(value)
    }

    async fn concat(
        &self,
        server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
        direction: &str,
    ) -> Result<(), CacheError> {
        let mut conn = self.connection(server_key, key).await?;

        let (status, _): (String, u64) = CONCAT_SCRIPT
            .key(key)
            .key(CAS_COUNTER_KEY)
            .arg(value.to_raw())
            .arg(direction)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                CacheError::backend(format!("Failed to {} key '{}': {}", direction, key, e))
            })?;

        script_status(&status, key)
    }

    async fn read(&self, server_key: Option<&str>, key: &str) -> Result<Fetched, CacheError> {
        let mut conn = self.connection(server_key, key).await?;

        let row: EntryRow = redis::cmd("HMGET")
            .arg(key)
            .arg("v")
            .arg("t")
            .arg("c")
            .arg("d")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::backend(format!("Failed to get key '{}': {}", key, e)))?;

        decode_row(key, row)
            .map(|item| Fetched {
                value: item.value,
                cas: item.cas,
            })
            .ok_or_else(|| CacheError::not_found(key))
    }

    async fn collect(
        &self,
        server_key: Option<&str>,
        keys: &[String],
    ) -> Result<Vec<FetchedItem>, CacheError> {
        let mut by_server: HashMap<usize, Vec<usize>> = HashMap::new();
        let connections = {
            let pool = self.pool.read().await;
            for (position, key) in keys.iter().enumerate() {
                let index = ServerRouter::select(&pool.servers, server_key.unwrap_or(key))
                    .ok_or(CacheError::NoServers)?;
                by_server.entry(index).or_default().push(position);
            }
            pool.connections.clone()
        };

        let mut slots: Vec<Option<FetchedItem>> = vec![None; keys.len()];

        for (index, positions) in by_server {
            let mut pipe = redis::pipe();
            for &position in &positions {
                pipe.cmd("HMGET")
                    .arg(&keys[position])
                    .arg("v")
                    .arg("t")
                    .arg("c")
                    .arg("d");
            }

            let mut conn = connections[index].clone();
            let rows: Vec<EntryRow> = pipe
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::backend(format!("Failed to get keys: {}", e)))?;

            for (position, row) in positions.into_iter().zip(rows) {
                slots[position] = decode_row(&keys[position], row);
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

/// Seconds to pass to the store script: 0 keeps the entry forever, a
/// negative value means already expired
fn ttl_seconds(expiration: i64, now: i64) -> i64 {
    match Deadline::resolve(expiration, now) {
        Deadline::Never => 0,
        Deadline::At(at) => (at - now).max(1),
        Deadline::Expired => -1,
    }
}

fn script_status(status: &str, key: &str) -> Result<(), CacheError> {
    match status {
        "STORED" | "DELETED" => Ok(()),
        "NOT_STORED" => Err(CacheError::not_stored(format!(
            "precondition failed for key '{}'",
            key
        ))),
        "NOT_FOUND" => Err(CacheError::not_found(key)),
        "EXISTS" => Err(CacheError::exists(key)),
        "NON_NUMERIC" => Err(CacheError::backend(format!(
            "cannot increment or decrement non-numeric value of key '{}'",
            key
        ))),
        other => Err(CacheError::backend(format!(
            "unexpected script status '{}' for key '{}'",
            other, key
        ))),
    }
}

fn decode_row(key: &str, (raw, tag, cas, deleted): EntryRow) -> Option<FetchedItem> {
    if deleted.as_deref() == Some("1") {
        return None;
    }
    let raw = raw?;
    let tag = tag
        .as_deref()
        .and_then(ValueTag::parse)
        .unwrap_or(ValueTag::String);

    Some(FetchedItem {
        key: key.to_string(),
        value: tag.decode(&raw),
        cas: CasToken(cas.unwrap_or_default()),
    })
}

/// Reads `field:value` lines out of an INFO reply
fn info_field<'a>(info: &'a str, field: &str) -> Option<&'a str> {
    info.lines().find_map(|line| {
        line.trim()
            .strip_prefix(field)
            .and_then(|rest| rest.strip_prefix(':'))
    })
}

#[async_trait]
impl DistributedCacheClient for RedisBackend {
    async fn add(
        &self,
        server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError> {
        let result = self.store(server_key, "add", None, key, value, expiration).await;
        self.last_code.record(result.map(|_| ()))
    }

    async fn set(
        &self,
        server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError> {
        let result = self.store(server_key, "set", None, key, value, expiration).await;
        self.last_code.record(result.map(|_| ()))
    }

    async fn replace(
        &self,
        server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError> {
        let result = self
            .store(server_key, "replace", None, key, value, expiration)
            .await;
        self.last_code.record(result.map(|_| ()))
    }

    async fn delete(
        &self,
        server_key: Option<&str>,
        key: &str,
        defer: u64,
    ) -> Result<(), CacheError> {
        let result = async {
            let mut conn = self.connection(server_key, key).await?;
            let (status, _): (String, u64) = DELETE_SCRIPT
                .key(key)
                .arg(defer)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| {
                    CacheError::backend(format!("Failed to delete key '{}': {}", key, e))
                })?;
            script_status(&status, key)
        }
        .await;
        self.last_code.record(result)
    }

    async fn get(
        &self,
        server_key: Option<&str>,
        key: &str,
        read_through: Option<&ReadThrough>,
    ) -> Result<Fetched, CacheError> {
        let result = match (self.read(server_key, key).await, read_through) {
            (Err(CacheError::NotFound { .. }), Some(load)) => match load(key) {
                Some(value) => self
                    .store(server_key, "set", None, key, &value, 0)
                    .await
                    .map(|cas| Fetched {
                        value,
                        cas: CasToken(cas),
                    }),
                None => Err(CacheError::not_found(key)),
            },
            (result, _) => result,
        };
        self.last_code.record(result)
    }

    async fn get_multi(
        &self,
        server_key: Option<&str>,
        keys: &[String],
        _preserve_order: bool,
    ) -> Result<Vec<FetchedItem>, CacheError> {
        let result = self.collect(server_key, keys).await;
        self.last_code.record(result)
    }

    async fn set_multi(
        &self,
        server_key: Option<&str>,
        items: &[(String, CacheValue)],
        expiration: i64,
    ) -> Result<(), CacheError> {
        let mut failed = Vec::new();

        for (key, value) in items {
            if let Err(e) = self.store(server_key, "set", None, key, value, expiration).await {
                tracing::warn!(key = %key, error = %e, "Failed to store batch item");
                failed.push(key.clone());
            }
        }

        let result = if failed.is_empty() {
            Ok(())
        } else {
            Err(CacheError::PartialBatch { failed })
        };
        self.last_code.record(result)
    }

    async fn increment(
        &self,
        server_key: Option<&str>,
        key: &str,
        offset: i64,
    ) -> Result<i64, CacheError> {
        let result = self.adjust(server_key, key, offset).await;
        self.last_code.record(result)
    }

    async fn decrement(
        &self,
        server_key: Option<&str>,
        key: &str,
        offset: i64,
    ) -> Result<i64, CacheError> {
        let result = self.adjust(server_key, key, offset.saturating_neg()).await;
        self.last_code.record(result)
    }

    async fn append(
        &self,
        server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
    ) -> Result<(), CacheError> {
        let result = self.concat(server_key, key, value, "append").await;
        self.last_code.record(result)
    }

    async fn prepend(
        &self,
        server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
    ) -> Result<(), CacheError> {
        let result = self.concat(server_key, key, value, "prepend").await;
        self.last_code.record(result)
    }

    async fn cas(
        &self,
        server_key: Option<&str>,
        token: CasToken,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError> {
        let result = self
            .store(server_key, "cas", Some(token), key, value, expiration)
            .await;
        self.last_code.record(result.map(|_| ()))
    }

    async fn flush(&self, delay: u64) -> Result<(), CacheError> {
        let result = async {
            let connections = self.all_connections().await?;

            if delay > 0 {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    for (server, mut conn) in connections {
                        if let Err(e) = redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await {
                            tracing::warn!(server = %server.address(), error = %e, "Delayed flush failed");
                        }
                    }
                });
                return Ok(());
            }

            let flushes = connections.into_iter().map(|(server, mut conn)| async move {
                redis::cmd("FLUSHDB")
                    .query_async::<()>(&mut conn)
                    .await
                    .map_err(|e| {
                        CacheError::backend(format!(
                            "Failed to flush {}: {}",
                            server.address(),
                            e
                        ))
                    })
            });

            join_all(flushes).await.into_iter().collect::<Result<Vec<_>, _>>()?;
            Ok(())
        }
        .await;
        self.last_code.record(result)
    }

    async fn get_delayed(
        &self,
        server_key: Option<&str>,
        keys: &[String],
    ) -> Result<(), CacheError> {
        let result = match self.collect(server_key, keys).await {
            Ok(items) => {
                self.pending.lock().await.extend(items);
                Ok(())
            }
            Err(e) => Err(e),
        };
        self.last_code.record(result)
    }

    async fn fetch(&self) -> Result<Option<FetchedItem>, CacheError> {
        let item = self.pending.lock().await.pop_front();
        self.last_code.record(Ok(item))
    }

    async fn fetch_all(&self) -> Result<Vec<FetchedItem>, CacheError> {
        let items = self.pending.lock().await.drain(..).collect();
        self.last_code.record(Ok(items))
    }

    async fn add_server(&self, server: ServerSpec) -> Result<(), CacheError> {
        let connection = self.connect(&server).await?;
        tracing::info!(server = %server.address(), weight = server.weight, "Added Redis server");

        let mut pool = self.pool.write().await;
        pool.servers.push(server);
        pool.connections.push(connection);
        Ok(())
    }

    async fn server_list(&self) -> Vec<ServerSpec> {
        self.pool.read().await.servers.clone()
    }

    async fn server_by_key(&self, server_key: &str) -> Option<ServerSpec> {
        let pool = self.pool.read().await;
        ServerRouter::select(&pool.servers, server_key).map(|index| pool.servers[index].clone())
    }

    async fn stats(&self) -> Result<HashMap<String, ServerStats>, CacheError> {
        let mut stats = HashMap::new();

        for (server, mut conn) in self.all_connections().await? {
            let curr_items: u64 = redis::cmd("DBSIZE")
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::backend(format!("Failed to get database size: {}", e)))?;
            let info: String = redis::cmd("INFO")
                .arg("stats")
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::backend(format!("Failed to read stats: {}", e)))?;

            let number = |field: &str| {
                info_field(&info, field)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(0)
            };

            stats.insert(
                server.address(),
                ServerStats {
                    curr_items,
                    get_hits: number("keyspace_hits"),
                    get_misses: number("keyspace_misses"),
                    total_commands: number("total_commands_processed"),
                },
            );
        }

        Ok(stats)
    }

    async fn version(&self) -> Result<HashMap<String, String>, CacheError> {
        let mut versions = HashMap::new();

        for (server, mut conn) in self.all_connections().await? {
            let info: String = redis::cmd("INFO")
                .arg("server")
                .query_async(&mut conn)
                .await
                .map_err(|e| CacheError::backend(format!("Failed to read server info: {}", e)))?;

            let version = info_field(&info, "redis_version")
                .unwrap_or("unknown")
                .trim()
                .to_string();
            versions.insert(server.address(), version);
        }

        Ok(versions)
    }

    fn result_code(&self) -> ResultCode {
        self.last_code.get()
    }
}
