//! In-process backend implementation using moka

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use moka::Expiry;
use moka::future::Cache as MokaCache;
use tokio::sync::{Mutex, RwLock};

use crate::domain::cache::{
    CacheValue, CasToken, Deadline, DistributedCacheClient, Fetched, FetchedItem,
    LastResultCode, ReadThrough, ServerSpec, ServerStats, ValueTag,
};
use crate::domain::{CacheError, ResultCode};

use super::routing::ServerRouter;

/// Configuration for the in-memory backend
#[derive(Debug, Clone)]
pub struct InMemoryBackendConfig {
    /// Maximum number of entries
    pub max_capacity: u64,
    /// Servers reported by the pool management calls
    pub servers: Vec<ServerSpec>,
}

impl Default for InMemoryBackendConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            servers: Vec::new(),
        }
    }
}

impl InMemoryBackendConfig {
    pub fn with_max_capacity(mut self, capacity: u64) -> Self {
        self.max_capacity = capacity;
        self
    }

    pub fn with_servers(mut self, servers: Vec<ServerSpec>) -> Self {
        self.servers = servers;
        self
    }
}

/// Entry stored in moka
#[derive(Debug, Clone)]
struct StoredEntry {
    raw: Vec<u8>,
    tag: ValueTag,
    cas: u64,
    deadline: Deadline,
    /// Tombstone left by a deferred delete
    blocked: bool,
}

impl StoredEntry {
    fn value(&self) -> CacheValue {
        self.tag.decode(&self.raw)
    }
}

/// Longest expiry handed to moka; later deadlines are only checked on read
const MAX_TRACKED_SECS: i64 = 100 * 365 * 86_400;

/// Evicts entries once their deadline passes
struct DeadlineExpiry;

impl DeadlineExpiry {
    fn remaining(entry: &StoredEntry) -> Option<Duration> {
        entry
            .deadline
            .remaining(now())
            .filter(|secs| *secs <= MAX_TRACKED_SECS)
            .map(|secs| Duration::from_secs(secs as u64))
    }
}

impl Expiry<String, StoredEntry> for DeadlineExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Self::remaining(value)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Self::remaining(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreMode {
    Add,
    Set,
    Replace,
    Cas(CasToken),
}

#[derive(Debug, Default)]
struct Counters {
    get_hits: AtomicU64,
    get_misses: AtomicU64,
    total_commands: AtomicU64,
}

impl Counters {
    fn command(&self) {
        self.total_commands.fetch_add(1, Ordering::Relaxed);
    }

    fn lookup(&self, hit: bool) {
        if hit {
            self.get_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.get_misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Backend that keeps everything inside the current process.
///
/// Implements the full client contract (conditional stores, concurrency
/// tokens, deferred deletes, delayed flushes) on top of a moka cache.
/// Read-modify-write operations are serialized by a single write lock.
#[derive(Debug)]
pub struct InMemoryBackend {
    cache: MokaCache<String, StoredEntry>,
    write_lock: Mutex<()>,
    next_cas: AtomicU64,
    /// Unix timestamp of a pending delayed flush, zero when none
    flush_at: AtomicI64,
    pending: Mutex<VecDeque<FetchedItem>>,
    servers: RwLock<Vec<ServerSpec>>,
    counters: Counters,
    last_code: LastResultCode,
}

fn now() -> i64 {
    Utc::now().timestamp()
}

impl InMemoryBackend {
    /// Creates a new in-memory backend with default configuration
    pub fn new() -> Self {
        Self::with_config(InMemoryBackendConfig::default())
    }

    pub fn with_config(config: InMemoryBackendConfig) -> Self {
        let cache = MokaCache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(DeadlineExpiry)
            .build();

        Self {
            cache,
            write_lock: Mutex::new(()),
            next_cas: AtomicU64::new(1),
            flush_at: AtomicI64::new(0),
            pending: Mutex::new(VecDeque::new()),
            servers: RwLock::new(config.servers),
            counters: Counters::default(),
            last_code: LastResultCode::new(),
        }
    }

    fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed)
    }

    async fn apply_pending_flush(&self, now: i64) {
        let at = self.flush_at.load(Ordering::Acquire);
        if at != 0
            && now >= at
            && self
                .flush_at
                .compare_exchange(at, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            tracing::debug!("Applying delayed flush");
            self.cache.invalidate_all();
        }
    }

    /// Entry under `key` that has not expired, tombstones included
    async fn live(&self, key: &str, now: i64) -> Option<StoredEntry> {
        self.apply_pending_flush(now).await;

        let entry = self.cache.get(key).await?;
        if entry.deadline.is_passed(now) {
            self.cache.invalidate(key).await;
            return None;
        }
        Some(entry)
    }

    /// Entry under `key` that a reader may see
    async fn visible(&self, key: &str, now: i64) -> Option<StoredEntry> {
        self.live(key, now).await.filter(|entry| !entry.blocked)
    }

    async fn read(&self, key: &str) -> Option<StoredEntry> {
        self.counters.command();
        let entry = self.visible(key, now()).await;
        self.counters.lookup(entry.is_some());
        entry
    }

    /// Stores `value` under the rules of `mode`, returning the new token
    async fn store(
        &self,
        mode: StoreMode,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<u64, CacheError> {
        let _guard = self.write_lock.lock().await;
        self.counters.command();

        let now = now();
        let current = self.live(key, now).await;

        match mode {
            StoreMode::Add if current.is_some() => {
                return Err(CacheError::not_stored(format!("key '{}' already exists", key)));
            }
            StoreMode::Replace if !current.as_ref().is_some_and(|e| !e.blocked) => {
                return Err(CacheError::not_stored(format!("key '{}' does not exist", key)));
            }
            StoreMode::Cas(token) => match &current {
                Some(entry) if !entry.blocked => {
                    if CasToken(entry.cas) != token {
                        return Err(CacheError::exists(key));
                    }
                }
                _ => return Err(CacheError::not_found(key)),
            },
            _ => {}
        }

        let deadline = Deadline::resolve(expiration, now);
        if deadline.is_passed(now) {
            self.cache.invalidate(key).await;
            return Ok(0);
        }

        let cas = self.next_cas();
        self.cache
            .insert(
                key.to_string(),
                StoredEntry {
                    raw: value.to_raw(),
                    tag: value.tag(),
                    cas,
                    deadline,
                    blocked: false,
                },
            )
            .await;
        Ok(cas)
    }

    /// Rewrites the raw bytes of an existing entry, keeping tag and deadline
    async fn rewrite<F>(&self, key: &str, missing: CacheError, f: F) -> Result<StoredEntry, CacheError>
    where
        F: FnOnce(&StoredEntry) -> Result<Vec<u8>, CacheError>,
    {
        let _guard = self.write_lock.lock().await;
        self.counters.command();

        let entry = self.visible(key, now()).await.ok_or(missing)?;
        let updated = StoredEntry {
            raw: f(&entry)?,
            cas: self.next_cas(),
            ..entry
        };
        self.cache.insert(key.to_string(), updated.clone()).await;
        Ok(updated)
    }

    async fn adjust(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut next = 0;
        self.rewrite(key, CacheError::not_found(key), |entry| {
            let current = entry.value().numeric_value().ok_or_else(|| {
                CacheError::backend("cannot increment or decrement non-numeric value")
            })?;
            next = current.saturating_add(delta).max(0);
            Ok(next.to_string().into_bytes())
        })
        .await?;
        Ok(next)
    }

    async fn concat(&self, key: &str, value: &CacheValue, append: bool) -> Result<(), CacheError> {
        let missing = CacheError::not_stored(format!("key '{}' does not exist", key));
        self.rewrite(key, missing, |entry| {
            let extra = value.to_raw();
            Ok(if append {
                [entry.raw.as_slice(), extra.as_slice()].concat()
            } else {
                [extra.as_slice(), entry.raw.as_slice()].concat()
            })
        })
        .await?;
        Ok(())
    }

    async fn collect(&self, keys: &[String]) -> Vec<FetchedItem> {
        let mut items = Vec::with_capacity(keys.len());

        for key in keys {
            if let Some(entry) = self.read(key).await {
                items.push(FetchedItem {
                    key: key.clone(),
                    value: entry.value(),
                    cas: CasToken(entry.cas),
                });
            }
        }

        items
    }

    async fn load_through(&self, key: &str, load: &ReadThrough) -> Result<Fetched, CacheError> {
        let value = load(key).ok_or_else(|| CacheError::not_found(key))?;
        let cas = self.store(StoreMode::Set, key, &value, 0).await?;
        tracing::debug!(key = %key, "Stored value from read-through loader");

        Ok(Fetched {
            value,
            cas: CasToken(cas),
        })
    }

    async fn addresses(&self) -> Vec<String> {
        let servers = self.servers.read().await;
        if servers.is_empty() {
            vec!["in-memory".to_string()]
        } else {
            servers.iter().map(ServerSpec::address).collect()
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedCacheClient for InMemoryBackend {
    async fn add(
        &self,
        _server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError> {
        let result = self.store(StoreMode::Add, key, value, expiration).await;
        self.last_code.record(result.map(|_| ()))
    }

    async fn set(
        &self,
        _server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError> {
        let result = self.store(StoreMode::Set, key, value, expiration).await;
        self.last_code.record(result.map(|_| ()))
    }

    async fn replace(
        &self,
        _server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError> {
        let result = self.store(StoreMode::Replace, key, value, expiration).await;
        self.last_code.record(result.map(|_| ()))
    }

    async fn delete(
        &self,
        _server_key: Option<&str>,
        key: &str,
        defer: u64,
    ) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        self.counters.command();

        let now = now();
        let result = match self.visible(key, now).await {
            None => Err(CacheError::not_found(key)),
            Some(_) if defer == 0 => {
                self.cache.invalidate(key).await;
                Ok(())
            }
            Some(_) => {
                let tombstone = StoredEntry {
                    raw: Vec::new(),
                    tag: ValueTag::String,
                    cas: self.next_cas(),
                    deadline: Deadline::after(defer, now),
                    blocked: true,
                };
                self.cache.insert(key.to_string(), tombstone).await;
                Ok(())
            }
        };
        self.last_code.record(result)
    }

    async fn get(
        &self,
        _server_key: Option<&str>,
        key: &str,
        read_through: Option<&ReadThrough>,
    ) -> Result<Fetched, CacheError> {
        let result = match (self.read(key).await, read_through) {
            (Some(entry), _) => Ok(Fetched {
                value: entry.value(),
                cas: CasToken(entry.cas),
            }),
            (None, Some(load)) => self.load_through(key, load).await,
            (None, None) => Err(CacheError::not_found(key)),
        };
        self.last_code.record(result)
    }

    async fn get_multi(
        &self,
        _server_key: Option<&str>,
        keys: &[String],
        _preserve_order: bool,
    ) -> Result<Vec<FetchedItem>, CacheError> {
        let items = self.collect(keys).await;
        self.last_code.record(Ok(items))
    }

    async fn set_multi(
        &self,
        _server_key: Option<&str>,
        items: &[(String, CacheValue)],
        expiration: i64,
    ) -> Result<(), CacheError> {
        let mut failed = Vec::new();

        for (key, value) in items {
            if let Err(e) = self.store(StoreMode::Set, key, value, expiration).await {
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
        _server_key: Option<&str>,
        key: &str,
        offset: i64,
    ) -> Result<i64, CacheError> {
        let result = self.adjust(key, offset).await;
        self.last_code.record(result)
    }

    async fn decrement(
        &self,
        _server_key: Option<&str>,
        key: &str,
        offset: i64,
    ) -> Result<i64, CacheError> {
        let result = self.adjust(key, offset.saturating_neg()).await;
        self.last_code.record(result)
    }

    async fn append(
        &self,
        _server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
    ) -> Result<(), CacheError> {
        let result = self.concat(key, value, true).await;
        self.last_code.record(result)
    }

    async fn prepend(
        &self,
        _server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
    ) -> Result<(), CacheError> {
        let result = self.concat(key, value, false).await;
        self.last_code.record(result)
    }

    async fn cas(
        &self,
        _server_key: Option<&str>,
        token: CasToken,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError> {
        let result = self.store(StoreMode::Cas(token), key, value, expiration).await;
        self.last_code.record(result.map(|_| ()))
    }

    async fn flush(&self, delay: u64) -> Result<(), CacheError> {
        self.counters.command();

        if delay == 0 {
            self.flush_at.store(0, Ordering::Release);
            self.cache.invalidate_all();
            self.cache.run_pending_tasks().await;
        } else {
            let delay = i64::try_from(delay).unwrap_or(i64::MAX);
            self.flush_at
                .store(now().saturating_add(delay), Ordering::Release);
        }
        self.last_code.record(Ok(()))
    }

    async fn get_delayed(
        &self,
        _server_key: Option<&str>,
        keys: &[String],
    ) -> Result<(), CacheError> {
        let items = self.collect(keys).await;
        self.pending.lock().await.extend(items);
        self.last_code.record(Ok(()))
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
        tracing::info!(server = %server.address(), "Adding server to in-memory pool");
        self.servers.write().await.push(server);
        Ok(())
    }

    async fn server_list(&self) -> Vec<ServerSpec> {
        self.servers.read().await.clone()
    }

    async fn server_by_key(&self, server_key: &str) -> Option<ServerSpec> {
        let servers = self.servers.read().await;
        ServerRouter::select(&servers, server_key).map(|index| servers[index].clone())
    }

    async fn stats(&self) -> Result<HashMap<String, ServerStats>, CacheError> {
        self.cache.run_pending_tasks().await;

        let stats = ServerStats {
            curr_items: self.cache.entry_count(),
            get_hits: self.counters.get_hits.load(Ordering::Relaxed),
            get_misses: self.counters.get_misses.load(Ordering::Relaxed),
            total_commands: self.counters.total_commands.load(Ordering::Relaxed),
        };

        Ok(self
            .addresses()
            .await
            .into_iter()
            .map(|address| (address, stats.clone()))
            .collect())
    }

    async fn version(&self) -> Result<HashMap<String, String>, CacheError> {
        Ok(self
            .addresses()
            .await
            .into_iter()
            .map(|address| (address, env!("CARGO_PKG_VERSION").to_string()))
            .collect())
    }

    fn result_code(&self) -> ResultCode {
        self.last_code.get()
    }
}
