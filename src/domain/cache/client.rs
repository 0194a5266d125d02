//! Distributed cache client contract

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::CacheValue;
use crate::domain::{CacheError, ResultCode};

/// Loader invoked by a backend on a miss. A returned value is stored and
/// handed back to the caller.
pub type ReadThrough = Arc<dyn Fn(&str) -> Option<CacheValue> + Send + Sync>;

/// Opaque optimistic-concurrency token of a stored entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CasToken(pub u64);

/// A single value read from a backend
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub value: CacheValue,
    pub cas: CasToken,
}

/// A keyed value read from a backend in a batch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedItem {
    pub key: String,
    pub value: CacheValue,
    pub cas: CasToken,
}

/// A backend server in the pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerSpec {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl ServerSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// `host:port` label used in stats and version maps
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub curr_items: u64,
    pub get_hits: u64,
    pub get_misses: u64,
    pub total_commands: u64,
}

/// Network-backed key-value store addressed by derived keys.
///
/// Every keyed operation takes an optional server key; when present it
/// replaces the item key for choosing the server, so related items can be
/// pinned to one partition.
#[async_trait]
pub trait DistributedCacheClient: Send + Sync + Debug {
    /// Stores a value only if the key does not exist
    async fn add(
        &self,
        server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError>;

    async fn set(
        &self,
        server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError>;

    /// Stores a value only if the key already exists
    async fn replace(
        &self,
        server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError>;

    /// Deletes a key. A positive `defer` keeps the key blocked for that many
    /// seconds: reads miss and add/replace fail until the window closes.
    async fn delete(
        &self,
        server_key: Option<&str>,
        key: &str,
        defer: u64,
    ) -> Result<(), CacheError>;

    async fn get(
        &self,
        server_key: Option<&str>,
        key: &str,
        read_through: Option<&ReadThrough>,
    ) -> Result<Fetched, CacheError>;

    /// Fetches many keys, skipping misses. With `preserve_order` the items
    /// come back in request order.
    async fn get_multi(
        &self,
        server_key: Option<&str>,
        keys: &[String],
        preserve_order: bool,
    ) -> Result<Vec<FetchedItem>, CacheError>;

    /// Stores many values. Fails with `PartialBatch` naming the keys that
    /// were not stored when only some succeed.
    async fn set_multi(
        &self,
        server_key: Option<&str>,
        items: &[(String, CacheValue)],
        expiration: i64,
    ) -> Result<(), CacheError>;

    async fn increment(
        &self,
        server_key: Option<&str>,
        key: &str,
        offset: i64,
    ) -> Result<i64, CacheError>;

    /// Decrements a counter, never going below zero
    async fn decrement(
        &self,
        server_key: Option<&str>,
        key: &str,
        offset: i64,
    ) -> Result<i64, CacheError>;

    async fn append(
        &self,
        server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
    ) -> Result<(), CacheError>;

    async fn prepend(
        &self,
        server_key: Option<&str>,
        key: &str,
        value: &CacheValue,
    ) -> Result<(), CacheError>;

    /// Stores a value only if the entry still carries `token`
    async fn cas(
        &self,
        server_key: Option<&str>,
        token: CasToken,
        key: &str,
        value: &CacheValue,
        expiration: i64,
    ) -> Result<(), CacheError>;

    /// Invalidates every entry, after `delay` seconds when non-zero
    async fn flush(&self, delay: u64) -> Result<(), CacheError>;

    /// Requests many keys; results are drained with `fetch`/`fetch_all`
    async fn get_delayed(
        &self,
        server_key: Option<&str>,
        keys: &[String],
    ) -> Result<(), CacheError>;

    async fn fetch(&self) -> Result<Option<FetchedItem>, CacheError>;

    async fn fetch_all(&self) -> Result<Vec<FetchedItem>, CacheError>;

    async fn add_server(&self, server: ServerSpec) -> Result<(), CacheError>;

    async fn add_servers(&self, servers: Vec<ServerSpec>) -> Result<(), CacheError> {
        for server in servers {
            self.add_server(server).await?;
        }
        Ok(())
    }

    async fn server_list(&self) -> Vec<ServerSpec>;

    /// The server a server key routes to, if any server is configured
    async fn server_by_key(&self, server_key: &str) -> Option<ServerSpec>;

    async fn stats(&self) -> Result<HashMap<String, ServerStats>, CacheError>;

    async fn version(&self) -> Result<HashMap<String, String>, CacheError>;

    /// Status of the most recent operation
    fn result_code(&self) -> ResultCode;

    fn result_message(&self) -> &'static str {
        self.result_code().message()
    }
}

/// Last-operation status shared by backend implementations
#[derive(Debug, Default)]
pub struct LastResultCode(AtomicU8);

impl LastResultCode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of an operation and hands it back unchanged
    pub fn record<T>(&self, result: Result<T, CacheError>) -> Result<T, CacheError> {
        let code = match &result {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        };
        self.0.store(encode(code), Ordering::Relaxed);
        result
    }

    pub fn get(&self) -> ResultCode {
        decode(self.0.load(Ordering::Relaxed))
    }
}

fn encode(code: ResultCode) -> u8 {
    match code {
        ResultCode::Success => 0,
        ResultCode::NotStored => 1,
        ResultCode::NotFound => 2,
        ResultCode::Exists => 3,
        ResultCode::Rejected => 4,
        ResultCode::NoServers => 5,
        ResultCode::Failure => 6,
    }
}

fn decode(raw: u8) -> ResultCode {
    match raw {
        0 => ResultCode::Success,
        1 => ResultCode::NotStored,
        2 => ResultCode::NotFound,
        3 => ResultCode::Exists,
        4 => ResultCode::Rejected,
        5 => ResultCode::NoServers,
        _ => ResultCode::Failure,
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::domain::cache::{Direction, combine};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Mock backend for testing: records calls and can be switched into a
    /// failing state to simulate an outage
    #[derive(Debug, Default)]
    pub struct MockBackend {
        entries: Mutex<HashMap<String, (CacheValue, u64)>>,
        calls: Mutex<Vec<String>>,
        pending: Mutex<VecDeque<FetchedItem>>,
        servers: Mutex<Vec<ServerSpec>>,
        next_cas: Mutex<u64>,
        last_expiration: Mutex<Option<i64>>,
        last_defer: Mutex<Option<u64>>,
        failing: Mutex<bool>,
        last_code: LastResultCode,
    }

    impl MockBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_entry(self, key: &str, value: impl Into<CacheValue>) -> Self {
            self.insert(key, value.into());
            self
        }

        /// Every subsequent call fails with a backend failure
        pub fn with_failure(self) -> Self {
            self.set_failing(true);
            self
        }

        pub fn set_failing(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }

        /// Number of calls made to the named operation
        pub fn calls(&self, operation: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.as_str() == operation)
                .count()
        }

        pub fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        pub fn stored(&self, key: &str) -> Option<CacheValue> {
            self.entries.lock().unwrap().get(key).map(|(v, _)| v.clone())
        }

        /// Expiration passed to the most recent write
        pub fn last_expiration(&self) -> Option<i64> {
            *self.last_expiration.lock().unwrap()
        }

        /// Defer window passed to the most recent delete
        pub fn last_defer(&self) -> Option<u64> {
            *self.last_defer.lock().unwrap()
        }

        pub fn keys(&self) -> Vec<String> {
            let mut keys: Vec<String> = self.entries.lock().unwrap().keys().cloned().collect();
            keys.sort();
            keys
        }

        fn insert(&self, key: &str, value: CacheValue) -> u64 {
            let mut next = self.next_cas.lock().unwrap();
            *next += 1;
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), (value, *next));
            *next
        }

        fn begin(&self, operation: &str) -> Result<(), CacheError> {
            self.calls.lock().unwrap().push(operation.to_string());
            if *self.failing.lock().unwrap() {
                return Err(CacheError::backend("mock backend unavailable"));
            }
            Ok(())
        }

        fn exists(&self, key: &str) -> bool {
            self.entries.lock().unwrap().contains_key(key)
        }

        fn lookup(&self, key: &str) -> Option<(CacheValue, u64)> {
            self.entries.lock().unwrap().get(key).cloned()
        }

        fn store(&self, key: &str, value: &CacheValue, expiration: i64) {
            *self.last_expiration.lock().unwrap() = Some(expiration);
            if expiration < 0 {
                self.entries.lock().unwrap().remove(key);
            } else {
                self.insert(key, value.clone());
            }
        }

        fn concat(&self, key: &str, value: &CacheValue, direction: Direction) -> Result<(), CacheError> {
            let (current, _) = self
                .lookup(key)
                .ok_or_else(|| CacheError::not_stored(format!("key '{}' does not exist", key)))?;
            let combined = combine(&current, value, direction)?;
            self.insert(key, combined);
            Ok(())
        }

        fn adjust(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
            let (current, _) = self.lookup(key).ok_or_else(|| CacheError::not_found(key))?;
            let current = current
                .numeric_value()
                .ok_or_else(|| CacheError::backend("value is not numeric"))?;
            let next = current.saturating_add(delta).max(0);
            self.insert(key, CacheValue::Int(next));
            Ok(next)
        }

        fn collect(&self, keys: &[String]) -> Vec<FetchedItem> {
            keys.iter()
                .filter_map(|key| {
                    self.lookup(key).map(|(value, cas)| FetchedItem {
                        key: key.clone(),
                        value,
                        cas: CasToken(cas),
                    })
                })
                .collect()
        }
    }

    #[async_trait]
    impl DistributedCacheClient for MockBackend {
        async fn add(
            &self,
            _server_key: Option<&str>,
            key: &str,
            value: &CacheValue,
            expiration: i64,
        ) -> Result<(), CacheError> {
            let result = self.begin("add").and_then(|_| {
                if self.exists(key) {
                    return Err(CacheError::not_stored(format!("key '{}' exists", key)));
                }
                self.store(key, value, expiration);
                Ok(())
            });
            self.last_code.record(result)
        }

        async fn set(
            &self,
            _server_key: Option<&str>,
            key: &str,
            value: &CacheValue,
            expiration: i64,
        ) -> Result<(), CacheError> {
            let result = self
                .begin("set")
                .map(|_| self.store(key, value, expiration));
            self.last_code.record(result)
        }

        async fn replace(
            &self,
            _server_key: Option<&str>,
            key: &str,
            value: &CacheValue,
            expiration: i64,
        ) -> Result<(), CacheError> {
            let result = self.begin("replace").and_then(|_| {
                if !self.exists(key) {
                    return Err(CacheError::not_stored(format!("key '{}' missing", key)));
                }
                self.store(key, value, expiration);
                Ok(())
            });
            self.last_code.record(result)
        }

        async fn delete(
            &self,
            _server_key: Option<&str>,
            key: &str,
            defer: u64,
        ) -> Result<(), CacheError> {
            *self.last_defer.lock().unwrap() = Some(defer);
            let result = self.begin("delete").and_then(|_| {
                match self.entries.lock().unwrap().remove(key) {
                    Some(_) => Ok(()),
                    None => Err(CacheError::not_found(key)),
                }
            });
            self.last_code.record(result)
        }

        async fn get(
            &self,
            _server_key: Option<&str>,
            key: &str,
            read_through: Option<&ReadThrough>,
        ) -> Result<Fetched, CacheError> {
            let result = self.begin("get").and_then(|_| match self.lookup(key) {
                Some((value, cas)) => Ok(Fetched {
                    value,
                    cas: CasToken(cas),
                }),
                None => match read_through.and_then(|load| load(key)) {
                    Some(value) => {
                        let cas = self.insert(key, value.clone());
                        Ok(Fetched {
                            value,
                            cas: CasToken(cas),
                        })
                    }
                    None => Err(CacheError::not_found(key)),
                },
            });
            self.last_code.record(result)
        }

        async fn get_multi(
            &self,
            _server_key: Option<&str>,
            keys: &[String],
            _preserve_order: bool,
        ) -> Result<Vec<FetchedItem>, CacheError> {
            let result = self.begin("get_multi").map(|_| self.collect(keys));
            self.last_code.record(result)
        }

        async fn set_multi(
            &self,
            _server_key: Option<&str>,
            items: &[(String, CacheValue)],
            expiration: i64,
        ) -> Result<(), CacheError> {
            let result = self.begin("set_multi").map(|_| {
                for (key, value) in items {
                    self.store(key, value, expiration);
                }
            });
            self.last_code.record(result)
        }

        async fn increment(
            &self,
            _server_key: Option<&str>,
            key: &str,
            offset: i64,
        ) -> Result<i64, CacheError> {
            let result = self
                .begin("increment")
                .and_then(|_| self.adjust(key, offset));
            self.last_code.record(result)
        }

        async fn decrement(
            &self,
            _server_key: Option<&str>,
            key: &str,
            offset: i64,
        ) -> Result<i64, CacheError> {
            let result = self
                .begin("decrement")
                .and_then(|_| self.adjust(key, offset.saturating_neg()));
            self.last_code.record(result)
        }

        async fn append(
            &self,
            _server_key: Option<&str>,
            key: &str,
            value: &CacheValue,
        ) -> Result<(), CacheError> {
            let result = self
                .begin("append")
                .and_then(|_| self.concat(key, value, Direction::Append));
            self.last_code.record(result)
        }

        async fn prepend(
            &self,
            _server_key: Option<&str>,
            key: &str,
            value: &CacheValue,
        ) -> Result<(), CacheError> {
            let result = self
                .begin("prepend")
                .and_then(|_| self.concat(key, value, Direction::Prepend));
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
            let result = self.begin("cas").and_then(|_| match self.lookup(key) {
                Some((_, cas)) if CasToken(cas) == token => {
                    self.store(key, value, expiration);
                    Ok(())
                }
                Some(_) => Err(CacheError::exists(key)),
                None => Err(CacheError::not_found(key)),
            });
            self.last_code.record(result)
        }

        async fn flush(&self, _delay: u64) -> Result<(), CacheError> {
            let result = self
                .begin("flush")
                .map(|_| self.entries.lock().unwrap().clear());
            self.last_code.record(result)
        }

        async fn get_delayed(
            &self,
            _server_key: Option<&str>,
            keys: &[String],
        ) -> Result<(), CacheError> {
            let result = self.begin("get_delayed").map(|_| {
                let items = self.collect(keys);
                self.pending.lock().unwrap().extend(items);
            });
            self.last_code.record(result)
        }

        async fn fetch(&self) -> Result<Option<FetchedItem>, CacheError> {
            let result = self
                .begin("fetch")
                .map(|_| self.pending.lock().unwrap().pop_front());
            self.last_code.record(result)
        }

        async fn fetch_all(&self) -> Result<Vec<FetchedItem>, CacheError> {
            let result = self
                .begin("fetch_all")
                .map(|_| self.pending.lock().unwrap().drain(..).collect());
            self.last_code.record(result)
        }

        async fn add_server(&self, server: ServerSpec) -> Result<(), CacheError> {
            self.servers.lock().unwrap().push(server);
            Ok(())
        }

        async fn server_list(&self) -> Vec<ServerSpec> {
            self.servers.lock().unwrap().clone()
        }

        async fn server_by_key(&self, _server_key: &str) -> Option<ServerSpec> {
            self.servers.lock().unwrap().first().cloned()
        }

        async fn stats(&self) -> Result<HashMap<String, ServerStats>, CacheError> {
            self.begin("stats")?;
            let mut stats = HashMap::new();
            stats.insert(
                "mock:0".to_string(),
                ServerStats {
                    curr_items: self.entries.lock().unwrap().len() as u64,
                    total_commands: self.total_calls() as u64,
                    ..Default::default()
                },
            );
            Ok(stats)
        }

        async fn version(&self) -> Result<HashMap<String, String>, CacheError> {
            self.begin("version")?;
            Ok(HashMap::from([("mock:0".to_string(), "mock".to_string())]))
        }

        fn result_code(&self) -> ResultCode {
            self.last_code.get()
        }
    }

    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_mock_backend_counts_calls() {
            let backend = MockBackend::new();
            backend.set(None, "k", &"v".into(), 0).await.unwrap();
            backend.get(None, "k", None).await.unwrap();
            backend.get(None, "k", None).await.unwrap();

            assert_eq!(backend.calls("set"), 1);
            assert_eq!(backend.calls("get"), 2);
            assert_eq!(backend.result_code(), ResultCode::Success);
        }

        #[tokio::test]
        async fn test_mock_backend_failure() {
            let backend = MockBackend::new().with_failure();

            let result = backend.set(None, "k", &"v".into(), 0).await;
            assert!(matches!(result, Err(CacheError::BackendFailure { .. })));
            assert_eq!(backend.result_code(), ResultCode::Failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_result_code_records_outcome() {
        let code = LastResultCode::new();
        assert_eq!(code.get(), ResultCode::Success);

        let _ = code.record::<()>(Err(CacheError::not_found("k")));
        assert_eq!(code.get(), ResultCode::NotFound);

        let _ = code.record(Ok(1));
        assert_eq!(code.get(), ResultCode::Success);
    }

    #[test]
    fn test_result_code_round_trip() {
        for code in [
            ResultCode::Success,
            ResultCode::NotStored,
            ResultCode::NotFound,
            ResultCode::Exists,
            ResultCode::Rejected,
            ResultCode::NoServers,
            ResultCode::Failure,
        ] {
            assert_eq!(decode(encode(code)), code);
        }
    }

    #[test]
    fn test_server_spec() {
        let server = ServerSpec::new("10.0.0.1", 11211).with_weight(3);
        assert_eq!(server.address(), "10.0.0.1:11211");
        assert_eq!(server.weight, 3);

        let parsed: ServerSpec = serde_json::from_str(r#"{"host":"a","port":1}"#).unwrap();
        assert_eq!(parsed.weight, 1);
    }
}
