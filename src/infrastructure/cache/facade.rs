//! Two-tier cache facade
//!
//! A [`CacheFacade`] keeps a request-scoped [`RuntimeMirror`] in front of a
//! shared [`DistributedCacheClient`]. Writes reach the mirror only after the
//! backend accepts them; reads are answered from the mirror when possible.
//! Groups registered as local-only never leave the process: the mirror is
//! their only tier.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::CacheSettings;
use crate::domain::cache::{
    combine, CacheValue, CasToken, Direction, DistributedCacheClient, ExpirationPolicy,
    FetchedItem, GroupRegistry, KeyBuilder, ReadThrough, RuntimeMirror, ServerSpec, ServerStats,
};
use crate::domain::{CacheError, ResultCode};

/// Options of a single-key read
#[derive(Clone, Default)]
pub struct GetOptions {
    /// Skip the mirror and ask the backend
    pub force: bool,
    /// Loader the backend calls on a miss
    pub read_through: Option<ReadThrough>,
    /// Return the entry's concurrency token
    pub with_cas: bool,
}

impl fmt::Debug for GetOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetOptions")
            .field("force", &self.force)
            .field("read_through", &self.read_through.is_some())
            .field("with_cas", &self.with_cas)
            .finish()
    }
}

impl GetOptions {
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Default::default()
        }
    }

    pub fn with_cas() -> Self {
        Self {
            with_cas: true,
            ..Default::default()
        }
    }

    pub fn read_through<F>(loader: F) -> Self
    where
        F: Fn(&str) -> Option<CacheValue> + Send + Sync + 'static,
    {
        Self {
            read_through: Some(Arc::new(loader)),
            ..Default::default()
        }
    }

    fn bypasses_mirror(&self) -> bool {
        self.force || self.with_cas || self.read_through.is_some()
    }
}

/// Result of a single-key read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheLookup {
    pub value: Option<CacheValue>,
    /// Present when the value came from the backend
    pub cas: Option<CasToken>,
}

impl CacheLookup {
    fn hit(value: CacheValue, cas: Option<CasToken>) -> Self {
        Self {
            value: Some(value),
            cas,
        }
    }

    fn miss() -> Self {
        Self::default()
    }

    pub fn found(&self) -> bool {
        self.value.is_some()
    }
}

/// Options of a multi-key read
#[derive(Debug, Clone, Copy, Default)]
pub struct GetMultiOptions {
    pub with_cas: bool,
    /// Emit results in request order
    pub preserve_order: bool,
}

/// Result of a multi-key read. Keys that were not found are absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiLookup {
    /// Derived key and value pairs
    pub values: Vec<(String, CacheValue)>,
    pub cas_tokens: HashMap<String, CasToken>,
    /// Number of keys asked for
    pub requested: usize,
}

impl MultiLookup {
    /// Whether some requested keys were not found
    pub fn is_partial(&self) -> bool {
        self.values.len() < self.requested
    }

    pub fn get(&self, derived_key: &str) -> Option<&CacheValue> {
        self.values
            .iter()
            .find(|(key, _)| key == derived_key)
            .map(|(_, value)| value)
    }

    pub fn keys(&self) -> Vec<&str> {
        self.values.iter().map(|(key, _)| key.as_str()).collect()
    }
}

/// Read counters of one facade
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HitStats {
    pub mirror_hits: u64,
    pub backend_hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Copy)]
enum WriteMode {
    Add,
    Set,
    Replace,
}

/// Request-scoped cache facade over a shared backend.
///
/// Owned by one logical caller; every operation takes `&mut self` and the
/// mirror is never shared. Reads never fail: a backend error is logged and
/// reported as a miss. Writes return the backend's verdict.
pub struct CacheFacade {
    backend: Arc<dyn DistributedCacheClient>,
    keys: KeyBuilder,
    expiration: ExpirationPolicy,
    mirror: RuntimeMirror,
    last_code: ResultCode,
    stats: HitStats,
}

impl fmt::Debug for CacheFacade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheFacade")
            .field("backend", &self.backend)
            .field("keys", &self.keys)
            .field("mirror_entries", &self.mirror.len())
            .field("last_code", &self.last_code)
            .finish()
    }
}

impl CacheFacade {
    pub fn new(backend: Arc<dyn DistributedCacheClient>, settings: &CacheSettings) -> Self {
        Self::with_policy(backend, settings, ExpirationPolicy::new())
    }

    /// Creates a facade with an explicit expiration policy
    pub fn with_policy(
        backend: Arc<dyn DistributedCacheClient>,
        settings: &CacheSettings,
        expiration: ExpirationPolicy,
    ) -> Self {
        let mut groups = GroupRegistry::new();
        groups.add_global_groups(settings.global_groups.as_slice());
        groups.add_non_persistent_groups(settings.non_persistent_groups.as_slice());

        Self {
            backend,
            keys: KeyBuilder::new(
                settings.salt.as_str(),
                settings.global_prefix.as_str(),
                &settings.namespace,
                groups,
            ),
            expiration,
            mirror: RuntimeMirror::new(),
            last_code: ResultCode::Success,
            stats: HitStats::default(),
        }
    }

    /// Storage key for `key` in `group` under the current namespace
    pub fn key(&self, key: &str, group: &str) -> String {
        self.keys.derive(key, group)
    }

    pub fn mirror(&self) -> &RuntimeMirror {
        &self.mirror
    }

    pub fn hit_stats(&self) -> HitStats {
        self.stats
    }

    /// Status of the most recent operation
    pub fn result_code(&self) -> ResultCode {
        self.last_code
    }

    pub fn result_message(&self) -> &'static str {
        self.last_code.message()
    }

    /// Changes the namespace used for non-global groups from now on
    pub fn switch_to_namespace(&mut self, namespace: &str) {
        self.keys.switch_namespace(namespace);
    }

    pub fn add_global_groups<G: AsRef<str>>(&mut self, groups: &[G]) {
        self.keys.groups_mut().add_global_groups(groups);
    }

    pub fn add_non_persistent_groups<G: AsRef<str>>(&mut self, groups: &[G]) {
        self.keys.groups_mut().add_non_persistent_groups(groups);
    }

    fn is_local_only(&self, group: &str) -> bool {
        self.keys
            .groups()
            .is_local_only(KeyBuilder::normalize_group(group))
    }

    fn finish<T>(&mut self, result: Result<T, CacheError>) -> Result<T, CacheError> {
        self.last_code = match &result {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        };
        result
    }

    // Writes

    pub async fn add(
        &mut self,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
        expiration: i64,
    ) -> Result<(), CacheError> {
        self.write(WriteMode::Add, None, key, value.into(), group, expiration)
            .await
    }

    pub async fn add_by_key(
        &mut self,
        server_key: &str,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
        expiration: i64,
    ) -> Result<(), CacheError> {
        self.write(WriteMode::Add, Some(server_key), key, value.into(), group, expiration)
            .await
    }

    pub async fn set(
        &mut self,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
        expiration: i64,
    ) -> Result<(), CacheError> {
        self.write(WriteMode::Set, None, key, value.into(), group, expiration)
            .await
    }

    pub async fn set_by_key(
        &mut self,
        server_key: &str,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
        expiration: i64,
    ) -> Result<(), CacheError> {
        self.write(WriteMode::Set, Some(server_key), key, value.into(), group, expiration)
            .await
    }

    pub async fn replace(
        &mut self,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
        expiration: i64,
    ) -> Result<(), CacheError> {
        self.write(WriteMode::Replace, None, key, value.into(), group, expiration)
            .await
    }

    pub async fn replace_by_key(
        &mut self,
        server_key: &str,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
        expiration: i64,
    ) -> Result<(), CacheError> {
        self.write(
            WriteMode::Replace,
            Some(server_key),
            key,
            value.into(),
            group,
            expiration,
        )
        .await
    }

    async fn write(
        &mut self,
        mode: WriteMode,
        server_key: Option<&str>,
        key: &str,
        value: CacheValue,
        group: &str,
        expiration: i64,
    ) -> Result<(), CacheError> {
        let derived = self.keys.derive(key, group);

        if self.is_local_only(group) {
            let exists = self.mirror.contains(&derived);
            let result = match mode {
                WriteMode::Add if exists => Err(CacheError::not_stored(format!(
                    "key '{}' already exists",
                    derived
                ))),
                WriteMode::Replace if !exists => Err(CacheError::not_stored(format!(
                    "key '{}' does not exist",
                    derived
                ))),
                _ => {
                    self.mirror.put(derived, &value);
                    Ok(())
                }
            };
            return self.finish(result);
        }

        let expiration = self.expiration.normalize(expiration);
        let result = match mode {
            WriteMode::Add => {
                self.backend
                    .add(server_key, &derived, &value, expiration)
                    .await
            }
            WriteMode::Set => {
                self.backend
                    .set(server_key, &derived, &value, expiration)
                    .await
            }
            WriteMode::Replace => {
                self.backend
                    .replace(server_key, &derived, &value, expiration)
                    .await
            }
        };

        match &result {
            Ok(()) => self.mirror.put(derived, &value),
            Err(e) => debug!(
                key = %derived,
                mode = ?mode,
                code = %e.code(),
                "Backend rejected write"
            ),
        }
        self.finish(result)
    }

    // Reads

    pub async fn get(&mut self, key: &str, group: &str, options: GetOptions) -> CacheLookup {
        self.get_at(None, key, group, options).await
    }

    pub async fn get_by_key(
        &mut self,
        server_key: &str,
        key: &str,
        group: &str,
        options: GetOptions,
    ) -> CacheLookup {
        self.get_at(Some(server_key), key, group, options).await
    }

    async fn get_at(
        &mut self,
        server_key: Option<&str>,
        key: &str,
        group: &str,
        options: GetOptions,
    ) -> CacheLookup {
        let derived = self.keys.derive(key, group);
        let local_only = self.is_local_only(group);

        if local_only || !options.bypasses_mirror() {
            if let Some(value) = self.mirror.get(&derived) {
                debug!(key = %derived, "Mirror hit");
                self.stats.mirror_hits += 1;
                self.last_code = ResultCode::Success;
                return CacheLookup::hit(value, None);
            }

            if local_only {
                debug!(key = %derived, group = %group, "Local-only miss");
                self.stats.misses += 1;
                self.last_code = ResultCode::NotFound;
                return CacheLookup::miss();
            }
        }

        match self
            .backend
            .get(server_key, &derived, options.read_through.as_ref())
            .await
        {
            Ok(fetched) => {
                debug!(key = %derived, "Backend hit");
                self.mirror.put(derived, &fetched.value);
                self.stats.backend_hits += 1;
                self.last_code = ResultCode::Success;
                CacheLookup::hit(fetched.value, Some(fetched.cas))
            }
            Err(CacheError::NotFound { .. }) => {
                debug!(key = %derived, "Backend miss");
                self.stats.misses += 1;
                self.last_code = ResultCode::NotFound;
                CacheLookup::miss()
            }
            Err(e) => {
                warn!(key = %derived, error = %e, "Backend read failed, treating as miss");
                self.stats.misses += 1;
                self.last_code = e.code();
                CacheLookup::miss()
            }
        }
    }

    pub async fn get_multi<K, G>(
        &mut self,
        keys: &[K],
        groups: &[G],
        options: GetMultiOptions,
    ) -> MultiLookup
    where
        K: AsRef<str>,
        G: AsRef<str>,
    {
        self.get_multi_at(None, keys, groups, options).await
    }

    pub async fn get_multi_by_key<K, G>(
        &mut self,
        server_key: &str,
        keys: &[K],
        groups: &[G],
        options: GetMultiOptions,
    ) -> MultiLookup
    where
        K: AsRef<str>,
        G: AsRef<str>,
    {
        self.get_multi_at(Some(server_key), keys, groups, options)
            .await
    }

    async fn get_multi_at<K, G>(
        &mut self,
        server_key: Option<&str>,
        keys: &[K],
        groups: &[G],
        options: GetMultiOptions,
    ) -> MultiLookup
    where
        K: AsRef<str>,
        G: AsRef<str>,
    {
        let batch = self.keys.derive_batch(keys, groups);
        let batch_groups: Vec<&str> = batch
            .iter()
            .map(|b| KeyBuilder::normalize_group(&b.group))
            .collect();
        let involves_local = self.keys.groups().contains_local_only(batch_groups.as_slice());

        let mut lookup = MultiLookup {
            requested: batch.len(),
            ..Default::default()
        };

        if (options.with_cas || options.preserve_order) && !involves_local {
            let derived: Vec<String> = batch.iter().map(|b| b.derived.clone()).collect();
            let fetched = self.fetch_many(server_key, &derived, options.preserve_order).await;
            self.stats.backend_hits += fetched.len() as u64;

            for item in fetched {
                lookup.cas_tokens.insert(item.key.clone(), item.cas);
                lookup.values.push((item.key, item.value));
            }
        } else {
            let mut missing = Vec::new();

            for (entry, group) in batch.iter().zip(&batch_groups) {
                match self.mirror.get(&entry.derived) {
                    Some(value) => lookup.values.push((entry.derived.clone(), value)),
                    None if !self.keys.groups().contains_local_only(&[*group]) => {
                        missing.push(entry.derived.clone())
                    }
                    None => {}
                }
            }
            self.stats.mirror_hits += lookup.values.len() as u64;

            if !missing.is_empty() {
                let fetched = self.fetch_many(server_key, &missing, false).await;
                self.stats.backend_hits += fetched.len() as u64;

                for item in fetched {
                    lookup.cas_tokens.insert(item.key.clone(), item.cas);
                    lookup.values.push((item.key, item.value));
                }
            }

            if options.preserve_order {
                let mut found: HashMap<String, CacheValue> = lookup.values.drain(..).collect();
                lookup.values = batch
                    .iter()
                    .filter_map(|b| {
                        found
                            .remove(&b.derived)
                            .map(|value| (b.derived.clone(), value))
                    })
                    .collect();
            }
        }

        self.mirror
            .extend(lookup.values.iter().map(|(key, value)| (key, value)));

        let misses = lookup.requested.saturating_sub(lookup.values.len());
        self.stats.misses += misses as u64;
        self.last_code = if lookup.values.is_empty() && lookup.requested > 0 {
            ResultCode::NotFound
        } else {
            ResultCode::Success
        };

        debug!(
            requested = lookup.requested,
            found = lookup.values.len(),
            "Multi-key read"
        );
        lookup
    }

    async fn fetch_many(
        &self,
        server_key: Option<&str>,
        keys: &[String],
        preserve_order: bool,
    ) -> Vec<FetchedItem> {
        match self
            .backend
            .get_multi(server_key, keys, preserve_order)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                warn!(
                    keys = keys.len(),
                    error = %e,
                    "Backend multi-key read failed, treating as misses"
                );
                Vec::new()
            }
        }
    }

    /// Stores many items, pairing keys with groups like [`Self::get_multi`].
    /// Items of local-only groups go to the mirror only.
    pub async fn set_multi<K, G>(
        &mut self,
        items: &[(K, CacheValue)],
        groups: &[G],
        expiration: i64,
    ) -> Result<(), CacheError>
    where
        K: AsRef<str>,
        G: AsRef<str>,
    {
        self.set_multi_at(None, items, groups, expiration).await
    }

    pub async fn set_multi_by_key<K, G>(
        &mut self,
        server_key: &str,
        items: &[(K, CacheValue)],
        groups: &[G],
        expiration: i64,
    ) -> Result<(), CacheError>
    where
        K: AsRef<str>,
        G: AsRef<str>,
    {
        self.set_multi_at(Some(server_key), items, groups, expiration)
            .await
    }

    async fn set_multi_at<K, G>(
        &mut self,
        server_key: Option<&str>,
        items: &[(K, CacheValue)],
        groups: &[G],
        expiration: i64,
    ) -> Result<(), CacheError>
    where
        K: AsRef<str>,
        G: AsRef<str>,
    {
        let keys: Vec<&str> = items.iter().map(|(key, _)| key.as_ref()).collect();
        let batch = self.keys.derive_batch(&keys, groups);

        if batch.is_empty() && !items.is_empty() {
            let result = Err(CacheError::not_stored("more groups than keys"));
            return self.finish(result);
        }

        let mut remote = Vec::new();
        for (entry, (_, value)) in batch.iter().zip(items) {
            if self.is_local_only(&entry.group) {
                self.mirror.put(entry.derived.clone(), value);
            } else {
                remote.push((entry.derived.clone(), value.clone()));
            }
        }

        if remote.is_empty() {
            return self.finish(Ok(()));
        }

        let expiration = self.expiration.normalize(expiration);
        let result = self
            .backend
            .set_multi(server_key, &remote, expiration)
            .await;

        match &result {
            Ok(()) => self.mirror.extend(remote.iter().map(|(k, v)| (k, v))),
            Err(CacheError::PartialBatch { failed }) => {
                warn!(failed = failed.len(), "Backend stored part of a batch");
                self.mirror.extend(
                    remote
                        .iter()
                        .filter(|(key, _)| !failed.contains(key))
                        .map(|(k, v)| (k, v)),
                );
            }
            Err(e) => warn!(items = remote.len(), error = %e, "Backend batch write failed"),
        }
        self.finish(result)
    }

    // Deletes

    /// Deletes a key. A positive `defer` asks the backend to keep the key
    /// blocked for that many seconds.
    pub async fn delete(&mut self, key: &str, group: &str, defer: u64) -> Result<(), CacheError> {
        self.delete_at(None, key, group, defer).await
    }

    pub async fn delete_by_key(
        &mut self,
        server_key: &str,
        key: &str,
        group: &str,
        defer: u64,
    ) -> Result<(), CacheError> {
        self.delete_at(Some(server_key), key, group, defer).await
    }

    async fn delete_at(
        &mut self,
        server_key: Option<&str>,
        key: &str,
        group: &str,
        defer: u64,
    ) -> Result<(), CacheError> {
        let derived = self.keys.derive(key, group);

        if self.is_local_only(group) {
            let result = if self.mirror.delete(&derived) {
                Ok(())
            } else {
                Err(CacheError::not_found(derived))
            };
            return self.finish(result);
        }

        let result = self.backend.delete(server_key, &derived, defer).await;
        if result.is_ok() {
            self.mirror.delete(&derived);
        }
        self.finish(result)
    }

    // Counters

    /// Adds `offset` to a numeric entry and returns the new value.
    ///
    /// For local-only groups the mirror entry must exist and must not be
    /// negative. A non-numeric entry counts as 0 and the offset is still
    /// applied, so `"abc"` incremented by 4 becomes 4. Results never go
    /// below 0.
    pub async fn increment(&mut self, key: &str, offset: i64, group: &str) -> Result<i64, CacheError> {
        self.adjust(None, key, offset, group).await
    }

    pub async fn increment_by_key(
        &mut self,
        server_key: &str,
        key: &str,
        offset: i64,
        group: &str,
    ) -> Result<i64, CacheError> {
        self.adjust(Some(server_key), key, offset, group).await
    }

    /// Decrements a counter; the result never drops below zero
    pub async fn decrement(&mut self, key: &str, offset: i64, group: &str) -> Result<i64, CacheError> {
        self.adjust(None, key, offset.saturating_neg(), group).await
    }

    pub async fn decrement_by_key(
        &mut self,
        server_key: &str,
        key: &str,
        offset: i64,
        group: &str,
    ) -> Result<i64, CacheError> {
        self.adjust(Some(server_key), key, offset.saturating_neg(), group)
            .await
    }

    async fn adjust(
        &mut self,
        server_key: Option<&str>,
        key: &str,
        delta: i64,
        group: &str,
    ) -> Result<i64, CacheError> {
        let derived = self.keys.derive(key, group);

        let result = if self.is_local_only(group) {
            match self.mirror.get(&derived) {
                None => Err(CacheError::not_found(derived.clone())),
                Some(current) => {
                    let current = current.numeric_value().unwrap_or(0);
                    if current < 0 {
                        Err(CacheError::not_stored(format!(
                            "counter '{}' is negative",
                            derived
                        )))
                    } else {
                        Ok(current.saturating_add(delta).max(0))
                    }
                }
            }
        } else if delta >= 0 {
            self.backend.increment(server_key, &derived, delta).await
        } else {
            self.backend
                .decrement(server_key, &derived, delta.saturating_neg())
                .await
        };

        if let Ok(value) = &result {
            self.mirror.put(derived, &CacheValue::Int(*value));
        }
        self.finish(result)
    }

    // Concatenation

    pub async fn append(
        &mut self,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
    ) -> Result<(), CacheError> {
        self.concat(None, key, value.into(), group, Direction::Append)
            .await
    }

    pub async fn append_by_key(
        &mut self,
        server_key: &str,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
    ) -> Result<(), CacheError> {
        self.concat(Some(server_key), key, value.into(), group, Direction::Append)
            .await
    }

    pub async fn prepend(
        &mut self,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
    ) -> Result<(), CacheError> {
        self.concat(None, key, value.into(), group, Direction::Prepend)
            .await
    }

    pub async fn prepend_by_key(
        &mut self,
        server_key: &str,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
    ) -> Result<(), CacheError> {
        self.concat(Some(server_key), key, value.into(), group, Direction::Prepend)
            .await
    }

    async fn concat(
        &mut self,
        server_key: Option<&str>,
        key: &str,
        value: CacheValue,
        group: &str,
        direction: Direction,
    ) -> Result<(), CacheError> {
        if !value.is_scalar_operand() {
            let result = Err(CacheError::rejected(format!(
                "cannot concatenate a '{}' value",
                value.tag()
            )));
            return self.finish(result);
        }

        let derived = self.keys.derive(key, group);

        if self.is_local_only(group) {
            let result = match self.mirror.get(&derived) {
                None => Err(CacheError::not_stored(format!(
                    "key '{}' does not exist",
                    derived
                ))),
                Some(original) => combine(&original, &value, direction).map(|combined| {
                    self.mirror.put(derived, &combined);
                }),
            };
            return self.finish(result);
        }

        let result = match direction {
            Direction::Append => self.backend.append(server_key, &derived, &value).await,
            Direction::Prepend => self.backend.prepend(server_key, &derived, &value).await,
        };

        if result.is_ok() {
            if let Some(original) = self.mirror.get(&derived) {
                match combine(&original, &value, direction) {
                    Ok(combined) => self.mirror.put(derived, &combined),
                    Err(_) => {
                        self.mirror.delete(&derived);
                    }
                }
            }
        }
        self.finish(result)
    }

    // Optimistic concurrency

    /// Stores `value` only if the entry still carries `token`.
    ///
    /// Local-only groups have no tokens, so the write is unconditional there
    /// and `token` is ignored.
    pub async fn cas(
        &mut self,
        token: CasToken,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
        expiration: i64,
    ) -> Result<(), CacheError> {
        self.cas_at(None, token, key, value.into(), group, expiration)
            .await
    }

    pub async fn cas_by_key(
        &mut self,
        server_key: &str,
        token: CasToken,
        key: &str,
        value: impl Into<CacheValue>,
        group: &str,
        expiration: i64,
    ) -> Result<(), CacheError> {
        self.cas_at(Some(server_key), token, key, value.into(), group, expiration)
            .await
    }

    async fn cas_at(
        &mut self,
        server_key: Option<&str>,
        token: CasToken,
        key: &str,
        value: CacheValue,
        group: &str,
        expiration: i64,
    ) -> Result<(), CacheError> {
        let derived = self.keys.derive(key, group);

        if self.is_local_only(group) {
            self.mirror.put(derived, &value);
            return self.finish(Ok(()));
        }

        let expiration = self.expiration.normalize(expiration);
        let result = self
            .backend
            .cas(server_key, token, &derived, &value, expiration)
            .await;

        if result.is_ok() {
            self.mirror.put(derived, &value);
        }
        self.finish(result)
    }

    /// Flushes the backend, clearing the mirror only when that succeeds
    pub async fn flush(&mut self, delay: u64) -> Result<(), CacheError> {
        let result = self.backend.flush(delay).await;

        match &result {
            Ok(()) => self.mirror.clear(),
            Err(e) => warn!(error = %e, "Backend flush failed, mirror kept"),
        }
        self.finish(result)
    }

    // Delayed retrieval

    /// Queues a multi-key fetch; drain it with [`Self::fetch`] or
    /// [`Self::fetch_all`]
    pub async fn get_delayed<K, G>(&mut self, keys: &[K], groups: &[G]) -> Result<(), CacheError>
    where
        K: AsRef<str>,
        G: AsRef<str>,
    {
        self.get_delayed_at(None, keys, groups).await
    }

    pub async fn get_delayed_by_key<K, G>(
        &mut self,
        server_key: &str,
        keys: &[K],
        groups: &[G],
    ) -> Result<(), CacheError>
    where
        K: AsRef<str>,
        G: AsRef<str>,
    {
        self.get_delayed_at(Some(server_key), keys, groups).await
    }

    async fn get_delayed_at<K, G>(
        &mut self,
        server_key: Option<&str>,
        keys: &[K],
        groups: &[G],
    ) -> Result<(), CacheError>
    where
        K: AsRef<str>,
        G: AsRef<str>,
    {
        let derived: Vec<String> = self
            .keys
            .derive_batch(keys, groups)
            .into_iter()
            .map(|b| b.derived)
            .collect();

        let result = self.backend.get_delayed(server_key, &derived).await;
        self.finish(result)
    }

    pub async fn fetch(&mut self) -> Option<FetchedItem> {
        let result = self.backend.fetch().await;
        if let Err(e) = &result {
            warn!(error = %e, "Backend fetch failed");
        }
        self.finish(result).ok().flatten()
    }

    pub async fn fetch_all(&mut self) -> Vec<FetchedItem> {
        let result = self.backend.fetch_all().await;
        if let Err(e) = &result {
            warn!(error = %e, "Backend fetch failed");
        }
        self.finish(result).unwrap_or_default()
    }

    // Server pool

    pub async fn add_server(&mut self, host: &str, port: u16, weight: u32) -> Result<(), CacheError> {
        let result = self
            .backend
            .add_server(ServerSpec::new(host, port).with_weight(weight))
            .await;
        self.finish(result)
    }

    pub async fn add_servers(&mut self, servers: Vec<ServerSpec>) -> Result<(), CacheError> {
        let result = self.backend.add_servers(servers).await;
        self.finish(result)
    }

    pub async fn server_list(&self) -> Vec<ServerSpec> {
        self.backend.server_list().await
    }

    pub async fn server_by_key(&self, server_key: &str) -> Option<ServerSpec> {
        self.backend.server_by_key(server_key).await
    }

    pub async fn stats(&mut self) -> Result<HashMap<String, ServerStats>, CacheError> {
        let result = self.backend.stats().await;
        self.finish(result)
    }

    pub async fn version(&mut self) -> Result<HashMap<String, String>, CacheError> {
        let result = self.backend.version().await;
        self.finish(result)
    }
}
