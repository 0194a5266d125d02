//! Backend factory for runtime selection

use std::sync::Arc;

use crate::config::BackendSettings;
use crate::domain::cache::{DistributedCacheClient, ServerSpec};
use crate::domain::CacheError;

use super::in_memory::{InMemoryBackend, InMemoryBackendConfig};
use super::redis::{RedisBackend, RedisBackendConfig};

/// Supported backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// In-process backend using moka
    #[default]
    InMemory,
    /// Redis server pool
    Redis,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendType::InMemory => write!(f, "in_memory"),
            BackendType::Redis => write!(f, "redis"),
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in_memory" | "inmemory" | "memory" => Ok(BackendType::InMemory),
            "redis" => Ok(BackendType::Redis),
            _ => Err(CacheError::configuration(format!(
                "Unknown backend type: {}. Valid types: in_memory, redis",
                s
            ))),
        }
    }
}

/// Configuration for the backend factory
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub backend_type: BackendType,
    /// Server pool; required for Redis
    pub servers: Vec<ServerSpec>,
    /// Maximum number of entries (in-memory only)
    pub max_capacity: Option<u64>,
    /// Logical database (Redis only)
    pub database: i64,
}

impl BackendConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn redis(servers: Vec<ServerSpec>) -> Self {
        Self {
            backend_type: BackendType::Redis,
            servers,
            ..Default::default()
        }
    }

    pub fn with_servers(mut self, servers: Vec<ServerSpec>) -> Self {
        self.servers = servers;
        self
    }

    pub fn with_max_capacity(mut self, capacity: u64) -> Self {
        self.max_capacity = Some(capacity);
        self
    }

    pub fn with_database(mut self, database: i64) -> Self {
        self.database = database;
        self
    }
}

impl TryFrom<&BackendSettings> for BackendConfig {
    type Error = CacheError;

    fn try_from(settings: &BackendSettings) -> Result<Self, Self::Error> {
        Ok(Self {
            backend_type: settings.kind.parse()?,
            servers: settings.servers.clone(),
            max_capacity: Some(settings.max_capacity),
            database: settings.database,
        })
    }
}

/// Parses `host:port[:weight]` entries separated by commas
pub fn parse_servers(list: &str) -> Result<Vec<ServerSpec>, CacheError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_server)
        .collect()
}

fn parse_server(entry: &str) -> Result<ServerSpec, CacheError> {
    let invalid = || CacheError::configuration(format!("Invalid server entry: {}", entry));

    let mut parts = entry.split(':');
    let host = parts.next().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
    let port = parts
        .next()
        .ok_or_else(invalid)?
        .parse::<u16>()
        .map_err(|_| invalid())?;

    let server = ServerSpec::new(host, port);
    match parts.next() {
        Some(weight) => Ok(server.with_weight(weight.parse().map_err(|_| invalid())?)),
        None => Ok(server),
    }
}

/// Factory for creating backend instances
#[derive(Debug, Default)]
pub struct CacheFactory;

impl CacheFactory {
    pub fn new() -> Self {
        Self
    }

    /// Creates a backend based on configuration
    pub async fn create(
        &self,
        config: &BackendConfig,
    ) -> Result<Arc<dyn DistributedCacheClient>, CacheError> {
        tracing::debug!(
            backend = %config.backend_type,
            servers = config.servers.len(),
            "Creating cache backend"
        );

        match config.backend_type {
            BackendType::InMemory => {
                let mut in_memory_config =
                    InMemoryBackendConfig::default().with_servers(config.servers.clone());

                if let Some(capacity) = config.max_capacity {
                    in_memory_config = in_memory_config.with_max_capacity(capacity);
                }

                Ok(Arc::new(InMemoryBackend::with_config(in_memory_config)))
            }
            BackendType::Redis => {
                if config.servers.is_empty() {
                    return Err(CacheError::configuration(
                        "At least one server is required for the Redis backend",
                    ));
                }

                let redis_config = RedisBackendConfig::new(config.servers.clone())
                    .with_database(config.database);

                let backend = RedisBackend::new(redis_config).await?;
                Ok(Arc::new(backend))
            }
        }
    }
}
