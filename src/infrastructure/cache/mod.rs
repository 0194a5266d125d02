//! Cache infrastructure - backends, routing and the two-tier facade

mod facade;
mod factory;
mod in_memory;
mod redis;
mod routing;

pub use facade::{CacheFacade, CacheLookup, GetMultiOptions, GetOptions, HitStats, MultiLookup};
pub use factory::{parse_servers, BackendConfig, BackendType, CacheFactory};
pub use in_memory::{InMemoryBackend, InMemoryBackendConfig};
pub use redis::{RedisBackend, RedisBackendConfig};
pub use routing::ServerRouter;
