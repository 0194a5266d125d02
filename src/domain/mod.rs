//! Domain layer - Cache model, backend contract and errors

pub mod cache;
pub mod error;

pub use cache::{
    CacheValue, CasToken, DistributedCacheClient, ExpirationPolicy, GroupRegistry, KeyBuilder,
    RuntimeMirror, ServerSpec,
};
pub use error::{CacheError, ResultCode};
