//! Cache domain - keys, groups, values and the backend contract

mod client;
mod expiration;
mod groups;
mod key;
mod mirror;
mod value;

pub use client::{
    CasToken, DistributedCacheClient, Fetched, FetchedItem, LastResultCode, ReadThrough,
    ServerSpec, ServerStats,
};
pub use expiration::{Deadline, ExpirationPolicy, RELATIVE_EXPIRATION_LIMIT};
pub use groups::{DEFAULT_GLOBAL_GROUPS, DEFAULT_NON_PERSISTENT_GROUPS, GroupRegistry};
pub use key::{BatchKey, DEFAULT_GROUP, KeyBuilder};
pub use mirror::RuntimeMirror;
pub use value::{CacheValue, Direction, ValueTag, combine};

#[cfg(test)]
pub use client::mock::MockBackend;
