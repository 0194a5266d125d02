//! Object Cache
//!
//! A two-tier object cache: a request-scoped in-process mirror in front of
//! a shared distributed backend, with support for:
//! - Namespaced, group-aware key derivation
//! - Local-only groups that never reach the backend
//! - Type-preserving append/prepend, clamped counters and CAS writes
//! - In-memory (moka) and Redis backends over a weighted server pool

pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use config::AppConfig;
pub use domain::{CacheError, CacheValue, ResultCode};
pub use infrastructure::cache::{CacheFacade, CacheFactory, GetMultiOptions, GetOptions};
