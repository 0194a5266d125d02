//! CLI module for the object cache
//!
//! Provides one-shot subcommands against the configured backend:
//! - `get`, `set`, `delete`, `incr`: single-key operations
//! - `flush`: invalidate every entry
//! - `servers`, `stats`: inspect the server pool

pub mod commands;

use clap::{Parser, Subcommand};

use crate::domain::CacheValue;

/// Object cache - two-tier cache over a distributed backend
#[derive(Parser)]
#[command(name = "object-cache")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Route keys to the server owning this key instead of the item key
    #[arg(long, global = true)]
    pub server_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Read a key
    Get {
        key: String,
        #[arg(short, long, default_value = "default")]
        group: String,
        /// Also print the concurrency token
        #[arg(long)]
        cas: bool,
    },

    /// Store a value; integers, floats, booleans and JSON keep their type
    Set {
        key: String,
        value: String,
        #[arg(short, long, default_value = "default")]
        group: String,
        /// Seconds to live, or an absolute unix timestamp; 0 never expires
        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        expire: i64,
    },

    /// Delete a key
    Delete {
        key: String,
        #[arg(short, long, default_value = "default")]
        group: String,
        /// Keep the key blocked for this many seconds
        #[arg(long, default_value_t = 0)]
        defer: u64,
    },

    /// Add to a counter; negative offsets decrement, stopping at zero
    Incr {
        key: String,
        #[arg(default_value_t = 1, allow_hyphen_values = true)]
        offset: i64,
        #[arg(short, long, default_value = "default")]
        group: String,
    },

    /// Invalidate every entry
    Flush {
        /// Seconds to wait before flushing
        #[arg(long, default_value_t = 0)]
        delay: u64,
    },

    /// List servers, or show the server owning a key
    Servers {
        #[arg(long)]
        key: Option<String>,

        /// Servers to add first, as `host:port[:weight],...`
        #[arg(long)]
        add: Option<String>,
    },

    /// Show per-server statistics and versions
    Stats,
}

/// Reads a command-line value, keeping numbers, booleans and JSON typed
pub fn parse_value(raw: &str) -> CacheValue {
    if let Ok(value) = raw.parse::<i64>() {
        return CacheValue::Int(value);
    }
    if let Ok(value) = raw.parse::<f64>() {
        if value.is_finite() {
            return CacheValue::Float(value);
        }
    }
    match raw {
        "true" => return CacheValue::Bool(true),
        "false" => return CacheValue::Bool(false),
        _ => {}
    }
    if raw.starts_with('{') || raw.starts_with('[') {
        if let Ok(record) = serde_json::from_str::<serde_json::Value>(raw) {
            return CacheValue::Record(record);
        }
    }
    CacheValue::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_types() {
        assert_eq!(parse_value("42"), CacheValue::Int(42));
        assert_eq!(parse_value("-7"), CacheValue::Int(-7));
        assert_eq!(parse_value("1.5"), CacheValue::Float(1.5));
        assert_eq!(parse_value("true"), CacheValue::Bool(true));
        assert_eq!(parse_value("hello"), CacheValue::from("hello"));
        assert_eq!(parse_value("inf"), CacheValue::from("inf"));
        assert_eq!(
            parse_value(r#"{"a":1}"#),
            CacheValue::Record(serde_json::json!({"a": 1}))
        );
        assert_eq!(parse_value("{not json"), CacheValue::from("{not json"));
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["object-cache", "set", "k", "12", "-g", "posts", "-e", "60"]);
        match cli.command {
            Command::Set {
                key,
                value,
                group,
                expire,
            } => {
                assert_eq!(key, "k");
                assert_eq!(value, "12");
                assert_eq!(group, "posts");
                assert_eq!(expire, 60);
            }
            _ => panic!("expected set"),
        }

        let cli = Cli::parse_from(["object-cache", "incr", "hits", "-3", "--server-key", "s1"]);
        assert_eq!(cli.server_key.as_deref(), Some("s1"));
        assert!(matches!(cli.command, Command::Incr { offset: -3, .. }));

        let cli = Cli::parse_from(["object-cache", "servers", "--add", "a:11211:2,b:11211"]);
        match cli.command {
            Command::Servers { key, add } => {
                assert!(key.is_none());
                assert_eq!(add.as_deref(), Some("a:11211:2,b:11211"));
            }
            _ => panic!("expected servers"),
        }
    }
}
