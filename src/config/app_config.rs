use serde::Deserialize;

use crate::domain::cache::ServerSpec;

/// Application configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub backend: BackendSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Which backend to build and where its servers live
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// `in_memory` or `redis`
    pub kind: String,
    pub servers: Vec<ServerSpec>,
    /// Entry limit of the in-memory backend
    pub max_capacity: u64,
    /// Redis logical database
    pub database: i64,
}

/// Key derivation and group settings of a facade
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Prepended to every derived key, typically unique per installation
    pub salt: String,
    /// Namespace of non-global groups; empty means no prefix
    pub namespace: String,
    /// Prefix of global groups
    pub global_prefix: String,
    /// Global groups in addition to the defaults
    pub global_groups: Vec<String>,
    /// Local-only groups in addition to the defaults
    pub non_persistent_groups: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: "in_memory".to_string(),
            servers: Vec::new(),
            max_capacity: 100_000,
            database: 0,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("OBJECT_CACHE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.backend.kind, "in_memory");
        assert_eq!(config.backend.max_capacity, 100_000);
        assert!(config.cache.salt.is_empty());
        assert!(config.cache.global_groups.is_empty());
    }

    #[test]
    fn test_deserialize_partial() {
        let json = r#"{
            "backend": {"kind": "redis", "servers": [{"host": "cache-1", "port": 6379, "weight": 2}]},
            "cache": {"namespace": "blog-7", "non_persistent_groups": ["sessions"]}
        }"#;

        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.backend.kind, "redis");
        assert_eq!(config.backend.servers[0].weight, 2);
        assert_eq!(config.backend.max_capacity, 100_000);
        assert_eq!(config.cache.namespace, "blog-7");
        assert_eq!(config.cache.non_persistent_groups, vec!["sessions"]);
        assert_eq!(config.logging.level, "info");
    }
}
