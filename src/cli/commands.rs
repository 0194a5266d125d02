//! Runs a parsed command against the configured backend

use tracing::info;

use crate::config::AppConfig;
use crate::infrastructure::cache::{
    parse_servers, BackendConfig, CacheFacade, CacheFactory, GetOptions,
};
use crate::infrastructure::logging;

use super::{parse_value, Cli, Command};

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::load().unwrap_or_default();
    logging::init_logging(&config.logging);

    let backend_config = BackendConfig::try_from(&config.backend)?;
    let backend = CacheFactory::new().create(&backend_config).await?;
    info!(backend = %backend_config.backend_type, "Cache backend ready");

    let mut cache = CacheFacade::new(backend, &config.cache);
    let server_key = cli.server_key.as_deref();

    match cli.command {
        Command::Get { key, group, cas } => {
            let options = if cas {
                GetOptions::with_cas()
            } else {
                GetOptions::default()
            };
            let lookup = match server_key {
                Some(server_key) => cache.get_by_key(server_key, &key, &group, options).await,
                None => cache.get(&key, &group, options).await,
            };

            match lookup.value {
                Some(value) => {
                    println!("{}", serde_json::to_string(&value)?);
                    if let Some(token) = lookup.cas.filter(|_| cas) {
                        println!("cas: {}", token.0);
                    }
                }
                None => anyhow::bail!("{}", cache.result_message()),
            }
        }
        Command::Set {
            key,
            value,
            group,
            expire,
        } => {
            let value = parse_value(&value);
            match server_key {
                Some(server_key) => {
                    cache
                        .set_by_key(server_key, &key, value, &group, expire)
                        .await?
                }
                None => cache.set(&key, value, &group, expire).await?,
            }
            println!("{}", cache.result_message());
        }
        Command::Delete { key, group, defer } => {
            match server_key {
                Some(server_key) => cache.delete_by_key(server_key, &key, &group, defer).await?,
                None => cache.delete(&key, &group, defer).await?,
            }
            println!("{}", cache.result_message());
        }
        Command::Incr { key, offset, group } => {
            let value = match (server_key, offset < 0) {
                (Some(server_key), false) => {
                    cache.increment_by_key(server_key, &key, offset, &group).await?
                }
                (Some(server_key), true) => {
                    cache
                        .decrement_by_key(server_key, &key, offset.saturating_neg(), &group)
                        .await?
                }
                (None, false) => cache.increment(&key, offset, &group).await?,
                (None, true) => {
                    cache
                        .decrement(&key, offset.saturating_neg(), &group)
                        .await?
                }
            };
            println!("{}", value);
        }
        Command::Flush { delay } => {
            cache.flush(delay).await?;
            println!("{}", cache.result_message());
        }
        Command::Servers { key, add } => {
            if let Some(list) = add {
                cache.add_servers(parse_servers(&list)?).await?;
            }

            match key {
                Some(key) => match cache.server_by_key(&key).await {
                    Some(server) => println!("{}", server.address()),
                    None => anyhow::bail!("no servers configured"),
                },
                None => {
                    for server in cache.server_list().await {
                        println!("{} weight={}", server.address(), server.weight);
                    }
                }
            }
        }
        Command::Stats => {
            let stats = cache.stats().await?;
            let versions = cache.version().await?;
            let report = serde_json::json!({
                "stats": stats,
                "versions": versions,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
