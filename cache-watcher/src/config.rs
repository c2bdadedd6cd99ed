use anyhow::{Context, Result};
use cache_connector::config::{ConnectorConfig, Endpoint};
use cache_connector::Address;
use cache_logger::LogConfig;
use serde::Deserialize;

use crate::cli::WatchCmd;

/// The top-level configuration for the CACHE watcher.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct WatcherConfig {
    #[serde(default)]
    pub connector: ConnectorConfig,
    #[serde(default)]
    pub watcher: WatcherSettings,
}

/// Contains settings that are unique to the watcher binary.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct WatcherSettings {
    /// Addresses whose confirmed transfers are printed.
    #[serde(default)]
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub log: LogConfig,
}

impl WatcherConfig {
    /// Builds a configuration from the `watch` subcommand's arguments.
    pub fn from_watch(cmd: WatchCmd) -> Self {
        let mut config = Self::default();
        config.connector.node.endpoints = vec![Endpoint::parse(&cmd.node)];
        config.watcher.addresses = cmd.addresses;
        config.watcher.log.level = cmd.level;
        config
    }
}

/// Loads the watcher configuration from a TOML file, with `CACHE__`-prefixed
/// environment variables layered on top.
pub fn load_config(path: &str) -> Result<WatcherConfig> {
    let builder = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix("CACHE").separator("__"));

    let settings: WatcherConfig = builder
        .build()
        .context(format!("Failed to build configuration from '{}'", path))?
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    Ok(settings)
}
