//! Configuration management for the network defense service.
//!
//! Configuration is layered: the optional file named by `CONFIG_FILE`
//! (default `config/default.toml`), then environment variables such as
//! `DETECTION__TICK_SECONDS=2`, then the defaults below.

use std::env;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};

use crate::models::Config;

/// Load configuration from the config file and environment variables
pub fn load_config() -> Result<Config, ConfigError> {
    let config_file = env::var("CONFIG_FILE").unwrap_or_else(|_| "config/default.toml".to_string());

    let config = ConfigBuilder::builder()
        .add_source(File::with_name(&config_file).required(false))
        .add_source(Environment::default().separator("__"))
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.port", 8080)?
        .set_default("redis.url", "redis://127.0.0.1:6379")?
        .set_default("storage.backend", "file")?
        .set_default("storage.path", "data/blocks.json")?
        .set_default("firewall.backend", "netsh")?
        .build()?;

    config.try_deserialize()
}
