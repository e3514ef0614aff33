//! Loads the broker configuration.
//!
//! Values come from, in increasing precedence:
//! - the configuration file (`broker.toml` unless one is named)
//! - environment variables with the `BROKER` prefix, `__` separating
//!   nested keys (`BROKER__SESSION__SECRET`, `BROKER__LOGGING__LEVEL`)

use anyhow::{Context, Result};
use broker_oauth_server::BrokerConfig;
use config::{Config, Environment, File};
use std::path::Path;
use tracing::debug;

const DEFAULT_CONFIG_FILE: &str = "broker.toml";

/// An explicitly named file must exist; the default one is optional.
pub fn load(path: Option<&Path>) -> Result<BrokerConfig> {
    let mut builder = Config::builder();
    match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!("configuration file {} does not exist", path.display());
            }
            builder = builder.add_source(File::from(path));
        }
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            builder = builder.add_source(File::with_name(DEFAULT_CONFIG_FILE));
        }
        None => debug!("no {DEFAULT_CONFIG_FILE} found, reading the environment only"),
    }

    builder = builder.add_source(
        Environment::with_prefix("BROKER")
            .separator("__")
            .try_parsing(true),
    );

    let config: BrokerConfig = builder
        .build()
        .context("Failed to build configuration")?
        .try_deserialize()
        .context("Failed to deserialize configuration")?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
