// src/config/mod.rs
mod models;

pub use models::*;

use anyhow::{Context, Result};
use std::path::Path;

/// Load configuration from a file (YAML or JSON), then apply `LB_*`
/// environment overrides and validate the result.
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    let mut config = parse_config(path, &contents)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;

    config.validate()?;
    Ok(config)
}

fn parse_config(path: &Path, contents: &str) -> Result<Config> {
    let config: Config = if path.extension().and_then(|s| s.to_str()) == Some("yaml")
        || path.extension().and_then(|s| s.to_str()) == Some("yml") {
        serde_yaml::from_str(contents).context("Failed to parse YAML config")?
    } else {
        serde_json::from_str(contents).context("Failed to parse JSON config")?
    };
    Ok(config)
}

/// Overlay environment values on top of the file configuration.
///
/// The lookup is injected so tests do not touch the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("LB_PORT") {
        config.listen.port = port.parse().context("LB_PORT must be a port number")?;
    }

    if let Some(strategy) = lookup("LB_STRATEGY") {
        config.strategy = strategy.parse()?;
    }

    if let Some(interval) = lookup("LB_HEALTH_CHECK_INTERVAL_SECS") {
        config.health_check.interval_secs = interval
            .parse()
            .context("LB_HEALTH_CHECK_INTERVAL_SECS must be an integer")?;
    }

    if let Some(backends) = lookup("LB_BACKENDS") {
        config.backends = backends
            .split(',')
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .collect();
    }

    Ok(())
}
