use std::path::Path;

use anyhow::{Context, Result, bail};
use conductor_core::ConductorConfig;

/// Load the TOML configuration. A missing file yields the defaults, so the
/// daemon runs without any configuration at all.
pub fn load_config(path: &Path) -> Result<ConductorConfig> {
    if !path.exists() {
        return Ok(ConductorConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: ConductorConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

pub fn validate_config(config: &ConductorConfig) -> Result<()> {
    if config.dispatcher.max_concurrent_turns == 0 {
        bail!("dispatcher.max_concurrent_turns must be at least 1");
    }
    if config.branching.slug_max_length == 0 {
        bail!("branching.slug_max_length must be at least 1");
    }
    for (model, price) in &config.prices {
        let rates = [
            price.input,
            price.output,
            price.cache_read,
            price.cache_write,
        ];
        if rates.iter().any(|rate| rate.is_sign_negative()) {
            bail!("prices.{model}: rates must be non-negative");
        }
    }
    if let Some(cap) = config.budgets.team_daily_cap {
        if cap.is_sign_negative() {
            bail!("budgets.team_daily_cap must be non-negative");
        }
    }
    if let Some(cap) = config.budgets.per_task_cap {
        if cap.is_sign_negative() {
            bail!("budgets.per_task_cap must be non-negative");
        }
    }
    Ok(())
}
