//! Environment variable overrides, applied after all file layers.

use std::str::FromStr;

use crate::{ChainMode, ConfigError, FathomConfig, Result};

pub const INVOKE_TIMEOUT_ENV: &str = "FATHOM_INVOKE_TIMEOUT_MS";
pub const COMPILE_TIMEOUT_ENV: &str = "FATHOM_COMPILE_TIMEOUT_MS";
pub const CACHE_TTL_ENV: &str = "FATHOM_CACHE_TTL_SECS";
pub const MAX_HEAP_ENV: &str = "FATHOM_MAX_HEAP_MB";
pub const CHAIN_MODE_ENV: &str = "FATHOM_CHAIN_MODE";
pub const INSTANCE_INDEX_ENV: &str = "FATHOM_INSTANCE_INDEX";
pub const TOTAL_INSTANCES_ENV: &str = "FATHOM_TOTAL_INSTANCES";

/// Apply overrides from the process environment.
pub fn apply_env_overrides(config: &mut FathomConfig) -> Result<Vec<&'static str>> {
    apply_overrides_from(config, |name| std::env::var(name).ok())
}

/// Apply overrides using `lookup` as the variable source.
///
/// Returns the names of the variables that were applied. Empty values are
/// treated as unset.
pub fn apply_overrides_from<F>(config: &mut FathomConfig, lookup: F) -> Result<Vec<&'static str>>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &'static str| lookup(name).filter(|v| !v.trim().is_empty());
    let mut applied = Vec::new();

    if let Some(v) = get(INVOKE_TIMEOUT_ENV) {
        config.runtime_mut().invoke_timeout_ms = parse(INVOKE_TIMEOUT_ENV, &v, "milliseconds")?;
        applied.push(INVOKE_TIMEOUT_ENV);
    }
    if let Some(v) = get(COMPILE_TIMEOUT_ENV) {
        config.runtime_mut().compile_timeout_ms = parse(COMPILE_TIMEOUT_ENV, &v, "milliseconds")?;
        applied.push(COMPILE_TIMEOUT_ENV);
    }
    if let Some(v) = get(CACHE_TTL_ENV) {
        config.runtime_mut().cache_ttl_secs = parse(CACHE_TTL_ENV, &v, "seconds")?;
        applied.push(CACHE_TTL_ENV);
    }
    if let Some(v) = get(MAX_HEAP_ENV) {
        config.runtime_mut().max_heap_mb = parse(MAX_HEAP_ENV, &v, "megabytes")?;
        applied.push(MAX_HEAP_ENV);
    }
    if let Some(v) = get(CHAIN_MODE_ENV) {
        config.runtime_mut().chain_mode =
            parse::<ChainMode>(CHAIN_MODE_ENV, &v, "first, sequential or merge")?;
        applied.push(CHAIN_MODE_ENV);
    }
    if let Some(v) = get(INSTANCE_INDEX_ENV) {
        config.state_mut().instance_index = parse(INSTANCE_INDEX_ENV, &v, "an integer")?;
        applied.push(INSTANCE_INDEX_ENV);
    }
    if let Some(v) = get(TOTAL_INSTANCES_ENV) {
        config.state_mut().total_instances = parse(TOTAL_INSTANCES_ENV, &v, "an integer")?;
        applied.push(TOTAL_INSTANCES_ENV);
    }

    Ok(applied)
}

fn parse<T: FromStr>(var: &str, value: &str, expected: &'static str) -> Result<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
        expected,
    })
}
