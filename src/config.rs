//! Configuration types.

use crate::error::ConfigError;

/// Environment variable holding the worker pool size.
pub const MAX_WORKERS_ENV: &str = "MAX_WORKERS";
/// Environment variable holding the intake queue depth.
pub const MAX_QUEUE_ENV: &str = "MAX_QUEUE";
/// Environment variable holding the demo binary's parcel count.
pub const DEMO_PARCELS_ENV: &str = "DEMO_PARCELS";
/// Parcels the demo binary submits when `DEMO_PARCELS` is unset.
pub const DEFAULT_DEMO_PARCELS: usize = 20;

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of concurrent workers.
    pub max_workers: usize,
    /// Capacity of the intake queue; the only backpressure bound.
    pub max_queue: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue: 100,
        }
    }
}

impl PoolConfig {
    /// Load from `MAX_WORKERS` / `MAX_QUEUE`, keeping defaults for unset variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            max_workers: parse_positive(MAX_WORKERS_ENV, lookup(MAX_WORKERS_ENV))?
                .unwrap_or(defaults.max_workers),
            max_queue: parse_positive(MAX_QUEUE_ENV, lookup(MAX_QUEUE_ENV))?
                .unwrap_or(defaults.max_queue),
        };
        config.validate()?;
        Ok(config)
    }

    /// Both values must be positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::invalid(MAX_WORKERS_ENV, "must be at least 1"));
        }
        if self.max_queue == 0 {
            return Err(ConfigError::invalid(MAX_QUEUE_ENV, "must be at least 1"));
        }
        Ok(())
    }
}

/// Parcel count for the demo binary. Unset keeps the default.
pub fn demo_parcels_from_env() -> Result<usize, ConfigError> {
    demo_parcels_from_lookup(|key| std::env::var(key).ok())
}

pub fn demo_parcels_from_lookup<F>(lookup: F) -> Result<usize, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_positive(DEMO_PARCELS_ENV, lookup(DEMO_PARCELS_ENV))?.unwrap_or(DEFAULT_DEMO_PARCELS))
}

fn parse_positive(key: &str, raw: Option<String>) -> Result<Option<usize>, ConfigError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value = raw
        .trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::invalid(key, format!("'{raw}' is not a positive integer: {e}")))?;
    if value == 0 {
        return Err(ConfigError::invalid(key, "must be at least 1"));
    }
    Ok(Some(value))
}
