//! Acquisition settings shared by the store, the acquirer and the CLI.

use std::env;

use thiserror::Error;

use crate::timestamp::{parse_granularity, Granularity, Timestamp};

pub const SAMPLING_INTERVAL_ENV: &str = "GAPFILL_SAMPLING_INTERVAL";
pub const START_DATE_ENV: &str = "GAPFILL_START_DATE";

/// 2012-01-01T00:00:00Z
const DEFAULT_START_EPOCH: i64 = 1_325_376_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionConfig {
    pub granularity: Granularity,
    /// Earliest point the acquirer tries to backfill to.
    pub start: Timestamp,
}

impl AcquisitionConfig {
    pub fn new(granularity: Granularity, start: Timestamp) -> Self {
        Self { granularity, start }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        let granularity = Granularity::Day;
        Self {
            granularity,
            start: Timestamp::from_epoch(DEFAULT_START_EPOCH, granularity)
                .expect("default start date is representable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}': {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Reads `GAPFILL_SAMPLING_INTERVAL` and `GAPFILL_START_DATE` on top of the defaults.
///
/// Unset or blank variables keep the default. Unparseable values are errors: a
/// silently ignored granularity would make gap detection compare the wrong buckets.
pub fn acquisition_config_from_env() -> Result<AcquisitionConfig, ConfigError> {
    let mut config = AcquisitionConfig::default();

    if let Some(granularity) = sampling_interval_from_env()? {
        config.granularity = granularity;
    }

    let start = match non_blank_var(START_DATE_ENV) {
        Some(raw) => Timestamp::new(raw.as_str(), config.granularity).map_err(|err| {
            ConfigError::InvalidValue {
                var: START_DATE_ENV,
                value: raw.clone(),
                reason: err.to_string(),
            }
        })?,
        None => Timestamp::new(config.start, config.granularity).map_err(|err| {
            ConfigError::InvalidValue {
                var: START_DATE_ENV,
                value: config.start.to_string(),
                reason: err.to_string(),
            }
        })?,
    };
    config.start = start;

    Ok(config)
}

/// The granularity named by `GAPFILL_SAMPLING_INTERVAL`, or `None` when unset.
///
/// Existing stores keep the granularity they were created with; only an
/// explicitly configured value is checked against it.
pub fn sampling_interval_from_env() -> Result<Option<Granularity>, ConfigError> {
    non_blank_var(SAMPLING_INTERVAL_ENV)
        .map(|raw| {
            parse_granularity(&raw).map_err(|err| ConfigError::InvalidValue {
                var: SAMPLING_INTERVAL_ENV,
                value: raw.clone(),
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn non_blank_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}
