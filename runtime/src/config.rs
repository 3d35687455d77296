//! Runtime configuration.
//!
//! Loads configuration from environment variables (optionally seeded from a
//! `.env` file) with defaults for everything.
//!
//! | Variable | Default |
//! |---|---|
//! | `WAYBILL_NUMBER_FORMAT` | `year_sequence` |
//! | `WAYBILL_NUMBER_PREFIX` | required for `prefix_sequence` |
//! | `WAYBILL_NUMBER_TEMPLATE` | required for `custom` |
//! | `WAYBILL_DEDUP_RULE` | `farm_waybill_consignee_product` |
//! | `WAYBILL_LOYALTY_POINTS_PER_CHILD` | `10` |
//! | `WAYBILL_LOYALTY_EXPIRY_DAYS` | `365` |
//! | `WAYBILL_EVENT_QUEUE_CAPACITY` | `1024` |
//! | `WAYBILL_ALLOCATION_RETRIES` | `3` |

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use waybill_flow_core::allocation::DedupRule;
use waybill_flow_core::constants::defaults;
use waybill_flow_core::numbering::NumberFormat;

/// A configuration value could not be used.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid value '{value}' for {key}: {reason}")]
pub struct ConfigError {
    /// Variable name.
    pub key: &'static str,
    /// Offending value.
    pub value: String,
    /// Why it was rejected.
    pub reason: String,
}

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Child waybill number format.
    pub number_format: NumberFormat,
    /// Child waybill dedup rule.
    pub dedup_rule: DedupRule,
    /// Loyalty points per non-cancelled child waybill on cut.
    pub loyalty_points_per_child: i64,
    /// Days until credited points expire.
    pub loyalty_expiry_days: i64,
    /// Capacity of each listener queue.
    pub event_queue_capacity: usize,
    /// Replays of an allocation that lost a dedup race.
    pub allocation_retries: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            number_format: NumberFormat::default(),
            dedup_rule: DedupRule::default(),
            loyalty_points_per_child: defaults::LOYALTY_POINTS_PER_CHILD,
            loyalty_expiry_days: defaults::LOYALTY_EXPIRY_DAYS,
            event_queue_capacity: defaults::EVENT_QUEUE_CAPACITY,
            allocation_retries: defaults::ALLOCATION_RETRIES,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from the process environment, after applying a
    /// `.env` file if one is present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a malformed or inconsistent value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a malformed or inconsistent value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let number_format = match lookup("WAYBILL_NUMBER_FORMAT") {
            None => defaults.number_format,
            Some(name) => NumberFormat::from_config(
                &name,
                lookup("WAYBILL_NUMBER_PREFIX").as_deref(),
                lookup("WAYBILL_NUMBER_TEMPLATE").as_deref(),
            )
            .map_err(|e| ConfigError {
                key: "WAYBILL_NUMBER_FORMAT",
                value: name.clone(),
                reason: e.to_string(),
            })?,
        };

        let config = Self {
            number_format,
            dedup_rule: parse(&lookup, "WAYBILL_DEDUP_RULE", defaults.dedup_rule)?,
            loyalty_points_per_child: parse(
                &lookup,
                "WAYBILL_LOYALTY_POINTS_PER_CHILD",
                defaults.loyalty_points_per_child,
            )?,
            loyalty_expiry_days: parse(
                &lookup,
                "WAYBILL_LOYALTY_EXPIRY_DAYS",
                defaults.loyalty_expiry_days,
            )?,
            event_queue_capacity: parse(
                &lookup,
                "WAYBILL_EVENT_QUEUE_CAPACITY",
                defaults.event_queue_capacity,
            )?,
            allocation_retries: parse(
                &lookup,
                "WAYBILL_ALLOCATION_RETRIES",
                defaults.allocation_retries,
            )?,
        };

        if config.loyalty_points_per_child < 0 {
            return Err(ConfigError {
                key: "WAYBILL_LOYALTY_POINTS_PER_CHILD",
                value: config.loyalty_points_per_child.to_string(),
                reason: "must not be negative".into(),
            });
        }
        if config.event_queue_capacity == 0 {
            return Err(ConfigError {
                key: "WAYBILL_EVENT_QUEUE_CAPACITY",
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(config)
    }

    /// Retry policy for allocations that lose a dedup race.
    #[must_use]
    pub const fn allocation_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.allocation_retries)
            .initial_delay(Duration::from_millis(5))
            .max_delay(Duration::from_millis(200))
            .build()
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
