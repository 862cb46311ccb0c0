//! Environment-driven configuration.
//!
//! Every knob is a `SLOTBOOK_*` variable; a `.env` file in the working
//! directory is loaded first when present. Unset variables take defaults,
//! malformed ones are an error.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use thiserror::Error;

use crate::clock::parse_offset;
use crate::limits::*;
use crate::model::{parse_clock, MINUTES_PER_DAY};
use crate::policy::{RangeTable, ScheduleEnforcement, SlotPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}={value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Requests served concurrently before new ones get 503.
    pub max_in_flight: usize,
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
    /// Upper bound for one slot generation request.
    pub request_timeout: Duration,
    /// The clinic's wall clock. One offset for the whole deployment.
    pub utc_offset: FixedOffset,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
    pub policy: SlotPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, so tests need not touch the process env.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let utc_offset = match get("SLOTBOOK_UTC_OFFSET") {
            Some(raw) => parse_offset(&raw).ok_or_else(|| invalid("SLOTBOOK_UTC_OFFSET", &raw, "expected Z or ±HH:MM"))?,
            None => Utc.fix(),
        };

        let rollover_after = match get("SLOTBOOK_ROLLOVER_AFTER") {
            None => SlotPolicy::default().rollover_after,
            Some(raw) if raw.eq_ignore_ascii_case("off") => None,
            Some(raw) => {
                let m = parse_clock(&raw).map_err(|e| invalid("SLOTBOOK_ROLLOVER_AFTER", &raw, e))?;
                if m >= MINUTES_PER_DAY {
                    return Err(invalid("SLOTBOOK_ROLLOVER_AFTER", &raw, "must be before 24:00"));
                }
                Some(m)
            }
        };

        let defaults = SlotPolicy::default();
        let policy = SlotPolicy {
            lead_time: bounded(
                get("SLOTBOOK_LEAD_TIME_MINUTES"),
                "SLOTBOOK_LEAD_TIME_MINUTES",
                defaults.lead_time,
                0..=MINUTES_PER_DAY,
            )?,
            rollover_after,
            default_max_per_day: bounded(
                get("SLOTBOOK_MAX_PER_DAY"),
                "SLOTBOOK_MAX_PER_DAY",
                defaults.default_max_per_day,
                1..=MAX_SLOTS_PER_DAY,
            )?,
            next_available: bounded(
                get("SLOTBOOK_NEXT_AVAILABLE"),
                "SLOTBOOK_NEXT_AVAILABLE",
                defaults.next_available,
                0..=MAX_NEXT_AVAILABLE,
            )?,
            ranges: RangeTable {
                next_week: bounded(
                    get("SLOTBOOK_RANGE_NEXT_WEEK"),
                    "SLOTBOOK_RANGE_NEXT_WEEK",
                    defaults.ranges.next_week,
                    0..=MAX_RANGE_DAYS,
                )?,
                two_weeks: bounded(
                    get("SLOTBOOK_RANGE_TWO_WEEKS"),
                    "SLOTBOOK_RANGE_TWO_WEEKS",
                    defaults.ranges.two_weeks,
                    0..=MAX_RANGE_DAYS,
                )?,
                month: bounded(
                    get("SLOTBOOK_RANGE_MONTH"),
                    "SLOTBOOK_RANGE_MONTH",
                    defaults.ranges.month,
                    0..=MAX_RANGE_DAYS,
                )?,
            },
            enforcement: parsed::<ScheduleEnforcement>(
                get("SLOTBOOK_ENFORCEMENT"),
                "SLOTBOOK_ENFORCEMENT",
                defaults.enforcement,
            )?,
            reject_past: flag(get("SLOTBOOK_REJECT_PAST"), "SLOTBOOK_REJECT_PAST", defaults.reject_past)?,
        };

        let metrics_port = match get("SLOTBOOK_METRICS_PORT") {
            Some(raw) => Some(raw.parse().map_err(|e| invalid("SLOTBOOK_METRICS_PORT", &raw, e))?),
            None => None,
        };

        Ok(Self {
            bind: get("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(get("SLOTBOOK_PORT"), "SLOTBOOK_PORT", 8080)?,
            data_dir: PathBuf::from(get("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            max_in_flight: bounded(get("SLOTBOOK_MAX_IN_FLIGHT"), "SLOTBOOK_MAX_IN_FLIGHT", 256, 1..=65_536)?,
            compact_threshold: parsed(get("SLOTBOOK_COMPACT_THRESHOLD"), "SLOTBOOK_COMPACT_THRESHOLD", 1000)?,
            compact_interval: Duration::from_secs(bounded(
                get("SLOTBOOK_COMPACT_INTERVAL_SECS"),
                "SLOTBOOK_COMPACT_INTERVAL_SECS",
                30,
                1..=86_400,
            )?),
            metrics_port,
            request_timeout: Duration::from_millis(bounded(
                get("SLOTBOOK_REQUEST_TIMEOUT_MS"),
                "SLOTBOOK_REQUEST_TIMEOUT_MS",
                5_000,
                1..=600_000,
            )?),
            utc_offset,
            log_filter: get("SLOTBOOK_LOG").unwrap_or_else(|| "info".into()),
            policy,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parsed<T>(raw: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match raw {
        Some(raw) => raw.trim().parse().map_err(|e| invalid(key, &raw, e)),
        None => Ok(default),
    }
}

fn bounded<T>(
    raw: Option<String>,
    key: &'static str,
    default: T,
    range: std::ops::RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Display + Copy,
    T::Err: Display,
{
    let value = parsed(raw, key, default)?;
    if !range.contains(&value) {
        return Err(invalid(
            key,
            &value.to_string(),
            format!("must be between {} and {}", range.start(), range.end()),
        ));
    }
    Ok(value)
}

fn flag(raw: Option<String>, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::trim) {
        None => Ok(default),
        Some("1" | "true" | "yes" | "on") => Ok(true),
        Some("0" | "false" | "no" | "off") => Ok(false),
        Some(other) => Err(invalid(key, other, "expected true or false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = from_pairs(&[]).unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.max_in_flight, 256);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.utc_offset.local_minus_utc(), 0);
        assert_eq!(cfg.policy, SlotPolicy::default());
    }

    #[test]
    fn policy_knobs_override() {
        let cfg = from_pairs(&[
            ("SLOTBOOK_LEAD_TIME_MINUTES", "15"),
            ("SLOTBOOK_ROLLOVER_AFTER", "off"),
            ("SLOTBOOK_MAX_PER_DAY", "20"),
            ("SLOTBOOK_RANGE_MONTH", "31"),
            ("SLOTBOOK_ENFORCEMENT", "members_only"),
            ("SLOTBOOK_REJECT_PAST", "false"),
            ("SLOTBOOK_UTC_OFFSET", "+05:30"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
        ])
        .unwrap();
        assert_eq!(cfg.policy.lead_time, 15);
        assert_eq!(cfg.policy.rollover_after, None);
        assert_eq!(cfg.policy.default_max_per_day, 20);
        assert_eq!(cfg.policy.ranges.month, 31);
        assert_eq!(cfg.policy.enforcement, ScheduleEnforcement::MembersOnly);
        assert!(!cfg.policy.reject_past);
        assert_eq!(cfg.utc_offset.local_minus_utc(), 5 * 3600 + 30 * 60);
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn rollover_clock_time() {
        let cfg = from_pairs(&[("SLOTBOOK_ROLLOVER_AFTER", "17:30")]).unwrap();
        assert_eq!(cfg.policy.rollover_after, Some(17 * 60 + 30));
        assert!(from_pairs(&[("SLOTBOOK_ROLLOVER_AFTER", "24:00")]).is_err());
    }

    #[test]
    fn blank_values_fall_back() {
        let cfg = from_pairs(&[("SLOTBOOK_PORT", "  ")]).unwrap();
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn malformed_values_rejected() {
        for (key, value) in [
            ("SLOTBOOK_PORT", "eighty"),
            ("SLOTBOOK_MAX_PER_DAY", "0"),
            ("SLOTBOOK_RANGE_NEXT_WEEK", "400"),
            ("SLOTBOOK_ENFORCEMENT", "strict"),
            ("SLOTBOOK_REJECT_PAST", "maybe"),
            ("SLOTBOOK_UTC_OFFSET", "+25:00"),
            ("SLOTBOOK_MAX_IN_FLIGHT", "0"),
        ] {
            let err = from_pairs(&[(key, value)]).unwrap_err();
            let ConfigError::Invalid { key: got, .. } = err;
            assert_eq!(got, key);
        }
    }
}
