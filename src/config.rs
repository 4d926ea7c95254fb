use std::path::PathBuf;
use std::time::Duration;

use crate::model::{HOUR_MS, MINUTE_MS, Ms};

/// Runtime settings, read from `SLOTKEEPER_*` environment variables.
/// Unparseable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    /// How far ahead of the start a reminder is sent.
    pub reminder_lead: Ms,
    /// Tolerance around `reminder_lead`; the sweep fires for starts within lead ± slack.
    pub reminder_slack: Ms,
}

/// `count` units of `unit` milliseconds, or `None` if that does not fit in `Ms`.
fn to_ms(count: u64, unit: Ms) -> Option<Ms> {
    Ms::try_from(count).ok()?.checked_mul(unit)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            reminder_lead: 24 * HOUR_MS,
            reminder_slack: 60 * MINUTE_MS,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            data_dir: lookup("SLOTKEEPER_DATA_DIR")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: lookup("SLOTKEEPER_METRICS_PORT").and_then(|s| s.trim().parse().ok()),
            compact_threshold: parsed("SLOTKEEPER_COMPACT_THRESHOLD")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.compact_threshold),
            sweep_interval: parsed("SLOTKEEPER_SWEEP_INTERVAL_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            reminder_lead: parsed("SLOTKEEPER_REMINDER_LEAD_HOURS")
                .and_then(|h| to_ms(h, HOUR_MS))
                .unwrap_or(defaults.reminder_lead),
            reminder_slack: parsed("SLOTKEEPER_REMINDER_SLACK_MINUTES")
                .and_then(|m| to_ms(m, MINUTE_MS))
                .unwrap_or(defaults.reminder_slack),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotkeeper.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config, Config::default());
        assert_eq!(config.wal_path(), PathBuf::from("./data/slotkeeper.wal"));
    }

    #[test]
    fn values_are_read() {
        let config = Config::from_lookup(lookup_from(&[
            ("SLOTKEEPER_DATA_DIR", "/var/lib/slotkeeper"),
            ("SLOTKEEPER_METRICS_PORT", "9100"),
            ("SLOTKEEPER_COMPACT_THRESHOLD", "50"),
            ("SLOTKEEPER_SWEEP_INTERVAL_SECS", "5"),
            ("SLOTKEEPER_REMINDER_LEAD_HOURS", "2"),
            ("SLOTKEEPER_REMINDER_SLACK_MINUTES", "10"),
        ]));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotkeeper"));
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.compact_threshold, 50);
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.reminder_lead, 2 * HOUR_MS);
        assert_eq!(config.reminder_slack, 10 * MINUTE_MS);
    }

    #[test]
    fn garbage_falls_back() {
        let config = Config::from_lookup(lookup_from(&[
            ("SLOTKEEPER_METRICS_PORT", "not-a-port"),
            ("SLOTKEEPER_COMPACT_THRESHOLD", "0"),
            ("SLOTKEEPER_SWEEP_INTERVAL_SECS", "-3"),
            ("SLOTKEEPER_DATA_DIR", "  "),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn oversized_durations_fall_back() {
        let config = Config::from_lookup(lookup_from(&[
            ("SLOTKEEPER_REMINDER_LEAD_HOURS", "18446744073709551615"),
            ("SLOTKEEPER_REMINDER_SLACK_MINUTES", "9223372036854775807"),
        ]));
        assert_eq!(config.reminder_lead, Config::default().reminder_lead);
        assert_eq!(config.reminder_slack, Config::default().reminder_slack);
    }
}
