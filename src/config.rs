use std::path::PathBuf;
use std::time::Duration;

use chrono::TimeDelta;

/// Scheduling knobs handed to the engine and to every lifecycle predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleConfig {
    /// How long before `reserve_start_at` an early start is allowed.
    pub grace_period: TimeDelta,
    /// How long before `reserve_start_at` the start time freezes.
    pub lock_window: TimeDelta,
    /// Upper bound on waiting for a channel's occupancy lock.
    pub lock_timeout: Duration,
    /// Upper bound on a device status probe.
    pub device_timeout: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            grace_period: TimeDelta::minutes(5),
            lock_window: TimeDelta::hours(12),
            lock_timeout: Duration::from_secs(2),
            device_timeout: Duration::from_secs(3),
        }
    }
}

/// Settings for the `labsched` daemon, read from `LABSCHED_*` variables.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub schedule: ScheduleConfig,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unset, unparsable or out-of-range values
    /// fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|s| s.parse().ok())
        }

        let defaults = ScheduleConfig::default();
        let schedule = ScheduleConfig {
            grace_period: parsed(&lookup, "LABSCHED_GRACE_PERIOD_MINUTES")
                .and_then(TimeDelta::try_minutes)
                .unwrap_or(defaults.grace_period),
            lock_window: parsed(&lookup, "LABSCHED_LOCK_WINDOW_HOURS")
                .and_then(TimeDelta::try_hours)
                .unwrap_or(defaults.lock_window),
            lock_timeout: parsed(&lookup, "LABSCHED_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            device_timeout: parsed(&lookup, "LABSCHED_DEVICE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.device_timeout),
        };

        Self {
            data_dir: lookup("LABSCHED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            metrics_port: parsed(&lookup, "LABSCHED_METRICS_PORT"),
            sweep_interval: parsed::<u64>(&lookup, "LABSCHED_SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(60)),
            compact_threshold: parsed(&lookup, "LABSCHED_COMPACT_THRESHOLD").unwrap_or(1000),
            schedule,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("labsched.wal")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_environment_uses_defaults() {
        let cfg = DaemonConfig::from_lookup(|_| None);
        assert_eq!(cfg.data_dir, PathBuf::from("./data"));
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.schedule, ScheduleConfig::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LABSCHED_DATA_DIR", "/var/lib/labsched"),
            ("LABSCHED_METRICS_PORT", "9100"),
            ("LABSCHED_GRACE_PERIOD_MINUTES", "10"),
            ("LABSCHED_LOCK_WINDOW_HOURS", "24"),
            ("LABSCHED_DEVICE_TIMEOUT_MS", "500"),
        ]);
        let cfg = DaemonConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.wal_path(), PathBuf::from("/var/lib/labsched/labsched.wal"));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.schedule.grace_period, TimeDelta::minutes(10));
        assert_eq!(cfg.schedule.lock_window, TimeDelta::hours(24));
        assert_eq!(cfg.schedule.device_timeout, Duration::from_millis(500));
    }

    #[test]
    fn garbage_falls_back() {
        let cfg = DaemonConfig::from_lookup(|k| {
            (k == "LABSCHED_SWEEP_INTERVAL_SECS").then(|| "soon".to_string())
        });
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn out_of_range_falls_back() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("LABSCHED_SWEEP_INTERVAL_SECS", "0"),
            ("LABSCHED_GRACE_PERIOD_MINUTES", "9223372036854775807"),
            ("LABSCHED_LOCK_WINDOW_HOURS", "9223372036854775807"),
        ]);
        let cfg = DaemonConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.schedule, ScheduleConfig::default());
    }
}
