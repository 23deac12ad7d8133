use std::str::FromStr;
use std::time::Duration;

use spool_core::booking::{
    RebalancePolicy, DEFAULT_REBALANCE_FLOOR_KB, DEFAULT_REBALANCE_HEADROOM_PERCENT,
};
use spool_core::error::CoreError;
use spool_core::frame::DEFAULT_ORPHAN_TIMEOUT;
use spool_core::resources::DEFAULT_MIN_MEMORY_PER_CORE_KB;
use spool_core::scheduling::SchedulingMode;

/// Default number of candidate jobs considered per host report.
const DEFAULT_JOB_CANDIDATES: i64 = 8;

/// Default number of procs booked per host report.
const DEFAULT_MAX_FRAMES_PER_REPORT: usize = 16;

/// Default orphan sweep cadence.
const DEFAULT_ORPHAN_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Tunables for the dispatch services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Initial matcher mode; can be switched at runtime on the matcher.
    pub scheduling_mode: SchedulingMode,
    pub job_candidates: i64,
    pub max_frames_per_report: usize,
    /// A `Running` frame with no proc and no update for this long is orphaned.
    pub orphan_timeout: Duration,
    pub orphan_sweep_interval: Duration,
    /// Idle memory (KB) a host must have per offered core.
    pub min_memory_per_core: i64,
    pub rebalance: RebalancePolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            scheduling_mode: SchedulingMode::Priority,
            job_candidates: DEFAULT_JOB_CANDIDATES,
            max_frames_per_report: DEFAULT_MAX_FRAMES_PER_REPORT,
            orphan_timeout: DEFAULT_ORPHAN_TIMEOUT,
            orphan_sweep_interval: DEFAULT_ORPHAN_SWEEP_INTERVAL,
            min_memory_per_core: DEFAULT_MIN_MEMORY_PER_CORE_KB,
            rebalance: RebalancePolicy {
                floor: DEFAULT_REBALANCE_FLOOR_KB,
                headroom_percent: DEFAULT_REBALANCE_HEADROOM_PERCENT,
            },
        }
    }
}

impl DispatchConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default    |
    /// |----------------------------------|------------|
    /// | `SCHEDULING_MODE`                | `priority` |
    /// | `DISPATCH_JOB_CANDIDATES`        | `8`        |
    /// | `DISPATCH_MAX_FRAMES_PER_REPORT` | `16`       |
    /// | `ORPHAN_TIMEOUT_SECS`            | `300`      |
    /// | `ORPHAN_SWEEP_INTERVAL_SECS`     | `60`       |
    /// | `MIN_MEMORY_PER_CORE_KB`         | `262144`   |
    /// | `REBALANCE_FLOOR_KB`             | `524288`   |
    /// | `REBALANCE_HEADROOM_PERCENT`     | `20`       |
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CoreError> {
        let defaults = Self::default();

        let scheduling_mode = match lookup("SCHEDULING_MODE") {
            Some(raw) => raw.parse()?,
            None => defaults.scheduling_mode,
        };
        let job_candidates = parse_or(&lookup, "DISPATCH_JOB_CANDIDATES", defaults.job_candidates)?;
        let max_frames_per_report = parse_or(
            &lookup,
            "DISPATCH_MAX_FRAMES_PER_REPORT",
            defaults.max_frames_per_report,
        )?;
        let orphan_timeout = Duration::from_secs(parse_or(
            &lookup,
            "ORPHAN_TIMEOUT_SECS",
            defaults.orphan_timeout.as_secs(),
        )?);
        let orphan_sweep_interval = Duration::from_secs(parse_or(
            &lookup,
            "ORPHAN_SWEEP_INTERVAL_SECS",
            defaults.orphan_sweep_interval.as_secs(),
        )?);
        let min_memory_per_core =
            parse_or(&lookup, "MIN_MEMORY_PER_CORE_KB", defaults.min_memory_per_core)?;
        let rebalance = RebalancePolicy {
            floor: parse_or(&lookup, "REBALANCE_FLOOR_KB", defaults.rebalance.floor)?,
            headroom_percent: parse_or(
                &lookup,
                "REBALANCE_HEADROOM_PERCENT",
                defaults.rebalance.headroom_percent,
            )?,
        };

        if job_candidates <= 0 || max_frames_per_report == 0 {
            return Err(CoreError::Validation(
                "DISPATCH_JOB_CANDIDATES and DISPATCH_MAX_FRAMES_PER_REPORT must be positive"
                    .to_string(),
            ));
        }
        if orphan_sweep_interval.is_zero() {
            return Err(CoreError::Validation(
                "ORPHAN_SWEEP_INTERVAL_SECS must be positive".to_string(),
            ));
        }

        Ok(Self {
            scheduling_mode,
            job_candidates,
            max_frames_per_report,
            orphan_timeout,
            orphan_sweep_interval,
            min_memory_per_core,
            rebalance,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, CoreError> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            CoreError::Validation(format!("{key} has an invalid value: \"{raw}\""))
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = DispatchConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.orphan_timeout, Duration::from_secs(300));
        assert_eq!(config.min_memory_per_core, 262_144);
    }

    #[test]
    fn overrides_are_applied() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("SCHEDULING_MODE", "fifo"),
            ("ORPHAN_TIMEOUT_SECS", "120"),
            ("REBALANCE_FLOOR_KB", "1024"),
        ]))
        .unwrap();
        assert_eq!(config.scheduling_mode, SchedulingMode::Fifo);
        assert_eq!(config.orphan_timeout, Duration::from_secs(120));
        assert_eq!(config.rebalance.floor, 1024);
    }

    #[test]
    fn malformed_values_are_validation_errors() {
        let err = DispatchConfig::from_lookup(lookup(&[("DISPATCH_JOB_CANDIDATES", "lots")]));
        assert!(matches!(err, Err(CoreError::Validation(_))));

        let err = DispatchConfig::from_lookup(lookup(&[("SCHEDULING_MODE", "lottery")]));
        assert!(matches!(err, Err(CoreError::Validation(_))));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let err = DispatchConfig::from_lookup(lookup(&[("DISPATCH_MAX_FRAMES_PER_REPORT", "0")]));
        assert!(err.is_err());
    }
}
