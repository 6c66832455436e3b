//! Environment-driven configuration.
//!
//! Every knob has a default and is clamped to a sane range, so a typo degrades to the default
//! instead of taking the fleet down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;

pub const DEFAULT_IDLE_MINUTES: u64 = 10;
pub const DEFAULT_PENDING_MAX_AGE_MINUTES: u64 = 10;
pub const DEFAULT_LONG_RUNNING_WARN_HOURS: u64 = 9;
pub const DEFAULT_LONG_RUNNING_MAX_HOURS: u64 = 10;
pub const DEFAULT_LOW_BALANCE_THRESHOLD: i64 = 10;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5000;

/// Per-variant idle thresholds for the empty-server policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleThresholds {
    pub default: Duration,
    pub per_variant: HashMap<String, Duration>,
}

impl Default for IdleThresholds {
    fn default() -> Self {
        Self {
            default: Duration::from_secs(DEFAULT_IDLE_MINUTES * MINUTE),
            per_variant: HashMap::new(),
        }
    }
}

impl IdleThresholds {
    pub fn for_variant(&self, variant: &str) -> Duration {
        self.per_variant
            .get(variant)
            .copied()
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPeriods {
    pub empty: Duration,
    pub pending: Duration,
    pub long_running: Duration,
    pub credit: Duration,
}

impl Default for LoopPeriods {
    fn default() -> Self {
        Self {
            empty: Duration::from_secs(MINUTE),
            pending: Duration::from_secs(15 * MINUTE),
            long_running: Duration::from_secs(30 * MINUTE),
            credit: Duration::from_secs(MINUTE),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetConfig {
    pub billing_enabled: bool,
    pub low_balance_threshold: i64,
    pub idle: IdleThresholds,
    pub pending_max_age: Duration,
    pub long_running_warn_after: Duration,
    pub long_running_max_age: Duration,
    pub probe_timeout: Duration,
    pub task_tick: Duration,
    pub periods: LoopPeriods,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            billing_enabled: false,
            low_balance_threshold: DEFAULT_LOW_BALANCE_THRESHOLD,
            idle: IdleThresholds::default(),
            pending_max_age: Duration::from_secs(DEFAULT_PENDING_MAX_AGE_MINUTES * MINUTE),
            long_running_warn_after: Duration::from_secs(DEFAULT_LONG_RUNNING_WARN_HOURS * HOUR),
            long_running_max_age: Duration::from_secs(DEFAULT_LONG_RUNNING_MAX_HOURS * HOUR),
            probe_timeout: Duration::from_millis(DEFAULT_PROBE_TIMEOUT_MS),
            task_tick: crate::task_queue::DEFAULT_TICK,
            periods: LoopPeriods::default(),
        }
    }
}

impl FleetConfig {
    /// Provisioner call budget. Ends before the pending reaper may reclaim the reservation.
    pub fn deploy_timeout(&self) -> Duration {
        self.pending_max_age * 4 / 5
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let u64_var = |name: &str| get(name).and_then(|v| v.trim().parse::<u64>().ok());

        let long_running_max_hours = u64_var("QS_LONG_RUNNING_MAX_HOURS")
            .map(|v| v.clamp(1, 7 * 24))
            .unwrap_or(DEFAULT_LONG_RUNNING_MAX_HOURS);
        // The warning window must open before the hard limit.
        let long_running_warn_hours = u64_var("QS_LONG_RUNNING_WARN_HOURS")
            .map(|v| v.clamp(0, long_running_max_hours.saturating_sub(1)))
            .unwrap_or_else(|| {
                DEFAULT_LONG_RUNNING_WARN_HOURS.min(long_running_max_hours.saturating_sub(1))
            });

        let minutes = |name: &str, default: Duration, max: u64| {
            u64_var(name)
                .map(|v| Duration::from_secs(v.clamp(1, max) * MINUTE))
                .unwrap_or(default)
        };

        Self {
            billing_enabled: get("QS_BILLING_ENABLED").is_some_and(|v| parse_bool(&v)),
            low_balance_threshold: get("QS_LOW_BALANCE_THRESHOLD")
                .and_then(|v| v.trim().parse::<i64>().ok())
                .map(|v| v.clamp(0, 1_000_000))
                .unwrap_or(DEFAULT_LOW_BALANCE_THRESHOLD),
            idle: IdleThresholds {
                default: minutes("QS_IDLE_MINUTES", defaults.idle.default, 24 * 60),
                per_variant: get("QS_VARIANT_IDLE_MINUTES")
                    .map(|v| parse_variant_minutes(&v))
                    .unwrap_or_default(),
            },
            pending_max_age: minutes("QS_PENDING_MAX_AGE_MINUTES", defaults.pending_max_age, 24 * 60),
            long_running_warn_after: Duration::from_secs(long_running_warn_hours * HOUR),
            long_running_max_age: Duration::from_secs(long_running_max_hours * HOUR),
            probe_timeout: u64_var("QS_PROBE_TIMEOUT_MS")
                .map(|v| Duration::from_millis(v.clamp(500, 60_000)))
                .unwrap_or(defaults.probe_timeout),
            task_tick: u64_var("QS_TASK_TICK_MS")
                .map(|v| Duration::from_millis(v.clamp(100, 60_000)))
                .unwrap_or(defaults.task_tick),
            periods: LoopPeriods {
                empty: secs(&u64_var, "QS_EMPTY_REAPER_PERIOD_SECS", defaults.periods.empty),
                pending: secs(&u64_var, "QS_PENDING_REAPER_PERIOD_SECS", defaults.periods.pending),
                long_running: secs(
                    &u64_var,
                    "QS_LONG_RUNNING_REAPER_PERIOD_SECS",
                    defaults.periods.long_running,
                ),
                credit: secs(&u64_var, "QS_CREDIT_REAPER_PERIOD_SECS", defaults.periods.credit),
            },
        }
    }
}

fn secs(u64_var: &impl Fn(&str) -> Option<u64>, name: &str, default: Duration) -> Duration {
    u64_var(name)
        .map(|v| Duration::from_secs(v.clamp(5, 24 * HOUR)))
        .unwrap_or(default)
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// `casual=15, competitive=5` -> {casual: 15min, competitive: 5min}. Bad entries are skipped.
fn parse_variant_minutes(raw: &str) -> HashMap<String, Duration> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, minutes) = entry.split_once('=')?;
            let name = name.trim();
            let minutes = minutes.trim().parse::<u64>().ok()?;
            if name.is_empty() {
                return None;
            }
            Some((
                name.to_string(),
                Duration::from_secs(minutes.clamp(1, 24 * 60) * MINUTE),
            ))
        })
        .collect()
}

/// Process-level settings for the control binary.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub database_url: String,
    pub http_addr: SocketAddr,
    pub provisioner_url: String,
    pub notifier_url: Option<String>,
    pub fleet: FleetConfig,
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;
        let provisioner_url = std::env::var("QS_PROVISIONER_URL")
            .map_err(|_| anyhow::anyhow!("QS_PROVISIONER_URL is required"))?;
        let http_addr = std::env::var("QS_HTTP_ADDR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("parse QS_HTTP_ADDR")?;
        let notifier_url = std::env::var("QS_NOTIFIER_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            database_url,
            http_addr,
            provisioner_url,
            notifier_url,
            fleet: FleetConfig::from_env(),
        })
    }
}
