//! Runtime configuration model.
//!
//! Loaded by the figment-based loader with hierarchical merging;
//! defaults here are the lowest-precedence layer.

use serde::{Deserialize, Serialize};

/// Scheduler poll-loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between poll cycles.
    pub poll_interval_secs: u64,
    /// Configured concurrency cap; the effective cap may be lower when
    /// the executor reports a platform limit.
    pub max_concurrent: usize,
    /// Heartbeat TTL for stale-agent detection, seconds.
    pub heartbeat_ttl_secs: u64,
    /// Hard cap on assigns executed in one poll cycle.
    pub max_dispatches_per_poll: usize,
    /// Minimum spacing between consecutive assigns, milliseconds.
    pub min_dispatch_interval_ms: u64,
    /// Minimum spacing between SLA alerts for one task, seconds.
    pub sla_alert_interval_secs: u64,
    /// Plan but never execute actions.
    pub dry_run: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_concurrent: 4,
            heartbeat_ttl_secs: 300,
            max_dispatches_per_poll: 8,
            min_dispatch_interval_ms: 250,
            sla_alert_interval_secs: 3600,
            dry_run: false,
        }
    }
}

/// Lease settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Lease TTL, seconds.
    pub ttl_secs: u64,
    /// Renewal cap to stop runaway agents.
    pub max_renewals: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 900,
            max_renewals: 20,
        }
    }
}

/// Dispatch retry and deadletter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries before a spawn-failed task stops being requeued.
    pub max_retries: u32,
    /// Delay before a spawn-failed task is requeued, seconds.
    pub retry_delay_secs: u64,
    /// Dispatch failures before the failure tracker retires a task.
    pub max_dispatch_failures: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 300,
            max_dispatch_failures: 3,
        }
    }
}

/// External executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Spawn call timeout, milliseconds.
    pub spawn_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_ms: 30_000,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of: trace, debug, info, warn, error.
    pub level: String,
    /// One of: json, pretty.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub lease: LeaseConfig,
    pub retry: RetryConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn heartbeat_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.scheduler.heartbeat_ttl_secs).unwrap_or(300))
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lease.ttl_secs).unwrap_or(900))
    }

    pub fn retry_delay(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.retry.retry_delay_secs).unwrap_or(300))
    }

    pub fn sla_alert_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.scheduler.sla_alert_interval_secs).unwrap_or(3600),
        )
    }
}
