//! Monitoring configuration.
//!
//! Defines cadences, inactivity thresholds, budgets, timeouts and anomaly
//! bands. Every duration here is wall-clock time read through the injected
//! [`Clock`](crate::clock::Clock), except collaborator timeouts which are
//! enforced by the async runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use vigil_types::Temperature;

/// Deployment profile used to pick configuration presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// Production cadences and budgets.
    #[default]
    #[serde(alias = "production")]
    Pro,
    /// Fast cadences and generous budgets for local testing.
    #[serde(alias = "dev")]
    Development,
}

impl std::str::FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pro" | "production" => Ok(Profile::Pro),
            "dev" | "development" => Ok(Profile::Development),
            other => Err(format!("unknown profile: {}", other)),
        }
    }
}

/// Configuration for the monitoring core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MonitorConfig {
    /// Polling cadence per temperature.
    pub cadence: CadenceConfig,

    /// Inactivity thresholds for demotion.
    pub temperature: TemperatureConfig,

    /// Retention of unconfirmed system-originated conditions.
    pub retention: RetentionConfig,

    /// Daily notification budget.
    pub budget: BudgetConfig,

    /// Escalation timeouts and resilience.
    pub escalation: EscalationConfig,

    /// Per-user patrol sweep.
    pub patrol: PatrolConfig,

    /// Anomaly detection.
    pub anomaly: AnomalyConfig,

    /// Signal-tier limits.
    pub signal: SignalConfig,

    /// Meaningful-change policy.
    pub delta: DeltaConfig,
}

impl MonitorConfig {
    /// Create config for a deployment profile.
    pub fn for_profile(profile: Profile) -> Self {
        let mut config = Self::default();

        match profile {
            Profile::Pro => {}
            Profile::Development => {
                config.cadence.hot_interval = Duration::from_secs(2);
                config.cadence.warm_interval = Duration::from_secs(30);
                config.cadence.sample_timeout = Duration::from_secs(1);
                config.budget.daily_limit = 50;
                config.escalation.collect_timeout = Duration::from_secs(10);
                config.escalation.judge_timeout = Duration::from_secs(20);
                config.patrol.interval = Duration::from_secs(60);
                config.patrol.deadline = Duration::from_secs(30);
            }
        }

        config
    }
}

/// Cadence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Poll interval for Hot streams.
    pub hot_interval: Duration,

    /// Poll interval for Warm streams.
    pub warm_interval: Duration,

    /// A polled sample stays fresh for this many cadence intervals.
    pub staleness_multiplier: u32,

    /// Freshness window for Cold streams (sampled only during patrol).
    pub cold_max_age: Duration,

    /// Upper bound on one polled fetch from the data source. Kept below the
    /// Hot interval so one slow topic cannot hold back the next poll.
    #[serde(default = "default_sample_timeout")]
    pub sample_timeout: Duration,
}

fn default_sample_timeout() -> Duration {
    Duration::from_secs(5)
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            hot_interval: Duration::from_secs(10),
            warm_interval: Duration::from_secs(30 * 60),
            staleness_multiplier: 3,
            cold_max_age: Duration::from_secs(2 * 60 * 60),
            sample_timeout: default_sample_timeout(),
        }
    }
}

impl CadenceConfig {
    /// Polling interval for a temperature; `None` for Cold.
    pub fn interval(&self, temperature: Temperature) -> Option<Duration> {
        match temperature {
            Temperature::Hot => Some(self.hot_interval),
            Temperature::Warm => Some(self.warm_interval),
            Temperature::Cold => None,
        }
    }

    /// How long a sample taken at this temperature is considered fresh.
    pub fn freshness_window(&self, temperature: Temperature) -> Duration {
        match self.interval(temperature) {
            Some(interval) => interval.saturating_mul(self.staleness_multiplier.max(1)),
            None => self.cold_max_age,
        }
    }
}

/// Temperature transition thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureConfig {
    /// Idle time after which a Hot stream demotes to Warm.
    pub hot_to_warm: Duration,

    /// Idle time after which a Warm stream demotes to Cold.
    pub warm_to_cold: Duration,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            hot_to_warm: Duration::from_secs(7 * 24 * 60 * 60),
            warm_to_cold: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Unconfirmed system-originated conditions are purged after this.
    pub system_originated: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            system_originated: Duration::from_secs(72 * 60 * 60),
        }
    }
}

/// Notification budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Judged notifications per user per day.
    pub daily_limit: u32,

    /// Offset of the reference timezone from UTC, in seconds.
    pub reset_offset_secs: i32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: 5,
            reset_offset_secs: 0,
        }
    }
}

/// Escalation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Timeout for one deep-collect call.
    pub collect_timeout: Duration,

    /// Timeout for one judge call.
    pub judge_timeout: Duration,

    /// Timeout for one notify call.
    pub notify_timeout: Duration,

    /// Circuit breaker shared by deep-collect and judge.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Number of escalation records kept in memory.
    pub outcome_log_capacity: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            collect_timeout: Duration::from_secs(30),
            judge_timeout: Duration::from_secs(60),
            notify_timeout: Duration::from_secs(10),
            circuit_breaker: CircuitBreakerConfig::default(),
            outcome_log_capacity: 1024,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of failures to open the circuit.
    pub failure_threshold: u32,

    /// Number of successes in half-open to close the circuit.
    pub success_threshold: u32,

    /// Time to wait before transitioning from open to half-open.
    pub reset_timeout: Duration,

    /// Maximum requests allowed in half-open state.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(60),
            half_open_max_requests: 2,
        }
    }
}

/// Patrol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatrolConfig {
    /// Interval between patrol runs for one user.
    pub interval: Duration,

    /// Overall deadline for one user's patrol run.
    pub deadline: Duration,

    /// Users with no reference for this long are patrolled every other tick.
    pub inactive_user_after: Duration,

    /// Timeout for fetching one Cold stream.
    pub cold_sample_timeout: Duration,

    /// Upper bound on Cold streams fetched per run.
    pub max_cold_samples: usize,
}

impl Default for PatrolConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60 * 60),
            deadline: Duration::from_secs(5 * 60),
            inactive_user_after: Duration::from_secs(24 * 60 * 60),
            cold_sample_timeout: Duration::from_secs(10),
            max_cold_samples: 64,
        }
    }
}

/// Anomaly detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Deviation (in standard deviations) that counts as anomalous.
    pub sigma: f64,

    /// History length required before the deviation test applies.
    pub min_history: usize,

    /// Numeric samples kept per stream.
    pub history_window: usize,

    /// Price change band, percent.
    pub price_change_band: f64,

    /// Price change at which the anomaly is high severity, percent.
    pub price_change_high: f64,

    /// Funding rate band, percent.
    pub funding_band: f64,

    /// Open interest change band, percent.
    pub open_interest_band: f64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            sigma: 3.0,
            min_history: 8,
            history_window: 48,
            price_change_band: 10.0,
            price_change_high: 20.0,
            funding_band: 5.0,
            open_interest_band: 15.0,
        }
    }
}

/// Signal-tier limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Streams one Signal condition may reference (and force Hot).
    pub max_streams: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self { max_streams: 8 }
    }
}

/// Meaningful-change policy for numeric topics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeltaConfig {
    /// Minimum relative change (0.01 = 1 %) for a numeric sample to be
    /// forwarded to evaluation. Zero forwards any change.
    pub min_relative_change: f64,
}

/// Convert a configuration duration into a chrono duration for timestamp math.
pub(crate) fn span(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
