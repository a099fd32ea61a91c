//! Configuration for vigil-daemon

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use vigil_monitor::{MonitorConfig, Profile};

/// Main daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Polling and patrol configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Collaborator endpoints
    #[serde(default)]
    pub collaborators: CollaboratorEndpoints,

    /// Monitoring preset
    #[serde(default)]
    pub profile: Profile,

    /// Overrides the preset's daily notification budget
    #[serde(default)]
    pub daily_budget: Option<u32>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            collaborators: CollaboratorEndpoints::default(),
            profile: Profile::Pro,
            daily_budget: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: SocketAddr,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: true,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Polling tick in milliseconds
    #[serde(default = "default_poll_tick")]
    pub poll_tick_ms: u64,

    /// Maximum due streams claimed per tick
    #[serde(default = "default_max_claims")]
    pub max_claims_per_tick: usize,

    /// Maximum concurrent source fetches
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_samples: usize,

    /// Start patrol loops for users as they appear
    #[serde(default = "default_true")]
    pub patrol_enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_tick_ms: default_poll_tick(),
            max_claims_per_tick: default_max_claims(),
            max_concurrent_samples: default_max_concurrent(),
            patrol_enabled: true,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms.max(1))
    }
}

/// URLs of the external collaborators. Any endpoint left unset falls back
/// to the offline implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorEndpoints {
    #[serde(default)]
    pub classify_url: Option<String>,

    #[serde(default)]
    pub collect_url: Option<String>,

    #[serde(default)]
    pub judge_url: Option<String>,

    #[serde(default)]
    pub notify_url: Option<String>,

    #[serde(default)]
    pub source_url: Option<String>,

    /// Transport-level timeout; the core applies its own per-call bounds
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl Default for CollaboratorEndpoints {
    fn default() -> Self {
        Self {
            classify_url: None,
            collect_url: None,
            judge_url: None,
            notify_url: None,
            source_url: None,
            http_timeout_secs: default_http_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_poll_tick() -> u64 {
    1_000
}

fn default_max_claims() -> usize {
    256
}

fn default_max_concurrent() -> usize {
    16
}

fn default_http_timeout() -> u64 {
    90
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `VIGIL_`-prefixed environment variables (`VIGIL_SERVER__LISTEN_ADDR`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("VIGIL")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Monitoring configuration for the selected profile.
    pub fn monitor_config(&self) -> MonitorConfig {
        let mut config = MonitorConfig::for_profile(self.profile);
        if let Some(limit) = self.daily_budget {
            config.budget.daily_limit = limit;
        }
        config
    }

    /// Create a development configuration
    pub fn development() -> Self {
        Self {
            profile: Profile::Development,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.profile, Profile::Pro);
        assert!(config.collaborators.judge_url.is_none());
    }

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_tick(), Duration::from_secs(1));
        assert!(config.max_concurrent_samples > 0);
        assert!(config.patrol_enabled);
    }

    #[test]
    fn test_budget_override() {
        let mut config = DaemonConfig::development();
        let preset = config.monitor_config().budget.daily_limit;
        config.daily_budget = Some(preset + 3);
        assert_eq!(config.monitor_config().budget.daily_limit, preset + 3);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = DaemonConfig::load(None).unwrap();
        assert_eq!(config.scheduler.max_claims_per_tick, 256);
        assert_eq!(config.logging.level, "info");
    }
}
