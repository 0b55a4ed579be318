// ============================================================================
// CONFIGURATION SYSTEM
// ============================================================================
// Console configuration with:
// - TOML file parsing
// - Environment variable overrides (CEREBRO_CONSOLE_<SECTION>__<FIELD>)
// - Validation
// - Sensible defaults for every field
// ============================================================================

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::alerts::ReopenPolicy;
use crate::error::ConfigError;
use crate::types::{AlertSource, PollResource};
use crate::{
    DEFAULT_ALERTS_PER_SOURCE, DEFAULT_CACHE_TTL_SECS, DEFAULT_CHANNEL_URL, DEFAULT_FETCH_TIMEOUT_SECS,
    DEFAULT_MAX_DATA_POINTS, DEFAULT_MAX_NOTIFICATIONS, DEFAULT_MAX_POLL_INTERVAL_SECS, DEFAULT_OUTBOUND_BUFFER,
    DEFAULT_POLL_FAILURE_THRESHOLD, DEFAULT_RECONNECT_BASE_DELAY_MS, DEFAULT_RECONNECT_MAX_ATTEMPTS,
    DEFAULT_RECONNECT_MAX_DELAY_MS, DEFAULT_REST_BASE_URL, DEFAULT_WORKFLOW_RETENTION_SECS, SUBSCRIBABLE_EVENT_TYPES,
};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "CEREBRO_CONSOLE_";

// ----------------------------------------------------------------------------
// 1. Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the console core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default)]
    pub console: GeneralConfig,

    /// Push channel
    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub workflows: WorkflowsConfig,

    /// Freshness tracking
    #[serde(default)]
    pub staleness: StalenessConfig,

    /// REST poll fallback
    #[serde(default)]
    pub polling: PollingConfig,

    #[serde(default)]
    pub rest: RestConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConsoleConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string without consulting the environment
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metrics.max_data_points == 0 {
            return Err(ConfigError::invalid_value(
                "metrics.max_data_points",
                "Rolling window must hold at least one point",
            ));
        }

        if self.alerts.max_per_source == 0 {
            return Err(ConfigError::invalid_value(
                "alerts.max_per_source",
                "Each source must retain at least one alert",
            ));
        }

        if self.workflows.retention.is_zero() {
            return Err(ConfigError::invalid_value("workflows.retention", "Retention must be positive"));
        }

        if self.channel.base_delay.is_zero() {
            return Err(ConfigError::invalid_value("channel.base_delay", "Reconnect delay must be positive"));
        }

        if self.channel.base_delay > self.channel.max_delay {
            return Err(ConfigError::invalid_value(
                "channel.base_delay",
                format!(
                    "Base delay ({}) exceeds max delay ({})",
                    humantime::format_duration(self.channel.base_delay),
                    humantime::format_duration(self.channel.max_delay)
                ),
            ));
        }

        if self.channel.outbound_buffer == 0 {
            return Err(ConfigError::invalid_value(
                "channel.outbound_buffer",
                "Outbound buffer must hold at least one frame",
            ));
        }

        if self.channel.enabled && self.channel.url.trim().is_empty() {
            return Err(ConfigError::invalid_value("channel.url", "URL is required when the channel is enabled"));
        }

        if self.staleness.default_ttl.is_zero() {
            return Err(ConfigError::invalid_value("staleness.default_ttl", "TTL must be positive"));
        }

        if self.polling.fetch_timeout.is_zero() {
            return Err(ConfigError::invalid_value("polling.fetch_timeout", "Fetch timeout must be positive"));
        }

        let mut seen = HashSet::new();
        for (index, resource) in self.polling.resources.iter().enumerate() {
            if resource.interval.is_zero() {
                return Err(ConfigError::invalid_value(
                    format!("polling.resources[{index}].interval"),
                    "Poll interval must be positive",
                ));
            }
            if resource.interval > self.polling.max_interval {
                return Err(ConfigError::invalid_value(
                    format!("polling.resources[{index}].interval"),
                    "Poll interval exceeds polling.max_interval",
                ));
            }
            if !seen.insert(resource.resource) {
                return Err(ConfigError::invalid_value(
                    format!("polling.resources[{index}]"),
                    format!("Resource '{}' is scheduled more than once", resource.resource),
                ));
            }
        }

        if reqwest::Url::parse(&self.rest.base_url).is_err() {
            return Err(ConfigError::invalid_value("rest.base_url", "Not an absolute URL"));
        }

        Ok(())
    }

    /// Render the defaults as TOML
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 2. General Settings
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Dashboard name used in logs
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// Identity recorded on acknowledgements issued from this console
    #[serde(default = "default_operator")]
    pub operator: String,

    /// Notifications retained for display
    #[serde(default = "default_max_notifications")]
    pub max_notifications: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            operator: default_operator(),
            max_notifications: default_max_notifications(),
        }
    }
}

fn default_instance_name() -> String {
    "performance-dashboard".into()
}

fn default_operator() -> String {
    "operator".into()
}

fn default_max_notifications() -> usize {
    DEFAULT_MAX_NOTIFICATIONS
}

// ----------------------------------------------------------------------------
// 3. Channel Configuration
// ----------------------------------------------------------------------------

/// Push channel and reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_channel_url")]
    pub url: String,

    /// First reconnect delay; doubles per attempt
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Attempts before the status reports exhaustion (0 = never)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Frames retained while reconnecting
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Event types subscribed on every connect
    #[serde(default = "default_subscriptions")]
    pub subscriptions: Vec<String>,

    /// Send `get_metrics` after each connect
    #[serde(default = "default_true")]
    pub request_snapshot_on_connect: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_channel_url(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            max_attempts: default_max_attempts(),
            outbound_buffer: default_outbound_buffer(),
            subscriptions: default_subscriptions(),
            request_snapshot_on_connect: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_channel_url() -> String {
    DEFAULT_CHANNEL_URL.into()
}

fn default_base_delay() -> Duration {
    Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS)
}

fn default_max_delay() -> Duration {
    Duration::from_millis(DEFAULT_RECONNECT_MAX_DELAY_MS)
}

fn default_max_attempts() -> u32 {
    DEFAULT_RECONNECT_MAX_ATTEMPTS
}

fn default_outbound_buffer() -> usize {
    DEFAULT_OUTBOUND_BUFFER
}

fn default_subscriptions() -> Vec<String> {
    SUBSCRIBABLE_EVENT_TYPES.iter().map(|t| t.to_string()).collect()
}

// ----------------------------------------------------------------------------
// 4. Store Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Points retained per series
    #[serde(default = "default_max_data_points")]
    pub max_data_points: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_data_points: default_max_data_points(),
        }
    }
}

fn default_max_data_points() -> usize {
    DEFAULT_MAX_DATA_POINTS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Alerts retained per source
    #[serde(default = "default_max_per_source")]
    pub max_per_source: usize,

    /// How replacements treat a locally acknowledged alert
    #[serde(default)]
    pub reopen_policy: ReopenPolicy,

    /// Source assumed for push alerts that do not name one
    #[serde(default = "default_push_source")]
    pub default_push_source: AlertSource,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            max_per_source: default_max_per_source(),
            reopen_policy: ReopenPolicy::default(),
            default_push_source: default_push_source(),
        }
    }
}

fn default_max_per_source() -> usize {
    DEFAULT_ALERTS_PER_SOURCE
}

fn default_push_source() -> AlertSource {
    AlertSource::Performance
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowsConfig {
    /// Finished workflows are dropped once no update touched them for this long
    #[serde(default = "default_workflow_retention", with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for WorkflowsConfig {
    fn default() -> Self {
        Self {
            retention: default_workflow_retention(),
        }
    }
}

fn default_workflow_retention() -> Duration {
    Duration::from_secs(DEFAULT_WORKFLOW_RETENTION_SECS)
}

// ----------------------------------------------------------------------------
// 5. Freshness & Polling Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StalenessConfig {
    /// TTL for keys refreshed without an explicit one
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Global aggregate keys cleared alongside any assessment transition
    #[serde(default = "default_aggregate_keys")]
    pub aggregate_keys: Vec<String>,
}

impl Default for StalenessConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_cache_ttl(),
            aggregate_keys: default_aggregate_keys(),
        }
    }
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(DEFAULT_CACHE_TTL_SECS)
}

fn default_aggregate_keys() -> Vec<String> {
    vec!["assessments".into(), "dashboard_stats".into(), "recent_activity".into()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// A fetch still pending after this counts as a failure
    #[serde(default = "default_fetch_timeout", with = "humantime_serde")]
    pub fetch_timeout: Duration,

    /// Consecutive failures tolerated before the interval widens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_max_interval", with = "humantime_serde")]
    pub max_interval: Duration,

    #[serde(default = "default_poll_resources")]
    pub resources: Vec<PollResourceConfig>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fetch_timeout: default_fetch_timeout(),
            failure_threshold: default_failure_threshold(),
            max_interval: default_max_interval(),
            resources: default_poll_resources(),
        }
    }
}

/// One polled REST resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollResourceConfig {
    pub resource: PollResource,

    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Freshness window; falls back to `staleness.default_ttl`
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
}

impl PollResourceConfig {
    pub fn new(resource: PollResource, interval: Duration) -> Self {
        Self {
            resource,
            interval,
            ttl: None,
        }
    }
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)
}

fn default_failure_threshold() -> u32 {
    DEFAULT_POLL_FAILURE_THRESHOLD
}

fn default_max_interval() -> Duration {
    Duration::from_secs(DEFAULT_MAX_POLL_INTERVAL_SECS)
}

fn default_poll_resources() -> Vec<PollResourceConfig> {
    vec![
        PollResourceConfig::new(PollResource::MetricsSnapshot, Duration::from_secs(30)),
        PollResourceConfig::new(PollResource::Alerts(AlertSource::Performance), Duration::from_secs(30)),
        PollResourceConfig::new(PollResource::Alerts(AlertSource::Admin), Duration::from_secs(60)),
        PollResourceConfig::new(PollResource::Alerts(AlertSource::Compliance), Duration::from_secs(60)),
    ]
}

// ----------------------------------------------------------------------------
// 6. REST Configuration
// ----------------------------------------------------------------------------

/// Backend endpoints. Paths may contain `{source}` and `{id}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    #[serde(default = "default_rest_base_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    #[serde(default = "default_metrics_snapshot_path")]
    pub metrics_snapshot_path: String,

    #[serde(default = "default_alerts_path")]
    pub alerts_path: String,

    #[serde(default = "default_acknowledge_path")]
    pub acknowledge_path: String,

    #[serde(default = "default_alert_rules_path")]
    pub alert_rules_path: String,

    /// Decorate GETs with cache-defeating parameters and headers
    #[serde(default = "default_true")]
    pub cache_bust: bool,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: default_rest_base_url(),
            request_timeout: default_request_timeout(),
            metrics_snapshot_path: default_metrics_snapshot_path(),
            alerts_path: default_alerts_path(),
            acknowledge_path: default_acknowledge_path(),
            alert_rules_path: default_alert_rules_path(),
            cache_bust: true,
        }
    }
}

fn default_rest_base_url() -> String {
    DEFAULT_REST_BASE_URL.into()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)
}

fn default_metrics_snapshot_path() -> String {
    "/api/performance/metrics/current".into()
}

fn default_alerts_path() -> String {
    "/api/{source}/alerts".into()
}

fn default_acknowledge_path() -> String {
    "/api/{source}/alerts/{id}/acknowledge".into()
}

fn default_alert_rules_path() -> String {
    "/api/performance/alert-rules".into()
}

// ----------------------------------------------------------------------------
// 7. Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}
