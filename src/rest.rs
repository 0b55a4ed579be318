// ============================================================================
// REST COLLABORATORS
// ============================================================================
// HTTP client for the backend endpoints the console consumes:
// - Metrics snapshot (polled)
// - Alert listings for performance / admin / compliance (polled)
// - Alert acknowledge and alert-rule creation (user actions)
//
// GETs carry cache-defeating decoration when `rest.cache_bust` is set.
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Method, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};

use crate::config::RestConfig;
use crate::error::{AlertError, AlertResult, FetchError, FetchResult};
use crate::poller::Fetcher;
use crate::staleness::CacheBuster;
use crate::types::{AlertSource, PollResource, Severity, Timestamp};

// ----------------------------------------------------------------------------
// 1. Alert Rules
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCondition {
    Above,
    Below,
}

/// Threshold rule submitted to the alert-rule endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub metric: String,
    pub condition: RuleCondition,
    pub threshold: f64,
    pub severity: Severity,
    /// Seconds the condition must hold before firing
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl AlertRule {
    pub fn new(name: impl Into<String>, metric: impl Into<String>, condition: RuleCondition, threshold: f64, severity: Severity) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            condition,
            threshold,
            severity,
            duration_secs: 0,
            enabled: true,
        }
    }

    pub fn validate(&self) -> AlertResult<()> {
        if self.name.trim().is_empty() {
            return Err(AlertError::InvalidRule {
                message: "name must not be empty".into(),
            });
        }
        if self.metric.trim().is_empty() {
            return Err(AlertError::InvalidRule {
                message: "metric must not be empty".into(),
            });
        }
        if !self.threshold.is_finite() {
            return Err(AlertError::InvalidRule {
                message: format!("threshold must be finite, got {}", self.threshold),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 2. User-Action Seam
// ----------------------------------------------------------------------------

/// Backend calls behind operator actions. Implemented by [`RestClient`];
/// tests substitute their own.
#[async_trait]
pub trait AlertActions: Send + Sync + 'static {
    async fn acknowledge(&self, source: AlertSource, alert_id: &str, by: &str) -> FetchResult<()>;

    async fn create_rule(&self, rule: &AlertRule) -> FetchResult<JsonValue>;
}

// ----------------------------------------------------------------------------
// 3. Client
// ----------------------------------------------------------------------------

pub struct RestClient {
    client: HttpClient,
    base_url: Url,
    config: RestConfig,
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url.as_str())
            .field("cache_bust", &self.config.cache_bust)
            .finish()
    }
}

impl RestClient {
    pub fn new(config: &RestConfig) -> FetchResult<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| FetchError::InvalidUrl {
            message: format!("{}: {e}", config.base_url),
        })?;
        let client = HttpClient::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(4)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::Transport { message: e.to_string() })?;

        debug!(target: "cerebro::console", base_url = %base_url, "REST client ready");
        Ok(Self {
            client,
            base_url,
            config: config.clone(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a path template against the base URL.
    /// `{source}` and `{id}` are substituted when given.
    pub fn endpoint(&self, template: &str, source: Option<AlertSource>, id: Option<&str>) -> FetchResult<Url> {
        let mut path = template.to_string();
        if let Some(source) = source {
            path = path.replace("{source}", source.as_str());
        }
        if let Some(id) = id {
            path = path.replace("{id}", id);
        }
        if path.contains('{') {
            return Err(FetchError::InvalidUrl {
                message: format!("unresolved placeholder in '{path}'"),
            });
        }
        self.base_url.join(&path).map_err(|e| FetchError::InvalidUrl {
            message: format!("{path}: {e}"),
        })
    }

    pub async fn fetch_metrics_snapshot(&self) -> FetchResult<JsonValue> {
        let url = self.endpoint(&self.config.metrics_snapshot_path, None, None)?;
        self.get_json(url).await
    }

    pub async fn fetch_alerts(&self, source: AlertSource) -> FetchResult<JsonValue> {
        let url = self.endpoint(&self.config.alerts_path, Some(source), None)?;
        self.get_json(url).await
    }

    /// Cache-busted GET of any backend path, e.g. `/api/assessments/7`
    pub async fn fetch_path(&self, path: &str) -> FetchResult<JsonValue> {
        let url = self.endpoint(path, None, None)?;
        self.get_json(url).await
    }

    pub async fn acknowledge_alert(&self, source: AlertSource, alert_id: &str, by: &str) -> FetchResult<()> {
        let url = self.endpoint(&self.config.acknowledge_path, Some(source), Some(alert_id))?;
        let request = self.client.post(url).json(&json!({ "acknowledged_by": by }));
        Self::send(request).await?;
        info!(target: "cerebro::alerts", alert_id, by, %source, "Alert acknowledged upstream");
        Ok(())
    }

    pub async fn create_alert_rule(&self, rule: &AlertRule) -> FetchResult<JsonValue> {
        let url = self.endpoint(&self.config.alert_rules_path, None, None)?;
        let response = Self::send(self.client.post(url).json(rule)).await?;
        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_slice(&body).map_err(|e| FetchError::Decode { message: e.to_string() })
    }

    async fn get_json(&self, url: Url) -> FetchResult<JsonValue> {
        let request = if self.config.cache_bust {
            let url = CacheBuster::decorate(&url, Timestamp::now());
            self.client
                .request(Method::GET, url)
                .headers(CacheBuster::no_store_headers())
        } else {
            self.client.request(Method::GET, url)
        };
        let response = Self::send(request).await?;
        response.json::<JsonValue>().await.map_err(|e| FetchError::Decode { message: e.to_string() })
    }

    async fn send(request: RequestBuilder) -> FetchResult<reqwest::Response> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("unexpected status");
            return Err(FetchError::http(status.as_u16(), reason));
        }
        Ok(response)
    }
}

#[async_trait]
impl AlertActions for RestClient {
    async fn acknowledge(&self, source: AlertSource, alert_id: &str, by: &str) -> FetchResult<()> {
        self.acknowledge_alert(source, alert_id, by).await
    }

    async fn create_rule(&self, rule: &AlertRule) -> FetchResult<JsonValue> {
        self.create_alert_rule(rule).await
    }
}

// ----------------------------------------------------------------------------
// 4. Poll Adapter
// ----------------------------------------------------------------------------

/// Exposes one polled REST resource as a [`Fetcher`]
#[derive(Debug, Clone)]
pub struct RestFetcher {
    client: Arc<RestClient>,
    target: FetchTarget,
}

#[derive(Debug, Clone)]
enum FetchTarget {
    Resource(PollResource),
    Path(String),
}

impl RestFetcher {
    pub fn new(client: Arc<RestClient>, resource: PollResource) -> Self {
        Self {
            client,
            target: FetchTarget::Resource(resource),
        }
    }

    /// Fetch a raw backend path, for keyed data such as `assessment_<id>`
    pub fn path(client: Arc<RestClient>, path: impl Into<String>) -> Self {
        Self {
            client,
            target: FetchTarget::Path(path.into()),
        }
    }
}

#[async_trait]
impl Fetcher for RestFetcher {
    async fn fetch(&self) -> FetchResult<JsonValue> {
        match &self.target {
            FetchTarget::Resource(PollResource::MetricsSnapshot) => self.client.fetch_metrics_snapshot().await,
            FetchTarget::Resource(PollResource::Alerts(source)) => self.client.fetch_alerts(*source).await,
            FetchTarget::Path(path) => self.client.fetch_path(path).await,
        }
    }
}
