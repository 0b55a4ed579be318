//! Core value types shared by every subsystem.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UnknownVariant;

// ============================================================================
// SECTION 1: TIMESTAMPS
// ============================================================================

// ----------------------------------------------------------------------------
// 1.1 Timestamp - Millisecond Wall-Clock Time
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in milliseconds since the Unix epoch.
///
/// Millisecond precision matches what the backend emits and keeps
/// timestamps comparable regardless of whether they came from an
/// ISO-8601 string or an epoch number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Zero timestamp (Unix epoch)
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Create a timestamp from milliseconds since Unix epoch
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Create a timestamp from seconds since Unix epoch
    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1_000))
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as i64)
    }

    #[inline]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000
    }

    /// Saturating distance to an earlier timestamp
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0).max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_add(duration.as_millis() as i64))
    }

    #[inline]
    pub fn sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as i64))
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0).single().unwrap_or_default()
    }

    pub fn from_datetime<Tz: TimeZone>(dt: DateTime<Tz>) -> Self {
        Self(dt.timestamp_millis())
    }

    /// Parse the textual forms the backend emits: RFC 3339 with an offset,
    /// or a naive ISO-8601 datetime which is taken to be UTC.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Some(Self::from_datetime(dt));
        }
        const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"];
        NAIVE_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
            .map(|naive| Self(naive.and_utc().timestamp_millis()))
    }

    /// Interpret an epoch number. Values below 10^11 are taken as seconds
    /// (with an optional fraction), larger values as milliseconds.
    pub fn from_epoch_number(value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        if value < 100_000_000_000.0 {
            Some(Self((value * 1_000.0).round() as i64))
        } else {
            Some(Self(value.round() as i64))
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::EPOCH
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let millis = time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(millis)
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self::from_datetime(dt)
    }
}

// ============================================================================
// SECTION 2: SEVERITY
// ============================================================================

/// Severity level for alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Severity {
    /// Informational - no action needed
    Info = 0,
    /// Low severity - can be addressed later
    Low = 1,
    /// Medium severity - should be addressed soon
    Medium = 2,
    /// High severity - needs attention
    High = 3,
    /// Critical severity - immediate action required
    Critical = 4,
    /// Emergency - service is down or data is at risk
    Emergency = 5,
}

impl Severity {
    pub const ALL: [Severity; 6] = [
        Severity::Info,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
        Severity::Emergency,
    ];

    #[inline]
    pub const fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
            Severity::Emergency => "emergency",
        }
    }

    /// Coarse rank used for dashboard ordering. Critical and emergency
    /// share the top band, medium and below share the bottom one.
    pub fn display_rank(&self) -> u8 {
        match self {
            Severity::Critical | Severity::Emergency => 2,
            Severity::High => 1,
            Severity::Medium | Severity::Low | Severity::Info => 0,
        }
    }

    /// Lenient parse accepting the aliases different subsystems use.
    pub fn parse_lenient(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" => Some(Severity::Info),
            "low" => Some(Severity::Low),
            "medium" | "warning" | "warn" => Some(Severity::Medium),
            "high" | "error" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            "emergency" => Some(Severity::Emergency),
            _ => None,
        }
    }

    /// Color code for UI
    pub fn color(&self) -> &'static str {
        match self {
            Severity::Info => "#3498db",
            Severity::Low => "#2ecc71",
            Severity::Medium => "#f1c40f",
            Severity::High => "#e67e22",
            Severity::Critical => "#e74c3c",
            Severity::Emergency => "#8e44ad",
        }
    }
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Info
    }
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::parse_lenient(s).ok_or_else(|| UnknownVariant::new("severity", s))
    }
}

// ============================================================================
// SECTION 3: ALERT SOURCES & POLL RESOURCES
// ============================================================================

/// Subsystem an alert originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSource {
    Performance,
    Admin,
    Compliance,
}

impl AlertSource {
    pub const ALL: [AlertSource; 3] = [AlertSource::Performance, AlertSource::Admin, AlertSource::Compliance];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSource::Performance => "performance",
            AlertSource::Admin => "admin",
            AlertSource::Compliance => "compliance",
        }
    }

    /// Freshness key covering this source's alert listing
    pub fn freshness_key(&self) -> String {
        PollResource::Alerts(*self).key()
    }
}

impl Display for AlertSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertSource {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "performance" | "perf" => Ok(AlertSource::Performance),
            "admin" => Ok(AlertSource::Admin),
            "compliance" => Ok(AlertSource::Compliance),
            _ => Err(UnknownVariant::new("alert source", s)),
        }
    }
}

/// A REST resource the poll scheduler knows how to fetch.
///
/// Serialized as its freshness key: `metrics_snapshot` or `alerts:<source>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PollResource {
    MetricsSnapshot,
    Alerts(AlertSource),
}

impl PollResource {
    pub fn key(&self) -> String {
        match self {
            PollResource::MetricsSnapshot => crate::METRICS_SNAPSHOT_KEY.to_string(),
            PollResource::Alerts(source) => format!("alerts:{source}"),
        }
    }
}

impl Display for PollResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for PollResource {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == crate::METRICS_SNAPSHOT_KEY {
            return Ok(PollResource::MetricsSnapshot);
        }
        match s.split_once(':') {
            Some(("alerts", source)) => source
                .parse()
                .map(PollResource::Alerts)
                .map_err(|_| UnknownVariant::new("poll resource", s)),
            _ => Err(UnknownVariant::new("poll resource", s)),
        }
    }
}

impl TryFrom<String> for PollResource {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PollResource> for String {
    fn from(resource: PollResource) -> Self {
        resource.key()
    }
}
