// ============================================================================
// ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the console core.
// Designed for:
// - Clear error categorization
// - Recovery strategy hints
// - Cheap per-category accounting surfaced in dashboard snapshots
// ============================================================================

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// 1. Console Errors
// ----------------------------------------------------------------------------

/// The main error type for the console core.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ConsoleError {
    // ---- Configuration Errors ----
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // ---- Push Channel Errors ----
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    // ---- Normalization Errors ----
    #[error("Normalization error: {0}")]
    Normalize(#[from] NormalizeError),

    // ---- Alert Errors ----
    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    // ---- REST / Poll Errors ----
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    // ---- IO Errors ----
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ---- Generic Errors ----
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl ConsoleError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ConsoleError::Config(_) => false,
            ConsoleError::Channel(e) => e.is_recoverable(),
            ConsoleError::Normalize(_) => true,
            ConsoleError::Alert(_) => true,
            ConsoleError::Fetch(e) => e.is_recoverable(),
            ConsoleError::Io(_) => true,
            ConsoleError::Internal(_) => false,
            ConsoleError::ShuttingDown => false,
        }
    }

    /// Get the error category for accounting/logging
    pub fn category(&self) -> &'static str {
        match self {
            ConsoleError::Config(_) => "config",
            ConsoleError::Channel(_) => "channel",
            ConsoleError::Normalize(_) => "normalize",
            ConsoleError::Alert(_) => "alert",
            ConsoleError::Fetch(_) => "fetch",
            ConsoleError::Io(_) => "io",
            ConsoleError::Internal(_) => "internal",
            ConsoleError::ShuttingDown => "shutdown",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ConsoleError::Config(_) => RecoveryHint::FixConfiguration,
            ConsoleError::Channel(e) => e.recovery_hint(),
            ConsoleError::Normalize(_) => RecoveryHint::Skip,
            ConsoleError::Alert(_) => RecoveryHint::NotifyUser,
            ConsoleError::Fetch(e) => e.recovery_hint(),
            ConsoleError::ShuttingDown => RecoveryHint::None,
            _ => RecoveryHint::RetryWithBackoff,
        }
    }
}

/// Hints for how to recover from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Reconnect the push channel
    Reconnect,
    /// Fix configuration and restart
    FixConfiguration,
    /// Drop this item and continue
    Skip,
    /// Surface a notification to the operator
    NotifyUser,
}

// ----------------------------------------------------------------------------
// 2. Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3. Channel Errors
// ----------------------------------------------------------------------------

/// Errors from the push channel
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    #[error("Connection to '{url}' failed: {message}")]
    ConnectFailed { url: String, message: String },

    #[error("Send failed: {message}")]
    SendFailed { message: String },

    #[error("Connection closed abnormally (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Channel is not connected")]
    NotConnected,

    #[error("No inbound frame consumer registered")]
    NoConsumer,
}

impl ChannelError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ChannelError::NoConsumer)
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ChannelError::NoConsumer => RecoveryHint::FixConfiguration,
            ChannelError::NotConnected => RecoveryHint::None,
            _ => RecoveryHint::Reconnect,
        }
    }

    pub fn connect_failed(url: impl Into<String>, message: impl Into<String>) -> Self {
        ChannelError::ConnectFailed {
            url: url.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4. Normalization Errors
// ----------------------------------------------------------------------------

/// Reasons an inbound frame or poll body was dropped
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NormalizeError {
    #[error("Frame is not valid JSON: {message}")]
    InvalidJson { message: String },

    #[error("Frame has no 'type' discriminator")]
    MissingType,

    #[error("Unknown frame type '{kind}'")]
    UnknownType { kind: String },

    #[error("Invalid '{kind}' payload: {message}")]
    InvalidPayload { kind: String, message: String },

    #[error("'{kind}' payload is missing required field '{field}'")]
    MissingField { kind: String, field: String },
}

impl NormalizeError {
    pub fn invalid_payload(kind: impl Into<String>, message: impl Into<String>) -> Self {
        NormalizeError::InvalidPayload {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(kind: impl Into<String>, field: impl Into<String>) -> Self {
        NormalizeError::MissingField {
            kind: kind.into(),
            field: field.into(),
        }
    }

    /// Short reason label used in drop logs and counters
    pub fn reason(&self) -> &'static str {
        match self {
            NormalizeError::InvalidJson { .. } => "invalid_json",
            NormalizeError::MissingType => "missing_type",
            NormalizeError::UnknownType { .. } => "unknown_type",
            NormalizeError::InvalidPayload { .. } => "invalid_payload",
            NormalizeError::MissingField { .. } => "missing_field",
        }
    }
}

// ----------------------------------------------------------------------------
// 5. Alert Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlertError {
    #[error("Alert not found: id={id}")]
    NotFound { id: String },

    #[error("Invalid alert rule: {message}")]
    InvalidRule { message: String },
}

// ----------------------------------------------------------------------------
// 6. Fetch Errors
// ----------------------------------------------------------------------------

/// Errors from REST fetches, whether polled or user-initiated
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Fetch of '{key}' timed out after {timeout_ms}ms")]
    Timeout { key: String, timeout_ms: u64 },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport failure: {message}")]
    Transport { message: String },

    #[error("Could not decode response: {message}")]
    Decode { message: String },

    #[error("Invalid request URL: {message}")]
    InvalidUrl { message: String },

    #[error("No backend configured for '{operation}'")]
    Unavailable { operation: String },
}

impl FetchError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            FetchError::InvalidUrl { .. } | FetchError::Unavailable { .. } => false,
            FetchError::Http { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => true,
        }
    }

    pub fn recovery_hint(&self) -> RecoveryHint {
        if self.is_recoverable() {
            RecoveryHint::RetryWithBackoff
        } else {
            RecoveryHint::NotifyUser
        }
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        FetchError::Http {
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                key: err.url().map(|u| u.path().to_string()).unwrap_or_default(),
                timeout_ms: 0,
            }
        } else if err.is_decode() {
            FetchError::Decode { message: err.to_string() }
        } else if let Some(status) = err.status() {
            FetchError::http(status.as_u16(), err.to_string())
        } else {
            FetchError::Transport { message: err.to_string() }
        }
    }
}

// ----------------------------------------------------------------------------
// 7. Parse Helper Error
// ----------------------------------------------------------------------------

/// A string did not name any known variant of an enum
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 8. Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for console operations
pub type ConsoleResult<T> = Result<T, ConsoleError>;

/// Result type for push channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Result type for normalization
pub type NormalizeResult<T> = Result<T, NormalizeError>;

/// Result type for alert store operations
pub type AlertResult<T> = Result<T, AlertError>;

/// Result type for REST fetches
pub type FetchResult<T> = Result<T, FetchError>;

// ----------------------------------------------------------------------------
// 9. Error Statistics Tracking
// ----------------------------------------------------------------------------

/// Per-category error counters. Owned by the state-owning task, so plain
/// integers are enough.
#[derive(Debug, Default, Clone)]
pub struct ErrorStats {
    by_category: BTreeMap<&'static str, u64>,
    recoverable_count: u64,
    non_recoverable_count: u64,
    last_error_time: Option<Timestamp>,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn record(&mut self, error: &ConsoleError) {
        *self.by_category.entry(error.category()).or_insert(0) += 1;
        if error.is_recoverable() {
            self.recoverable_count += 1;
        } else {
            self.non_recoverable_count += 1;
        }
        self.last_error_time = Some(Timestamp::now());
    }

    pub fn total_errors(&self) -> u64 {
        self.recoverable_count + self.non_recoverable_count
    }

    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category.get(category).copied().unwrap_or(0)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn summary(&self) -> ErrorStatsSummary {
        ErrorStatsSummary {
            total: self.total_errors(),
            recoverable: self.recoverable_count,
            non_recoverable: self.non_recoverable_count,
            by_category: self
                .by_category
                .iter()
                .map(|(category, count)| (category.to_string(), *count))
                .collect(),
            last_error_time: self.last_error_time,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorStatsSummary {
    pub total: u64,
    pub recoverable: u64,
    pub non_recoverable: u64,
    pub by_category: BTreeMap<String, u64>,
    pub last_error_time: Option<Timestamp>,
}
