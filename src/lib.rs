//! # Cerebro Console - Telemetry Ingestion & Coherence Core
//!
//! The data plane behind the Cerebro operations console. It keeps a single
//! live push channel open to the backend, normalizes every inbound frame,
//! folds metrics into bounded rolling windows, reconciles alerts arriving
//! from three subsystems, and decides when REST polling must fill the gaps
//! the push channel leaves.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          CEREBRO CONSOLE CORE                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  CHANNEL ─┐                                                                  │
//! │           ├─→ NORMALIZER ─→ METRIC STORE / ALERT AGGREGATOR / WORKFLOWS      │
//! │  POLLER ──┘        │                          │                              │
//! │     ↑              └──→ STALENESS TRACKER ←───┘                              │
//! │     └──────────── skip-if-fresh ──────┘            → DASHBOARD SNAPSHOT      │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every state mutation happens on one task (see [`console`]), so frames and
//! poll results are applied one at a time in arrival order.
//!
//! ## Author
//!
//! AIOps Team

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ============================================================================
// SECTION 1: MODULES
// ============================================================================

pub mod alerts;
pub mod channel;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod normalizer;
pub mod poller;
pub mod rest;
pub mod staleness;
pub mod types;
pub mod workflows;

pub use alerts::{Alert, AlertAggregator, IncomingAlert, MergeOutcome, ReopenPolicy};
pub use channel::{
    BackoffPolicy, ChannelManager, Connection, ConnectionState, ConnectionStatus, InboundFrame,
    OutboundFrame, Transport,
};
pub use config::ConsoleConfig;
pub use console::{Console, ConsoleBuilder, DashboardSnapshot, MonitorHandle};
pub use error::{ConsoleError, ConsoleResult, RecoveryHint};
pub use metrics::{MetricPoint, MetricSeries, MetricStore};
pub use normalizer::{EventNormalizer, NormalizedEvent};
pub use poller::{Fetcher, PollScheduler};
pub use rest::{RestClient, RestFetcher};
pub use staleness::{CacheBuster, DomainTransition, Invalidation, StalenessTracker};
pub use types::{AlertSource, PollResource, Severity, Timestamp};
pub use workflows::{WorkflowState, WorkflowTracker};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Defaults that shape the behaviour of the console core. All of them can be
// overridden through `ConsoleConfig`.
// ============================================================================

/// Crate version - follows semantic versioning
pub const CONSOLE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Short binary name
pub const CONSOLE_NAME: &str = "cerebro-console";

/// Human readable name used in banners
pub const CONSOLE_FULL_NAME: &str = "Cerebro Console Telemetry Core";

// ----------------------------------------------------------------------------
// Channel
// ----------------------------------------------------------------------------

/// Default push channel endpoint
pub const DEFAULT_CHANNEL_URL: &str = "ws://localhost:8000/ws/performance";

/// First reconnect delay
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Reconnect delays never grow past this
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;

/// Attempts before the connection indicator reports exhaustion
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Frames buffered while the channel is reconnecting
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Event types subscribed to on every (re)connect
pub const SUBSCRIBABLE_EVENT_TYPES: [&str; 3] = ["metrics_update", "alert", "workflow_progress"];

// ----------------------------------------------------------------------------
// Stores
// ----------------------------------------------------------------------------

/// Rolling window length per metric series
pub const DEFAULT_MAX_DATA_POINTS: usize = 60;

/// Alerts retained per source
pub const DEFAULT_ALERTS_PER_SOURCE: usize = 200;

/// Bounded notification history surfaced in snapshots
pub const DEFAULT_MAX_NOTIFICATIONS: usize = 50;

/// Finished workflows are kept this long after their last update
pub const DEFAULT_WORKFLOW_RETENTION_SECS: u64 = 3_600;

// ----------------------------------------------------------------------------
// Freshness & Polling
// ----------------------------------------------------------------------------

/// Cache entries older than this are stale
pub const DEFAULT_CACHE_TTL_SECS: u64 = 30;

/// Per-fetch timeout
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Consecutive failures before a poll interval widens
pub const DEFAULT_POLL_FAILURE_THRESHOLD: u32 = 3;

/// Upper bound for a widened poll interval
pub const DEFAULT_MAX_POLL_INTERVAL_SECS: u64 = 300;

/// Freshness key refreshed by metric pushes and snapshot polls
pub const METRICS_SNAPSHOT_KEY: &str = "metrics_snapshot";

// ----------------------------------------------------------------------------
// REST
// ----------------------------------------------------------------------------

/// Default backend base URL
pub const DEFAULT_REST_BASE_URL: &str = "http://localhost:8000";

/// Capacity of the command queue feeding the state owner
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;
