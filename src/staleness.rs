// ============================================================================
// STALENESS TRACKER
// ============================================================================
// Last-refresh bookkeeping per logical resource key:
// - Gates poll ticks (a fresh key needs no fetch)
// - Domain transitions clear the keys derived from the pre-transition state
// - Stamps outbound fetches with cache-defeating decoration
//
// One tracker per dashboard, injected into its composition root. The clock
// is injected too, so tests drive time with `quanta::Clock::mock()`.
// ============================================================================

use std::time::Duration;

use ahash::AHashMap;
use quanta::{Clock, Instant};
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, PRAGMA};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::StalenessConfig;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// 1. Cache Entries
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub last_refreshed: Instant,
    pub ttl: Duration,
}

/// Freshness of a key as shown to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale,
    /// Never refreshed
    Unknown,
}

/// Which keys a domain event invalidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// Every key starting with the prefix
    Prefix(String),
    /// Exactly these keys
    Keys(Vec<String>),
}

/// An external status change of a domain object, e.g. an assessment
/// moving to `completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainTransition {
    pub resource: String,
    pub id: String,
    pub status: String,
}

impl DomainTransition {
    pub fn new(resource: impl Into<String>, id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            id: id.into(),
            status: status.into(),
        }
    }

    pub fn assessment_completed(id: impl Into<String>) -> Self {
        Self::new("assessment", id, "completed")
    }
}

/// Keys derived from an assessment's state
pub fn related_keys_for_assessment(id: &str) -> Vec<String> {
    ["assessment", "recommendations", "visualization", "reports"]
        .iter()
        .map(|prefix| format!("{prefix}_{id}"))
        .collect()
}

// ----------------------------------------------------------------------------
// 2. Tracker
// ----------------------------------------------------------------------------

#[derive(Debug)]
pub struct StalenessTracker {
    clock: Clock,
    default_ttl: Duration,
    aggregate_keys: Vec<String>,
    entries: AHashMap<String, CacheEntry>,
}

impl StalenessTracker {
    pub fn new(clock: Clock, default_ttl: Duration) -> Self {
        Self {
            clock,
            default_ttl,
            aggregate_keys: Vec::new(),
            entries: AHashMap::new(),
        }
    }

    pub fn from_config(config: &StalenessConfig, clock: Clock) -> Self {
        Self::new(clock, config.default_ttl).with_aggregate_keys(config.aggregate_keys.clone())
    }

    /// Global keys cleared alongside every assessment transition
    pub fn with_aggregate_keys(mut self, keys: Vec<String>) -> Self {
        self.aggregate_keys = keys;
        self
    }

    /// Stamp `key` as refreshed now, keeping any TTL it already has.
    pub fn mark_refreshed(&mut self, key: &str) {
        let ttl = self.entries.get(key).map_or(self.default_ttl, |e| e.ttl);
        self.mark_refreshed_with_ttl(key, ttl);
    }

    pub fn mark_refreshed_with_ttl(&mut self, key: &str, ttl: Duration) {
        let now = self.clock.now();
        trace!(target: "cerebro::staleness", key, ttl_ms = ttl.as_millis() as u64, "Marked refreshed");
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_refreshed = now;
                entry.ttl = ttl;
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    CacheEntry {
                        key: key.to_string(),
                        last_refreshed: now,
                        ttl,
                    },
                );
            }
        }
    }

    /// True when `key` was never refreshed or its age exceeds `ttl`.
    pub fn is_stale(&self, key: &str, ttl: Duration) -> bool {
        match self.entries.get(key) {
            None => true,
            Some(entry) => self.clock.now().saturating_duration_since(entry.last_refreshed) > ttl,
        }
    }

    /// Staleness against the TTL stored with the entry
    pub fn needs_refresh(&self, key: &str) -> bool {
        match self.entries.get(key) {
            None => true,
            Some(entry) => self.is_stale(key, entry.ttl),
        }
    }

    pub fn freshness(&self, key: &str) -> Freshness {
        match self.entries.get(key) {
            None => Freshness::Unknown,
            Some(entry) if self.is_stale(key, entry.ttl) => Freshness::Stale,
            Some(_) => Freshness::Fresh,
        }
    }

    pub fn age(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .map(|e| self.clock.now().saturating_duration_since(e.last_refreshed))
    }

    pub fn entry(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn invalidate(&mut self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            debug!(target: "cerebro::staleness", key, "Invalidated");
        }
        removed
    }

    /// Drop every entry matched by `target`; returns how many were removed.
    pub fn invalidate_related(&mut self, target: &Invalidation) -> usize {
        let before = self.entries.len();
        match target {
            Invalidation::Prefix(prefix) => self.entries.retain(|key, _| !key.starts_with(prefix.as_str())),
            Invalidation::Keys(keys) => {
                for key in keys {
                    self.entries.remove(key);
                }
            }
        }
        let removed = before - self.entries.len();
        debug!(target: "cerebro::staleness", ?target, removed, "Invalidated related keys");
        removed
    }

    /// Clear the derived keys of an assessment plus the aggregate keys.
    pub fn invalidate_assessment(&mut self, id: &str) -> usize {
        let mut keys = related_keys_for_assessment(id);
        keys.extend(self.aggregate_keys.iter().cloned());
        self.invalidate_related(&Invalidation::Keys(keys))
    }

    /// React to a domain transition. A completed assessment clears its
    /// derived keys; any other transition clears keys prefixed with
    /// `<resource>_<id>`.
    pub fn apply_transition(&mut self, transition: &DomainTransition) -> usize {
        if transition.resource == "assessment" {
            if transition.status == "completed" {
                return self.invalidate_assessment(&transition.id);
            }
            return 0;
        }
        self.invalidate_related(&Invalidation::Prefix(format!("{}_{}", transition.resource, transition.id)))
    }

    /// Tracked keys in lexical order
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ----------------------------------------------------------------------------
// 3. Cache Busting
// ----------------------------------------------------------------------------

/// Cache-defeating decoration for outbound fetches. Only a hint for
/// intermediaries; freshness decisions never depend on it.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheBuster;

impl CacheBuster {
    pub const TIMESTAMP_PARAM: &'static str = "_t";
    pub const TOKEN_PARAM: &'static str = "_r";

    /// Append `_t=<epoch-ms>` and `_r=<random token>`, replacing any
    /// previous decoration.
    pub fn decorate(url: &Url, now: Timestamp) -> Url {
        let retained: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != Self::TIMESTAMP_PARAM && k != Self::TOKEN_PARAM)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        let mut decorated = url.clone();
        {
            let mut pairs = decorated.query_pairs_mut();
            pairs.clear();
            for (k, v) in &retained {
                pairs.append_pair(k, v);
            }
            pairs.append_pair(Self::TIMESTAMP_PARAM, &now.as_millis().to_string());
            pairs.append_pair(Self::TOKEN_PARAM, &Uuid::new_v4().simple().to_string());
        }
        decorated
    }

    pub fn no_store_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store, no-cache, must-revalidate"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn tracker() -> (StalenessTracker, std::sync::Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let tracker = StalenessTracker::new(clock, Duration::from_secs(30))
            .with_aggregate_keys(vec!["assessments".into(), "dashboard_stats".into()]);
        (tracker, mock)
    }

    #[test]
    fn test_never_refreshed_is_stale() {
        let (tracker, _) = tracker();
        assert!(tracker.is_stale("metrics_snapshot", Duration::from_secs(30)));
        assert_eq!(tracker.freshness("metrics_snapshot"), Freshness::Unknown);
    }

    #[test]
    fn test_staleness_follows_clock() {
        let (mut tracker, mock) = tracker();
        tracker.mark_refreshed("alerts:admin");
        assert!(!tracker.is_stale("alerts:admin", Duration::from_secs(30)));

        mock.increment(Duration::from_secs(2));
        assert!(!tracker.is_stale("alerts:admin", Duration::from_secs(30)));
        assert_eq!(tracker.age("alerts:admin"), Some(Duration::from_secs(2)));

        mock.increment(Duration::from_secs(29));
        assert!(tracker.is_stale("alerts:admin", Duration::from_secs(30)));
        assert_eq!(tracker.freshness("alerts:admin"), Freshness::Stale);
    }

    #[test]
    fn test_mark_refreshed_keeps_entry_ttl() {
        let (mut tracker, mock) = tracker();
        tracker.mark_refreshed_with_ttl("k", Duration::from_secs(5));
        mock.increment(Duration::from_secs(4));
        tracker.mark_refreshed("k");
        assert_eq!(tracker.entry("k").unwrap().ttl, Duration::from_secs(5));
        mock.increment(Duration::from_secs(6));
        assert!(tracker.needs_refresh("k"));
    }

    #[test]
    fn test_invalidate_assessment_clears_related_only() {
        let (mut tracker, _) = tracker();
        for key in ["assessment_X", "recommendations_X", "visualization_X", "reports_X", "assessments", "assessment_Y", "metrics_snapshot"] {
            tracker.mark_refreshed(key);
        }

        let removed = tracker.invalidate_assessment("X");

        assert_eq!(removed, 5);
        assert_eq!(tracker.keys(), vec!["assessment_Y", "metrics_snapshot"]);
    }

    #[test]
    fn test_prefix_invalidation_and_transitions() {
        let (mut tracker, _) = tracker();
        for key in ["report_7_pdf", "report_7_html", "report_8_pdf", "assessment_3"] {
            tracker.mark_refreshed(key);
        }

        assert_eq!(tracker.apply_transition(&DomainTransition::new("report", "7", "archived")), 2);
        assert_eq!(tracker.apply_transition(&DomainTransition::new("assessment", "3", "running")), 0);
        assert_eq!(tracker.apply_transition(&DomainTransition::assessment_completed("3")), 1);
        assert_eq!(tracker.keys(), vec!["report_8_pdf"]);
        assert!(tracker.invalidate("report_8_pdf"));
        assert!(!tracker.invalidate("report_8_pdf"));
    }

    #[test]
    fn test_cache_buster_decoration() {
        let url = Url::parse("http://backend:8000/api/admin/alerts?limit=50&_t=1").unwrap();
        let decorated = CacheBuster::decorate(&url, Timestamp::from_millis(1_700_000_000_123));

        let pairs: Vec<(String, String)> = decorated.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
        assert_eq!(pairs[0], ("limit".to_string(), "50".to_string()));
        assert_eq!(pairs[1], ("_t".to_string(), "1700000000123".to_string()));
        assert_eq!(pairs[2].0, "_r");
        assert_eq!(pairs[2].1.len(), 32);
        assert_eq!(pairs.len(), 3);

        let again = CacheBuster::decorate(&url, Timestamp::from_millis(1_700_000_000_123));
        assert_ne!(decorated, again);

        let headers = CacheBuster::no_store_headers();
        assert_eq!(headers.get(PRAGMA).unwrap(), "no-cache");
    }

    proptest! {
        #[test]
        fn prop_fresh_immediately_after_refresh(key in "[a-z_:]{1,24}", ttl_ms in 1u64..10_000_000) {
            let (mut tracker, _) = tracker();
            prop_assert!(tracker.is_stale(&key, Duration::from_millis(ttl_ms)));
            tracker.mark_refreshed(&key);
            prop_assert!(!tracker.is_stale(&key, Duration::from_millis(ttl_ms)));
        }
    }
}
