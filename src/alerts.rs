// ============================================================================
// ALERT AGGREGATOR
// ============================================================================
// One deduplicated, severity-ranked view over alerts arriving from the
// performance, admin and compliance subsystems, by push or by poll.
// - Identity is the alert id; later records replace earlier ones
// - A local acknowledgement is sticky per `ReopenPolicy`
// - Capacity is bounded per source so one noisy source cannot evict another
// ============================================================================

use std::cmp::Reverse;
use std::collections::BTreeMap;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{AlertError, AlertResult};
use crate::types::{AlertSource, Severity, Timestamp};

// ----------------------------------------------------------------------------
// 1. Alert Record
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub source: AlertSource,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_type: Option<String>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl Alert {
    pub fn new(
        id: impl Into<String>,
        source: AlertSource,
        severity: Severity,
        message: impl Into<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            source,
            severity,
            message: message.into(),
            alert_type: None,
            created_at,
            acknowledged: false,
            acknowledged_by: None,
            metric_value: None,
            threshold: None,
        }
    }

    pub fn with_type(mut self, alert_type: impl Into<String>) -> Self {
        self.alert_type = Some(alert_type.into());
        self
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.metric_value = Some(value);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn acknowledged_by(mut self, by: impl Into<String>) -> Self {
        self.acknowledged = true;
        self.acknowledged_by = Some(by.into());
        self
    }

    pub fn is_critical(&self) -> bool {
        self.severity >= Severity::Critical
    }
}

/// An alert as handed to the aggregator, with the authoritative reset
/// marker carried alongside rather than stored.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingAlert {
    pub alert: Alert,
    /// Backend explicitly reopened this alert
    pub reopen: bool,
}

impl IncomingAlert {
    pub fn reopened(alert: Alert) -> Self {
        Self { alert, reopen: true }
    }
}

impl From<Alert> for IncomingAlert {
    fn from(alert: Alert) -> Self {
        Self { alert, reopen: false }
    }
}

// ----------------------------------------------------------------------------
// 2. Reopen Policy
// ----------------------------------------------------------------------------

/// How a replacing record treats an alert acknowledged locally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReopenPolicy {
    /// Acknowledged is sticky unless the replacement carries a reopen marker
    #[default]
    HonorReopen,
    /// Acknowledged is sticky even against a reopen marker
    IgnoreReopen,
    /// The replacement's acknowledgement fields always win
    LastWriteWins,
}

impl ReopenPolicy {
    fn keeps_acknowledgement(&self, reopen: bool) -> bool {
        match self {
            ReopenPolicy::HonorReopen => !reopen,
            ReopenPolicy::IgnoreReopen => true,
            ReopenPolicy::LastWriteWins => false,
        }
    }
}

/// Result of a merge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced {
        /// A local acknowledgement survived the replacement
        kept_acknowledgement: bool,
    },
    /// Older than everything its source bucket keeps; dropped on arrival
    Evicted,
}

// ----------------------------------------------------------------------------
// 3. Aggregator
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct TrackedAlert {
    alert: Alert,
    seq: u64,
}

/// Merged alert collection. Eviction order per source is
/// `(created_at, ingest sequence)`, oldest first.
#[derive(Debug)]
pub struct AlertAggregator {
    max_per_source: usize,
    policy: ReopenPolicy,
    alerts: AHashMap<String, TrackedAlert>,
    by_source: AHashMap<AlertSource, BTreeMap<(Timestamp, u64), String>>,
    next_seq: u64,
    evicted: u64,
}

impl AlertAggregator {
    pub fn new(max_per_source: usize, policy: ReopenPolicy) -> Self {
        Self {
            max_per_source: max_per_source.max(1),
            policy,
            alerts: AHashMap::new(),
            by_source: AHashMap::new(),
            next_seq: 0,
            evicted: 0,
        }
    }

    /// Merge one record. Returns how it was merged.
    pub fn ingest(&mut self, incoming: impl Into<IncomingAlert>) -> MergeOutcome {
        let IncomingAlert { mut alert, reopen } = incoming.into();
        let seq = self.next_seq;
        self.next_seq += 1;

        let outcome = match self.alerts.remove(&alert.id) {
            None => MergeOutcome::Inserted,
            Some(previous) => {
                self.unindex(&previous);
                let prior = previous.alert;
                let mut kept = false;
                if prior.acknowledged && self.policy.keeps_acknowledgement(reopen) {
                    if !alert.acknowledged {
                        alert.acknowledged = true;
                        alert.acknowledged_by = prior.acknowledged_by;
                        kept = true;
                    } else if alert.acknowledged_by.is_none() {
                        alert.acknowledged_by = prior.acknowledged_by;
                    }
                }
                if prior.source != alert.source {
                    debug!(target: "cerebro::alerts", id = %alert.id, from = %prior.source, to = %alert.source,
                        "Alert id moved between sources");
                }
                MergeOutcome::Replaced {
                    kept_acknowledgement: kept,
                }
            }
        };

        let source = alert.source;
        let id = alert.id.clone();
        self.by_source
            .entry(source)
            .or_default()
            .insert((alert.created_at, seq), id.clone());
        self.alerts.insert(id.clone(), TrackedAlert { alert, seq });
        self.enforce_capacity(source);
        if self.alerts.contains_key(&id) {
            outcome
        } else {
            MergeOutcome::Evicted
        }
    }

    fn unindex(&mut self, tracked: &TrackedAlert) {
        if let Some(bucket) = self.by_source.get_mut(&tracked.alert.source) {
            bucket.remove(&(tracked.alert.created_at, tracked.seq));
        }
    }

    fn enforce_capacity(&mut self, source: AlertSource) {
        let Some(bucket) = self.by_source.get_mut(&source) else {
            return;
        };
        while bucket.len() > self.max_per_source {
            let Some((_, id)) = bucket.pop_first() else {
                break;
            };
            if let Some(dropped) = self.alerts.remove(&id) {
                self.evicted += 1;
                debug!(target: "cerebro::alerts", id = %id, source = %source,
                    severity = %dropped.alert.severity, "Evicted alert past per-source capacity");
            }
        }
    }

    /// Mark an alert acknowledged locally.
    pub fn acknowledge(&mut self, id: &str, by: &str) -> AlertResult<&Alert> {
        let tracked = self
            .alerts
            .get_mut(id)
            .ok_or_else(|| AlertError::NotFound { id: id.to_string() })?;
        tracked.alert.acknowledged = true;
        tracked.alert.acknowledged_by = Some(by.to_string());
        Ok(&tracked.alert)
    }

    /// Remove one alert (user "clear").
    pub fn clear(&mut self, id: &str) -> Option<Alert> {
        let tracked = self.alerts.remove(id)?;
        self.unindex(&tracked);
        Some(tracked.alert)
    }

    /// Remove every acknowledged alert; returns how many were removed.
    pub fn clear_acknowledged(&mut self) -> usize {
        let ids: Vec<String> = self
            .alerts
            .values()
            .filter(|t| t.alert.acknowledged)
            .map(|t| t.alert.id.clone())
            .collect();
        for id in &ids {
            self.clear(id);
        }
        ids.len()
    }

    pub fn clear_all(&mut self) {
        self.alerts.clear();
        self.by_source.clear();
    }

    /// Alerts ordered by severity band, then newest first.
    pub fn snapshot(&self) -> Vec<Alert> {
        let mut tracked: Vec<&TrackedAlert> = self.alerts.values().collect();
        tracked.sort_by_key(|t| {
            (
                Reverse(t.alert.severity.display_rank()),
                Reverse(t.alert.created_at),
                Reverse(t.seq),
            )
        });
        tracked.into_iter().map(|t| t.alert.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Alert> {
        self.alerts.get(id).map(|t| &t.alert)
    }

    pub fn unread_count(&self) -> usize {
        self.alerts.values().filter(|t| !t.alert.acknowledged).count()
    }

    pub fn count_for_source(&self, source: AlertSource) -> usize {
        self.by_source.get(&source).map_or(0, BTreeMap::len)
    }

    pub fn counts_by_severity(&self) -> BTreeMap<Severity, usize> {
        let mut counts = BTreeMap::new();
        for tracked in self.alerts.values() {
            *counts.entry(tracked.alert.severity).or_insert(0) += 1;
        }
        counts
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted
    }

    pub fn policy(&self) -> ReopenPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}
