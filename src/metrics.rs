// ============================================================================
// WINDOWED METRIC STORE
// ============================================================================
// Bounded rolling windows of (timestamp, value) points, one per metric name.
// - Sorted insertion absorbs minor out-of-order delivery
// - Strict FIFO eviction of the oldest point once full
// - Values stored exactly as received
// ============================================================================

use std::collections::VecDeque;

use ahash::AHashMap;
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::normalizer::MetricsUpdate;
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// 1. Metric Point
// ----------------------------------------------------------------------------

/// A single point in a series. Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: Timestamp,
    pub value: f64,
}

impl MetricPoint {
    #[inline]
    pub fn new(timestamp: Timestamp, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// What happened to an appended point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AppendOutcome {
    /// Stored without displacing anything
    Stored,
    /// Stored after evicting the oldest retained point
    Evicted(MetricPoint),
    /// Older than everything retained in a full window
    Rejected,
}

// ----------------------------------------------------------------------------
// 2. Metric Series
// ----------------------------------------------------------------------------

/// Fixed-capacity series ordered by non-decreasing timestamp.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSeries {
    name: CompactString,
    capacity: usize,
    points: VecDeque<MetricPoint>,
}

impl MetricSeries {
    pub fn new(name: impl Into<CompactString>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            points: VecDeque::with_capacity(capacity),
        }
    }

    /// Insert a point, keeping timestamp order and the capacity bound.
    ///
    /// Points sharing a timestamp keep their arrival order. In a full window
    /// a point older than the oldest retained one is rejected; anything else
    /// evicts the oldest point first.
    pub fn append(&mut self, point: MetricPoint) -> AppendOutcome {
        let mut evicted = None;
        if self.points.len() >= self.capacity {
            if matches!(self.points.front(), Some(oldest) if point.timestamp < oldest.timestamp) {
                return AppendOutcome::Rejected;
            }
            evicted = self.points.pop_front();
        }

        let position = self.points.partition_point(|p| p.timestamp <= point.timestamp);
        self.points.insert(position, point);

        match evicted {
            Some(old) => AppendOutcome::Evicted(old),
            None => AppendOutcome::Stored,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = &MetricPoint> + '_ {
        self.points.iter()
    }

    pub fn to_vec(&self) -> Vec<MetricPoint> {
        self.points.iter().copied().collect()
    }

    pub fn latest(&self) -> Option<MetricPoint> {
        self.points.back().copied()
    }

    pub fn oldest(&self) -> Option<MetricPoint> {
        self.points.front().copied()
    }

    /// Short rolling summary for CLI display
    pub fn summary(&self) -> SeriesSummary {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for point in &self.points {
            min = min.min(point.value);
            max = max.max(point.value);
        }
        SeriesSummary {
            name: self.name.clone(),
            count: self.points.len(),
            min: (!self.points.is_empty()).then_some(min),
            max: (!self.points.is_empty()).then_some(max),
            latest: self.latest(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesSummary {
    pub name: CompactString,
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub latest: Option<MetricPoint>,
}

// ----------------------------------------------------------------------------
// 3. Metric Store
// ----------------------------------------------------------------------------

/// Series keyed by metric name, created lazily on first point.
#[derive(Debug, Clone)]
pub struct MetricStore {
    max_data_points: usize,
    series: AHashMap<CompactString, MetricSeries>,
    rejected: u64,
}

impl MetricStore {
    pub fn new(max_data_points: usize) -> Self {
        Self {
            max_data_points: max_data_points.max(1),
            series: AHashMap::new(),
            rejected: 0,
        }
    }

    pub fn append(&mut self, name: &str, point: MetricPoint) -> AppendOutcome {
        let capacity = self.max_data_points;
        let series = self
            .series
            .entry(CompactString::from(name))
            .or_insert_with(|| MetricSeries::new(name, capacity));
        let outcome = series.append(point);
        if outcome == AppendOutcome::Rejected {
            self.rejected += 1;
            trace!(target: "cerebro::metrics", metric = name, timestamp = %point.timestamp,
                "Rejected point older than full window");
        }
        outcome
    }

    /// Append every value of a normalized update at its timestamp.
    pub fn apply(&mut self, update: &MetricsUpdate) -> usize {
        let mut stored = 0;
        for (name, value) in &update.values {
            if self.append(name, MetricPoint::new(update.timestamp, *value)) != AppendOutcome::Rejected {
                stored += 1;
            }
        }
        stored
    }

    /// Copy of the series, empty when the name was never observed.
    pub fn get_series(&self, name: &str) -> MetricSeries {
        self.series
            .get(name)
            .cloned()
            .unwrap_or_else(|| MetricSeries::new(name, self.max_data_points))
    }

    pub fn series(&self, name: &str) -> Option<&MetricSeries> {
        self.series.get(name)
    }

    /// Metric names in lexical order
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.series.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// All series ordered by name
    pub fn all_series(&self) -> Vec<&MetricSeries> {
        let mut all: Vec<&MetricSeries> = self.series.values().collect();
        all.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn summaries(&self) -> Vec<SeriesSummary> {
        self.all_series().into_iter().map(MetricSeries::summary).collect()
    }

    pub fn max_data_points(&self) -> usize {
        self.max_data_points
    }

    pub fn rejected_points(&self) -> u64 {
        self.rejected
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn clear(&mut self) {
        self.series.clear();
    }
}
