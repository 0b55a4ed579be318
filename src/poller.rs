// ============================================================================
// POLL SCHEDULER
// ============================================================================
// REST polling that fills the gaps the push channel leaves.
//
// - Each resource key has one pending tick in a DelayQueue
// - A tick is skipped when the staleness tracker says the key is fresh
//   (a push frame already refreshed it) or a fetch is still in flight
// - Fetches run on a JoinSet with a per-fetch timeout; completions come back
//   to the owner and are dropped if the job was cancelled or replaced
// - Consecutive failures past a threshold widen the interval, capped
//
// The scheduler never touches stores. It hands completions to its owner.
// ============================================================================

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::task::JoinSet;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, trace, warn};

use crate::config::PollingConfig;
use crate::error::{FetchError, FetchResult};
use crate::staleness::StalenessTracker;
use crate::types::{PollResource, Timestamp};

// ----------------------------------------------------------------------------
// 1. Fetcher Seam
// ----------------------------------------------------------------------------

/// One REST resource, fetched as raw JSON.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
    async fn fetch(&self) -> FetchResult<JsonValue>;
}

/// Adapts an async closure into a [`Fetcher`]
pub struct FnFetcher<F> {
    f: F,
}

impl<F> fmt::Debug for FnFetcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnFetcher")
    }
}

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<JsonValue>> + Send + 'static,
{
    async fn fetch(&self) -> FetchResult<JsonValue> {
        (self.f)().await
    }
}

pub fn fetch_fn<F, Fut>(f: F) -> Arc<dyn Fetcher>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FetchResult<JsonValue>> + Send + 'static,
{
    Arc::new(FnFetcher { f })
}

// ----------------------------------------------------------------------------
// 2. Jobs, Events & Outcomes
// ----------------------------------------------------------------------------

struct PollJob {
    /// `None` for keyed jobs that do not map onto a built-in resource
    resource: Option<PollResource>,
    base_interval: Duration,
    ttl: Duration,
    fetcher: Arc<dyn Fetcher>,
    /// `None` between expiry and the owner's `begin_tick`
    queue_key: Option<delay_queue::Key>,
    generation: u64,
    in_flight: bool,
    consecutive_failures: u32,
    last_success: Option<Timestamp>,
    last_error: Option<String>,
    fetches: u64,
    failures_total: u64,
    skipped_fresh: u64,
}

/// What happened when a tick came due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    Fetching,
    SkippedFresh,
    SkippedInFlight,
    /// Key was cancelled while its tick was pending
    Unknown,
}

/// A finished fetch, as delivered by the JoinSet
#[derive(Debug)]
pub struct FetchCompletion {
    pub key: String,
    pub resource: Option<PollResource>,
    generation: u64,
    pub result: FetchResult<JsonValue>,
    pub finished_at: Timestamp,
}

#[derive(Debug)]
pub enum PollEvent {
    /// The tick for this key is due
    Due(String),
    Completed(FetchCompletion),
}

#[derive(Debug, PartialEq)]
pub enum CompletionOutcome {
    Applied {
        key: String,
        resource: Option<PollResource>,
        ttl: Duration,
        body: JsonValue,
    },
    Failed {
        key: String,
        error: FetchError,
        consecutive_failures: u32,
        next_interval: Duration,
    },
    /// Cancelled or rescheduled since the fetch started
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PollJobStatus {
    pub key: String,
    pub interval_ms: u64,
    pub ttl_ms: u64,
    pub in_flight: bool,
    pub consecutive_failures: u32,
    pub last_success: Option<Timestamp>,
    pub last_error: Option<String>,
    pub fetches: u64,
    pub failures_total: u64,
    pub skipped_fresh: u64,
}

// ----------------------------------------------------------------------------
// 3. Scheduler
// ----------------------------------------------------------------------------

pub struct PollScheduler {
    queue: DelayQueue<String>,
    tasks: JoinSet<FetchCompletion>,
    jobs: AHashMap<String, PollJob>,
    generation: u64,
    fetch_timeout: Duration,
    failure_threshold: u32,
    max_interval: Duration,
}

impl fmt::Debug for PollScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollScheduler")
            .field("jobs", &self.jobs.len())
            .field("in_flight", &self.tasks.len())
            .field("fetch_timeout", &self.fetch_timeout)
            .field("failure_threshold", &self.failure_threshold)
            .finish()
    }
}

impl PollScheduler {
    pub fn new(fetch_timeout: Duration, failure_threshold: u32, max_interval: Duration) -> Self {
        Self {
            queue: DelayQueue::new(),
            tasks: JoinSet::new(),
            jobs: AHashMap::new(),
            generation: 0,
            fetch_timeout,
            failure_threshold,
            max_interval,
        }
    }

    pub fn from_config(config: &PollingConfig) -> Self {
        Self::new(config.fetch_timeout, config.failure_threshold, config.max_interval)
    }

    /// Register (or replace) the job for `resource`. The first tick is due
    /// immediately. Returns the freshness key.
    pub fn schedule(&mut self, resource: PollResource, interval: Duration, ttl: Duration, fetcher: Arc<dyn Fetcher>) -> String {
        self.insert_job(resource.key(), Some(resource), interval, ttl, fetcher)
    }

    /// Register (or replace) a job under an arbitrary freshness key, such as
    /// `assessment_42`. Keys naming a built-in resource are scheduled as that
    /// resource.
    pub fn schedule_key(&mut self, key: &str, interval: Duration, ttl: Duration, fetcher: Arc<dyn Fetcher>) -> String {
        match key.parse::<PollResource>() {
            Ok(resource) => self.schedule(resource, interval, ttl, fetcher),
            Err(_) => self.insert_job(key.to_string(), None, interval, ttl, fetcher),
        }
    }

    fn insert_job(
        &mut self,
        key: String,
        resource: Option<PollResource>,
        interval: Duration,
        ttl: Duration,
        fetcher: Arc<dyn Fetcher>,
    ) -> String {
        if self.cancel(&key) {
            debug!(target: "cerebro::poller", key = %key, "Replacing poll job");
        }
        self.generation += 1;
        let queue_key = self.queue.insert(key.clone(), Duration::ZERO);
        self.jobs.insert(
            key.clone(),
            PollJob {
                resource,
                base_interval: interval,
                ttl,
                fetcher,
                queue_key: Some(queue_key),
                generation: self.generation,
                in_flight: false,
                consecutive_failures: 0,
                last_success: None,
                last_error: None,
                fetches: 0,
                failures_total: 0,
                skipped_fresh: 0,
            },
        );
        info!(target: "cerebro::poller", key = %key, interval_ms = interval.as_millis() as u64, "Poll scheduled");
        key
    }

    /// Stop polling `key`. A fetch already in flight finishes but its
    /// result is ignored.
    pub fn cancel(&mut self, key: &str) -> bool {
        match self.jobs.remove(key) {
            Some(job) => {
                if let Some(queue_key) = job.queue_key {
                    self.queue.remove(&queue_key);
                }
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        let jobs = self.jobs.len();
        self.jobs.clear();
        self.queue.clear();
        self.tasks.abort_all();
        if jobs > 0 {
            debug!(target: "cerebro::poller", jobs, "Cancelled all polls");
        }
    }

    /// Nothing scheduled and nothing in flight
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.tasks.is_empty()
    }

    /// Next due tick or finished fetch. Returns `None` once idle.
    pub async fn next_event(&mut self) -> Option<PollEvent> {
        loop {
            let queue = &mut self.queue;
            let tasks = &mut self.tasks;
            let event = tokio::select! {
                Some(expired) = std::future::poll_fn(|cx| queue.poll_expired(cx)), if !queue.is_empty() => {
                    PollEvent::Due(expired.into_inner())
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok(completion) => PollEvent::Completed(completion),
                    Err(e) => {
                        if !e.is_cancelled() {
                            warn!(target: "cerebro::poller", error = %e, "Fetch task failed");
                        }
                        continue;
                    }
                },
                else => return None,
            };

            if let PollEvent::Due(key) = &event {
                if let Some(job) = self.jobs.get_mut(key) {
                    job.queue_key = None;
                }
            }
            return Some(event);
        }
    }

    /// Handle a due tick: reschedule at the current interval, then fetch
    /// unless the key is fresh or already being fetched.
    pub fn begin_tick(&mut self, key: &str, staleness: &StalenessTracker) -> TickDecision {
        let Some(job) = self.jobs.get_mut(key) else {
            return TickDecision::Unknown;
        };

        let interval = effective_interval(job, self.failure_threshold, self.max_interval);
        match job.queue_key {
            Some(queue_key) => self.queue.reset(&queue_key, interval),
            None => job.queue_key = Some(self.queue.insert(key.to_string(), interval)),
        }

        if job.in_flight {
            trace!(target: "cerebro::poller", key, "Tick skipped, fetch in flight");
            return TickDecision::SkippedInFlight;
        }
        if !staleness.is_stale(key, job.ttl) {
            job.skipped_fresh += 1;
            trace!(target: "cerebro::poller", key, "Tick skipped, data fresh");
            return TickDecision::SkippedFresh;
        }

        job.in_flight = true;
        let fetcher = Arc::clone(&job.fetcher);
        let completion_key = key.to_string();
        let resource = job.resource;
        let generation = job.generation;
        let timeout = self.fetch_timeout;

        self.tasks.spawn(async move {
            let guarded = AssertUnwindSafe(tokio::time::timeout(timeout, fetcher.fetch())).catch_unwind();
            let result = match guarded.await {
                Ok(Ok(result)) => result,
                Ok(Err(_elapsed)) => Err(FetchError::Timeout {
                    key: completion_key.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
                Err(_panic) => Err(FetchError::Transport {
                    message: "fetch panicked".to_string(),
                }),
            };
            FetchCompletion {
                key: completion_key,
                resource,
                generation,
                result,
                finished_at: Timestamp::now(),
            }
        });
        debug!(target: "cerebro::poller", key, "Fetch started");
        TickDecision::Fetching
    }

    /// Account for a finished fetch. Failures keep the job scheduled.
    pub fn complete(&mut self, completion: FetchCompletion) -> CompletionOutcome {
        let Some(job) = self.jobs.get_mut(&completion.key) else {
            trace!(target: "cerebro::poller", key = %completion.key, "Completion for cancelled job ignored");
            return CompletionOutcome::Ignored;
        };
        if job.generation != completion.generation {
            trace!(target: "cerebro::poller", key = %completion.key, "Completion for replaced job ignored");
            return CompletionOutcome::Ignored;
        }
        job.in_flight = false;

        match completion.result {
            Ok(body) => {
                let widened = job.consecutive_failures > self.failure_threshold;
                job.consecutive_failures = 0;
                job.last_success = Some(completion.finished_at);
                job.last_error = None;
                job.fetches += 1;
                if widened {
                    if let Some(queue_key) = job.queue_key {
                        self.queue.reset(&queue_key, job.base_interval);
                    }
                    info!(target: "cerebro::poller", key = %completion.key, "Poll recovered, base interval restored");
                }
                CompletionOutcome::Applied {
                    key: completion.key,
                    resource: completion.resource,
                    ttl: job.ttl,
                    body,
                }
            }
            Err(error) => {
                job.consecutive_failures = job.consecutive_failures.saturating_add(1);
                job.failures_total += 1;
                job.last_error = Some(error.to_string());
                let next_interval = effective_interval(job, self.failure_threshold, self.max_interval);
                if next_interval > job.base_interval {
                    if let Some(queue_key) = job.queue_key {
                        self.queue.reset(&queue_key, next_interval);
                    }
                }
                warn!(target: "cerebro::poller", key = %completion.key, error = %error,
                    failures = job.consecutive_failures, next_ms = next_interval.as_millis() as u64,
                    "Poll fetch failed");
                CompletionOutcome::Failed {
                    key: completion.key,
                    error,
                    consecutive_failures: job.consecutive_failures,
                    next_interval,
                }
            }
        }
    }

    /// Pull the next tick for `key` forward to now.
    pub fn trigger_now(&mut self, key: &str) -> bool {
        let Some(job) = self.jobs.get_mut(key) else {
            return false;
        };
        match job.queue_key {
            Some(queue_key) => self.queue.reset(&queue_key, Duration::ZERO),
            None => job.queue_key = Some(self.queue.insert(key.to_string(), Duration::ZERO)),
        }
        true
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.jobs.get(key).map(|job| job.ttl)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.jobs.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn stats(&self) -> Vec<PollJobStatus> {
        let mut stats: Vec<PollJobStatus> = self
            .jobs
            .iter()
            .map(|(key, job)| PollJobStatus {
                key: key.clone(),
                interval_ms: effective_interval(job, self.failure_threshold, self.max_interval).as_millis() as u64,
                ttl_ms: job.ttl.as_millis() as u64,
                in_flight: job.in_flight,
                consecutive_failures: job.consecutive_failures,
                last_success: job.last_success,
                last_error: job.last_error.clone(),
                fetches: job.fetches,
                failures_total: job.failures_total,
                skipped_fresh: job.skipped_fresh,
            })
            .collect();
        stats.sort_by(|a, b| a.key.cmp(&b.key));
        stats
    }
}

/// `base * 2^(failures - threshold)` once failures exceed the threshold
fn effective_interval(job: &PollJob, threshold: u32, max_interval: Duration) -> Duration {
    widened_interval(job.base_interval, job.consecutive_failures, threshold, max_interval)
}

pub fn widened_interval(base: Duration, failures: u32, threshold: u32, max_interval: Duration) -> Duration {
    if failures <= threshold {
        return base;
    }
    let exponent = (failures - threshold).min(31);
    base.saturating_mul(1u32 << exponent).min(max_interval.max(base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use quanta::Clock;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_case::test_case;

    use crate::types::AlertSource;

    fn scheduler() -> PollScheduler {
        PollScheduler::new(Duration::from_secs(5), 2, Duration::from_secs(60))
    }

    fn counting_fetcher(calls: Arc<AtomicU32>) -> Arc<dyn Fetcher> {
        fetch_fn(move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"cpu": 1.0}))
            }
        })
    }

    async fn expect_due(poller: &mut PollScheduler) -> String {
        match poller.next_event().await {
            Some(PollEvent::Due(key)) => key,
            other => panic!("expected due tick, got {other:?}"),
        }
    }

    async fn expect_completion(poller: &mut PollScheduler) -> FetchCompletion {
        match poller.next_event().await {
            Some(PollEvent::Completed(completion)) => completion,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test_case(0, 10)]
    #[test_case(2, 10)]
    #[test_case(3, 20)]
    #[test_case(4, 40)]
    #[test_case(5, 60)]
    #[test_case(50, 60)]
    fn test_widened_interval(failures: u32, expected_secs: u64) {
        let interval = widened_interval(Duration::from_secs(10), failures, 2, Duration::from_secs(60));
        assert_eq!(interval, Duration::from_secs(expected_secs));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_fetches_and_applies() {
        let (clock, _mock) = Clock::mock();
        let staleness = StalenessTracker::new(clock, Duration::from_secs(30));
        let calls = Arc::new(AtomicU32::new(0));
        let mut poller = scheduler();
        let key = poller.schedule(PollResource::MetricsSnapshot, Duration::from_secs(10), Duration::from_secs(30), counting_fetcher(calls.clone()));

        assert_eq!(expect_due(&mut poller).await, key);
        assert_eq!(poller.begin_tick(&key, &staleness), TickDecision::Fetching);

        let completion = expect_completion(&mut poller).await;
        match poller.complete(completion) {
            CompletionOutcome::Applied { key: applied, body, .. } => {
                assert_eq!(applied, "metrics_snapshot");
                assert_eq!(body, json!({"cpu": 1.0}));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(poller.stats()[0].fetches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skipped_when_fresh() {
        let (clock, mock) = Clock::mock();
        let mut staleness = StalenessTracker::new(clock, Duration::from_secs(30));
        let calls = Arc::new(AtomicU32::new(0));
        let mut poller = scheduler();
        let key = poller.schedule(PollResource::MetricsSnapshot, Duration::from_secs(10), Duration::from_secs(30), counting_fetcher(calls.clone()));

        staleness.mark_refreshed(&key);
        mock.increment(Duration::from_secs(2));

        expect_due(&mut poller).await;
        assert_eq!(poller.begin_tick(&key, &staleness), TickDecision::SkippedFresh);
        assert!(poller.tasks.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(poller.stats()[0].skipped_fresh, 1);

        // Next tick still comes due at the base interval
        let start = tokio::time::Instant::now();
        expect_due(&mut poller).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_tick_skipped() {
        let (clock, _mock) = Clock::mock();
        let staleness = StalenessTracker::new(clock, Duration::from_secs(30));
        let mut poller = scheduler();
        let slow = fetch_fn(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(json!([]))
        });
        let key = poller.schedule(PollResource::MetricsSnapshot, Duration::from_secs(1), Duration::from_secs(30), slow);

        expect_due(&mut poller).await;
        assert_eq!(poller.begin_tick(&key, &staleness), TickDecision::Fetching);
        expect_due(&mut poller).await;
        assert_eq!(poller.begin_tick(&key, &staleness), TickDecision::SkippedInFlight);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure_and_widens() {
        let (clock, _mock) = Clock::mock();
        let staleness = StalenessTracker::new(clock, Duration::from_secs(30));
        let mut poller = PollScheduler::new(Duration::from_secs(1), 0, Duration::from_secs(60));
        let hung = fetch_fn(|| std::future::pending::<FetchResult<JsonValue>>());
        let key = poller.schedule(PollResource::Alerts(crate::types::AlertSource::Admin), Duration::from_secs(10), Duration::from_secs(30), hung);

        expect_due(&mut poller).await;
        poller.begin_tick(&key, &staleness);
        let completion = expect_completion(&mut poller).await;
        match poller.complete(completion) {
            CompletionOutcome::Failed { error, consecutive_failures, next_interval, .. } => {
                assert!(matches!(error, FetchError::Timeout { timeout_ms: 1000, .. }));
                assert_eq!(consecutive_failures, 1);
                assert_eq!(next_interval, Duration::from_secs(20));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(poller.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_job_completion_ignored() {
        let (clock, _mock) = Clock::mock();
        let staleness = StalenessTracker::new(clock, Duration::from_secs(30));
        let calls = Arc::new(AtomicU32::new(0));
        let mut poller = scheduler();
        let key = poller.schedule(PollResource::MetricsSnapshot, Duration::from_secs(10), Duration::from_secs(30), counting_fetcher(calls.clone()));

        expect_due(&mut poller).await;
        poller.begin_tick(&key, &staleness);
        assert!(poller.cancel(&key));
        let completion = expect_completion(&mut poller).await;
        assert_eq!(poller.complete(completion), CompletionOutcome::Ignored);
        assert!(poller.next_event().await.is_none());
        assert!(poller.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_now_and_cancel_all() {
        let (clock, _mock) = Clock::mock();
        let staleness = StalenessTracker::new(clock, Duration::from_secs(30));
        let calls = Arc::new(AtomicU32::new(0));
        let mut poller = scheduler();
        let key = poller.schedule(PollResource::MetricsSnapshot, Duration::from_secs(60), Duration::from_secs(30), counting_fetcher(calls.clone()));

        expect_due(&mut poller).await;
        poller.begin_tick(&key, &staleness);
        let completion = expect_completion(&mut poller).await;
        poller.complete(completion);

        let start = tokio::time::Instant::now();
        assert!(poller.trigger_now(&key));
        assert_eq!(expect_due(&mut poller).await, key);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!poller.trigger_now("alerts:unknown"));

        poller.cancel_all();
        assert!(poller.is_empty());
        assert!(poller.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_job_refetches_after_invalidation() {
        let (clock, _mock) = Clock::mock();
        let mut staleness = StalenessTracker::new(clock, Duration::from_secs(30));
        let calls = Arc::new(AtomicU32::new(0));
        let mut poller = scheduler();
        let key = poller.schedule_key("assessment_7", Duration::from_secs(10), Duration::from_secs(300), counting_fetcher(calls.clone()));
        assert_eq!(key, "assessment_7");

        expect_due(&mut poller).await;
        assert_eq!(poller.begin_tick(&key, &staleness), TickDecision::Fetching);
        let completion = expect_completion(&mut poller).await;
        match poller.complete(completion) {
            CompletionOutcome::Applied { key: applied, resource, ttl, .. } => {
                assert_eq!(applied, "assessment_7");
                assert_eq!(resource, None);
                staleness.mark_refreshed_with_ttl(&applied, ttl);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        expect_due(&mut poller).await;
        assert_eq!(poller.begin_tick(&key, &staleness), TickDecision::SkippedFresh);

        assert!(staleness.invalidate_assessment("7") >= 1);
        expect_due(&mut poller).await;
        assert_eq!(poller.begin_tick(&key, &staleness), TickDecision::Fetching);
        expect_completion(&mut poller).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_schedule_key_recognises_builtin_resources() {
        let mut poller = scheduler();
        let fetcher = counting_fetcher(Arc::new(AtomicU32::new(0)));
        let key = poller.schedule_key("alerts:admin", Duration::from_secs(10), Duration::from_secs(30), fetcher);
        assert_eq!(key, "alerts:admin");
        assert_eq!(poller.jobs["alerts:admin"].resource, Some(PollResource::Alerts(AlertSource::Admin)));
    }
}
