// ============================================================================
// CONSOLE RUNTIME
// ============================================================================
// Composition root for one dashboard.
//
//   ChannelManager ──frames──┐
//   PollScheduler ──ticks────┼──→ Console (state owner) ──→ watch<Snapshot>
//   MonitorHandle ──commands─┘          │
//                                       └──→ background REST (ack / rules)
//
// Every mutation of ConsoleState happens inside the state-owner task, one
// event at a time, in arrival order. `MonitorHandle::close` cancels polls,
// closes the channel and aborts background calls.
// ============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use quanta::Clock;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::alerts::{Alert, AlertAggregator, IncomingAlert, MergeOutcome};
use crate::channel::{ChannelManager, ConnectionStatus, OutboundFrame, Transport};
use crate::config::ConsoleConfig;
use crate::error::{AlertResult, ConfigError, ConsoleError, ConsoleResult, ErrorStats, ErrorStatsSummary};
use crate::log_alert;
use crate::metrics::{MetricSeries, MetricStore};
use crate::normalizer::{EventKind, EventNormalizer, NormalizedEvent, NormalizerStats};
use crate::poller::{CompletionOutcome, Fetcher, PollEvent, PollJobStatus, PollScheduler};
use crate::rest::{AlertActions, AlertRule, RestClient, RestFetcher};
use crate::staleness::{DomainTransition, Freshness, Invalidation, StalenessTracker};
use crate::types::{AlertSource, PollResource, Severity, Timestamp};
use crate::workflows::{WorkflowChange, WorkflowState, WorkflowTracker};
use crate::{COMMAND_CHANNEL_CAPACITY, METRICS_SNAPSHOT_KEY};

// ----------------------------------------------------------------------------
// 1. Notifications
// ----------------------------------------------------------------------------

/// Transient operator notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    AcknowledgeFailed {
        at: Timestamp,
        alert_id: String,
        error: String,
    },
    CriticalAlert {
        at: Timestamp,
        alert_id: String,
        source: AlertSource,
        severity: Severity,
        message: String,
    },
}

impl Notification {
    pub fn at(&self) -> Timestamp {
        match self {
            Notification::AcknowledgeFailed { at, .. } | Notification::CriticalAlert { at, .. } => *at,
        }
    }

    pub fn alert_id(&self) -> &str {
        match self {
            Notification::AcknowledgeFailed { alert_id, .. } | Notification::CriticalAlert { alert_id, .. } => alert_id,
        }
    }

    pub fn message(&self) -> String {
        match self {
            Notification::AcknowledgeFailed { alert_id, error, .. } => {
                format!("Could not acknowledge alert {alert_id}: {error}")
            }
            Notification::CriticalAlert { severity, message, source, .. } => {
                format!("[{severity}] {source}: {message}")
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 2. Dashboard Snapshot
// ----------------------------------------------------------------------------

/// Everything a dashboard renders, published after every processed event.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub instance: String,
    pub generated_at: Timestamp,
    pub connection: ConnectionStatus,
    pub series: Vec<MetricSeries>,
    /// Severity rank descending, newest first
    pub alerts: Vec<Alert>,
    pub unread_alerts: usize,
    pub workflows: Vec<WorkflowState>,
    pub freshness: BTreeMap<String, Freshness>,
    /// Latest body of each keyed poll, e.g. `assessment_42`
    pub resources: BTreeMap<String, JsonValue>,
    pub polls: Vec<PollJobStatus>,
    /// Newest last
    pub notifications: Vec<Notification>,
    pub errors: ErrorStatsSummary,
    pub normalizer: NormalizerStats,
}

impl DashboardSnapshot {
    pub fn series(&self, name: &str) -> Option<&MetricSeries> {
        self.series.iter().find(|s| s.name() == name)
    }

    pub fn alert(&self, id: &str) -> Option<&Alert> {
        self.alerts.iter().find(|a| a.id == id)
    }

    pub fn freshness(&self, key: &str) -> Freshness {
        self.freshness.get(key).copied().unwrap_or(Freshness::Unknown)
    }

    pub fn workflow(&self, id: &str) -> Option<&WorkflowState> {
        self.workflows.iter().find(|w| w.workflow_id == id)
    }

    pub fn resource(&self, key: &str) -> Option<&JsonValue> {
        self.resources.get(key)
    }
}

// ----------------------------------------------------------------------------
// 3. Console State
// ----------------------------------------------------------------------------

/// The stores of one dashboard plus the rules that feed them. Synchronous;
/// the runtime owns it and the `replay` command drives it directly.
#[derive(Debug)]
pub struct ConsoleState {
    instance: String,
    normalizer: EventNormalizer,
    metrics: MetricStore,
    alerts: AlertAggregator,
    workflows: WorkflowTracker,
    staleness: StalenessTracker,
    resources: BTreeMap<String, JsonValue>,
    errors: ErrorStats,
    notifications: VecDeque<Notification>,
    max_notifications: usize,
}

impl ConsoleState {
    pub fn new(config: &ConsoleConfig, clock: Clock) -> Self {
        Self {
            instance: config.console.instance_name.clone(),
            normalizer: EventNormalizer::new(config.alerts.default_push_source),
            metrics: MetricStore::new(config.metrics.max_data_points),
            alerts: AlertAggregator::new(config.alerts.max_per_source, config.alerts.reopen_policy),
            workflows: WorkflowTracker::with_retention(config.workflows.retention),
            staleness: StalenessTracker::from_config(&config.staleness, clock),
            resources: BTreeMap::new(),
            errors: ErrorStats::new(),
            notifications: VecDeque::new(),
            max_notifications: config.console.max_notifications.max(1),
        }
    }

    /// Normalize and apply one push frame. Malformed frames are counted
    /// and dropped.
    pub fn apply_frame(&mut self, raw: &str, received_at: Timestamp) -> Option<EventKind> {
        let event = self.normalizer.normalize(raw, received_at)?;
        let kind = event.kind();
        self.apply_event(event);
        Some(kind)
    }

    /// Apply one normalized event and refresh the freshness key it covers.
    pub fn apply_event(&mut self, event: NormalizedEvent) {
        match event {
            NormalizedEvent::MetricsUpdate(update) => {
                let stored = self.metrics.apply(&update);
                trace!(target: "cerebro::metrics", stored, "Metrics update applied");
                self.staleness.mark_refreshed(METRICS_SNAPSHOT_KEY);
            }
            NormalizedEvent::Alert(incoming) => {
                let source = incoming.alert.source;
                self.ingest_alert(incoming);
                self.staleness.mark_refreshed(&source.freshness_key());
            }
            NormalizedEvent::WorkflowProgress(update) => {
                let workflow_id = update.workflow_id.clone();
                let change = self.workflows.apply(update);
                self.on_workflow_change(&workflow_id, change);
            }
        }
    }

    /// Route a polled body through the same stores as push events, then
    /// stamp `key` with the job's TTL.
    pub fn apply_poll(&mut self, key: &str, resource: PollResource, body: &JsonValue, ttl: Duration, received_at: Timestamp) -> usize {
        let events = self.normalizer.normalize_poll(resource, body, received_at);
        let applied = events.len();
        for event in events {
            self.apply_event(event);
        }
        self.staleness.mark_refreshed_with_ttl(key, ttl);
        debug!(target: "cerebro::poller", key, applied, "Poll result applied");
        applied
    }

    /// Store the body of a keyed poll as-is and stamp its freshness key.
    pub fn apply_keyed(&mut self, key: &str, body: JsonValue, ttl: Duration) {
        self.resources.insert(key.to_string(), body);
        self.staleness.mark_refreshed_with_ttl(key, ttl);
        debug!(target: "cerebro::poller", key, "Keyed poll result stored");
    }

    /// Drop a keyed body and its freshness entry.
    pub fn forget_resource(&mut self, key: &str) -> bool {
        self.staleness.invalidate(key);
        self.resources.remove(key).is_some()
    }

    pub fn resource(&self, key: &str) -> Option<&JsonValue> {
        self.resources.get(key)
    }

    /// Local, optimistic acknowledge. Returns the alert's source.
    pub fn acknowledge(&mut self, id: &str, by: &str) -> AlertResult<AlertSource> {
        self.alerts.acknowledge(id, by).map(|alert| alert.source)
    }

    pub fn notify(&mut self, notification: Notification) {
        if self.notifications.len() >= self.max_notifications {
            self.notifications.pop_front();
        }
        self.notifications.push_back(notification);
    }

    pub fn record_error(&mut self, error: &ConsoleError) {
        self.errors.record(error);
    }

    fn ingest_alert(&mut self, incoming: IncomingAlert) {
        let id = incoming.alert.id.clone();
        let source = incoming.alert.source;
        let severity = incoming.alert.severity;
        let message = incoming.alert.message.clone();

        if let MergeOutcome::Inserted = self.alerts.ingest(incoming) {
            if severity >= Severity::High {
                log_alert!(severity, message, alert_id = %id, source = %source);
            }
            if severity >= Severity::Critical {
                self.notify(Notification::CriticalAlert {
                    at: Timestamp::now(),
                    alert_id: id,
                    source,
                    severity,
                    message,
                });
            }
        }
    }

    fn on_workflow_change(&mut self, workflow_id: &str, change: WorkflowChange) {
        let Some(state) = self.workflows.get(workflow_id) else {
            return;
        };
        let reached_completed = match change {
            WorkflowChange::Created => state.is_completed(),
            WorkflowChange::Updated { status_changed } => status_changed && state.is_completed(),
        };
        if !reached_completed {
            return;
        }
        if let Some(assessment_id) = state.assessment_id() {
            let removed = self.staleness.invalidate_assessment(&assessment_id);
            info!(target: "cerebro::staleness", assessment = %assessment_id, removed,
                "Assessment completed, derived data invalidated");
        }
    }

    pub fn metrics(&self) -> &MetricStore {
        &self.metrics
    }

    pub fn alerts(&self) -> &AlertAggregator {
        &self.alerts
    }

    pub fn alerts_mut(&mut self) -> &mut AlertAggregator {
        &mut self.alerts
    }

    pub fn workflows(&self) -> &WorkflowTracker {
        &self.workflows
    }

    pub fn staleness(&self) -> &StalenessTracker {
        &self.staleness
    }

    pub fn staleness_mut(&mut self) -> &mut StalenessTracker {
        &mut self.staleness
    }

    pub fn normalizer_stats(&self) -> &NormalizerStats {
        self.normalizer.stats()
    }

    pub fn notifications(&self) -> impl Iterator<Item = &Notification> + '_ {
        self.notifications.iter()
    }

    pub fn error_stats(&self) -> &ErrorStats {
        &self.errors
    }

    pub fn snapshot(&self, connection: ConnectionStatus, polls: Vec<PollJobStatus>) -> DashboardSnapshot {
        let mut freshness: BTreeMap<String, Freshness> = self
            .staleness
            .keys()
            .into_iter()
            .map(|key| (key.to_string(), self.staleness.freshness(key)))
            .collect();
        for poll in &polls {
            freshness
                .entry(poll.key.clone())
                .or_insert_with(|| self.staleness.freshness(&poll.key));
        }

        let mut series: Vec<MetricSeries> = self.metrics.all_series().into_iter().cloned().collect();
        series.sort_by(|a, b| a.name().cmp(b.name()));

        DashboardSnapshot {
            instance: self.instance.clone(),
            generated_at: Timestamp::now(),
            connection,
            series,
            alerts: self.alerts.snapshot(),
            unread_alerts: self.alerts.unread_count(),
            workflows: self.workflows.list(),
            freshness,
            resources: self.resources.clone(),
            polls,
            notifications: self.notifications.iter().cloned().collect(),
            errors: self.errors.summary(),
            normalizer: self.normalizer.stats().clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4. Builder
// ----------------------------------------------------------------------------

struct PollSpec {
    key: String,
    interval: Duration,
    ttl: Duration,
    fetcher: Arc<dyn Fetcher>,
}

/// Assembles a console from configuration plus injected seams.
pub struct ConsoleBuilder {
    config: ConsoleConfig,
    transport: Option<Arc<dyn Transport>>,
    actions: Option<Arc<dyn AlertActions>>,
    rest_client: Option<Arc<RestClient>>,
    clock: Option<Clock>,
    polls: Vec<PollSpec>,
}

impl fmt::Debug for ConsoleBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleBuilder")
            .field("instance", &self.config.console.instance_name)
            .field("custom_transport", &self.transport.is_some())
            .field("custom_actions", &self.actions.is_some())
            .field("polls", &self.polls.len())
            .finish()
    }
}

impl ConsoleBuilder {
    pub fn new(config: ConsoleConfig) -> Self {
        Self {
            config,
            transport: None,
            actions: None,
            rest_client: None,
            clock: None,
            polls: Vec::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_actions(mut self, actions: Arc<dyn AlertActions>) -> Self {
        self.actions = Some(actions);
        self
    }

    pub fn with_rest_client(mut self, client: Arc<RestClient>) -> Self {
        self.rest_client = Some(client);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Poll `resource` with a custom fetcher. Once any poll is registered
    /// here, `polling.resources` from the config is not used.
    pub fn with_poll(mut self, resource: PollResource, interval: Duration, ttl: Duration, fetcher: Arc<dyn Fetcher>) -> Self {
        self.polls.push(PollSpec {
            key: resource.key(),
            interval,
            ttl,
            fetcher,
        });
        self
    }

    /// Poll an arbitrary freshness key such as `assessment_42`. The latest
    /// body is published under [`DashboardSnapshot::resources`], and the key
    /// takes part in invalidation like any other.
    pub fn with_keyed_poll(mut self, key: impl Into<String>, interval: Duration, ttl: Duration, fetcher: Arc<dyn Fetcher>) -> Self {
        self.polls.push(PollSpec {
            key: key.into(),
            interval,
            ttl,
            fetcher,
        });
        self
    }

    /// Validate, wire and spawn the state owner. Must be called from within
    /// a tokio runtime.
    pub fn start(self) -> ConsoleResult<MonitorHandle> {
        let ConsoleBuilder {
            config,
            transport,
            actions,
            rest_client,
            clock,
            polls,
        } = self;
        config.validate()?;

        let needs_rest = actions.is_none() || (polls.is_empty() && config.polling.enabled && !config.polling.resources.is_empty());
        let rest_client = match rest_client {
            Some(client) => Some(client),
            None if needs_rest => Some(Arc::new(RestClient::new(&config.rest)?)),
            None => None,
        };
        let actions: Arc<dyn AlertActions> = match (actions, &rest_client) {
            (Some(actions), _) => actions,
            (None, Some(client)) => Arc::clone(client) as Arc<dyn AlertActions>,
            (None, None) => return Err(ConsoleError::Internal("no backend for alert actions".into())),
        };

        let polls = if !polls.is_empty() {
            polls
        } else if config.polling.enabled {
            match &rest_client {
                Some(client) => config
                    .polling
                    .resources
                    .iter()
                    .map(|spec| PollSpec {
                        key: spec.resource.key(),
                        interval: spec.interval,
                        ttl: spec.ttl.unwrap_or(config.staleness.default_ttl),
                        fetcher: Arc::new(RestFetcher::new(Arc::clone(client), spec.resource)) as Arc<dyn Fetcher>,
                    })
                    .collect(),
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (status, channel) = if config.channel.enabled {
            let transport = match transport {
                Some(transport) => transport,
                None => default_transport()?,
            };
            let mut channel = ChannelManager::new(&config.channel, transport);
            channel.on_message(frames_tx);
            channel.connect(&config.channel.url)?;
            (channel.watch_status(), Some(channel))
        } else {
            drop(frames_tx);
            let (_tx, rx) = watch::channel(ConnectionStatus::disconnected());
            (rx, None)
        };

        let mut poller = PollScheduler::from_config(&config.polling);
        for spec in polls {
            poller.schedule_key(&spec.key, spec.interval, spec.ttl, spec.fetcher);
        }

        let state = ConsoleState::new(&config, clock.unwrap_or_else(Clock::new));
        let initial = state.snapshot(status.borrow().clone(), poller.stats());
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(initial));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        let console = Console {
            state,
            channel,
            status,
            poller,
            actions,
            frames: frames_rx,
            commands: command_rx,
            background: JoinSet::new(),
            snapshots: snapshot_tx,
            shutdown: shutdown.clone(),
        };
        info!(target: "cerebro::console", instance = %config.console.instance_name,
            channel = config.channel.enabled, polls = console.poller.len(), "Console starting");
        let task = tokio::spawn(console.run());

        Ok(MonitorHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            shutdown,
            task: Some(task),
        })
    }
}

#[cfg(feature = "websocket")]
fn default_transport() -> ConsoleResult<Arc<dyn Transport>> {
    Ok(Arc::new(crate::channel::WebSocketTransport))
}

#[cfg(not(feature = "websocket"))]
fn default_transport() -> ConsoleResult<Arc<dyn Transport>> {
    Err(crate::error::ConfigError::invalid_value("channel.enabled", "built without the websocket feature; inject a transport").into())
}

// ----------------------------------------------------------------------------
// 5. State Owner
// ----------------------------------------------------------------------------

enum Command {
    Acknowledge {
        id: String,
        by: String,
        reply: oneshot::Sender<ConsoleResult<()>>,
    },
    Refresh {
        key: String,
        reply: oneshot::Sender<bool>,
    },
    ClearAlert {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    ClearAcknowledged {
        reply: oneshot::Sender<usize>,
    },
    Subscribe {
        types: Vec<String>,
    },
    Transition {
        transition: DomainTransition,
        reply: oneshot::Sender<usize>,
    },
    Invalidate {
        target: Invalidation,
        reply: oneshot::Sender<usize>,
    },
    CreateRule {
        rule: AlertRule,
        reply: oneshot::Sender<ConsoleResult<JsonValue>>,
    },
    Send {
        frame: OutboundFrame,
    },
    Watch {
        spec: PollSpec,
        reply: oneshot::Sender<String>,
    },
    Unwatch {
        key: String,
        reply: oneshot::Sender<bool>,
    },
}

enum BackgroundOutcome {
    Acknowledged {
        alert_id: String,
        result: Result<(), crate::error::FetchError>,
    },
    RuleSubmitted {
        name: String,
        ok: bool,
    },
}

/// The single task that owns all dashboard state.
pub struct Console {
    state: ConsoleState,
    channel: Option<ChannelManager>,
    status: watch::Receiver<ConnectionStatus>,
    poller: PollScheduler,
    actions: Arc<dyn AlertActions>,
    frames: mpsc::UnboundedReceiver<crate::channel::InboundFrame>,
    commands: mpsc::Receiver<Command>,
    background: JoinSet<BackgroundOutcome>,
    snapshots: watch::Sender<Arc<DashboardSnapshot>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for Console {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Console")
            .field("state", &self.state)
            .field("channel", &self.channel)
            .field("poller", &self.poller)
            .finish()
    }
}

impl Console {
    pub fn builder(config: ConsoleConfig) -> ConsoleBuilder {
        ConsoleBuilder::new(config)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some(frame) = self.frames.recv() => {
                    self.state.apply_frame(&frame.text, frame.received_at);
                }
                Some(event) = self.poller.next_event(), if !self.poller.is_idle() => self.handle_poll(event),
                Some(joined) = self.background.join_next(), if !self.background.is_empty() => self.handle_background(joined),
                Ok(()) = self.status.changed() => {}
            }
            self.publish();
        }
        self.teardown().await;
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Acknowledge { id, by, reply } => {
                let result = match self.state.acknowledge(&id, &by) {
                    Ok(source) => {
                        let actions = Arc::clone(&self.actions);
                        self.background.spawn(async move {
                            let result = actions.acknowledge(source, &id, &by).await;
                            BackgroundOutcome::Acknowledged { alert_id: id, result }
                        });
                        Ok(())
                    }
                    Err(e) => Err(ConsoleError::from(e)),
                };
                let _ = reply.send(result);
            }
            Command::Refresh { key, reply } => {
                self.state.staleness_mut().invalidate(&key);
                let triggered = self.poller.trigger_now(&key);
                if key == METRICS_SNAPSHOT_KEY {
                    if let Some(channel) = &self.channel {
                        channel.send_frame(OutboundFrame::GetMetrics);
                    }
                }
                debug!(target: "cerebro::console", key = %key, triggered, "Manual refresh");
                let _ = reply.send(triggered);
            }
            Command::ClearAlert { id, reply } => {
                let _ = reply.send(self.state.alerts_mut().clear(&id).is_some());
            }
            Command::ClearAcknowledged { reply } => {
                let _ = reply.send(self.state.alerts_mut().clear_acknowledged());
            }
            Command::Subscribe { types } => match &mut self.channel {
                Some(channel) => channel.subscribe(types),
                None => trace!(target: "cerebro::console", "Subscribe ignored, channel disabled"),
            },
            Command::Transition { transition, reply } => {
                let removed = self.state.staleness_mut().apply_transition(&transition);
                info!(target: "cerebro::console", resource = %transition.resource, id = %transition.id,
                    status = %transition.status, removed, "Domain transition");
                let _ = reply.send(removed);
            }
            Command::Invalidate { target, reply } => {
                let _ = reply.send(self.state.staleness_mut().invalidate_related(&target));
            }
            Command::CreateRule { rule, reply } => {
                if let Err(e) = rule.validate() {
                    let _ = reply.send(Err(e.into()));
                    return;
                }
                let actions = Arc::clone(&self.actions);
                self.background.spawn(async move {
                    let result = actions.create_rule(&rule).await.map_err(ConsoleError::from);
                    let ok = result.is_ok();
                    let _ = reply.send(result);
                    BackgroundOutcome::RuleSubmitted { name: rule.name, ok }
                });
            }
            Command::Send { frame } => match &self.channel {
                Some(channel) => channel.send_frame(frame),
                None => trace!(target: "cerebro::console", "Send dropped, channel disabled"),
            },
            Command::Watch { spec, reply } => {
                let key = self.poller.schedule_key(&spec.key, spec.interval, spec.ttl, spec.fetcher);
                let _ = reply.send(key);
            }
            Command::Unwatch { key, reply } => {
                let cancelled = self.poller.cancel(&key);
                let forgotten = self.state.forget_resource(&key);
                debug!(target: "cerebro::console", key = %key, cancelled, forgotten, "Watch removed");
                let _ = reply.send(cancelled);
            }
        }
    }

    fn handle_poll(&mut self, event: PollEvent) {
        match event {
            PollEvent::Due(key) => {
                self.poller.begin_tick(&key, self.state.staleness());
            }
            PollEvent::Completed(completion) => match self.poller.complete(completion) {
                CompletionOutcome::Applied { key, resource: Some(resource), ttl, body } => {
                    self.state.apply_poll(&key, resource, &body, ttl, Timestamp::now());
                }
                CompletionOutcome::Applied { key, resource: None, ttl, body } => {
                    self.state.apply_keyed(&key, body, ttl);
                }
                CompletionOutcome::Failed { error, .. } => {
                    self.state.record_error(&ConsoleError::Fetch(error));
                }
                CompletionOutcome::Ignored => {}
            },
        }
    }

    fn handle_background(&mut self, joined: Result<BackgroundOutcome, JoinError>) {
        match joined {
            Ok(BackgroundOutcome::Acknowledged { alert_id, result: Ok(()) }) => {
                debug!(target: "cerebro::alerts", alert_id = %alert_id, "Acknowledge confirmed");
            }
            Ok(BackgroundOutcome::Acknowledged { alert_id, result: Err(error) }) => {
                warn!(target: "cerebro::alerts", alert_id = %alert_id, error = %error,
                    "Acknowledge failed upstream, keeping local state");
                self.state.notify(Notification::AcknowledgeFailed {
                    at: Timestamp::now(),
                    alert_id,
                    error: error.to_string(),
                });
                self.state.record_error(&ConsoleError::Fetch(error));
            }
            Ok(BackgroundOutcome::RuleSubmitted { name, ok }) => {
                debug!(target: "cerebro::alerts", rule = %name, ok, "Alert rule submitted");
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                warn!(target: "cerebro::console", error = %e, "Background call failed");
                self.state.record_error(&ConsoleError::Internal(e.to_string()));
            }
        }
    }

    fn publish(&self) {
        let connection = self.status.borrow().clone();
        let snapshot = self.state.snapshot(connection, self.poller.stats());
        self.snapshots.send_replace(Arc::new(snapshot));
    }

    async fn teardown(&mut self) {
        self.poller.cancel_all();
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        self.background.abort_all();
        self.commands.close();
        self.publish();
        info!(target: "cerebro::console", "Console stopped");
    }
}

// ----------------------------------------------------------------------------
// 6. Monitor Handle
// ----------------------------------------------------------------------------

/// Scoped handle over a running console. Dropping it cancels everything;
/// `close()` also waits for teardown to finish.
#[derive(Debug)]
pub struct MonitorHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Arc<DashboardSnapshot>>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Acknowledge { .. } => "acknowledge",
            Command::Refresh { .. } => "refresh",
            Command::ClearAlert { .. } => "clear_alert",
            Command::ClearAcknowledged { .. } => "clear_acknowledged",
            Command::Subscribe { .. } => "subscribe",
            Command::Transition { .. } => "transition",
            Command::Invalidate { .. } => "invalidate",
            Command::CreateRule { .. } => "create_rule",
            Command::Send { .. } => "send",
            Command::Watch { .. } => "watch",
            Command::Unwatch { .. } => "unwatch",
        };
        f.write_str(name)
    }
}

impl MonitorHandle {
    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<DashboardSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<Arc<DashboardSnapshot>> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> ConsoleResult<Arc<DashboardSnapshot>>
    where
        F: FnMut(&DashboardSnapshot) -> bool,
    {
        let mut rx = self.snapshots.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| ConsoleError::ShuttingDown)?;
        Ok(Arc::clone(&snapshot))
    }

    /// Acknowledge locally right away; the backend call runs in the
    /// background and a failure surfaces as a notification.
    pub async fn acknowledge(&self, id: &str, by: &str) -> ConsoleResult<()> {
        self.request(|reply| Command::Acknowledge {
            id: id.to_string(),
            by: by.to_string(),
            reply,
        })
        .await?
    }

    /// Invalidate `key` and pull its poll tick forward. Returns whether a
    /// poll job exists for the key.
    pub async fn refresh(&self, key: &str) -> ConsoleResult<bool> {
        self.request(|reply| Command::Refresh {
            key: key.to_string(),
            reply,
        })
        .await
    }

    pub async fn clear_alert(&self, id: &str) -> ConsoleResult<bool> {
        self.request(|reply| Command::ClearAlert { id: id.to_string(), reply }).await
    }

    pub async fn clear_acknowledged(&self) -> ConsoleResult<usize> {
        self.request(|reply| Command::ClearAcknowledged { reply }).await
    }

    pub async fn subscribe(&self, types: Vec<String>) -> ConsoleResult<()> {
        self.dispatch(Command::Subscribe { types }).await
    }

    pub async fn domain_transition(&self, transition: DomainTransition) -> ConsoleResult<usize> {
        self.request(|reply| Command::Transition { transition, reply }).await
    }

    pub async fn invalidate(&self, target: Invalidation) -> ConsoleResult<usize> {
        self.request(|reply| Command::Invalidate { target, reply }).await
    }

    pub async fn create_alert_rule(&self, rule: AlertRule) -> ConsoleResult<JsonValue> {
        self.request(|reply| Command::CreateRule { rule, reply }).await?
    }

    /// Queue a typed frame on the channel. Not delivered while disconnected.
    pub async fn send(&self, frame_type: &str, payload: JsonValue) -> ConsoleResult<()> {
        self.dispatch(Command::Send {
            frame: OutboundFrame::custom(frame_type, payload),
        })
        .await
    }

    /// Start polling `key` with `fetcher`; replaces an existing job for the
    /// same key. The first fetch happens right away.
    pub async fn watch_resource(&self, key: &str, interval: Duration, ttl: Duration, fetcher: Arc<dyn Fetcher>) -> ConsoleResult<String> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ConfigError::invalid_value("watch.key", "must not be empty").into());
        }
        if interval.is_zero() {
            return Err(ConfigError::invalid_value("watch.interval", "must be > 0").into());
        }
        let spec = PollSpec {
            key: key.to_string(),
            interval,
            ttl,
            fetcher,
        };
        self.request(|reply| Command::Watch { spec, reply }).await
    }

    /// Stop polling `key` and drop its stored body. Returns whether a job
    /// was scheduled.
    pub async fn unwatch(&self, key: &str) -> ConsoleResult<bool> {
        self.request(|reply| Command::Unwatch {
            key: key.to_string(),
            reply,
        })
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Cancel polls, close the channel and wait for the state owner to exit.
    pub async fn close(mut self) -> ConsoleResult<()> {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| ConsoleError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn dispatch(&self, command: Command) -> ConsoleResult<()> {
        self.commands.send(command).await.map_err(|_| ConsoleError::ShuttingDown)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> ConsoleResult<T> {
        let (reply, response) = oneshot::channel();
        self.dispatch(make(reply)).await?;
        response.await.map_err(|_| ConsoleError::ShuttingDown)
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::error::FetchResult;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config() -> ConsoleConfig {
        let mut config = ConsoleConfig::default();
        config.channel.enabled = false;
        config.polling.enabled = false;
        config.metrics.max_data_points = 2;
        config
    }

    fn state() -> (ConsoleState, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        (ConsoleState::new(&config(), clock), mock)
    }

    struct FlakyActions {
        fail: AtomicBool,
    }

    #[async_trait]
    impl AlertActions for FlakyActions {
        async fn acknowledge(&self, _source: AlertSource, _alert_id: &str, _by: &str) -> FetchResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                Err(FetchError::http(502, "Bad Gateway"))
            } else {
                Ok(())
            }
        }

        async fn create_rule(&self, rule: &AlertRule) -> FetchResult<JsonValue> {
            Ok(serde_json::json!({"id": 9, "name": rule.name}))
        }
    }

    #[test]
    fn test_metrics_window_scenario() {
        let (mut state, _mock) = state();
        for (t, cpu) in [(0, 42), (1, 55), (2, 60)] {
            let frame = format!(r#"{{"type":"metrics_update","data":{{"cpu":{cpu}}},"timestamp":{t}}}"#);
            assert_eq!(state.apply_frame(&frame, Timestamp::EPOCH), Some(EventKind::MetricsUpdate));
        }
        let points: Vec<(i64, f64)> = state
            .metrics()
            .get_series("cpu")
            .points()
            .map(|p| (p.timestamp.as_secs(), p.value))
            .collect();
        assert_eq!(points, vec![(1, 55.0), (2, 60.0)]);
        assert_eq!(state.staleness().freshness(METRICS_SNAPSHOT_KEY), Freshness::Fresh);
    }

    #[test]
    fn test_malformed_frame_dropped() {
        let (mut state, _mock) = state();
        assert_eq!(state.apply_frame("{oops", Timestamp::EPOCH), None);
        assert_eq!(state.apply_frame(r#"{"type":"heartbeat"}"#, Timestamp::EPOCH), None);
        assert_eq!(state.normalizer_stats().dropped(), 2);
        assert!(state.metrics().is_empty());
    }

    #[test]
    fn test_push_alert_refreshes_source_and_notifies_critical() {
        let (mut state, _mock) = state();
        let frame = r#"{"type":"alert","data":{"alert_id":"C1","severity":"critical","message":"disk full","source":"admin"}}"#;
        state.apply_frame(frame, Timestamp::from_secs(10));

        assert_eq!(state.staleness().freshness("alerts:admin"), Freshness::Fresh);
        let notifications: Vec<&Notification> = state.notifications().collect();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].alert_id(), "C1");

        // Re-sent alert does not notify twice
        state.apply_frame(frame, Timestamp::from_secs(11));
        assert_eq!(state.notifications().count(), 1);
    }

    #[test]
    fn test_critical_alert_evicted_on_arrival_does_not_notify() {
        let mut config = config();
        config.alerts.max_per_source = 1;
        let mut state = ConsoleState::new(&config, Clock::mock().0);
        state.apply_frame(
            r#"{"type":"alert","data":{"alert_id":"N1","severity":"info","message":"fresh","source":"admin","created_at":100}}"#,
            Timestamp::from_secs(100),
        );
        state.apply_frame(
            r#"{"type":"alert","data":{"alert_id":"OLD","severity":"critical","message":"backlog","source":"admin","created_at":10}}"#,
            Timestamp::from_secs(101),
        );

        assert!(state.alerts().get("OLD").is_none());
        assert!(state.alerts().get("N1").is_some());
        assert_eq!(state.notifications().count(), 0);
    }

    #[test]
    fn test_completed_assessment_workflow_invalidates() {
        let (mut state, _mock) = state();
        for key in ["assessment_7", "reports_7", "assessments", "unrelated"] {
            state.staleness_mut().mark_refreshed(key);
        }
        state.apply_frame(r#"{"type":"workflow_progress","data":{"workflow_id":"assessment_7","status":"running"}}"#, Timestamp::EPOCH);
        assert_eq!(state.staleness().len(), 4);

        state.apply_frame(r#"{"type":"workflow_progress","data":{"workflow_id":"assessment_7","status":"completed","progress":100}}"#, Timestamp::EPOCH);
        assert_eq!(state.staleness().keys(), vec!["unrelated"]);
    }

    #[test]
    fn test_keyed_poll_results_invalidated_by_completed_workflow() {
        let (mut state, _mock) = state();
        state.apply_keyed("assessment_12", serde_json::json!({"id": 12, "status": "running"}), Duration::from_secs(300));
        state.apply_keyed("reports_12", serde_json::json!([]), Duration::from_secs(300));
        state.apply_keyed("assessment_13", serde_json::json!({"id": 13}), Duration::from_secs(300));
        assert_eq!(state.staleness().freshness("assessment_12"), Freshness::Fresh);

        state.apply_frame(r#"{"type":"workflow_progress","data":{"workflow_id":"assessment_12","status":"completed"}}"#, Timestamp::EPOCH);
        assert_eq!(state.staleness().keys(), vec!["assessment_13"]);
        assert!(state.staleness().is_stale("assessment_12", Duration::from_secs(300)));
        // Last body stays visible until the refetch replaces it
        assert_eq!(state.resource("assessment_12").unwrap()["status"], "running");

        assert!(state.forget_resource("assessment_13"));
        assert!(state.resource("assessment_13").is_none());
        assert!(state.staleness().is_empty());
    }

    #[test]
    fn test_poll_body_applied_with_ttl() {
        let (mut state, mock) = state();
        let body = serde_json::json!([{"id": "P1", "severity": "high", "message": "latency"}]);
        let applied = state.apply_poll("alerts:performance", PollResource::Alerts(AlertSource::Performance), &body, Duration::from_secs(60), Timestamp::EPOCH);
        assert_eq!(applied, 1);
        assert_eq!(state.alerts().get("P1").unwrap().source, AlertSource::Performance);

        mock.increment(Duration::from_secs(45));
        assert_eq!(state.staleness().freshness("alerts:performance"), Freshness::Fresh);
        mock.increment(Duration::from_secs(20));
        assert_eq!(state.staleness().freshness("alerts:performance"), Freshness::Stale);
    }

    #[test]
    fn test_repeated_poll_of_idless_alert_keeps_one_copy() {
        let (mut state, _mock) = state();
        let body = serde_json::json!([{"severity": "high", "message": "disk nearly full"}]);
        for at in [100, 130, 160] {
            state.apply_poll("alerts:admin", PollResource::Alerts(AlertSource::Admin), &body, Duration::from_secs(30), Timestamp::from_secs(at));
        }

        assert_eq!(state.alerts().len(), 1);
        assert_eq!(state.alerts().unread_count(), 1);
        assert_eq!(state.alerts().evicted_total(), 0);
    }

    #[test]
    fn test_notifications_bounded() {
        let mut config = config();
        config.console.max_notifications = 2;
        let mut state = ConsoleState::new(&config, Clock::mock().0);
        for id in ["a", "b", "c"] {
            state.notify(Notification::AcknowledgeFailed {
                at: Timestamp::EPOCH,
                alert_id: id.into(),
                error: "boom".into(),
            });
        }
        let ids: Vec<&str> = state.notifications().map(Notification::alert_id).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_alert_rejected() {
        let actions = Arc::new(FlakyActions { fail: AtomicBool::new(true) });
        let handle = Console::builder(config()).with_actions(actions).start().unwrap();

        let err = handle.acknowledge("missing", "ops").await.unwrap_err();
        assert!(matches!(err, ConsoleError::Alert(_)));
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_rule_validates_then_submits() {
        let actions = Arc::new(FlakyActions { fail: AtomicBool::new(false) });
        let handle = Console::builder(config()).with_actions(actions).start().unwrap();

        let bad = AlertRule::new("", "cpu", crate::rest::RuleCondition::Above, 1.0, Severity::Low);
        assert!(matches!(handle.create_alert_rule(bad).await, Err(ConsoleError::Alert(_))));

        let rule = AlertRule::new("cpu hot", "cpu", crate::rest::RuleCondition::Above, 90.0, Severity::High);
        let created = handle.create_alert_rule(rule).await.unwrap();
        assert_eq!(created["id"], 9);
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_resource_publishes_body_until_unwatched() {
        let actions = Arc::new(FlakyActions { fail: AtomicBool::new(false) });
        let handle = Console::builder(config()).with_actions(actions).start().unwrap();
        let fetcher = crate::poller::fetch_fn(|| async { Ok(serde_json::json!({"id": 5, "score": 72})) });

        let empty = handle.watch_resource("  ", Duration::from_secs(30), Duration::from_secs(60), Arc::clone(&fetcher)).await;
        assert!(matches!(empty, Err(ConsoleError::Config(_))));
        let zero = handle.watch_resource("assessment_5", Duration::ZERO, Duration::from_secs(60), Arc::clone(&fetcher)).await;
        assert!(matches!(zero, Err(ConsoleError::Config(_))));

        let key = handle.watch_resource("assessment_5", Duration::from_secs(30), Duration::from_secs(60), fetcher).await.unwrap();
        assert_eq!(key, "assessment_5");
        let snapshot = handle.wait_for(|s| s.resource("assessment_5").is_some()).await.unwrap();
        assert_eq!(snapshot.resource("assessment_5").unwrap()["score"], 72);
        assert_eq!(snapshot.freshness("assessment_5"), Freshness::Fresh);

        assert!(handle.unwatch("assessment_5").await.unwrap());
        assert!(!handle.unwatch("assessment_5").await.unwrap());
        let snapshot = handle.wait_for(|s| s.polls.is_empty()).await.unwrap();
        assert!(snapshot.resource("assessment_5").is_none());
        handle.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_ends_snapshot_stream() {
        let actions = Arc::new(FlakyActions { fail: AtomicBool::new(false) });
        let handle = Console::builder(config()).with_actions(actions).start().unwrap();
        let rx = handle.subscribe_snapshots();
        handle.close().await.unwrap();
        assert!(rx.has_changed().is_err());
    }
}
