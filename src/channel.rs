// ============================================================================
// CHANNEL MANAGER
// ============================================================================
// One persistent duplex connection per dashboard context.
//
//   disconnected → connecting → connected
//                      ↑            │ abnormal close / error
//                      └─ backoff ←─┘
//
// - Exponential reconnect delay (base doubling, capped), retried forever
// - Subscriptions replayed verbatim on every (re)connect
// - Sends queued during connecting/backoff are flushed FIFO once connected
// - Inbound text frames go to a single registered consumer, in order
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ChannelConfig;
use crate::error::{ChannelError, ChannelResult};
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// 1. Connection State & Status
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Backoff => "backoff",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status published to the UI layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed attempts since the last successful connect
    pub attempt: u32,
    /// Attempt limit reached; retries continue at the capped interval
    pub exhausted: bool,
    pub last_error: Option<String>,
    /// Delay before the next attempt while in backoff
    pub retry_in_ms: Option<u64>,
    pub since: Timestamp,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            attempt: 0,
            exhausted: false,
            last_error: None,
            retry_in_ms: None,
            since: Timestamp::now(),
        }
    }

    /// State shown on the passive indicator: exhaustion reads as
    /// disconnected even while retries continue.
    pub fn indicator(&self) -> ConnectionState {
        if self.exhausted && self.state != ConnectionState::Connected {
            ConnectionState::Disconnected
        } else {
            self.state
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self::disconnected()
    }
}

// ----------------------------------------------------------------------------
// 2. Backoff Policy
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 0 disables exhaustion reporting
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            max_attempts: config.max_attempts,
        }
    }

    /// Delay after the `attempt`-th consecutive failure (1-based):
    /// `base * 2^(attempt-1)`, capped. Past the attempt limit every
    /// retry waits the capped interval.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.max_attempts > 0 && attempt > self.max_attempts {
            return self.max_delay;
        }
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&ChannelConfig::default())
    }
}

// ----------------------------------------------------------------------------
// 3. Wire Frames
// ----------------------------------------------------------------------------

/// Typed outbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Subscribe { types: Vec<String> },
    GetMetrics,
    /// `{type, ...payload}` for anything else
    Custom { frame_type: String, payload: JsonValue },
}

impl OutboundFrame {
    pub fn custom(frame_type: impl Into<String>, payload: JsonValue) -> Self {
        let frame_type = frame_type.into();
        match frame_type.as_str() {
            "get_metrics" if payload.is_null() => OutboundFrame::GetMetrics,
            _ => OutboundFrame::Custom { frame_type, payload },
        }
    }

    pub fn frame_type(&self) -> &str {
        match self {
            OutboundFrame::Subscribe { .. } => "subscribe",
            OutboundFrame::GetMetrics => "get_metrics",
            OutboundFrame::Custom { frame_type, .. } => frame_type,
        }
    }

    /// JSON text as sent on the wire
    pub fn encode(&self) -> String {
        match self {
            OutboundFrame::Subscribe { types } => json!({"type": "subscribe", "types": types}).to_string(),
            OutboundFrame::GetMetrics => json!({"type": "get_metrics"}).to_string(),
            OutboundFrame::Custom { frame_type, payload } => {
                let mut object = match payload {
                    JsonValue::Object(map) => map.clone(),
                    JsonValue::Null => Map::new(),
                    other => {
                        let mut map = Map::new();
                        map.insert("data".into(), other.clone());
                        map
                    }
                };
                object.insert("type".into(), JsonValue::String(frame_type.clone()));
                JsonValue::Object(object).to_string()
            }
        }
    }
}

/// An inbound text frame stamped with its receipt time
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub text: String,
    pub received_at: Timestamp,
}

impl InboundFrame {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            received_at: Timestamp::now(),
        }
    }
}

/// Sender half handed to `ChannelManager::on_message`
pub type FrameSink = mpsc::UnboundedSender<InboundFrame>;

// ----------------------------------------------------------------------------
// 4. Transport Seam
// ----------------------------------------------------------------------------

/// Opens duplex connections. WebSocket in production, scripted in tests.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> ChannelResult<Box<dyn Connection>>;
}

/// One open duplex connection
#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, text: String) -> ChannelResult<()>;

    /// Next inbound text frame. `None` after a normal close by the peer;
    /// `Some(Err(_))` on abnormal closure or transport error.
    async fn next_text(&mut self) -> Option<ChannelResult<String>>;

    async fn close(&mut self);
}

#[cfg(feature = "websocket")]
pub use self::websocket::WebSocketTransport;

#[cfg(feature = "websocket")]
mod websocket {
    use async_trait::async_trait;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
    use tracing::trace;

    use super::{Connection, Transport};
    use crate::error::{ChannelError, ChannelResult};

    /// WebSocket transport over `tokio-tungstenite`
    #[derive(Debug, Clone, Copy, Default)]
    pub struct WebSocketTransport;

    #[async_trait]
    impl Transport for WebSocketTransport {
        async fn connect(&self, url: &str) -> ChannelResult<Box<dyn Connection>> {
            let (stream, _response) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| ChannelError::connect_failed(url, e.to_string()))?;
            Ok(Box::new(WebSocketConnection { stream }))
        }
    }

    struct WebSocketConnection {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    #[async_trait]
    impl Connection for WebSocketConnection {
        async fn send_text(&mut self, text: String) -> ChannelResult<()> {
            self.stream
                .send(Message::Text(text))
                .await
                .map_err(|e| ChannelError::SendFailed { message: e.to_string() })
        }

        async fn next_text(&mut self) -> Option<ChannelResult<String>> {
            loop {
                match self.stream.next().await? {
                    Ok(Message::Text(text)) => return Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => return Some(Ok(text)),
                        Err(_) => trace!(target: "cerebro::channel", "Ignored non-UTF-8 binary frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        return match frame {
                            None => None,
                            Some(frame) if frame.code == CloseCode::Normal => None,
                            Some(frame) => Some(Err(ChannelError::Closed {
                                code: Some(u16::from(frame.code)),
                                reason: frame.reason.into_owned(),
                            })),
                        };
                    }
                    Ok(_) => {}
                    Err(e) => return Some(Err(ChannelError::Protocol { message: e.to_string() })),
                }
            }
        }

        async fn close(&mut self) {
            let _ = self.stream.close(None).await;
        }
    }
}

// ----------------------------------------------------------------------------
// 5. Channel Manager Handle
// ----------------------------------------------------------------------------

enum ChannelCommand {
    Send(OutboundFrame),
    Subscribe(Vec<String>),
    Reconnect,
}

/// Handle over the channel driver task.
pub struct ChannelManager {
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    outbound_capacity: usize,
    request_snapshot: bool,
    subscriptions: Vec<String>,
    sink: Option<FrameSink>,
    link: Option<DriverLink>,
    status_tx: watch::Sender<ConnectionStatus>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

struct DriverLink {
    commands: mpsc::UnboundedSender<ChannelCommand>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("policy", &self.policy)
            .field("subscriptions", &self.subscriptions)
            .field("status", &*self.status_rx.borrow())
            .field("running", &self.link.is_some())
            .finish()
    }
}

impl ChannelManager {
    pub fn new(config: &ChannelConfig, transport: Arc<dyn Transport>) -> Self {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::disconnected());
        Self {
            transport,
            policy: BackoffPolicy::from_config(config),
            outbound_capacity: config.outbound_buffer.max(1),
            request_snapshot: config.request_snapshot_on_connect,
            subscriptions: dedup(config.subscriptions.clone()),
            sink: None,
            link: None,
            status_tx,
            status_rx,
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register the single downstream consumer, replacing any previous one.
    /// Takes effect on the next `connect`.
    pub fn on_message(&mut self, sink: FrameSink) {
        if self.sink.is_some() {
            debug!(target: "cerebro::channel", "Replacing inbound frame consumer");
        }
        self.sink = Some(sink);
    }

    /// Start the driver. Returns immediately; progress is visible through
    /// `status()` / `watch_status()`.
    pub fn connect(&mut self, url: &str) -> ChannelResult<()> {
        let sink = self.sink.clone().ok_or(ChannelError::NoConsumer)?;
        if let Some(link) = self.link.take() {
            link.shutdown.cancel();
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let driver = ChannelDriver {
            url: url.to_string(),
            transport: Arc::clone(&self.transport),
            policy: self.policy,
            outbound_capacity: self.outbound_capacity,
            request_snapshot: self.request_snapshot,
            subscriptions: self.subscriptions.clone(),
            pending: VecDeque::new(),
            commands: command_rx,
            sink,
            status: self.status_tx.clone(),
            shutdown: shutdown.clone(),
            attempt: 0,
        };
        let task = tokio::spawn(driver.run());
        self.link = Some(DriverLink { commands, shutdown, task });
        info!(target: "cerebro::channel", url, "Channel driver started");
        Ok(())
    }

    /// Queue a typed outbound message. Dropped silently when no driver is
    /// running; callers must not assume delivery.
    pub fn send(&self, frame_type: &str, payload: JsonValue) {
        self.send_frame(OutboundFrame::custom(frame_type, payload));
    }

    pub fn send_frame(&self, frame: OutboundFrame) {
        match &self.link {
            Some(link) if link.commands.send(ChannelCommand::Send(frame)).is_ok() => {}
            _ => trace!(target: "cerebro::channel", "Dropped send while disconnected"),
        }
    }

    /// Add event types to the subscription set and push it to the server.
    pub fn subscribe(&mut self, types: Vec<String>) {
        let before = self.subscriptions.len();
        merge_subscriptions(&mut self.subscriptions, types.clone());
        if self.subscriptions.len() == before {
            return;
        }
        if let Some(link) = &self.link {
            let _ = link.commands.send(ChannelCommand::Subscribe(types));
        }
    }

    /// Leave a normal-close idle state (or cut a backoff wait short).
    pub fn reconnect(&self) {
        if let Some(link) = &self.link {
            let _ = link.commands.send(ChannelCommand::Reconnect);
        }
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.link.as_ref().is_some_and(|link| !link.task.is_finished())
    }

    /// Close the connection and stop retrying. Waits for the driver to exit.
    pub async fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown.cancel();
            if let Err(e) = link.task.await {
                warn!(target: "cerebro::channel", error = %e, "Channel driver ended abnormally");
            }
        }
        self.status_tx.send_modify(|status| {
            *status = ConnectionStatus {
                last_error: status.last_error.take(),
                ..ConnectionStatus::disconnected()
            };
        });
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        if let Some(link) = &self.link {
            link.shutdown.cancel();
        }
    }
}

fn merge_subscriptions(current: &mut Vec<String>, types: Vec<String>) {
    for t in types {
        if !current.contains(&t) {
            current.push(t);
        }
    }
}

fn dedup(types: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(types.len());
    merge_subscriptions(&mut out, types);
    out
}

// ----------------------------------------------------------------------------
// 6. Driver Task
// ----------------------------------------------------------------------------

enum SessionEnd {
    Shutdown,
    ClosedNormally,
    Failed(ChannelError),
}

enum WaitEnd {
    Elapsed,
    Reconnect,
    Shutdown,
}

struct ChannelDriver {
    url: String,
    transport: Arc<dyn Transport>,
    policy: BackoffPolicy,
    outbound_capacity: usize,
    request_snapshot: bool,
    subscriptions: Vec<String>,
    pending: VecDeque<OutboundFrame>,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    sink: FrameSink,
    status: watch::Sender<ConnectionStatus>,
    shutdown: CancellationToken,
    attempt: u32,
}

impl ChannelDriver {
    async fn run(mut self) {
        loop {
            self.publish(ConnectionState::Connecting, None, None);
            let connected = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.transport.connect(&self.url) => result,
            };

            let end = match connected {
                Ok(connection) => self.run_session(connection).await,
                Err(err) => SessionEnd::Failed(err),
            };

            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::ClosedNormally => {
                    info!(target: "cerebro::channel", url = %self.url, "Channel closed by peer");
                    self.pending.clear();
                    self.publish(ConnectionState::Disconnected, None, None);
                    match self.idle().await {
                        WaitEnd::Shutdown => break,
                        _ => self.attempt = 0,
                    }
                }
                SessionEnd::Failed(err) => {
                    self.attempt = self.attempt.saturating_add(1);
                    let delay = self.policy.delay_for_attempt(self.attempt);
                    if self.policy.is_exhausted(self.attempt) && self.attempt == self.policy.max_attempts {
                        error!(target: "cerebro::channel", attempts = self.attempt, url = %self.url,
                            "Reconnect attempts exhausted, retrying at capped interval");
                    } else {
                        warn!(target: "cerebro::channel", attempt = self.attempt, delay_ms = delay.as_millis() as u64,
                            error = %err, "Channel unavailable, backing off");
                    }
                    self.publish(ConnectionState::Backoff, Some(err.to_string()), Some(delay));
                    if let WaitEnd::Shutdown = self.backoff(delay).await {
                        break;
                    }
                }
            }
        }

        self.pending.clear();
        self.publish(ConnectionState::Disconnected, None, None);
        debug!(target: "cerebro::channel", "Channel driver stopped");
    }

    async fn run_session(&mut self, mut connection: Box<dyn Connection>) -> SessionEnd {
        self.attempt = 0;
        self.publish(ConnectionState::Connected, None, None);
        info!(target: "cerebro::channel", url = %self.url, subscriptions = ?self.subscriptions, "Channel connected");

        if let Err(err) = self.establish(connection.as_mut()).await {
            return SessionEnd::Failed(err);
        }

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    connection.close().await;
                    return SessionEnd::Shutdown;
                }
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(err) = self.handle_connected(connection.as_mut(), command).await {
                            return SessionEnd::Failed(err);
                        }
                    }
                    None => {
                        connection.close().await;
                        return SessionEnd::Shutdown;
                    }
                },
                frame = connection.next_text() => match frame {
                    Some(Ok(text)) => {
                        if self.sink.send(InboundFrame::new(text)).is_err() {
                            debug!(target: "cerebro::channel", "Frame consumer gone, closing channel");
                            connection.close().await;
                            return SessionEnd::Shutdown;
                        }
                    }
                    Some(Err(err)) => return SessionEnd::Failed(err),
                    None => return SessionEnd::ClosedNormally,
                },
            }
        }
    }

    /// Replay subscriptions, request a snapshot, then flush queued sends.
    async fn establish(&mut self, connection: &mut dyn Connection) -> ChannelResult<()> {
        if !self.subscriptions.is_empty() {
            let frame = OutboundFrame::Subscribe {
                types: self.subscriptions.clone(),
            };
            connection.send_text(frame.encode()).await?;
        }
        if self.request_snapshot {
            connection.send_text(OutboundFrame::GetMetrics.encode()).await?;
        }
        let flushed = self.pending.len();
        while let Some(frame) = self.pending.pop_front() {
            if let Err(err) = connection.send_text(frame.encode()).await {
                self.pending.push_front(frame);
                return Err(err);
            }
        }
        if flushed > 0 {
            debug!(target: "cerebro::channel", flushed, "Flushed queued sends");
        }
        Ok(())
    }

    async fn handle_connected(&mut self, connection: &mut dyn Connection, command: ChannelCommand) -> ChannelResult<()> {
        match command {
            ChannelCommand::Send(frame) => {
                if let Err(err) = connection.send_text(frame.encode()).await {
                    self.enqueue(frame);
                    return Err(err);
                }
            }
            ChannelCommand::Subscribe(types) => {
                merge_subscriptions(&mut self.subscriptions, types);
                let frame = OutboundFrame::Subscribe {
                    types: self.subscriptions.clone(),
                };
                connection.send_text(frame.encode()).await?;
            }
            ChannelCommand::Reconnect => {}
        }
        Ok(())
    }

    /// Wait out a backoff delay, buffering sends in the meantime.
    async fn backoff(&mut self, delay: Duration) -> WaitEnd {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return WaitEnd::Shutdown,
                _ = &mut sleep => return WaitEnd::Elapsed,
                command = self.commands.recv() => match command {
                    Some(ChannelCommand::Send(frame)) => self.enqueue(frame),
                    Some(ChannelCommand::Subscribe(types)) => merge_subscriptions(&mut self.subscriptions, types),
                    Some(ChannelCommand::Reconnect) => return WaitEnd::Reconnect,
                    None => return WaitEnd::Shutdown,
                },
            }
        }
    }

    /// After a normal close: sends are dropped until a reconnect request.
    async fn idle(&mut self) -> WaitEnd {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return WaitEnd::Shutdown,
                command = self.commands.recv() => match command {
                    Some(ChannelCommand::Send(frame)) => {
                        trace!(target: "cerebro::channel", frame_type = frame.frame_type(), "Dropped send while disconnected");
                    }
                    Some(ChannelCommand::Subscribe(types)) => merge_subscriptions(&mut self.subscriptions, types),
                    Some(ChannelCommand::Reconnect) => return WaitEnd::Reconnect,
                    None => return WaitEnd::Shutdown,
                },
            }
        }
    }

    fn enqueue(&mut self, frame: OutboundFrame) {
        if self.pending.len() >= self.outbound_capacity {
            if let Some(dropped) = self.pending.pop_front() {
                warn!(target: "cerebro::channel", frame_type = dropped.frame_type(),
                    capacity = self.outbound_capacity, "Outbound buffer full, dropped oldest frame");
            }
        }
        self.pending.push_back(frame);
    }

    fn publish(&self, state: ConnectionState, last_error: Option<String>, retry_in: Option<Duration>) {
        let attempt = self.attempt;
        let exhausted = self.policy.is_exhausted(attempt);
        self.status.send_modify(|status| {
            status.state = state;
            status.attempt = attempt;
            status.exhausted = exhausted;
            status.retry_in_ms = retry_in.map(|d| d.as_millis() as u64);
            status.since = Timestamp::now();
            match state {
                ConnectionState::Connected => status.last_error = None,
                _ => {
                    if last_error.is_some() {
                        status.last_error = last_error;
                    }
                }
            }
        });
    }
}
