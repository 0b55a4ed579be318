//! Scripted collaborators for driving the console runtime in tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::time::Instant;

use cerebro_console::channel::{Connection, Transport};
use cerebro_console::error::{ChannelError, ChannelResult, FetchError, FetchResult};
use cerebro_console::poller::Fetcher;
use cerebro_console::rest::{AlertActions, AlertRule};
use cerebro_console::{AlertSource, ConsoleConfig};

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

/// What the fake server does next on an accepted connection
#[derive(Debug)]
pub enum ServerEvent {
    Frame(String),
    /// Abnormal close with this code
    Fail(u16),
    CloseNormally,
}

enum Script {
    Refuse,
    Accept(mpsc::UnboundedReceiver<ServerEvent>),
}

/// Connections are accepted or refused in script order; once the script
/// runs out every attempt is refused.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    attempts: Mutex<Vec<Instant>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn accept(&self) -> mpsc::UnboundedSender<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.scripts.lock().unwrap().push_back(Script::Accept(rx));
        tx
    }

    pub fn refuse(&self) {
        self.scripts.lock().unwrap().push_back(Script::Refuse);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&self, url: &str) -> ChannelResult<Box<dyn Connection>> {
        self.attempts.lock().unwrap().push(Instant::now());
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Accept(events)) => Ok(Box::new(ScriptedConnection {
                events,
                sent: Arc::clone(&self.sent),
                closed: Arc::clone(&self.closed),
            })),
            _ => Err(ChannelError::connect_failed(url, "connection refused")),
        }
    }
}

struct ScriptedConnection {
    events: mpsc::UnboundedReceiver<ServerEvent>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn send_text(&mut self, text: String) -> ChannelResult<()> {
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn next_text(&mut self) -> Option<ChannelResult<String>> {
        match self.events.recv().await {
            Some(ServerEvent::Frame(text)) => Some(Ok(text)),
            Some(ServerEvent::Fail(code)) => Some(Err(ChannelError::Closed {
                code: Some(code),
                reason: "scripted failure".into(),
            })),
            Some(ServerEvent::CloseNormally) => None,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Fetchers & Actions
// ----------------------------------------------------------------------------

/// Returns `body` on every fetch and counts calls
pub struct CountingFetcher {
    pub calls: AtomicU32,
    body: JsonValue,
}

impl CountingFetcher {
    pub fn new(body: JsonValue) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            body,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for CountingFetcher {
    async fn fetch(&self) -> FetchResult<JsonValue> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.body.clone())
    }
}

#[derive(Default)]
pub struct RecordingActions {
    pub fail: AtomicBool,
    pub acknowledged: Mutex<Vec<(AlertSource, String, String)>>,
}

impl RecordingActions {
    pub fn failing() -> Arc<Self> {
        let actions = Self::default();
        actions.fail.store(true, Ordering::SeqCst);
        Arc::new(actions)
    }

    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl AlertActions for RecordingActions {
    async fn acknowledge(&self, source: AlertSource, alert_id: &str, by: &str) -> FetchResult<()> {
        self.acknowledged
            .lock()
            .unwrap()
            .push((source, alert_id.to_string(), by.to_string()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(FetchError::http(503, "Service Unavailable"));
        }
        Ok(())
    }

    async fn create_rule(&self, rule: &AlertRule) -> FetchResult<JsonValue> {
        Ok(serde_json::json!({ "name": rule.name }))
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Channel on, REST polling from config off
pub fn console_config() -> ConsoleConfig {
    let mut config = ConsoleConfig::default();
    config.channel.url = "ws://scripted.test/ws/performance".into();
    config.polling.enabled = false;
    config
}

/// Yield until `condition` holds, without advancing time
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

pub fn metrics_frame(name: &str, value: f64, timestamp: i64) -> ServerEvent {
    ServerEvent::Frame(format!(
        r#"{{"type":"metrics_update","data":{{"{name}":{value}}},"timestamp":{timestamp}}}"#
    ))
}

pub fn alert_frame(data: JsonValue) -> ServerEvent {
    ServerEvent::Frame(serde_json::json!({ "type": "alert", "data": data }).to_string())
}
