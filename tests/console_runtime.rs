//! End-to-end behaviour of the console runtime with scripted collaborators.

mod common;

use std::time::Duration;

use pretty_assertions::assert_eq;
use quanta::Clock;
use serde_json::json;

use cerebro_console::staleness::Freshness;
use cerebro_console::{AlertSource, Console, ConnectionState, PollResource, Severity};

use common::*;

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_and_replays_subscriptions() {
    let transport = ScriptedTransport::new();
    let first = transport.accept();
    transport.refuse();
    transport.refuse();
    let _second = transport.accept();

    let handle = Console::builder(console_config())
        .with_transport(transport.clone())
        .with_actions(RecordingActions::succeeding())
        .with_clock(Clock::mock().0)
        .start()
        .unwrap();

    handle.wait_for(|s| s.connection.is_connected()).await.unwrap();
    handle.subscribe(vec!["deployment".into()]).await.unwrap();
    eventually(|| transport.sent().len() == 3).await;

    first.send(ServerEvent::Fail(1006)).unwrap();
    let t = transport.clone();
    handle
        .wait_for(move |s| s.connection.is_connected() && t.attempts().len() == 4)
        .await
        .unwrap();

    let attempts = transport.attempts();
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(gaps, vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]);

    let initial = r#"{"type":"subscribe","types":["metrics_update","alert","workflow_progress"]}"#;
    let extended = r#"{"type":"subscribe","types":["metrics_update","alert","workflow_progress","deployment"]}"#;
    let snapshot_request = r#"{"type":"get_metrics"}"#;
    assert_eq!(
        transport.sent(),
        vec![
            initial.to_string(),
            snapshot_request.to_string(),
            extended.to_string(),
            extended.to_string(),
            snapshot_request.to_string(),
        ]
    );
    assert_eq!(handle.snapshot().connection.attempt, 0);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_show_disconnected_while_retrying() {
    let transport = ScriptedTransport::new();
    let mut config = console_config();
    config.channel.max_attempts = 3;

    let handle = Console::builder(config)
        .with_transport(transport.clone())
        .with_actions(RecordingActions::succeeding())
        .start()
        .unwrap();

    let snapshot = handle.wait_for(|s| s.connection.exhausted).await.unwrap();
    assert_eq!(snapshot.connection.indicator(), ConnectionState::Disconnected);

    // Retries continue at the capped interval
    let t = transport.clone();
    handle.wait_for(move |_| t.attempts().len() >= 6).await.unwrap();
    let attempts = transport.attempts();
    assert_eq!(attempts[5] - attempts[4], Duration::from_secs(30));
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn poll_tick_skipped_while_push_keeps_key_fresh() {
    let (clock, mock) = Clock::mock();
    let transport = ScriptedTransport::new();
    let server = transport.accept();
    let fetcher = CountingFetcher::new(json!({"cpu": 10.0}));

    let handle = Console::builder(console_config())
        .with_transport(transport.clone())
        .with_actions(RecordingActions::succeeding())
        .with_clock(clock)
        .with_poll(PollResource::MetricsSnapshot, Duration::from_secs(10), Duration::from_secs(30), fetcher.clone())
        .start()
        .unwrap();

    handle.wait_for(|s| s.polls[0].fetches == 1).await.unwrap();

    // Polled data has gone stale; a push refreshes it
    mock.increment(Duration::from_secs(40));
    handle.wait_for(|s| s.connection.is_connected()).await.unwrap();
    server.send(metrics_frame("cpu", 20.0, 1_700_000_000)).unwrap();
    // One accepted from the poll, one from the push
    handle.wait_for(|s| s.normalizer.accepted == 2).await.unwrap();
    mock.increment(Duration::from_secs(2));

    let snapshot = handle.wait_for(|s| s.polls[0].skipped_fresh == 1).await.unwrap();
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(snapshot.freshness("metrics_snapshot"), Freshness::Fresh);

    // Without further pushes the next tick fetches again
    mock.increment(Duration::from_secs(40));
    handle.wait_for(|s| s.polls[0].fetches == 2).await.unwrap();
    assert_eq!(fetcher.calls(), 2);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn manual_refresh_fetches_immediately() {
    let fetcher = CountingFetcher::new(json!([{"id": "P1", "severity": "low", "message": "slow query"}]));
    let mut config = console_config();
    config.channel.enabled = false;

    let handle = Console::builder(config)
        .with_actions(RecordingActions::succeeding())
        .with_clock(Clock::mock().0)
        .with_poll(PollResource::Alerts(AlertSource::Performance), Duration::from_secs(60), Duration::from_secs(60), fetcher.clone())
        .start()
        .unwrap();

    handle.wait_for(|s| s.polls[0].fetches == 1).await.unwrap();
    let start = tokio::time::Instant::now();
    assert!(handle.refresh("alerts:performance").await.unwrap());
    handle.wait_for(|s| s.polls[0].fetches == 2).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(!handle.refresh("alerts:billing").await.unwrap());

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.alerts.len(), 1);
    assert_eq!(snapshot.connection.state, ConnectionState::Disconnected);
    handle.close().await.unwrap();
}

#[tokio::test]
async fn metric_window_keeps_latest_points() {
    let transport = ScriptedTransport::new();
    let server = transport.accept();
    let mut config = console_config();
    config.metrics.max_data_points = 2;

    let handle = Console::builder(config)
        .with_transport(transport.clone())
        .with_actions(RecordingActions::succeeding())
        .start()
        .unwrap();

    for (t, cpu) in [(0, 42.0), (1, 55.0), (2, 60.0)] {
        server.send(metrics_frame("cpu", cpu, t)).unwrap();
    }
    let snapshot = handle.wait_for(|s| s.normalizer.accepted == 3).await.unwrap();
    let points: Vec<(i64, f64)> = snapshot
        .series("cpu")
        .unwrap()
        .points()
        .map(|p| (p.timestamp.as_secs(), p.value))
        .collect();
    assert_eq!(points, vec![(1, 55.0), (2, 60.0)]);
    handle.close().await.unwrap();
}

#[tokio::test]
async fn alert_merge_across_sources_and_sticky_acknowledge() {
    let transport = ScriptedTransport::new();
    let server = transport.accept();
    let handle = Console::builder(console_config())
        .with_transport(transport.clone())
        .with_actions(RecordingActions::succeeding())
        .start()
        .unwrap();

    server
        .send(alert_frame(json!({"alert_id": "A1", "severity": "high", "message": "cpu", "source": "performance"})))
        .unwrap();
    server
        .send(alert_frame(json!({"alert_id": "A1", "severity": "medium", "message": "cpu", "source": "admin"})))
        .unwrap();
    let snapshot = handle.wait_for(|s| s.normalizer.accepted == 2).await.unwrap();
    let merged = snapshot.alert("A1").unwrap();
    assert_eq!(merged.severity, Severity::Medium);
    assert_eq!(merged.source, AlertSource::Admin);
    assert!(!merged.acknowledged);
    assert_eq!(snapshot.alerts.len(), 1);

    handle.acknowledge("A1", "ops").await.unwrap();
    server
        .send(alert_frame(json!({"alert_id": "A1", "severity": "high", "message": "cpu again", "source": "admin"})))
        .unwrap();
    let snapshot = handle.wait_for(|s| s.normalizer.accepted == 3).await.unwrap();
    let alert = snapshot.alert("A1").unwrap();
    assert!(alert.acknowledged);
    assert_eq!(alert.message, "cpu again");
    assert_eq!(snapshot.unread_alerts, 0);

    server
        .send(alert_frame(json!({"alert_id": "A1", "severity": "high", "message": "back", "source": "admin", "status": "reopened"})))
        .unwrap();
    let snapshot = handle.wait_for(|s| s.normalizer.accepted == 4).await.unwrap();
    assert!(!snapshot.alert("A1").unwrap().acknowledged);
    handle.close().await.unwrap();
}

#[tokio::test]
async fn failed_acknowledge_notifies_without_rollback() {
    let transport = ScriptedTransport::new();
    let server = transport.accept();
    let actions = RecordingActions::failing();
    let handle = Console::builder(console_config())
        .with_transport(transport.clone())
        .with_actions(actions.clone())
        .start()
        .unwrap();

    server
        .send(alert_frame(json!({"alert_id": "X9", "severity": "low", "message": "disk 80%", "source": "compliance"})))
        .unwrap();
    handle.wait_for(|s| s.alert("X9").is_some()).await.unwrap();

    handle.acknowledge("X9", "alice").await.unwrap();
    let snapshot = handle.wait_for(|s| !s.notifications.is_empty()).await.unwrap();

    let alert = snapshot.alert("X9").unwrap();
    assert!(alert.acknowledged);
    assert_eq!(alert.acknowledged_by.as_deref(), Some("alice"));
    assert_eq!(snapshot.notifications[0].alert_id(), "X9");
    assert!(snapshot.errors.total >= 1);
    assert_eq!(
        actions.acknowledged.lock().unwrap().clone(),
        vec![(AlertSource::Compliance, "X9".to_string(), "alice".to_string())]
    );
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn completed_assessment_workflow_refetches_keyed_polls() {
    let transport = ScriptedTransport::new();
    let server = transport.accept();
    let assessment = CountingFetcher::new(json!({"id": 12, "status": "running"}));
    let reports = CountingFetcher::new(json!([]));

    let handle = Console::builder(console_config())
        .with_transport(transport.clone())
        .with_actions(RecordingActions::succeeding())
        .with_clock(Clock::mock().0)
        .with_keyed_poll("assessment_12", Duration::from_secs(10), Duration::from_secs(300), assessment.clone())
        .with_keyed_poll("reports_12", Duration::from_secs(10), Duration::from_secs(300), reports.clone())
        .start()
        .unwrap();

    let snapshot = handle.wait_for(|s| s.polls.iter().all(|p| p.fetches == 1)).await.unwrap();
    assert_eq!(snapshot.freshness("assessment_12"), Freshness::Fresh);
    assert_eq!(snapshot.resource("assessment_12").unwrap()["status"], "running");

    // The mock clock never moves, so only invalidation can make these stale
    handle.wait_for(|s| s.polls.iter().all(|p| p.skipped_fresh >= 1)).await.unwrap();
    assert_eq!((assessment.calls(), reports.calls()), (1, 1));

    for frame in [
        r#"{"type":"workflow_progress","data":{"workflow_id":"assessment_12","status":"running","progress":30,"current_step":"scan"}}"#,
        r#"{"type":"workflow_progress","data":{"workflow_id":"assessment_12","status":"completed","progress":100}}"#,
    ] {
        server.send(ServerEvent::Frame(frame.into())).unwrap();
    }
    let snapshot = handle.wait_for(|s| s.normalizer.accepted == 2).await.unwrap();
    let workflow = snapshot.workflow("assessment_12").unwrap();
    assert_eq!(workflow.status.as_deref(), Some("completed"));
    assert_eq!(workflow.current_step.as_deref(), Some("scan"));
    assert_eq!(workflow.progress, Some(100.0));
    assert_eq!(snapshot.freshness("assessment_12"), Freshness::Unknown);

    handle.wait_for(|s| s.polls.iter().all(|p| p.fetches == 2)).await.unwrap();
    assert_eq!((assessment.calls(), reports.calls()), (2, 2));

    // Explicit transition clears the refetched keys again
    let removed = handle
        .domain_transition(cerebro_console::DomainTransition::assessment_completed("12"))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    handle.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn close_cancels_polls_and_channel() {
    let transport = ScriptedTransport::new();
    let _server = transport.accept();
    let fetcher = CountingFetcher::new(json!({"cpu": 1.0}));

    let handle = Console::builder(console_config())
        .with_transport(transport.clone())
        .with_actions(RecordingActions::succeeding())
        .with_clock(Clock::mock().0)
        .with_poll(PollResource::MetricsSnapshot, Duration::from_secs(5), Duration::from_secs(1), fetcher.clone())
        .start()
        .unwrap();

    handle.wait_for(|s| s.connection.is_connected() && s.polls[0].fetches == 1).await.unwrap();
    let snapshots = handle.subscribe_snapshots();
    handle.close().await.unwrap();

    assert_eq!(transport.closed(), 1);
    let last = snapshots.borrow().clone();
    assert_eq!(last.connection.state, ConnectionState::Disconnected);
    assert!(last.polls.is_empty());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(transport.attempts().len(), 1);
}
