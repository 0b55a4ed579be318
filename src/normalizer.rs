// ============================================================================
// EVENT NORMALIZER
// ============================================================================
// Raw JSON frames (push) and REST bodies (poll) become one closed set of
// typed events. Malformed input is dropped here with a diagnostic and a
// counter; nothing past this boundary sees a parse error.
// ============================================================================

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use compact_str::CompactString;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;

use crate::alerts::{Alert, IncomingAlert};
use crate::error::{NormalizeError, NormalizeResult};
use crate::log_frame_dropped;
use crate::types::{AlertSource, PollResource, Severity, Timestamp};
use crate::workflows::WorkflowUpdate;

// ----------------------------------------------------------------------------
// 1. Event Types
// ----------------------------------------------------------------------------

/// Discriminators accepted on the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MetricsUpdate,
    Alert,
    WorkflowProgress,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MetricsUpdate => "metrics_update",
            EventKind::Alert => "alert",
            EventKind::WorkflowProgress => "workflow_progress",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = NormalizeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "metrics_update" => Ok(EventKind::MetricsUpdate),
            "alert" => Ok(EventKind::Alert),
            "workflow_progress" => Ok(EventKind::WorkflowProgress),
            other => Err(NormalizeError::UnknownType { kind: other.to_string() }),
        }
    }
}

/// A metric snapshot: every numeric value observed at one instant
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsUpdate {
    pub timestamp: Timestamp,
    pub values: Vec<(CompactString, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    MetricsUpdate(MetricsUpdate),
    Alert(IncomingAlert),
    WorkflowProgress(WorkflowUpdate),
}

impl NormalizedEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            NormalizedEvent::MetricsUpdate(_) => EventKind::MetricsUpdate,
            NormalizedEvent::Alert(_) => EventKind::Alert,
            NormalizedEvent::WorkflowProgress(_) => EventKind::WorkflowProgress,
        }
    }
}

// ----------------------------------------------------------------------------
// 2. Normalizer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NormalizerStats {
    pub accepted: u64,
    pub dropped_invalid_json: u64,
    pub dropped_unknown_type: u64,
    pub dropped_invalid_payload: u64,
    /// Non-numeric entries ignored inside metric snapshots
    pub skipped_metric_values: u64,
    /// Alerts that arrived without a severity or with an unrecognised one
    pub defaulted_severities: u64,
}

impl NormalizerStats {
    fn record_drop(&mut self, err: &NormalizeError) {
        match err {
            NormalizeError::InvalidJson { .. } => self.dropped_invalid_json += 1,
            NormalizeError::MissingType | NormalizeError::UnknownType { .. } => self.dropped_unknown_type += 1,
            NormalizeError::InvalidPayload { .. } | NormalizeError::MissingField { .. } => {
                self.dropped_invalid_payload += 1
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped_invalid_json + self.dropped_unknown_type + self.dropped_invalid_payload
    }
}

/// Stateless apart from its counters.
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    default_alert_source: AlertSource,
    stats: NormalizerStats,
}

impl Default for EventNormalizer {
    fn default() -> Self {
        Self::new(AlertSource::Performance)
    }
}

impl EventNormalizer {
    /// `default_alert_source` is used for push alerts that do not name one.
    pub fn new(default_alert_source: AlertSource) -> Self {
        Self {
            default_alert_source,
            stats: NormalizerStats::default(),
        }
    }

    /// Normalize one push frame. `None` means the frame was dropped.
    pub fn normalize(&mut self, raw: &str, received_at: Timestamp) -> Option<NormalizedEvent> {
        match self.parse(raw, received_at) {
            Ok(event) => {
                self.stats.accepted += 1;
                trace!(target: "cerebro::normalizer", kind = %event.kind(), "Frame accepted");
                Some(event)
            }
            Err(err) => {
                self.stats.record_drop(&err);
                log_frame_dropped!(err, bytes = raw.len());
                None
            }
        }
    }

    fn parse(&mut self, raw: &str, received_at: Timestamp) -> NormalizeResult<NormalizedEvent> {
        let value: JsonValue =
            serde_json::from_str(raw).map_err(|e| NormalizeError::InvalidJson { message: e.to_string() })?;
        let frame = value
            .as_object()
            .ok_or_else(|| NormalizeError::invalid_payload("frame", "frame is not a JSON object"))?;
        let kind: EventKind = frame
            .get("type")
            .and_then(JsonValue::as_str)
            .ok_or(NormalizeError::MissingType)?
            .parse()?;

        let timestamp = frame.get("timestamp").and_then(parse_timestamp).unwrap_or(received_at);
        let data = frame.get("data").unwrap_or(&JsonValue::Null);

        match kind {
            EventKind::MetricsUpdate => {
                let (update, skipped) = metrics_from_data(data, timestamp)?;
                self.stats.skipped_metric_values += skipped;
                Ok(NormalizedEvent::MetricsUpdate(update))
            }
            EventKind::Alert => {
                let source = match data.get("source").and_then(JsonValue::as_str) {
                    Some(name) => name.parse().unwrap_or(self.default_alert_source),
                    None => self.default_alert_source,
                };
                let parsed = alert_from_data(data, source, timestamp)?;
                if parsed.defaulted_severity {
                    self.stats.defaulted_severities += 1;
                }
                Ok(NormalizedEvent::Alert(parsed.incoming))
            }
            EventKind::WorkflowProgress => workflow_from_data(data, timestamp).map(NormalizedEvent::WorkflowProgress),
        }
    }

    /// Normalize a polled REST body. Records that fail individually are
    /// dropped; the rest still flow.
    pub fn normalize_poll(&mut self, resource: PollResource, body: &JsonValue, received_at: Timestamp) -> Vec<NormalizedEvent> {
        match resource {
            PollResource::MetricsSnapshot => {
                let payload = match body.get("data") {
                    Some(inner) if inner.is_object() => inner,
                    _ => body,
                };
                let timestamp = body
                    .get("timestamp")
                    .or_else(|| payload.get("timestamp"))
                    .and_then(parse_timestamp)
                    .unwrap_or(received_at);
                match metrics_from_data(payload, timestamp) {
                    Ok((update, skipped)) => {
                        self.stats.accepted += 1;
                        self.stats.skipped_metric_values += skipped;
                        vec![NormalizedEvent::MetricsUpdate(update)]
                    }
                    Err(err) => {
                        self.stats.record_drop(&err);
                        log_frame_dropped!(err, resource = %resource);
                        Vec::new()
                    }
                }
            }
            PollResource::Alerts(source) => {
                let Some(records) = alert_records(body) else {
                    let err = NormalizeError::invalid_payload("alerts", "expected an array or an object with 'alerts'");
                    self.stats.record_drop(&err);
                    log_frame_dropped!(err, resource = %resource);
                    return Vec::new();
                };
                let mut events = Vec::with_capacity(records.len());
                for record in records {
                    match alert_from_data(record, source, received_at) {
                        Ok(parsed) => {
                            self.stats.accepted += 1;
                            if parsed.defaulted_severity {
                                self.stats.defaulted_severities += 1;
                            }
                            events.push(NormalizedEvent::Alert(parsed.incoming));
                        }
                        Err(err) => {
                            self.stats.record_drop(&err);
                            log_frame_dropped!(err, resource = %resource);
                        }
                    }
                }
                events
            }
        }
    }

    pub fn stats(&self) -> &NormalizerStats {
        &self.stats
    }

    pub fn default_alert_source(&self) -> AlertSource {
        self.default_alert_source
    }
}

// ----------------------------------------------------------------------------
// 3. Payload Parsers
// ----------------------------------------------------------------------------

/// Timestamp from an ISO-8601 string or an epoch number.
pub fn parse_timestamp(value: &JsonValue) -> Option<Timestamp> {
    match value {
        JsonValue::String(text) => Timestamp::parse(text),
        JsonValue::Number(n) => n.as_f64().and_then(Timestamp::from_epoch_number),
        _ => None,
    }
}

fn metrics_from_data(data: &JsonValue, timestamp: Timestamp) -> NormalizeResult<(MetricsUpdate, u64)> {
    let map = data
        .as_object()
        .ok_or_else(|| NormalizeError::invalid_payload("metrics_update", "data is not an object"))?;

    let mut values = Vec::with_capacity(map.len());
    let mut skipped = 0;
    for (name, value) in map {
        if name == "timestamp" {
            continue;
        }
        match value.as_f64() {
            Some(v) => values.push((CompactString::from(name.as_str()), v)),
            None => {
                skipped += 1;
                trace!(target: "cerebro::normalizer", metric = %name, "Skipped non-numeric metric value");
            }
        }
    }

    if values.is_empty() {
        return Err(NormalizeError::invalid_payload("metrics_update", "no numeric metric values"));
    }
    Ok((MetricsUpdate { timestamp, values }, skipped))
}

struct ParsedAlert {
    incoming: IncomingAlert,
    defaulted_severity: bool,
}

fn alert_records(body: &JsonValue) -> Option<&Vec<JsonValue>> {
    match body {
        JsonValue::Array(items) => Some(items),
        JsonValue::Object(map) => ["alerts", "data", "items"]
            .iter()
            .find_map(|key| map.get(*key).and_then(JsonValue::as_array)),
        _ => None,
    }
}

fn string_field<'a>(map: &'a Map<String, JsonValue>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| map.get(*key).and_then(JsonValue::as_str))
        .filter(|s| !s.trim().is_empty())
}

fn id_field(map: &Map<String, JsonValue>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key) {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => Some(s.clone()),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Deterministic id for alerts that arrive without one, so repeated
/// deliveries of the same alert still deduplicate. Built from record
/// content only; receipt time never enters it.
pub fn synthesize_alert_id(source: AlertSource, severity: Severity, message: &str, created_at: Option<Timestamp>) -> String {
    let stamp = created_at.map_or_else(String::new, |t| t.as_millis().to_string());
    let material = format!("{}|{}|{}|{}", source.as_str(), severity.as_str(), message, stamp);
    format!("{}-{:016x}", source.as_str(), xxh3_64(material.as_bytes()))
}

fn alert_from_data(data: &JsonValue, source: AlertSource, fallback_time: Timestamp) -> NormalizeResult<ParsedAlert> {
    let map = data
        .as_object()
        .ok_or_else(|| NormalizeError::invalid_payload("alert", "data is not an object"))?;

    let alert_type = string_field(map, &["alert_type", "type", "rule_name"]).map(str::to_string);
    let message = match string_field(map, &["message", "description", "title"]) {
        Some(text) => text.to_string(),
        None => match &alert_type {
            Some(kind) => kind.replace('_', " "),
            None => return Err(NormalizeError::missing_field("alert", "message")),
        },
    };

    let (severity, defaulted_severity) = match map.get("severity").and_then(JsonValue::as_str) {
        Some(text) => match Severity::parse_lenient(text) {
            Some(severity) => (severity, false),
            None => {
                debug!(target: "cerebro::normalizer", severity = text, "Unrecognised severity, using info");
                (Severity::Info, true)
            }
        },
        None => (Severity::Info, true),
    };

    let stated_at = ["created_at", "timestamp", "triggered_at"]
        .iter()
        .find_map(|key| map.get(*key).and_then(parse_timestamp));
    let created_at = stated_at.unwrap_or(fallback_time);

    let status = map.get("status").and_then(JsonValue::as_str);
    let acknowledged =
        map.get("acknowledged").and_then(JsonValue::as_bool).unwrap_or(false) || status == Some("acknowledged");
    let reopen = map.get("reopen").and_then(JsonValue::as_bool).unwrap_or(false) || status == Some("reopened");

    let id = id_field(map, &["alert_id", "id"]).unwrap_or_else(|| synthesize_alert_id(source, severity, &message, stated_at));

    let alert = Alert {
        id,
        source,
        severity,
        message,
        alert_type,
        created_at,
        acknowledged,
        acknowledged_by: string_field(map, &["acknowledged_by"]).map(str::to_string),
        metric_value: map.get("metric_value").and_then(JsonValue::as_f64),
        threshold: map.get("threshold").and_then(JsonValue::as_f64),
    };

    Ok(ParsedAlert {
        incoming: IncomingAlert { alert, reopen },
        defaulted_severity,
    })
}

fn workflow_from_data(data: &JsonValue, timestamp: Timestamp) -> NormalizeResult<WorkflowUpdate> {
    let map = data
        .as_object()
        .ok_or_else(|| NormalizeError::invalid_payload("workflow_progress", "data is not an object"))?;

    let workflow_id =
        id_field(map, &["workflow_id", "id"]).ok_or_else(|| NormalizeError::missing_field("workflow_progress", "workflow_id"))?;

    let mut fields = map.clone();
    for key in ["workflow_id", "id", "status", "progress", "current_step"] {
        fields.remove(key);
    }

    Ok(WorkflowUpdate {
        workflow_id,
        status: map.get("status").and_then(JsonValue::as_str).map(str::to_string),
        progress: map.get("progress").and_then(JsonValue::as_f64),
        current_step: map.get("current_step").and_then(JsonValue::as_str).map(str::to_string),
        fields,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    const NOW: Timestamp = Timestamp::from_millis(1_700_000_000_000);

    fn normalizer() -> EventNormalizer {
        EventNormalizer::new(AlertSource::Performance)
    }

    #[test]
    fn test_metrics_update_with_timestamp() {
        let mut n = normalizer();
        let event = n
            .normalize(r#"{"type":"metrics_update","data":{"cpu":42,"mem":71.5,"host":"db"},"timestamp":"2024-03-01T12:00:00Z"}"#, NOW)
            .unwrap();

        let NormalizedEvent::MetricsUpdate(update) = event else {
            panic!("expected metrics update");
        };
        assert_eq!(update.timestamp, Timestamp::parse("2024-03-01T12:00:00Z").unwrap());
        assert_eq!(update.values, vec![(CompactString::from("cpu"), 42.0), (CompactString::from("mem"), 71.5)]);
        assert_eq!(n.stats().skipped_metric_values, 1);
    }

    #[test]
    fn test_metrics_update_falls_back_to_receipt_time() {
        let mut n = normalizer();
        let Some(NormalizedEvent::MetricsUpdate(update)) = n.normalize(r#"{"type":"metrics_update","data":{"cpu":1}}"#, NOW) else {
            panic!("expected metrics update");
        };
        assert_eq!(update.timestamp, NOW);
    }

    #[test_case("not json at all", "invalid_json" ; "garbage")]
    #[test_case(r#"{"data":{}}"#, "missing_type" ; "no type")]
    #[test_case(r#"{"type":"heartbeat"}"#, "unknown_type" ; "unknown type")]
    #[test_case(r#"{"type":"metrics_update","data":{"host":"x"}}"#, "invalid_payload" ; "no numbers")]
    #[test_case(r#"{"type":"workflow_progress","data":{"status":"running"}}"#, "missing_field" ; "no workflow id")]
    #[test_case(r#"[1,2,3]"#, "invalid_payload" ; "array frame")]
    fn test_malformed_frames_dropped(raw: &str, reason: &str) {
        let mut n = normalizer();
        assert_eq!(n.normalize(raw, NOW), None);
        assert_eq!(n.stats().dropped(), 1);
        assert_eq!(n.parse(raw, NOW).unwrap_err().reason(), reason);
    }

    #[test]
    fn test_alert_defaults_and_synthesized_id() {
        let mut n = normalizer();
        let raw = r#"{"type":"alert","data":{"alert_type":"high_cpu","message":"CPU at 97%","metric_value":97.0,"threshold":90}}"#;
        let Some(NormalizedEvent::Alert(first)) = n.normalize(raw, NOW) else {
            panic!("expected alert");
        };
        let later = NOW.add_duration(std::time::Duration::from_secs(30));
        let Some(NormalizedEvent::Alert(second)) = n.normalize(raw, later) else {
            panic!("expected alert");
        };

        assert_eq!(first.alert.severity, Severity::Info);
        assert_eq!(first.alert.source, AlertSource::Performance);
        assert_eq!(first.alert.created_at, NOW);
        assert_eq!(first.alert.threshold, Some(90.0));
        assert!(first.alert.id.starts_with("performance-"));
        assert_eq!(first.alert.id, second.alert.id);
        assert_eq!(second.alert.created_at, later);
        assert_eq!(n.stats().defaulted_severities, 2);
    }

    #[test]
    fn test_synthesized_id_tracks_content_not_receipt() {
        let disk = synthesize_alert_id(AlertSource::Admin, Severity::High, "disk nearly full", None);
        assert_eq!(disk, synthesize_alert_id(AlertSource::Admin, Severity::High, "disk nearly full", None));
        assert_ne!(disk, synthesize_alert_id(AlertSource::Compliance, Severity::High, "disk nearly full", None));
        assert_ne!(disk, synthesize_alert_id(AlertSource::Admin, Severity::Critical, "disk nearly full", None));
        assert_ne!(
            disk,
            synthesize_alert_id(AlertSource::Admin, Severity::High, "disk nearly full", Some(Timestamp::from_secs(5)))
        );
    }

    #[test]
    fn test_alert_fields_and_markers() {
        let mut n = normalizer();
        let raw = r#"{"type":"alert","data":{"alert_id":"A1","source":"admin","severity":"warning","message":"disk","status":"reopened"}}"#;
        let Some(NormalizedEvent::Alert(incoming)) = n.normalize(raw, NOW) else {
            panic!("expected alert");
        };
        assert_eq!(incoming.alert.id, "A1");
        assert_eq!(incoming.alert.source, AlertSource::Admin);
        assert_eq!(incoming.alert.severity, Severity::Medium);
        assert!(incoming.reopen);
        assert!(!incoming.alert.acknowledged);
    }

    #[test]
    fn test_alert_without_message_or_type_dropped() {
        let mut n = normalizer();
        assert_eq!(n.normalize(r#"{"type":"alert","data":{"severity":"high"}}"#, NOW), None);
        assert_eq!(n.stats().dropped_invalid_payload, 1);
    }

    #[test]
    fn test_workflow_progress_fields() {
        let mut n = normalizer();
        let raw = r#"{"type":"workflow_progress","data":{"workflow_id":"assessment_9","status":"running","progress":40,"current_step":"scan","target":"db-01"}}"#;
        let Some(NormalizedEvent::WorkflowProgress(update)) = n.normalize(raw, NOW) else {
            panic!("expected workflow progress");
        };
        assert_eq!(update.workflow_id, "assessment_9");
        assert_eq!(update.progress, Some(40.0));
        assert_eq!(update.fields.len(), 1);
        assert_eq!(update.fields.get("target"), Some(&json!("db-01")));
    }

    #[test]
    fn test_poll_metrics_snapshot_shapes() {
        let mut n = normalizer();
        let flat = n.normalize_poll(PollResource::MetricsSnapshot, &json!({"cpu": 10, "timestamp": 1_700_000_100}), NOW);
        let wrapped = n.normalize_poll(PollResource::MetricsSnapshot, &json!({"data": {"cpu": 11}}), NOW);

        let [NormalizedEvent::MetricsUpdate(flat)] = flat.as_slice() else {
            panic!("expected one update");
        };
        assert_eq!(flat.timestamp, Timestamp::from_secs(1_700_000_100));
        assert_eq!(flat.values.len(), 1);
        let [NormalizedEvent::MetricsUpdate(wrapped)] = wrapped.as_slice() else {
            panic!("expected one update");
        };
        assert_eq!(wrapped.timestamp, NOW);
    }

    #[test]
    fn test_poll_alert_listing_uses_endpoint_source() {
        let mut n = normalizer();
        let body = json!({"alerts": [
            {"id": 7, "severity": "critical", "message": "policy violated", "source": "performance"},
            {"severity": "low"},
            {"id": "c-2", "severity": "low", "message": "audit gap", "acknowledged": true}
        ]});
        let events = n.normalize_poll(PollResource::Alerts(AlertSource::Compliance), &body, NOW);

        assert_eq!(events.len(), 2);
        for event in &events {
            let NormalizedEvent::Alert(incoming) = event else {
                panic!("expected alerts only");
            };
            assert_eq!(incoming.alert.source, AlertSource::Compliance);
        }
        assert_eq!(n.stats().dropped_invalid_payload, 1);
        assert!(n.normalize_poll(PollResource::Alerts(AlertSource::Admin), &json!("nope"), NOW).is_empty());
    }
}
