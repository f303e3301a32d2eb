//! Builds and ships OpenTelemetry traces for buffered mail flows.
//!
//! Span identity is derived from the mail identifiers rather than
//! generated: the trace id is the leading 128 bits of a SHA-256 over
//! the message id, and each span id is the leading 64 bits of a
//! SHA-256 over the queue id. Hops that surface in different query
//! rounds therefore coalesce into the same trace on the collector, and
//! restarts do not fork traces.
//!
//! One span is emitted per `(host, queue_id)` pair, grouped into one
//! resource per host so every relay shows up as its own service.

use crate::continuous::TraceState;
use crate::error::MailtraceError;
use mailtrace_log_types::extractor::{self, EventExtractor, MailEvent};
use mailtrace_log_types::LogRecord;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::any_value::Value as AnyValueKind;
use opentelemetry_proto::tonic::common::v1::{AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::span::SpanKind;
use opentelemetry_proto::tonic::trace::v1::status::StatusCode;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span, Status};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

/// Spans never report a zero duration; short hops are stretched to
/// one microsecond.
const MIN_SPAN_DURATION_NANOS: u64 = 1_000;

pub fn trace_id_for(message_id: &str) -> [u8; 16] {
    let digest = Sha256::digest(message_id.as_bytes());
    let mut id = [0u8; 16];
    id.copy_from_slice(&digest[..16]);
    id
}

pub fn span_id_for(queue_id: &str) -> [u8; 8] {
    let digest = Sha256::digest(queue_id.as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    id
}

pub struct OtlpExporter {
    client: TraceServiceClient<tonic::transport::Channel>,
}

impl OtlpExporter {
    pub async fn connect(endpoint: &str) -> Result<Self, MailtraceError> {
        let endpoint = if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("http://{endpoint}")
        };
        let client = TraceServiceClient::connect(endpoint.clone())
            .await
            .map_err(|err| MailtraceError::Export(format!("connecting to {endpoint}: {err}")))?;
        Ok(Self { client })
    }

    pub async fn export(
        &mut self,
        state: &TraceState,
        extractor: &EventExtractor,
    ) -> Result<(), MailtraceError> {
        let request = build_export_request(state, extractor);
        if request.resource_spans.is_empty() {
            debug!("nothing to export for {}", state.message_id);
            return Ok(());
        }
        self.client
            .export(request)
            .await
            .map_err(|status| MailtraceError::Export(status.to_string()))?;
        Ok(())
    }
}

struct HopSpan<'a> {
    host: String,
    queue_id: String,
    records: Vec<&'a LogRecord>,
}

/// Assemble the per-(host, queue id) spans for one buffered mail flow.
pub(crate) fn build_export_request(
    state: &TraceState,
    extractor: &EventExtractor,
) -> ExportTraceServiceRequest {
    let mut order: Vec<(String, String)> = Vec::new();
    let mut grouped: HashMap<(String, String), Vec<&LogRecord>> = HashMap::new();
    for record in &state.records {
        let Some(queue_id) = &record.queue_id else {
            continue;
        };
        let key = (record.host.clone(), queue_id.clone());
        if !grouped.contains_key(&key) {
            order.push(key.clone());
        }
        grouped.entry(key).or_default().push(record);
    }

    let groups: Vec<HopSpan> = order
        .into_iter()
        .map(|(host, queue_id)| {
            let records = grouped.remove(&(host.clone(), queue_id.clone())).unwrap_or_default();
            HopSpan {
                host,
                queue_id,
                records,
            }
        })
        .collect();

    // parent the receiving hop under the forwarding one when the
    // forward names the receiving host and the receiver references the
    // sender's queue id
    let mut parents: Vec<Option<usize>> = vec![None; groups.len()];
    for (from_idx, from) in groups.iter().enumerate() {
        for record in &from.records {
            let MailEvent::Forward {
                relay,
                next_queue_id,
                ..
            } = extractor.classify(record)
            else {
                continue;
            };
            for (to_idx, to) in groups.iter().enumerate() {
                if to_idx == from_idx || parents[to_idx].is_some() {
                    continue;
                }
                if !host_matches(&to.host, &relay.host) {
                    continue;
                }
                let renamed = next_queue_id.as_deref() == Some(to.queue_id.as_str());
                let referenced = to
                    .records
                    .iter()
                    .any(|r| r.message.contains(&from.queue_id));
                if renamed || referenced {
                    parents[to_idx] = Some(from_idx);
                }
            }
        }
    }

    let trace_id = trace_id_for(&state.message_id).to_vec();
    let mut spans_by_host: HashMap<String, Vec<Span>> = HashMap::new();
    let mut host_order: Vec<String> = Vec::new();

    for (idx, group) in groups.iter().enumerate() {
        // records arrive across rounds, so arrival order is not time order
        let Some(earliest) = group.records.iter().map(|r| r.timestamp).min() else {
            continue;
        };
        let Some(latest) = group.records.iter().map(|r| r.timestamp).max() else {
            continue;
        };
        let start = earliest.timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
        let mut end = latest.timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
        if end < start + MIN_SPAN_DURATION_NANOS {
            end = start + MIN_SPAN_DURATION_NANOS;
        }

        let span = Span {
            trace_id: trace_id.clone(),
            span_id: span_id_for(&group.queue_id).to_vec(),
            parent_span_id: parents[idx]
                .map(|p| span_id_for(&groups[p].queue_id).to_vec())
                .unwrap_or_default(),
            name: group.host.clone(),
            kind: SpanKind::Internal as i32,
            start_time_unix_nano: start,
            end_time_unix_nano: end,
            attributes: span_attributes(state, group, extractor),
            status: span_status(group, extractor),
            ..Default::default()
        };

        if !spans_by_host.contains_key(&group.host) {
            host_order.push(group.host.clone());
        }
        spans_by_host.entry(group.host.clone()).or_default().push(span);
    }

    let resource_spans = host_order
        .into_iter()
        .map(|host| {
            let spans = spans_by_host.remove(&host).unwrap_or_default();
            ResourceSpans {
                resource: Some(Resource {
                    attributes: vec![kv_str("service.name", &host)],
                    ..Default::default()
                }),
                scope_spans: vec![ScopeSpans {
                    scope: Some(InstrumentationScope {
                        name: "mailtrace".to_string(),
                        ..Default::default()
                    }),
                    spans,
                    ..Default::default()
                }],
                ..Default::default()
            }
        })
        .collect();

    ExportTraceServiceRequest { resource_spans }
}

/// Exact match, or one side is the bare form of the other.
fn host_matches(host: &str, relay: &str) -> bool {
    host == relay
        || host.strip_prefix(relay).is_some_and(|rest| rest.starts_with('.'))
        || relay.strip_prefix(host).is_some_and(|rest| rest.starts_with('.'))
}

fn span_attributes(
    state: &TraceState,
    group: &HopSpan,
    extractor: &EventExtractor,
) -> Vec<KeyValue> {
    let mut attributes = vec![
        kv_str("host.name", &group.host),
        kv_str("mail.queue_id", &group.queue_id),
        kv_str("mail.message_id", &state.message_id),
    ];
    if let Some(first) = group.records.first() {
        attributes.push(kv_str("mail.service", &first.service));
    }

    let mut counts: HashMap<&'static str, i64> = HashMap::new();
    let mut final_status = None;
    let mut sender = None;
    let mut recipient = None;
    let mut delay = extractor::DelayBreakdown::default();
    for record in &group.records {
        let event = extractor.classify(record);
        *counts.entry(event.kind_name()).or_default() += 1;
        if let MailEvent::Deliver { status, .. } = &event {
            final_status = Some(*status);
        }
        sender = sender.or_else(|| extractor::sender(&record.message));
        recipient = recipient.or_else(|| extractor::recipient(&record.message));
        let parsed = extractor::delays(&record.message);
        if parsed.total.is_some() {
            delay = parsed;
        }
    }

    for kind in ["receive", "connect", "forward", "deliver", "other"] {
        if let Some(count) = counts.get(kind) {
            attributes.push(kv_int(&format!("mail.events.{kind}"), *count));
        }
    }
    if let Some(status) = final_status {
        attributes.push(kv_str("mail.status", status.as_str()));
    }
    if let Some(sender) = sender {
        attributes.push(kv_str("mail.from", &sender));
    }
    if let Some(recipient) = recipient {
        attributes.push(kv_str("mail.to", &recipient));
    }
    if let Some(total) = delay.total {
        attributes.push(kv_f64("mail.delay", total));
    }
    if let Some(v) = delay.before_qmgr {
        attributes.push(kv_f64("mail.delay_before_qmgr", v));
    }
    if let Some(v) = delay.in_qmgr {
        attributes.push(kv_f64("mail.delay_in_qmgr", v));
    }
    if let Some(v) = delay.conn_setup {
        attributes.push(kv_f64("mail.delay_conn_setup", v));
    }
    if let Some(v) = delay.transmission {
        attributes.push(kv_f64("mail.delay_transmission", v));
    }
    attributes
}

fn span_status(group: &HopSpan, extractor: &EventExtractor) -> Option<Status> {
    let mut last = None;
    for record in &group.records {
        if let MailEvent::Deliver { status, .. } = extractor.classify(record) {
            last = Some(status);
        }
    }
    last.map(|status| match status {
        extractor::DeliveryStatus::Sent => Status {
            code: StatusCode::Ok as i32,
            ..Default::default()
        },
        extractor::DeliveryStatus::Bounced => Status {
            code: StatusCode::Error as i32,
            message: "bounced".to_string(),
        },
        extractor::DeliveryStatus::Deferred => Status {
            code: StatusCode::Error as i32,
            message: "deferred".to_string(),
        },
    })
}

fn kv_str(key: &str, value: &str) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(AnyValueKind::StringValue(value.to_string())),
        }),
    }
}

fn kv_int(key: &str, value: i64) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(AnyValueKind::IntValue(value)),
        }),
    }
}

fn kv_f64(key: &str, value: f64) -> KeyValue {
    KeyValue {
        key: key.to_string(),
        value: Some(AnyValue {
            value: Some(AnyValueKind::DoubleValue(value)),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mailtrace_log_types::LogRecord;

    fn record(host: &str, minute: u32, queue_id: &str, message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc.with_ymd_and_hms(2025, 2, 1, 10, minute, 0).unwrap(),
            host: host.to_string(),
            service: "postfix/smtp".to_string(),
            queue_id: Some(queue_id.to_string()),
            message: message.to_string(),
        }
    }

    fn two_hop_state() -> TraceState {
        let mut state = TraceState::new(
            "x@y".to_string(),
            Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap(),
        );
        state.push(record("mx.example.com", 0, "ABC123", "message-id=<x@y>, from=<a@b>"));
        state.push(record(
            "mx.example.com",
            1,
            "ABC123",
            "to=<u@v>, relay=mailer.example.com[10.0.0.2]:25, delay=3.1, \
             delays=1.0/0.1/1.0/1.0, status=sent (250 2.0.0 Ok: queued as DEF456)",
        ));
        state.push(record(
            "mailer.example.com",
            2,
            "DEF456",
            "client=mx.example.com[10.0.0.1]",
        ));
        state.push(record(
            "mailer.example.com",
            3,
            "DEF456",
            "to=<u@v>, relay=local, status=sent (delivered to maildir)",
        ));
        state
    }

    #[test]
    fn ids_are_stable_across_calls() {
        assert_eq!(trace_id_for("x@y"), trace_id_for("x@y"));
        assert_ne!(trace_id_for("x@y"), trace_id_for("x@z"));
        assert_eq!(span_id_for("ABC123"), span_id_for("ABC123"));
        assert_ne!(span_id_for("ABC123"), span_id_for("ABC124"));

        // the ids are the leading hash bytes, nothing else mixed in
        let digest = Sha256::digest("x@y".as_bytes());
        assert_eq!(trace_id_for("x@y"), digest[..16]);
    }

    #[test]
    fn one_span_per_host_queue_pair_with_forward_parenting() {
        let state = two_hop_state();
        let request = build_export_request(&state, &EventExtractor::default());

        // one resource per host, named after it
        assert_eq!(request.resource_spans.len(), 2);
        let spans: Vec<&Span> = request
            .resource_spans
            .iter()
            .flat_map(|rs| rs.scope_spans.iter())
            .flat_map(|ss| ss.spans.iter())
            .collect();
        assert_eq!(spans.len(), 2);

        let trace_id = trace_id_for("x@y").to_vec();
        for span in &spans {
            assert_eq!(span.trace_id, trace_id);
        }

        let root = spans
            .iter()
            .find(|s| s.parent_span_id.is_empty())
            .expect("one root span");
        assert_eq!(root.name, "mx.example.com");
        assert_eq!(root.span_id, span_id_for("ABC123").to_vec());

        let child = spans
            .iter()
            .find(|s| !s.parent_span_id.is_empty())
            .expect("one child span");
        assert_eq!(child.name, "mailer.example.com");
        assert_eq!(child.span_id, span_id_for("DEF456").to_vec());
        assert_eq!(child.parent_span_id, span_id_for("ABC123").to_vec());
    }

    #[test]
    fn span_timing_covers_the_records_with_a_floor() {
        let state = two_hop_state();
        let request = build_export_request(&state, &EventExtractor::default());
        for span in request
            .resource_spans
            .iter()
            .flat_map(|rs| rs.scope_spans.iter())
            .flat_map(|ss| ss.spans.iter())
        {
            assert!(span.end_time_unix_nano >= span.start_time_unix_nano + MIN_SPAN_DURATION_NANOS);
        }
    }

    #[test]
    fn attributes_carry_status_and_delays() {
        let state = two_hop_state();
        let request = build_export_request(&state, &EventExtractor::default());
        let mx = &request.resource_spans[0].scope_spans[0].spans[0];

        let get = |key: &str| {
            mx.attributes
                .iter()
                .find(|kv| kv.key == key)
                .and_then(|kv| kv.value.as_ref())
                .and_then(|v| v.value.as_ref())
                .cloned()
        };
        assert_eq!(
            get("mail.queue_id"),
            Some(AnyValueKind::StringValue("ABC123".to_string()))
        );
        assert_eq!(
            get("mail.from"),
            Some(AnyValueKind::StringValue("a@b".to_string()))
        );
        assert_eq!(get("mail.delay"), Some(AnyValueKind::DoubleValue(3.1)));
        assert_eq!(get("mail.events.forward"), Some(AnyValueKind::IntValue(1)));
    }

    #[test]
    fn records_without_queue_ids_produce_no_spans() {
        let mut state = TraceState::new(
            "x@y".to_string(),
            Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap(),
        );
        state.push(LogRecord {
            timestamp: Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap(),
            host: "mx.example.com".to_string(),
            service: "postfix/smtpd".to_string(),
            queue_id: None,
            message: "connect from unknown[1.2.3.4]".to_string(),
        });
        let request = build_export_request(&state, &EventExtractor::default());
        assert!(request.resource_spans.is_empty());
    }
}
