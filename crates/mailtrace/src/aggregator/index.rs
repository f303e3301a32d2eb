//! Queries an OpenSearch index for mail log records.
//!
//! The `(host, keywords, window)` tuple is translated into a bool
//! query over the configured field mapping: the facility must be
//! `mail`, the host field must match exactly, every keyword must
//! appear as a phrase in the message field, and the timestamp range is
//! evaluated in the configured timezone. Pages are fetched until the
//! result set is exhausted or the hard cap is reached.

use crate::aggregator::LogWindow;
use crate::config::{parse_tz_offset, Config, OpenSearchConfig};
use crate::error::MailtraceError;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use mailtrace_log_types::parser::split_queue_id;
use mailtrace_log_types::LogRecord;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PAGE_SIZE: usize = 1000;
const RESULT_CAP: usize = 10000;

pub struct IndexAggregator {
    config: Arc<Config>,
    client: reqwest::Client,
    search_url: String,
}

impl IndexAggregator {
    pub fn new(config: Arc<Config>) -> Result<Self, MailtraceError> {
        let os = config.opensearch_config.as_ref().ok_or_else(|| {
            MailtraceError::config("method = \"opensearch\" requires an [opensearch_config] section")
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(os.timeout))
            .danger_accept_invalid_certs(!os.verify_certs)
            .build()
            .map_err(|err| MailtraceError::config(format!("building http client: {err}")))?;
        let scheme = if os.use_ssl { "https" } else { "http" };
        let search_url = format!("{scheme}://{}:{}/{}/_search", os.host, os.port, os.index);
        Ok(Self {
            config,
            client,
            search_url,
        })
    }

    fn os(&self) -> Result<&OpenSearchConfig, MailtraceError> {
        self.config.opensearch_config.as_ref().ok_or_else(|| {
            MailtraceError::config("method = \"opensearch\" requires an [opensearch_config] section")
        })
    }

    pub async fn query(
        &self,
        host: &str,
        keywords: &[String],
        window: &LogWindow,
    ) -> Result<Vec<LogRecord>, MailtraceError> {
        let os = self.os()?;
        let tz = parse_tz_offset(&os.time_zone)?;

        let mut records = Vec::new();
        let mut dropped = 0usize;
        let mut from = 0usize;
        loop {
            let body = build_query(os, host, keywords, window, from, tz);
            debug!("search {} from={from}", self.search_url);
            let hits = self.fetch_page(os, &body).await?;
            let page_len = hits.len();

            for hit in &hits {
                match parse_hit(os, hit, tz) {
                    Some(record) => records.push(record),
                    None => dropped += 1,
                }
            }

            from += page_len;
            if page_len < PAGE_SIZE {
                break;
            }
            if from >= RESULT_CAP {
                warn!(
                    "result cap of {RESULT_CAP} reached while querying {host}; \
                     narrowing the window or keywords will avoid the truncation"
                );
                break;
            }
        }
        if dropped > 0 {
            debug!("dropped {dropped} malformed hits for {host}");
        }
        Ok(records)
    }

    async fn fetch_page(
        &self,
        os: &OpenSearchConfig,
        body: &Value,
    ) -> Result<Vec<Value>, MailtraceError> {
        let mut request = self.client.post(&self.search_url).json(body);
        if let Some(username) = &os.username {
            request = request.basic_auth(username, os.password.as_ref());
        }
        let response = request
            .send()
            .await
            .map_err(|err| MailtraceError::Aggregator {
                host: os.host.clone(),
                message: format!("search request failed: {err}"),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(MailtraceError::Auth {
                host: os.host.clone(),
                message: format!("search returned {status}"),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MailtraceError::Aggregator {
                host: os.host.clone(),
                message: format!("search returned {status}: {body}"),
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| MailtraceError::Aggregator {
                host: os.host.clone(),
                message: format!("decoding search response: {err}"),
            })?;
        Ok(payload["hits"]["hits"]
            .as_array()
            .cloned()
            .unwrap_or_default())
    }
}

/// `{ kind: { field: value } }` with a runtime field name.
fn clause(kind: &str, field: &str, value: Value) -> Value {
    let inner: Map<String, Value> = [(field.to_string(), value)].into_iter().collect();
    let outer: Map<String, Value> = [(kind.to_string(), Value::Object(inner))]
        .into_iter()
        .collect();
    Value::Object(outer)
}

fn build_query(
    os: &OpenSearchConfig,
    host: &str,
    keywords: &[String],
    window: &LogWindow,
    from: usize,
    tz: chrono::FixedOffset,
) -> Value {
    let mut must = vec![
        clause("match", &os.mapping.facility, json!("mail")),
        clause("term", &os.mapping.hostname, json!(host)),
    ];
    for keyword in keywords {
        must.push(clause("match_phrase", &os.mapping.message, json!(keyword)));
    }

    let start = window
        .start
        .with_timezone(&tz)
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string();
    let end = window
        .end
        .with_timezone(&tz)
        .format("%Y-%m-%dT%H:%M:%S")
        .to_string();
    must.push(clause(
        "range",
        &os.mapping.timestamp,
        json!({ "gte": start, "lte": end, "time_zone": os.time_zone }),
    ));

    json!({
        "query": { "bool": { "must": must } },
        "sort": [ clause_value(&os.mapping.timestamp, json!({ "order": "asc" })) ],
        "size": PAGE_SIZE,
        "from": from,
    })
}

fn clause_value(field: &str, value: Value) -> Value {
    let map: Map<String, Value> = [(field.to_string(), value)].into_iter().collect();
    Value::Object(map)
}

/// Walk a dotted field path into the source document. Tries the flat
/// literal key first since some pipelines index dotted names verbatim.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(value) = doc.get(path) {
        return Some(value);
    }
    let mut cursor = doc;
    for part in path.split('.') {
        cursor = cursor.get(part)?;
    }
    Some(cursor)
}

fn parse_hit(os: &OpenSearchConfig, hit: &Value, tz: chrono::FixedOffset) -> Option<LogRecord> {
    let source = hit.get("_source")?;

    let stamp = lookup(source, &os.mapping.timestamp)?.as_str()?;
    let timestamp = parse_stamp(stamp, tz)?;
    let host = lookup(source, &os.mapping.hostname)?.as_str()?.to_string();
    let service = lookup(source, &os.mapping.service)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let raw_message = lookup(source, &os.mapping.message)?.as_str()?;
    let (queue_id, message) = split_queue_id(raw_message);

    Some(LogRecord {
        timestamp,
        host,
        service,
        queue_id,
        message,
    })
}

fn parse_stamp(stamp: &str, tz: chrono::FixedOffset) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(stamp) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    tz.from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}
