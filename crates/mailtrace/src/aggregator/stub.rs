//! A canned-response backend for exercising the tracer and the
//! pipeline without a network.

use crate::aggregator::LogWindow;
use crate::error::MailtraceError;
use mailtrace_log_types::LogRecord;
use std::collections::HashMap;

#[derive(Default)]
pub(crate) struct StubAggregator {
    hosts: HashMap<String, Vec<LogRecord>>,
    /// Hosts that fail every query
    unreachable: Vec<String>,
    auth_denied: Vec<String>,
}

impl StubAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_records(&mut self, host: &str, records: Vec<LogRecord>) {
        self.hosts.entry(host.to_string()).or_default().extend(records);
    }

    pub fn mark_unreachable(&mut self, host: &str) {
        self.unreachable.push(host.to_string());
    }

    pub fn deny_auth(&mut self, host: &str) {
        self.auth_denied.push(host.to_string());
    }

    pub fn query(
        &self,
        host: &str,
        keywords: &[String],
        window: &LogWindow,
    ) -> Result<Vec<LogRecord>, MailtraceError> {
        if self.auth_denied.iter().any(|h| h == host) {
            return Err(MailtraceError::Auth {
                host: host.to_string(),
                message: "permission denied".to_string(),
            });
        }
        if self.unreachable.iter().any(|h| h == host) {
            return Err(MailtraceError::Aggregator {
                host: host.to_string(),
                message: "connection refused".to_string(),
            });
        }
        let records = self.hosts.get(host).ok_or_else(|| MailtraceError::Aggregator {
            host: host.to_string(),
            message: "unknown host".to_string(),
        })?;
        Ok(records
            .iter()
            .filter(|record| window.contains(record.timestamp))
            .filter(|record| {
                keywords.is_empty() || keywords.iter().any(|kw| raw_line_contains(record, kw))
            })
            .cloned()
            .collect())
    }
}

/// Match the way a real backend would: against the stored line, which
/// still carries the queue-id prefix.
fn raw_line_contains(record: &LogRecord, keyword: &str) -> bool {
    record.queue_id.as_deref() == Some(keyword) || record.message.contains(keyword)
}
