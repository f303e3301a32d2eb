//! The uniform contract over the two log backends.
//!
//! `query` fetches every record on one host that matches the keyword
//! set within a time window, normalized to absolute instants and
//! sorted ascending. Keyword matching happens backend-side against the
//! raw stored line; this module enforces the window clamp and the sort
//! so both backends behave identically.

use crate::config::{Config, Method};
use crate::error::MailtraceError;
use chrono::{DateTime, Duration, Utc};
use mailtrace_log_types::LogRecord;
use std::sync::Arc;

pub mod index;
pub mod shell;
#[cfg(test)]
pub(crate) mod stub;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl LogWindow {
    pub fn around(center: DateTime<Utc>, radius: Duration) -> Self {
        Self {
            start: center - radius,
            end: center + radius,
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }
}

pub enum Aggregator {
    Shell(shell::ShellAggregator),
    Index(index::IndexAggregator),
    #[cfg(test)]
    Stub(stub::StubAggregator),
}

impl Aggregator {
    pub fn from_config(config: &Arc<Config>) -> Result<Self, MailtraceError> {
        match config.method {
            Method::Ssh => Ok(Self::Shell(shell::ShellAggregator::new(config.clone())?)),
            Method::Opensearch => Ok(Self::Index(index::IndexAggregator::new(config.clone())?)),
        }
    }

    /// Fetch the records on `host` matching `keywords` within `window`.
    ///
    /// An empty keyword list matches every mail record in the window.
    /// The result is fully materialized, clamped to the window, and
    /// sorted ascending by timestamp with ties kept in input order.
    pub async fn query(
        &self,
        host: &str,
        keywords: &[String],
        window: &LogWindow,
    ) -> Result<Vec<LogRecord>, MailtraceError> {
        let mut records = match self {
            Self::Shell(backend) => backend.query(host, keywords, window).await?,
            Self::Index(backend) => backend.query(host, keywords, window).await?,
            #[cfg(test)]
            Self::Stub(backend) => backend.query(host, keywords, window)?,
        };
        records.retain(|record| window.contains(record.timestamp));
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }
}
