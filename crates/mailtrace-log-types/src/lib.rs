use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod extractor;
pub mod graph;
pub mod parser;

pub use graph::{MailGraph, MailHop};

/// One parsed mail log line.
///
/// The timestamp has already been resolved to an absolute instant using
/// the timezone offset configured for the log source, so records from
/// different hosts compare directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    /// The relay that emitted the line
    pub host: String,
    /// The daemon subprogram, eg `postfix/smtp`
    pub service: String,
    /// The queue id the daemon assigned to the message while it was
    /// resident on this host, when the line carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    /// The free-form payload after the service tag and queue id
    pub message: String,
}

impl std::fmt::Display for LogRecord {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{} {} {}: ",
            self.timestamp.to_rfc3339(),
            self.host,
            self.service
        )?;
        if let Some(queue_id) = &self.queue_id {
            write!(fmt, "{queue_id}: ")?;
        }
        write!(fmt, "{}", self.message)
    }
}
