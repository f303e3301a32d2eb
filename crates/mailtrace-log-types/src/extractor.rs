//! Classifies per-queue-id log records into mail events.
//!
//! The patterns here are the standard wording of mail-daemon logs:
//! `client=` on the receiving listener, `message-id=` when the cleanup
//! daemon records the header id, and `relay=`/`status=` on delivery
//! attempts.

use crate::LogRecord;
use regex::Regex;
use std::sync::LazyLock;

static CLIENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"client=(?P<host>[^\s,\[]+)\[(?P<ip>[^\]]*)\]").unwrap());
static MESSAGE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"message-id=<([^>]*)>").unwrap());
static BARE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bid=([\w.+=-]+@[\w.-]+)").unwrap());
static RELAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"relay=(?P<host>[^\s,\[]+)(?:\[(?P<ip>[^\]]*)\](?::(?P<port>\d+))?)?").unwrap()
});
static STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bstatus=(sent|bounced|deferred)\b").unwrap());
static QUEUED_AS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b250\b.*\bqueued as ([0-9A-F]+)").unwrap());
static FROM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"from=<([^>]*)>").unwrap());
static TO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"to=<([^>]*)>").unwrap());
static DELAY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bdelay=([\d.]+)").unwrap());
static DELAYS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bdelays=([\d.]+)/([\d.]+)/([\d.]+)/([\d.]+)").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    Sent,
    Bounced,
    Deferred,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Bounced => "bounced",
            Self::Deferred => "deferred",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.as_str())
    }
}

/// The `relay=host[ip]:port` target of a delivery attempt. Local
/// transports log without the address part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub host: String,
    pub ip: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MailEvent {
    /// The queue id first appears, usually carrying the header message id
    Receive {
        record: LogRecord,
        message_id: Option<String>,
    },
    /// The queue id was associated with a peer during the client handshake
    Connect { record: LogRecord, peer_host: String },
    /// The message was handed off to another relay. The peer's newly
    /// assigned queue id is present when the peer reported it in its
    /// 250 response.
    Forward {
        record: LogRecord,
        relay: RelayTarget,
        next_queue_id: Option<String>,
    },
    /// Terminal delivery, successful or otherwise
    Deliver {
        record: LogRecord,
        status: DeliveryStatus,
        relay: Option<RelayTarget>,
    },
    Other { record: LogRecord },
}

impl MailEvent {
    pub fn record(&self) -> &LogRecord {
        match self {
            Self::Receive { record, .. }
            | Self::Connect { record, .. }
            | Self::Forward { record, .. }
            | Self::Deliver { record, .. }
            | Self::Other { record } => record,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Receive { .. } => "receive",
            Self::Connect { .. } => "connect",
            Self::Forward { .. } => "forward",
            Self::Deliver { .. } => "deliver",
            Self::Other { .. } => "other",
        }
    }
}

/// Extract the header message id from a log payload.
///
/// Postfix logs `message-id=<id@domain>`; some MTAs log a bare
/// `id=local@domain` without brackets.
pub fn message_id(message: &str) -> Option<String> {
    if let Some(caps) = MESSAGE_ID_RE.captures(message) {
        return Some(caps[1].to_string());
    }
    BARE_ID_RE.captures(message).map(|caps| caps[1].to_string())
}

pub fn sender(message: &str) -> Option<String> {
    FROM_RE.captures(message).map(|caps| caps[1].to_string())
}

pub fn recipient(message: &str) -> Option<String> {
    TO_RE.captures(message).map(|caps| caps[1].to_string())
}

/// The `delay=`/`delays=` breakdown a delivery line carries, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DelayBreakdown {
    pub total: Option<f64>,
    pub before_qmgr: Option<f64>,
    pub in_qmgr: Option<f64>,
    pub conn_setup: Option<f64>,
    pub transmission: Option<f64>,
}

pub fn delays(message: &str) -> DelayBreakdown {
    let mut out = DelayBreakdown::default();
    if let Some(caps) = DELAY_RE.captures(message) {
        out.total = caps[1].parse().ok();
    }
    if let Some(caps) = DELAYS_RE.captures(message) {
        out.before_qmgr = caps[1].parse().ok();
        out.in_qmgr = caps[2].parse().ok();
        out.conn_setup = caps[3].parse().ok();
        out.transmission = caps[4].parse().ok();
    }
    out
}

/// Pattern-based classifier for log records that share a queue id.
pub struct EventExtractor {
    /// Relay names that terminate a mail flow on this fleet, in
    /// addition to the daemon's own `local` transport
    final_relays: Vec<String>,
}

impl Default for EventExtractor {
    fn default() -> Self {
        Self {
            final_relays: vec!["local".to_string()],
        }
    }
}

impl EventExtractor {
    pub fn new(mut final_relays: Vec<String>) -> Self {
        if !final_relays.iter().any(|r| r == "local") {
            final_relays.push("local".to_string());
        }
        Self { final_relays }
    }

    fn is_final(&self, relay_host: &str) -> bool {
        self.final_relays.iter().any(|r| r == relay_host)
    }

    pub fn classify(&self, record: &LogRecord) -> MailEvent {
        let msg = &record.message;

        if let Some(caps) = CLIENT_RE.captures(msg) {
            return MailEvent::Connect {
                record: record.clone(),
                peer_host: caps["host"].to_string(),
            };
        }

        if MESSAGE_ID_RE.is_match(msg) || BARE_ID_RE.is_match(msg) {
            return MailEvent::Receive {
                record: record.clone(),
                message_id: message_id(msg),
            };
        }

        let relay = RELAY_RE.captures(msg).map(|caps| RelayTarget {
            host: caps["host"].to_string(),
            ip: caps.name("ip").map(|m| m.as_str().to_string()),
            port: caps.name("port").and_then(|m| m.as_str().parse().ok()),
        });

        let status = STATUS_RE
            .captures(msg)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str());

        match status {
            Some("sent") => match relay {
                Some(relay) if !self.is_final(&relay.host) => MailEvent::Forward {
                    record: record.clone(),
                    next_queue_id: QUEUED_AS_RE.captures(msg).map(|caps| caps[1].to_string()),
                    relay,
                },
                relay => MailEvent::Deliver {
                    record: record.clone(),
                    status: DeliveryStatus::Sent,
                    relay,
                },
            },
            Some("bounced") => MailEvent::Deliver {
                record: record.clone(),
                status: DeliveryStatus::Bounced,
                relay,
            },
            Some(_) => MailEvent::Deliver {
                record: record.clone(),
                status: DeliveryStatus::Deferred,
                relay,
            },
            None => MailEvent::Other {
                record: record.clone(),
            },
        }
    }

    pub fn extract(&self, records: &[LogRecord]) -> Vec<MailEvent> {
        records.iter().map(|record| self.classify(record)).collect()
    }
}
