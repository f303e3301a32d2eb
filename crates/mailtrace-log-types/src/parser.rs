//! Parsers for the syslog wire formats commonly produced by mail relays.
//!
//! Two concrete shapes are supported, plus an auto-detecting front:
//!
//! * RFC 5424: an ISO 8601 timestamp with explicit timezone, then the
//!   hostname and the remaining header fields. Most modern forwarders
//!   emit a collapsed variant where the appname carries a `[pid]:`
//!   suffix and the header ends there; both forms are accepted.
//! * RFC 3164 (BSD): `Mmm DD HH:MM:SS host service[pid]: message`.
//!   The stamp has no year, so the caller supplies a reference instant
//!   (normally the upper bound of the search window) that provides the
//!   year and arbitrates the end-of-year wrap.
//!
//! Malformed lines produce an error that the caller is expected to
//! count and discard; bulk log streams routinely contain noise that is
//! not mail related.

use crate::LogRecord;
use chrono::{DateTime, Datelike, FixedOffset, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("log line is empty")]
    Empty,
    #[error("log line is truncated")]
    Truncated,
    #[error("unparseable timestamp {0:?}")]
    Timestamp(String),
    #[error("line matches neither rfc5424 nor rfc3164")]
    UnknownFormat,
}

/// Which wire format a log source produces.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum SyslogFormat {
    Rfc5424,
    Rfc3164,
    /// Inspect the leading character of each line: a digit (or a `<pri>`
    /// header) selects RFC 5424, a letter selects RFC 3164.
    #[default]
    Auto,
}

static RFC3164_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<mon>[A-Z][a-z]{2}) {1,2}(?P<day>\d{1,2}) (?P<time>\d{2}:\d{2}:\d{2}) (?P<host>\S+) (?P<tag>[^ :\[]+)(?:\[\d+\])?: (?P<msg>.*)$",
    )
    .unwrap()
});

static QUEUE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9A-F]+):\s+(.*)$").unwrap());

/// Split the leading queue-id token off a message payload.
///
/// Mail daemons prefix lines about a queued message with the queue id,
/// eg `postfix/smtp[1234]: ABC123DEF: to=<u@v>, ...`. The token is one
/// or more uppercase hex characters followed by a colon; anything else
/// leaves the payload untouched with no queue id.
pub fn split_queue_id(message: &str) -> (Option<String>, String) {
    match QUEUE_ID_RE.captures(message) {
        Some(caps) => (Some(caps[1].to_string()), caps[2].to_string()),
        None => (None, message.to_string()),
    }
}

/// Returns true if `s` has the shape of a daemon queue id.
pub fn is_queue_id(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}

/// Parses raw log lines into [LogRecord]s.
pub struct LineParser {
    format: SyslogFormat,
    tz: FixedOffset,
    /// Supplies the year for RFC 3164 stamps and arbitrates the
    /// wrap-backward when a stamped time would land past it.
    reference: DateTime<Utc>,
}

impl LineParser {
    pub fn new(format: SyslogFormat, tz: FixedOffset, reference: DateTime<Utc>) -> Self {
        Self {
            format,
            tz,
            reference,
        }
    }

    pub fn parse(&self, line: &str) -> Result<LogRecord, ParseError> {
        let line = line.trim_end();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }
        match self.format {
            SyslogFormat::Rfc5424 => self.parse_rfc5424(line),
            SyslogFormat::Rfc3164 => self.parse_rfc3164(line),
            SyslogFormat::Auto => {
                let first = line.as_bytes()[0];
                if first == b'<' || first.is_ascii_digit() {
                    self.parse_rfc5424(line)
                } else {
                    self.parse_rfc3164(line)
                }
            }
        }
    }

    fn parse_rfc5424(&self, line: &str) -> Result<LogRecord, ParseError> {
        let mut rest = line;
        // optional <pri> header and protocol version
        if let Some(stripped) = rest.strip_prefix('<') {
            let close = stripped.find('>').ok_or(ParseError::Truncated)?;
            rest = stripped[close + 1..].trim_start();
            rest = rest.strip_prefix("1 ").unwrap_or(rest);
        }

        let mut fields = rest.splitn(3, ' ');
        let stamp = fields.next().ok_or(ParseError::Truncated)?;
        let host = fields.next().ok_or(ParseError::Truncated)?;
        let tail = fields.next().ok_or(ParseError::Truncated)?;

        let timestamp = self.parse_iso_stamp(stamp)?;
        let (service, payload) = split_header_tail(tail)?;
        let (queue_id, message) = split_queue_id(&payload);

        Ok(LogRecord {
            timestamp,
            host: host.to_string(),
            service,
            queue_id,
            message,
        })
    }

    fn parse_rfc3164(&self, line: &str) -> Result<LogRecord, ParseError> {
        let caps = RFC3164_RE
            .captures(line)
            .ok_or(ParseError::UnknownFormat)?;

        let year = self.reference.with_timezone(&self.tz).year();
        let timestamp = self.bsd_stamp(&caps["mon"], &caps["day"], &caps["time"], year)?;
        // no year on the wire; wrap backward rather than stamping a
        // line that postdates the search window
        let timestamp = if timestamp > self.reference {
            self.bsd_stamp(&caps["mon"], &caps["day"], &caps["time"], year - 1)?
        } else {
            timestamp
        };

        let (queue_id, message) = split_queue_id(&caps["msg"]);

        Ok(LogRecord {
            timestamp,
            host: caps["host"].to_string(),
            service: caps["tag"].to_string(),
            queue_id,
            message,
        })
    }

    fn bsd_stamp(
        &self,
        mon: &str,
        day: &str,
        time: &str,
        year: i32,
    ) -> Result<DateTime<Utc>, ParseError> {
        let stamp = format!("{year} {mon} {day} {time}");
        let naive = NaiveDateTime::parse_from_str(&stamp, "%Y %b %d %H:%M:%S")
            .map_err(|_| ParseError::Timestamp(stamp.clone()))?;
        self.resolve_local(naive, &stamp)
    }

    fn parse_iso_stamp(&self, stamp: &str) -> Result<DateTime<Utc>, ParseError> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(stamp) {
            return Ok(dt.with_timezone(&Utc));
        }
        // no explicit zone: resolve with the configured offset
        let naive = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S"))
            .map_err(|_| ParseError::Timestamp(stamp.to_string()))?;
        self.resolve_local(naive, stamp)
    }

    fn resolve_local(
        &self,
        naive: NaiveDateTime,
        stamp: &str,
    ) -> Result<DateTime<Utc>, ParseError> {
        self.tz
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| ParseError::Timestamp(stamp.to_string()))
    }
}

/// Split the header remainder of an RFC 5424 line into (service, payload).
///
/// Accepts both the collapsed `app[pid]: payload` form and the full
/// `app procid msgid structured-data payload` field sequence.
fn split_header_tail(tail: &str) -> Result<(String, String), ParseError> {
    let (first, rest) = tail.split_once(' ').ok_or(ParseError::Truncated)?;

    if let Some(tag) = first.strip_suffix(':') {
        let service = tag.split('[').next().unwrap_or(tag).to_string();
        return Ok((service, rest.to_string()));
    }

    // full field sequence: procid, msgid, then structured data
    let mut it = rest.splitn(3, ' ');
    let _procid = it.next().ok_or(ParseError::Truncated)?;
    let _msgid = it.next().ok_or(ParseError::Truncated)?;
    let mut remainder = it.next().ok_or(ParseError::Truncated)?;

    if let Some(after) = remainder.strip_prefix("- ") {
        remainder = after;
    } else {
        while remainder.starts_with('[') {
            let close = remainder.find(']').ok_or(ParseError::Truncated)?;
            remainder = remainder[close + 1..].trim_start();
        }
    }

    Ok((first.to_string(), remainder.to_string()))
}
