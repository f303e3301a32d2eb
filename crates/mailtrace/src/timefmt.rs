use crate::error::MailtraceError;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};

/// Parse a `YYYY-MM-DD HH:MM:SS` wall clock, interpreted as UTC.
pub fn parse_when(s: &str) -> Result<DateTime<Utc>, MailtraceError> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S").map_err(|_| {
        MailtraceError::config(format!(
            "time {s:?} should be in the form YYYY-MM-DD HH:MM:SS"
        ))
    })?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Parse a `<int><unit>` span with units s, m, h, or d.
pub fn parse_time_range(s: &str) -> Result<Duration, MailtraceError> {
    let err = || {
        MailtraceError::config(format!(
            "time range {s:?} should be <int><unit> with unit s, m, h, or d"
        ))
    };
    let s = s.trim();
    if s.len() < 2 {
        return Err(err());
    }
    let (value, unit) = s.split_at(s.len() - 1);
    let value: i64 = value.parse().map_err(|_| err())?;
    match unit {
        "s" => Ok(Duration::seconds(value)),
        "m" => Ok(Duration::minutes(value)),
        "h" => Ok(Duration::hours(value)),
        "d" => Ok(Duration::days(value)),
        _ => Err(err()),
    }
}
