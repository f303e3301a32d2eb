//! The continuous tracing pipeline.
//!
//! Every round, all physical hosts in the clusters map are queried
//! with an empty keyword list over `[prev_end - go_back, now]`. The
//! overlap catches records whose syslog timestamp predates their
//! ingest into the backend; duplicates from the overlap are dropped by
//! `(timestamp, host, message)` identity. Records are buffered per
//! message id (joining queue ids to message ids through the receive
//! lines), and a buffered flow is flushed as one OpenTelemetry trace
//! once it has been quiescent for `hold_rounds` consecutive rounds.

use crate::aggregator::{Aggregator, LogWindow};
use crate::config::Config;
use crate::error::MailtraceError;
use crate::otel::OtlpExporter;
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use mailtrace_log_types::extractor::{self, EventExtractor};
use mailtrace_log_types::LogRecord;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Ceiling for the exponential backoff after authentication failures.
const MAX_AUTH_BACKOFF_SECS: u64 = 900;

/// Run the continuous tracing pipeline, shipping reconstructed mail
/// flows to an OTLP collector until interrupted.
#[derive(Debug, Parser)]
#[command(disable_help_flag = true)]
pub struct TracingCommand {
    /// OTLP gRPC endpoint to export traces to, eg http://otel:4317
    #[arg(long)]
    otel_endpoint: String,

    #[arg(long, action = clap::ArgAction::HelpLong, help = "Print help")]
    help: Option<bool>,
}

impl TracingCommand {
    pub async fn run(
        &self,
        config: &Arc<Config>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        if config.clusters.is_empty() {
            anyhow::bail!("the clusters map is empty; there is nothing to poll");
        }
        let aggregator = Arc::new(Aggregator::from_config(config)?);
        let exporter = OtlpExporter::connect(&self.otel_endpoint).await?;
        let mut pipeline = Pipeline::new(config.clone(), aggregator, exporter);
        pipeline.run(shutdown).await
    }
}

/// The window for one round: overlap backward from the previous upper
/// bound to catch late arrivals.
pub(crate) fn round_window(
    prev_end: DateTime<Utc>,
    now: DateTime<Utc>,
    go_back: Duration,
) -> LogWindow {
    LogWindow {
        start: prev_end - go_back,
        end: now,
    }
}

/// One buffered mail flow, keyed by message id.
#[derive(Debug, Clone)]
pub struct TraceState {
    pub message_id: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub hosts: BTreeSet<String>,
    pub records: Vec<LogRecord>,
    pub rounds_since_new: u32,
    fresh: bool,
}

impl TraceState {
    pub(crate) fn new(message_id: String, first_seen: DateTime<Utc>) -> Self {
        Self {
            message_id,
            first_seen,
            last_seen: first_seen,
            hosts: BTreeSet::new(),
            records: Vec::new(),
            rounds_since_new: 0,
            fresh: true,
        }
    }

    pub(crate) fn push(&mut self, record: LogRecord) {
        self.first_seen = self.first_seen.min(record.timestamp);
        self.last_seen = self.last_seen.max(record.timestamp);
        self.hosts.insert(record.host.clone());
        self.records.push(record);
        self.fresh = true;
    }
}

/// Buffers per-message-id log groups across rounds and decides when
/// each is quiescent enough to flush.
pub(crate) struct TraceBuffer {
    hold_rounds: u32,
    states: HashMap<String, TraceState>,
    /// Identity of every record already ingested, for overlap dedup
    seen: HashSet<(DateTime<Utc>, String, String)>,
    /// `(host, queue id)` to message id, fed by receive lines
    queue_to_message: HashMap<(String, String), String>,
}

impl TraceBuffer {
    pub fn new(hold_rounds: u32) -> Self {
        Self {
            hold_rounds,
            states: HashMap::new(),
            seen: HashSet::new(),
            queue_to_message: HashMap::new(),
        }
    }

    /// Ingest one round of records and return the flows whose hold
    /// period has expired.
    pub fn ingest_round(&mut self, records: Vec<LogRecord>) -> Vec<TraceState> {
        let mut unresolved = 0usize;
        for record in records {
            let key = (
                record.timestamp,
                record.host.clone(),
                record.message.clone(),
            );
            if !self.seen.insert(key) {
                continue;
            }

            let message_id = extractor::message_id(&record.message).or_else(|| {
                record.queue_id.as_ref().and_then(|queue_id| {
                    self.queue_to_message
                        .get(&(record.host.clone(), queue_id.clone()))
                        .cloned()
                })
            });
            let Some(message_id) = message_id else {
                unresolved += 1;
                continue;
            };
            if let Some(queue_id) = &record.queue_id {
                self.queue_to_message
                    .insert((record.host.clone(), queue_id.clone()), message_id.clone());
            }

            self.states
                .entry(message_id.clone())
                .or_insert_with(|| TraceState::new(message_id, record.timestamp))
                .push(record);
        }
        if unresolved > 0 {
            debug!("{unresolved} records had no resolvable message id this round");
        }

        for state in self.states.values_mut() {
            if state.fresh {
                state.rounds_since_new = 0;
                state.fresh = false;
            } else {
                state.rounds_since_new += 1;
            }
        }

        let ready_ids: Vec<String> = self
            .states
            .iter()
            .filter(|(_, state)| state.rounds_since_new >= self.hold_rounds)
            .map(|(id, _)| id.clone())
            .collect();
        let mut ready = Vec::with_capacity(ready_ids.len());
        for id in ready_ids {
            if let Some(state) = self.states.remove(&id) {
                self.queue_to_message
                    .retain(|_, message_id| message_id != &state.message_id);
                ready.push(state);
            }
        }
        ready
    }

    /// Records stamped before this instant can no longer collide with
    /// a future overlap, so their dedup keys can be dropped.
    pub fn prune_seen(&mut self, older_than: DateTime<Utc>) {
        self.seen.retain(|(timestamp, _, _)| *timestamp >= older_than);
    }

    pub fn pending(&self) -> usize {
        self.states.len()
    }
}

struct Pipeline {
    config: Arc<Config>,
    aggregator: Arc<Aggregator>,
    exporter: OtlpExporter,
    extractor: EventExtractor,
    limiter: Arc<Semaphore>,
    buffer: TraceBuffer,
    prev_end: DateTime<Utc>,
    auth_failures: u32,
}

impl Pipeline {
    fn new(config: Arc<Config>, aggregator: Arc<Aggregator>, exporter: OtlpExporter) -> Self {
        let buffer = TraceBuffer::new(config.tracing.hold_rounds);
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_queries.max(1)));
        let extractor = EventExtractor::new(config.final_delivery_relays.clone());
        let prev_end = Utc::now();
        Self {
            config,
            aggregator,
            exporter,
            extractor,
            limiter,
            buffer,
            prev_end,
            auth_failures: 0,
        }
    }

    async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let sleep = std::time::Duration::from_secs(self.config.tracing.sleep_seconds);
        let go_back = Duration::seconds(self.config.tracing.go_back_seconds as i64);
        self.prev_end = Utc::now() - Duration::seconds(self.config.tracing.sleep_seconds as i64);

        let mut round: u64 = 0;
        loop {
            round += 1;
            let now = Utc::now();
            let window = round_window(self.prev_end, now, go_back);

            match self.collect(&window).await {
                Ok(records) => {
                    self.auth_failures = 0;
                    info!("round {round}: {} records in window", records.len());
                    let ready = self.buffer.ingest_round(records);
                    debug!(
                        "round {round}: {} flows buffered, {} ready",
                        self.buffer.pending(),
                        ready.len()
                    );
                    for state in &ready {
                        info!(
                            "flushing trace for <{}> across {} hosts ({} records)",
                            state.message_id,
                            state.hosts.len(),
                            state.records.len()
                        );
                        if let Err(err) = self.exporter.export(state, &self.extractor).await {
                            warn!("export of <{}> failed: {err:#}", state.message_id);
                        }
                    }
                    self.prev_end = now;
                    self.buffer.prune_seen(now - go_back - Duration::seconds(1));
                }
                // the window is not advanced on failure, so the next
                // round retries the same span of time
                Err(err) if err.is_auth() => {
                    self.auth_failures += 1;
                    warn!("round {round}: {err:#} (backing off)");
                }
                Err(err) => {
                    warn!("round {round}: {err:#}");
                }
            }

            let delay = backoff_delay(sleep, self.auth_failures);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutting down with {} flows still buffered", self.buffer.pending());
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Fan out one round of queries over every configured host.
    async fn collect(&self, window: &LogWindow) -> Result<Vec<LogRecord>, MailtraceError> {
        let hosts = self.config.all_cluster_hosts();

        let mut queries = JoinSet::new();
        for host in hosts {
            let aggregator = self.aggregator.clone();
            let limiter = self.limiter.clone();
            let window = window.clone();
            queries.spawn(async move {
                let permit = limiter.acquire_owned().await;
                if permit.is_err() {
                    return (
                        host.clone(),
                        Err(MailtraceError::Aggregator {
                            host,
                            message: "query limiter closed".to_string(),
                        }),
                    );
                }
                let result = aggregator.query(&host, &[], &window).await;
                (host, result)
            });
        }

        let mut records = Vec::new();
        let mut auth_error = None;
        while let Some(joined) = queries.join_next().await {
            let Ok((host, result)) = joined else { continue };
            match result {
                Ok(mut host_records) => records.append(&mut host_records),
                Err(err) if err.is_auth() => {
                    warn!("authentication failed for {host}: {err:#}");
                    auth_error.get_or_insert(err);
                }
                Err(err) => warn!("skipping {host} this round: {err:#}"),
            }
        }
        if let Some(err) = auth_error {
            return Err(err);
        }

        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }
}

/// Doubles the inter-round pause per consecutive authentication
/// failure, up to a ceiling.
fn backoff_delay(sleep: std::time::Duration, auth_failures: u32) -> std::time::Duration {
    if auth_failures == 0 {
        return sleep;
    }
    let shift = auth_failures.min(10);
    let backoff = sleep.as_secs().saturating_mul(1 << shift);
    std::time::Duration::from_secs(backoff.min(MAX_AUTH_BACKOFF_SECS).max(sleep.as_secs()))
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap() + Duration::seconds(second as i64)
    }

    fn record(host: &str, second: u32, queue_id: Option<&str>, message: &str) -> LogRecord {
        LogRecord {
            timestamp: at(second),
            host: host.to_string(),
            service: "postfix/cleanup".to_string(),
            queue_id: queue_id.map(str::to_string),
            message: message.to_string(),
        }
    }

    #[test]
    fn window_overlaps_backward() {
        let window = round_window(at(100), at(110), Duration::seconds(5));
        assert_eq!(window.start, at(95));
        assert_eq!(window.end, at(110));
    }

    #[test]
    fn hold_rounds_buffering() {
        // records in rounds 1 and 2, quiet in 3 and 4; the flush fires
        // in round 4 with everything collected
        let mut buffer = TraceBuffer::new(2);

        let ready = buffer.ingest_round(vec![
            record("mx1", 1, Some("AA11"), "message-id=<m@x>"),
            record("mx1", 2, Some("AA11"), "from=<a@b>, size=100, message-id=<m@x>"),
        ]);
        assert!(ready.is_empty());

        let ready = buffer.ingest_round(vec![record(
            "mx1",
            12,
            Some("AA11"),
            "to=<u@v>, relay=local, status=sent",
        )]);
        assert!(ready.is_empty());

        let ready = buffer.ingest_round(vec![]);
        assert!(ready.is_empty());

        let ready = buffer.ingest_round(vec![]);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message_id, "m@x");
        assert_eq!(ready[0].records.len(), 3);
        assert_eq!(ready[0].first_seen, at(1));
        assert_eq!(ready[0].last_seen, at(12));
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn hold_rounds_zero_flushes_immediately() {
        let mut buffer = TraceBuffer::new(0);
        let ready = buffer.ingest_round(vec![record("mx1", 1, Some("AA11"), "message-id=<m@x>")]);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn late_arrivals_in_the_overlap_are_deduplicated() {
        let mut buffer = TraceBuffer::new(5);

        let first = record("mx1", 97, Some("AA11"), "message-id=<m@x>");
        buffer.ingest_round(vec![first.clone()]);

        // the next round's window overlaps and returns the same line
        // again plus one genuinely new record
        let ready = buffer.ingest_round(vec![
            first.clone(),
            record("mx1", 99, Some("AA11"), "to=<u@v>, relay=local, status=sent"),
        ]);
        assert!(ready.is_empty());

        let state = buffer.states.get("m@x").unwrap();
        assert_eq!(state.records.len(), 2);
    }

    #[test]
    fn queue_id_join_attaches_records_without_a_message_id() {
        let mut buffer = TraceBuffer::new(0);
        let ready = buffer.ingest_round(vec![
            record("mx1", 1, Some("AA11"), "message-id=<m@x>"),
            record("mx1", 2, Some("AA11"), "to=<u@v>, relay=local, status=sent"),
            // different queue id, never joined: dropped
            record("mx1", 3, Some("ZZ99"), "to=<u@v>, relay=local, status=sent"),
        ]);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].records.len(), 2);
    }

    #[test]
    fn join_survives_across_rounds_until_flush() {
        let mut buffer = TraceBuffer::new(5);
        buffer.ingest_round(vec![record("mx1", 1, Some("AA11"), "message-id=<m@x>")]);
        // a later round sees only the queue id
        buffer.ingest_round(vec![record(
            "mx1",
            20,
            Some("AA11"),
            "to=<u@v>, relay=local, status=sent",
        )]);
        let state = buffer.states.get("m@x").unwrap();
        assert_eq!(state.records.len(), 2);
        assert_eq!(state.rounds_since_new, 0);
    }

    #[test]
    fn flush_timing_follows_the_last_new_record() {
        let mut buffer = TraceBuffer::new(2);
        buffer.ingest_round(vec![record("mx1", 1, Some("AA11"), "message-id=<m@x>")]);
        buffer.ingest_round(vec![]);
        // new record arrives, resetting the quiescence counter
        buffer.ingest_round(vec![record(
            "mx1",
            25,
            Some("AA11"),
            "to=<u@v>, relay=local, status=sent",
        )]);
        assert!(buffer.ingest_round(vec![]).is_empty());
        assert_eq!(buffer.ingest_round(vec![]).len(), 1);
    }

    #[test]
    fn seen_pruning_keeps_recent_keys() {
        let mut buffer = TraceBuffer::new(0);
        buffer.ingest_round(vec![
            record("mx1", 1, Some("AA11"), "message-id=<m@x>"),
            record("mx1", 50, Some("BB22"), "message-id=<n@x>"),
        ]);
        buffer.prune_seen(at(40));
        assert_eq!(buffer.seen.len(), 1);
    }

    #[test]
    fn backoff_delay_is_bounded() {
        let base = std::time::Duration::from_secs(60);
        assert_eq!(backoff_delay(base, 0), base);
        assert_eq!(backoff_delay(base, 1), std::time::Duration::from_secs(120));
        assert_eq!(backoff_delay(base, 2), std::time::Duration::from_secs(240));
        assert_eq!(
            backoff_delay(base, 10),
            std::time::Duration::from_secs(MAX_AUTH_BACKOFF_SECS)
        );
        // never shorter than the configured pause
        assert_eq!(backoff_delay(std::time::Duration::from_secs(1200), 30),
            std::time::Duration::from_secs(1200));
    }
}
