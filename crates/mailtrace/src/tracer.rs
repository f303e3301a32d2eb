//! The hop-following tracer.
//!
//! Starting from `(host, keyword)` the walk discovers every queue id
//! the keyword matches on that host, pulls the full record set for
//! each, and chases every forward handoff onward: the sending host's
//! queue id becomes the keyword on the receiving relay, whose receive
//! line yields the newly assigned local id. Cluster aliases fan out to
//! their physical members with a bounded number of concurrent queries.
//!
//! A `(host, queue_id)` visited set guards against forwarding loops,
//! and per-host failures only remove that host from the walk.

use crate::aggregator::{Aggregator, LogWindow};
use crate::config::Config;
use crate::error::MailtraceError;
use mailtrace_log_types::extractor::{EventExtractor, MailEvent};
use mailtrace_log_types::{LogRecord, MailGraph};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

pub struct HopTracer {
    config: Arc<Config>,
    aggregator: Arc<Aggregator>,
    extractor: EventExtractor,
    limiter: Arc<Semaphore>,
    cancel: watch::Receiver<bool>,
}

/// Shared mutable state of one trace run.
struct RunState {
    visited: Mutex<HashSet<(String, String)>>,
    graph: Mutex<MailGraph>,
}

impl HopTracer {
    pub fn new(
        config: Arc<Config>,
        aggregator: Arc<Aggregator>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent_queries.max(1)));
        let extractor = EventExtractor::new(config.final_delivery_relays.clone());
        Self {
            config,
            aggregator,
            extractor,
            limiter,
            cancel,
        }
    }

    /// Walk the mail flow reachable from `start_host` and return the
    /// hop graph. Errors only when the start host (or every member of
    /// the start cluster) is unreachable; deeper failures shrink the
    /// walk instead of aborting it.
    pub async fn trace(
        self: &Arc<Self>,
        start_host: &str,
        keyword: &str,
        window: &LogWindow,
    ) -> Result<MailGraph, MailtraceError> {
        let run = Arc::new(RunState {
            visited: Mutex::new(HashSet::new()),
            graph: Mutex::new(MailGraph::new()),
        });
        self.clone()
            .walk(
                start_host.to_string(),
                keyword.to_string(),
                window.clone(),
                run.clone(),
                true,
            )
            .await?;
        let graph = std::mem::take(&mut *run.graph.lock());
        Ok(graph)
    }

    /// One level of the walk. Boxed because it recurses through
    /// `process_host`.
    fn walk(
        self: Arc<Self>,
        host: String,
        keyword: String,
        window: LogWindow,
        run: Arc<RunState>,
        is_root: bool,
    ) -> Pin<Box<dyn Future<Output = Result<(), MailtraceError>> + Send>> {
        Box::pin(async move {
            if *self.cancel.borrow() {
                return Ok(());
            }

            // a cluster alias fans out to its physical members; the
            // graph will record whichever member actually saw the mail
            let members: Vec<String> = match self.config.cluster_members(&host) {
                Some(members) => members.to_vec(),
                None => vec![host.clone()],
            };

            let mut queries = JoinSet::new();
            for member in members {
                let this = self.clone();
                let keyword = keyword.clone();
                let window = window.clone();
                queries.spawn(async move {
                    let permit = this.limiter.clone().acquire_owned().await;
                    if permit.is_err() {
                        return (
                            member.clone(),
                            Err(MailtraceError::Aggregator {
                                host: member,
                                message: "query limiter closed".to_string(),
                            }),
                        );
                    }
                    let result = this
                        .aggregator
                        .query(&member, std::slice::from_ref(&keyword), &window)
                        .await;
                    (member, result)
                });
            }

            let mut attempted = 0usize;
            let mut failed = 0usize;
            let mut first_error = None;
            let mut cancel = self.cancel.clone();
            let mut cancel_alive = true;
            loop {
                let joined = tokio::select! {
                    joined = queries.join_next() => joined,
                    changed = cancel.changed(), if cancel_alive => {
                        match changed {
                            Ok(()) if *cancel.borrow() => {
                                queries.abort_all();
                                return Ok(());
                            }
                            Ok(()) => {}
                            // sender gone, no cancellation will arrive
                            Err(_) => cancel_alive = false,
                        }
                        continue;
                    }
                };
                let Some(joined) = joined else { break };
                let Ok((member, result)) = joined else {
                    continue;
                };
                attempted += 1;
                match result {
                    Ok(records) => {
                        self.clone()
                            .process_host(member, records, &keyword, &window, &run)
                            .await;
                    }
                    Err(err) => {
                        warn!("skipping {member}: {err:#}");
                        failed += 1;
                        first_error.get_or_insert(err);
                    }
                }
            }

            if is_root && attempted > 0 && failed == attempted {
                if let Some(err) = first_error {
                    return Err(err);
                }
            }
            Ok(())
        })
    }

    /// Handle one host's keyword matches: group by queue id, pull the
    /// full per-queue record sets, and follow every forward.
    async fn process_host(
        self: Arc<Self>,
        host: String,
        records: Vec<LogRecord>,
        keyword: &str,
        window: &LogWindow,
        run: &Arc<RunState>,
    ) {
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<LogRecord>> = HashMap::new();
        for record in records {
            // records without a queue id are context lines only
            if let Some(queue_id) = record.queue_id.clone() {
                if !groups.contains_key(&queue_id) {
                    order.push(queue_id.clone());
                }
                groups.entry(queue_id).or_default().push(record);
            }
        }
        if order.is_empty() {
            debug!("no queue ids matched {keyword:?} on {host}");
            return;
        }

        for queue_id in order {
            if !run
                .visited
                .lock()
                .insert((host.clone(), queue_id.clone()))
            {
                debug!("already visited {queue_id} on {host}");
                continue;
            }
            run.graph.lock().add_node(&host);

            // the keyword query typically returns only the line that
            // mentioned the keyword; fetch the queue id's full history
            // before extracting events
            let full = if queue_id == keyword {
                groups.remove(&queue_id).unwrap_or_default()
            } else {
                match self
                    .aggregator
                    .query(&host, std::slice::from_ref(&queue_id), window)
                    .await
                {
                    Ok(records) if !records.is_empty() => records,
                    Ok(_) => groups.remove(&queue_id).unwrap_or_default(),
                    Err(err) => {
                        warn!("could not expand {queue_id} on {host}: {err:#}");
                        groups.remove(&queue_id).unwrap_or_default()
                    }
                }
            };

            let events = self.extractor.extract(&full);

            // a daemon may rename the queue locally between receive
            // and forward; both ids alias this host and the later id
            // labels the outbound hop
            let mut outbound_id = queue_id.clone();
            for event in &events {
                if let MailEvent::Forward {
                    relay,
                    next_queue_id: Some(renamed),
                    ..
                } = event
                {
                    if self.config.qualify_host(&relay.host) == host {
                        run.visited
                            .lock()
                            .insert((host.clone(), renamed.clone()));
                        outbound_id = renamed.clone();
                    }
                }
            }

            for event in events {
                match event {
                    MailEvent::Receive { message_id, .. } => {
                        debug!(
                            "{host} {queue_id}: received{}",
                            message_id
                                .map(|id| format!(" message-id <{id}>"))
                                .unwrap_or_default()
                        );
                    }
                    MailEvent::Connect { peer_host, .. } => {
                        debug!("{host} {queue_id}: client connection from {peer_host}");
                    }
                    MailEvent::Forward { relay, .. } => {
                        let next_host = self.config.qualify_host(&relay.host);
                        if next_host == host {
                            // local rename, handled above
                            continue;
                        }
                        info!("hop {host} -> {next_host} ({outbound_id})");
                        run.graph.lock().add_hop(&host, &next_host, &outbound_id);
                        if *self.cancel.borrow() {
                            return;
                        }
                        if let Err(err) = self
                            .clone()
                            .walk(
                                next_host.clone(),
                                outbound_id.clone(),
                                window.clone(),
                                run.clone(),
                                false,
                            )
                            .await
                        {
                            warn!("walk of {next_host} failed: {err:#}");
                        }
                    }
                    MailEvent::Deliver { status, .. } => {
                        info!("{host} {queue_id}: delivery terminal, status={status}");
                    }
                    MailEvent::Other { .. } => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::aggregator::stub::StubAggregator;
    use chrono::{Duration, TimeZone, Utc};

    fn record(host: &str, minute: u32, queue_id: Option<&str>, message: &str) -> LogRecord {
        LogRecord {
            timestamp: Utc.with_ymd_and_hms(2025, 2, 1, 10, minute, 0).unwrap(),
            host: host.to_string(),
            service: "postfix/smtp".to_string(),
            queue_id: queue_id.map(str::to_string),
            message: message.to_string(),
        }
    }

    fn window() -> LogWindow {
        LogWindow::around(
            Utc.with_ymd_and_hms(2025, 2, 1, 10, 30, 0).unwrap(),
            Duration::hours(1),
        )
    }

    fn tracer(config_toml: &str, backend: StubAggregator) -> Arc<HopTracer> {
        let config = Arc::new(crate::config::Config::from_toml(config_toml).unwrap());
        let aggregator = Arc::new(Aggregator::Stub(backend));
        let (_tx, rx) = watch::channel(false);
        Arc::new(HopTracer::new(config, aggregator, rx))
    }

    const SSH_CONFIG: &str = r#"
method = "ssh"

[ssh_config]
username = "ops"
private_key = "/key"
"#;

    const CLUSTER_CONFIG: &str = r#"
method = "ssh"

[ssh_config]
username = "ops"
private_key = "/key"

[clusters]
mx-us = ["mx1.example.com", "mx2.example.com"]
"#;

    #[tokio::test]
    async fn two_hop_forward() {
        let mut backend = StubAggregator::new();
        backend.add_records(
            "mx.example.com",
            vec![
                record(
                    "mx.example.com",
                    0,
                    Some("ABC123"),
                    "message-id=<x@y>, from=<user@example.com>",
                ),
                record(
                    "mx.example.com",
                    1,
                    Some("ABC123"),
                    "to=<u@v>, relay=mailer.example.com[10.0.0.2]:25, status=sent \
                     (250 2.0.0 Ok: queued as DEF456)",
                ),
            ],
        );
        backend.add_records(
            "mailer.example.com",
            vec![record(
                "mailer.example.com",
                2,
                Some("DEF456"),
                "client=mx.example.com[10.0.0.1], upstream ABC123",
            )],
        );

        let tracer = tracer(SSH_CONFIG, backend);
        let graph = tracer
            .trace("mx.example.com", "user@example.com", &window())
            .await
            .unwrap();

        assert_eq!(
            graph.nodes(),
            ["mx.example.com".to_string(), "mailer.example.com".to_string()]
        );
        assert_eq!(graph.hops().len(), 1);
        let hop = &graph.hops()[0];
        assert_eq!(hop.from_host, "mx.example.com");
        assert_eq!(hop.to_host, "mailer.example.com");
        assert_eq!(hop.queue_id, "ABC123");
    }

    #[tokio::test]
    async fn cluster_start_records_the_physical_host() {
        let mut backend = StubAggregator::new();
        backend.add_records("mx1.example.com", vec![]);
        backend.add_records(
            "mx2.example.com",
            vec![
                record(
                    "mx2.example.com",
                    0,
                    Some("AA11"),
                    "message-id=<m@x>, from=<user@example.com>",
                ),
                record(
                    "mx2.example.com",
                    1,
                    Some("AA11"),
                    "to=<user@example.com>, relay=mailer.example.com[10.0.0.2]:25, status=sent",
                ),
            ],
        );
        backend.add_records(
            "mailer.example.com",
            vec![record(
                "mailer.example.com",
                2,
                Some("BB22"),
                "client=mx2.example.com[10.0.0.1]",
            )],
        );

        let tracer = tracer(CLUSTER_CONFIG, backend);
        let graph = tracer
            .trace("mx-us", "user@example.com", &window())
            .await
            .unwrap();

        // the alias itself never becomes a node
        assert!(graph.nodes().contains(&"mx2.example.com".to_string()));
        assert!(!graph.nodes().iter().any(|n| n == "mx-us"));
        assert_eq!(graph.hops().len(), 1);
        assert_eq!(graph.hops()[0].from_host, "mx2.example.com");
    }

    #[tokio::test]
    async fn forwarding_cycle_terminates_with_both_edges() {
        let mut backend = StubAggregator::new();
        backend.add_records(
            "a.example.com",
            vec![
                record("a.example.com", 0, Some("CAFE1"), "message-id=<loop@x>"),
                record(
                    "a.example.com",
                    1,
                    Some("CAFE1"),
                    "to=<u@v>, relay=b.example.com[10.0.0.2]:25, status=sent",
                ),
            ],
        );
        backend.add_records(
            "b.example.com",
            vec![
                record("b.example.com", 2, Some("CAFE1"), "client=a.example.com[10.0.0.1]"),
                record(
                    "b.example.com",
                    3,
                    Some("CAFE1"),
                    "to=<u@v>, relay=a.example.com[10.0.0.1]:25, status=sent",
                ),
            ],
        );

        let tracer = tracer(SSH_CONFIG, backend);
        let graph = tracer
            .trace("a.example.com", "loop@x", &window())
            .await
            .unwrap();

        assert_eq!(graph.hops().len(), 2);
        assert_eq!(graph.hops()[0].from_host, "a.example.com");
        assert_eq!(graph.hops()[0].to_host, "b.example.com");
        assert_eq!(graph.hops()[1].from_host, "b.example.com");
        assert_eq!(graph.hops()[1].to_host, "a.example.com");
    }

    #[tokio::test]
    async fn unreachable_member_is_skipped() {
        let mut backend = StubAggregator::new();
        backend.mark_unreachable("mx1.example.com");
        backend.add_records(
            "mx2.example.com",
            vec![record(
                "mx2.example.com",
                0,
                Some("AA11"),
                "message-id=<m@x>, from=<user@example.com>",
            )],
        );

        let tracer = tracer(CLUSTER_CONFIG, backend);
        let graph = tracer
            .trace("mx-us", "user@example.com", &window())
            .await
            .unwrap();
        assert_eq!(graph.nodes(), ["mx2.example.com".to_string()]);
    }

    #[tokio::test]
    async fn fully_unreachable_start_is_an_error() {
        let mut backend = StubAggregator::new();
        backend.mark_unreachable("mx1.example.com");
        backend.mark_unreachable("mx2.example.com");

        let tracer = tracer(CLUSTER_CONFIG, backend);
        let err = tracer
            .trace("mx-us", "user@example.com", &window())
            .await
            .unwrap_err();
        assert!(matches!(err, MailtraceError::Aggregator { .. }));
    }

    #[tokio::test]
    async fn auth_failure_on_the_start_host_is_surfaced() {
        let mut backend = StubAggregator::new();
        backend.deny_auth("mx.example.com");

        let tracer = tracer(SSH_CONFIG, backend);
        let err = tracer
            .trace("mx.example.com", "user@example.com", &window())
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn no_matches_is_an_empty_graph_not_an_error() {
        let mut backend = StubAggregator::new();
        backend.add_records("mx.example.com", vec![]);

        let tracer = tracer(SSH_CONFIG, backend);
        let graph = tracer
            .trace("mx.example.com", "nobody@example.com", &window())
            .await
            .unwrap();
        assert!(graph.is_empty());
    }

    #[tokio::test]
    async fn visited_pairs_are_never_revisited() {
        // the same queue id reachable through two different paths is
        // expanded only once
        let mut backend = StubAggregator::new();
        backend.add_records(
            "a.example.com",
            vec![
                record("a.example.com", 0, Some("AB12"), "message-id=<m@x> shared-kw"),
                record(
                    "a.example.com",
                    1,
                    Some("AB12"),
                    "to=<u@v>, relay=c.example.com[1.1.1.3]:25, status=sent",
                ),
                record("a.example.com", 2, Some("CD34"), "message-id=<m2@x> shared-kw"),
                record(
                    "a.example.com",
                    3,
                    Some("CD34"),
                    "to=<u@v>, relay=c.example.com[1.1.1.3]:25, status=sent",
                ),
            ],
        );
        backend.add_records(
            "c.example.com",
            vec![record("c.example.com", 4, Some("EF56"), "client=a.example.com[1.1.1.1], refs AB12 CD34")],
        );

        let tracer = tracer(SSH_CONFIG, backend);
        let graph = tracer
            .trace("a.example.com", "shared-kw", &window())
            .await
            .unwrap();

        assert_eq!(graph.hops().len(), 2);
        assert_eq!(graph.nodes().len(), 2);
    }
}
