use crate::aggregator::{Aggregator, LogWindow};
use crate::config::Config;
use crate::timefmt::{parse_time_range, parse_when};
use crate::tracer::HopTracer;
use clap::Parser;
use mailtrace_log_types::LogRecord;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Trace a mail across the relay fleet and print the flow as text.
///
/// The keyword is matched against the logs of the starting host (or of
/// every member when the host is a cluster alias); each matching queue
/// id is then followed hop by hop until the flow terminates.
#[derive(Debug, Parser)]
#[command(disable_help_flag = true)]
pub struct RunCommand {
    /// Host or cluster alias to start the trace from
    #[arg(short = 'h', long)]
    pub host: String,

    /// Keyword to look for: a sender, a recipient, a message id, or a
    /// queue id
    #[arg(short, long)]
    pub keyword: String,

    /// Center of the search window, YYYY-MM-DD HH:MM:SS (UTC)
    #[arg(long)]
    pub time: String,

    /// Search radius around --time, eg 30m, 2h, 1d
    #[arg(long)]
    pub time_range: String,

    #[arg(long, action = clap::ArgAction::HelpLong, help = "Print help")]
    help: Option<bool>,
}

impl RunCommand {
    pub async fn run(
        &self,
        config: &Arc<Config>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let window = LogWindow::around(parse_when(&self.time)?, parse_time_range(&self.time_range)?);
        let aggregator = Arc::new(Aggregator::from_config(config)?);

        print_matches(config, &aggregator, &self.host, &self.keyword, &window).await;

        let tracer = Arc::new(HopTracer::new(config.clone(), aggregator, shutdown));
        let graph = tracer.trace(&self.host, &self.keyword, &window).await?;

        if graph.is_empty() {
            println!("No mail flow found for {:?}.", self.keyword);
            return Ok(());
        }
        println!("Hosts:");
        for node in graph.nodes() {
            println!("  {node}");
        }
        if !graph.hops().is_empty() {
            println!("Hops:");
            for hop in graph.hops() {
                println!("  {} -> {} [{}]", hop.from_host, hop.to_host, hop.queue_id);
            }
        }
        Ok(())
    }
}

/// Show the raw matches grouped by queue id before the walk starts, so
/// the operator can see what the trace is based on.
async fn print_matches(
    config: &Arc<Config>,
    aggregator: &Arc<Aggregator>,
    host: &str,
    keyword: &str,
    window: &LogWindow,
) {
    let members: Vec<String> = match config.cluster_members(host) {
        Some(members) => members.to_vec(),
        None => vec![host.to_string()],
    };

    let keywords = vec![keyword.to_string()];
    for member in members {
        let records = match aggregator.query(&member, &keywords, window).await {
            Ok(records) => records,
            Err(err) => {
                info!("skipping {member} while printing matches: {err:#}");
                continue;
            }
        };

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<LogRecord>> = HashMap::new();
        for record in records {
            if let Some(queue_id) = record.queue_id.clone() {
                if !groups.contains_key(&queue_id) {
                    order.push(queue_id.clone());
                }
                groups.entry(queue_id).or_default().push(record);
            }
        }

        for queue_id in order {
            println!("== Mail ID: {queue_id} ({member}) ==");
            for record in &groups[&queue_id] {
                println!("{record}");
            }
            println!("==============");
            println!();
        }
    }
}
