use crate::aggregator::{Aggregator, LogWindow};
use crate::config::Config;
use crate::timefmt::{parse_time_range, parse_when};
use crate::tracer::HopTracer;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

/// Trace a mail across the relay fleet and emit the flow as a
/// Graphviz DOT graph.
#[derive(Debug, Parser)]
#[command(disable_help_flag = true)]
pub struct GraphCommand {
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

    /// Write the DOT graph here instead of stdout ("-" is stdout too)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    #[arg(long, action = clap::ArgAction::HelpLong, help = "Print help")]
    help: Option<bool>,
}

impl GraphCommand {
    pub async fn run(
        &self,
        config: &Arc<Config>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let window = LogWindow::around(parse_when(&self.time)?, parse_time_range(&self.time_range)?);
        let aggregator = Arc::new(Aggregator::from_config(config)?);
        let tracer = Arc::new(HopTracer::new(config.clone(), aggregator, shutdown));

        let graph = tracer.trace(&self.host, &self.keyword, &window).await?;
        let dot = graph.to_dot();

        match &self.output {
            Some(path) if path.as_os_str() != "-" => {
                std::fs::write(path, &dot)
                    .with_context(|| format!("writing {}", path.display()))?;
                tracing::info!("graph saved to {}", path.display());
            }
            _ => print!("{dot}"),
        }
        Ok(())
    }
}
