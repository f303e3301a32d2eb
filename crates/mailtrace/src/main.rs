use clap::Parser;
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

mod aggregator;
mod config;
mod continuous;
mod diag;
mod error;
mod graph_cmd;
mod otel;
mod run;
mod timefmt;
mod tracer;

/// Reconstructs the end-to-end flow of a mail across a fleet of SMTP
/// relays from their syslog-style mail logs.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Path to the configuration file. The MAILTRACE_CONFIG
    /// environment variable takes precedence.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: SubCommand,
}

#[derive(Debug, Parser)]
enum SubCommand {
    Run(run::RunCommand),
    Graph(graph_cmd::GraphCommand),
    Tracing(continuous::TracingCommand),
}

impl SubCommand {
    async fn run(
        &self,
        config: &Arc<Config>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        match self {
            Self::Run(cmd) => cmd.run(config, shutdown).await,
            Self::Graph(cmd) => cmd.run(config, shutdown).await,
            Self::Tracing(cmd) => cmd.run(config, shutdown).await,
        }
    }
}

/// A watch channel that flips to true on the first interrupt.
fn shutdown_watch() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing up");
            let _ = tx.send(true);
        }
    });
    rx
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    let config = Arc::new(Config::load(opts.config.as_deref())?);
    diag::init(&config)?;

    let shutdown = shutdown_watch();
    opts.cmd.run(&config, shutdown).await
}
