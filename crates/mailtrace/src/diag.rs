use crate::config::Config;
use tracing_subscriber::EnvFilter;

/// Initialize diagnostic logging on stderr. The filter defaults to the
/// configured `log_level` and can be overridden with `MAILTRACE_LOG`.
pub fn init(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(
        std::env::var("MAILTRACE_LOG")
            .as_deref()
            .unwrap_or(config.log_level.as_filter()),
    )?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
