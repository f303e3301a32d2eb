use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailtraceError {
    #[error("configuration error: {0}")]
    Config(String),

    /// Bad credentials or insufficient privilege. Terminal for one-shot
    /// commands; the continuous pipeline retries with backoff.
    #[error("authentication failed for {host}: {message}")]
    Auth { host: String, message: String },

    /// Transport failure, unreachable host, or malformed backend
    /// response. The walk skips the host and continues.
    #[error("log query failed on {host}: {message}")]
    Aggregator { host: String, message: String },

    #[error("otlp export failed: {0}")]
    Export(String),
}

impl MailtraceError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
