//! Configuration for the tracer and the continuous pipeline.
//!
//! Loaded from a TOML file whose path comes from `MAILTRACE_CONFIG`
//! or the `--config` flag. The password fields can be supplied (and
//! are overridden) by environment variables so that credentials need
//! not live on disk.

use crate::error::MailtraceError;
use chrono::FixedOffset;
use mailtrace_log_types::parser::SyslogFormat;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Ssh,
    Opensearch,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// The default tracing filter directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error | Self::Critical => "error",
        }
    }
}

/// How to read logs from one host: which files, which wire format,
/// and how timestamps are written.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default = "default_log_files")]
    pub log_files: Vec<String>,
    #[serde(default)]
    pub parser: SyslogFormat,
    /// strftime format of the leading timestamp, used for the
    /// host-side window filter
    #[serde(default = "default_time_format")]
    pub time_format: String,
    /// Offset the host writes its local timestamps in, `+HH:MM`
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            log_files: default_log_files(),
            parser: SyslogFormat::default(),
            time_format: default_time_format(),
            time_zone: default_time_zone(),
        }
    }
}

/// Per-host override of [HostConfig]; unset fields fall back to the
/// default host config.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct HostOverride {
    #[serde(default)]
    pub log_files: Option<Vec<String>>,
    #[serde(default)]
    pub parser: Option<SyslogFormat>,
    #[serde(default)]
    pub time_format: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    /// Escalate before reading the log files
    #[serde(default)]
    pub sudo: bool,
    #[serde(default)]
    pub sudo_pass: Option<String>,
    /// Connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub ssh_config_file: Option<PathBuf>,
    #[serde(default)]
    pub host_config: HostConfig,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostOverride>,
}

impl SshConfig {
    /// The effective log-source settings for `host`, merging its
    /// overrides over the default host config.
    pub fn host_config(&self, host: &str) -> HostConfig {
        let base = self.host_config.clone();
        match self.hosts.get(host) {
            None => base,
            Some(over) => HostConfig {
                log_files: over.log_files.clone().unwrap_or(base.log_files),
                parser: over.parser.unwrap_or(base.parser),
                time_format: over.time_format.clone().unwrap_or(base.time_format),
                time_zone: over.time_zone.clone().unwrap_or(base.time_zone),
            },
        }
    }
}

/// Names of the index fields holding each log attribute.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FieldMapping {
    #[serde(default = "default_facility_field")]
    pub facility: String,
    #[serde(default = "default_hostname_field")]
    pub hostname: String,
    #[serde(default = "default_message_field")]
    pub message: String,
    #[serde(default = "default_timestamp_field")]
    pub timestamp: String,
    #[serde(default = "default_service_field")]
    pub service: String,
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self {
            facility: default_facility_field(),
            hostname: default_hostname_field(),
            message: default_message_field(),
            timestamp: default_timestamp_field(),
            service: default_service_field(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct OpenSearchConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub index: String,
    #[serde(default)]
    pub use_ssl: bool,
    #[serde(default)]
    pub verify_certs: bool,
    /// Offset the indexed naive timestamps are written in, `+HH:MM`
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub mapping: FieldMapping,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct TracingParams {
    /// Pause between query rounds
    #[serde(default = "default_sleep_seconds")]
    pub sleep_seconds: u64,
    /// Consecutive quiescent rounds required before a buffered trace
    /// is flushed; zero flushes every round
    #[serde(default = "default_hold_rounds")]
    pub hold_rounds: u32,
    /// Window overlap that catches records whose syslog timestamp
    /// predates their index-ingest time
    #[serde(default = "default_go_back_seconds")]
    pub go_back_seconds: u64,
}

impl Default for TracingParams {
    fn default() -> Self {
        Self {
            sleep_seconds: default_sleep_seconds(),
            hold_rounds: default_hold_rounds(),
            go_back_seconds: default_go_back_seconds(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub method: Method,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub ssh_config: Option<SshConfig>,
    #[serde(default)]
    pub opensearch_config: Option<OpenSearchConfig>,
    /// Cluster alias to the physical hosts behind it
    #[serde(default)]
    pub clusters: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub tracing: TracingParams,
    /// DNS suffix appended to bare relay names found in log messages
    #[serde(default)]
    pub domain: Option<String>,
    /// Relay names that terminate a flow, in addition to `local`
    #[serde(default)]
    pub final_delivery_relays: Vec<String>,
    /// Cap on concurrently running host queries
    #[serde(default = "default_max_concurrent_queries")]
    pub max_concurrent_queries: usize,
}

impl Config {
    /// Load the configuration, preferring the `MAILTRACE_CONFIG`
    /// environment variable over the command line path.
    pub fn load(cli_path: Option<&Path>) -> Result<Self, MailtraceError> {
        let path: PathBuf = match std::env::var_os("MAILTRACE_CONFIG") {
            Some(env_path) => env_path.into(),
            None => cli_path
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("mailtrace.toml")),
        };
        let text = std::fs::read_to_string(&path).map_err(|err| {
            MailtraceError::config(format!("reading {}: {err}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, MailtraceError> {
        let mut config: Config = toml::from_str(text)
            .map_err(|err| MailtraceError::config(err.to_string()))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(password) = std::env::var("MAILTRACE_SSH_PASSWORD") {
            if let Some(ssh) = &mut self.ssh_config {
                ssh.password = Some(password);
            }
        }
        if let Ok(password) = std::env::var("MAILTRACE_SUDO_PASSWORD") {
            if let Some(ssh) = &mut self.ssh_config {
                ssh.sudo_pass = Some(password);
            }
        }
        if let Ok(password) = std::env::var("MAILTRACE_OPENSEARCH_PASSWORD") {
            if let Some(os) = &mut self.opensearch_config {
                os.password = Some(password);
            }
        }
    }

    fn validate(&self) -> Result<(), MailtraceError> {
        match self.method {
            Method::Ssh => {
                let ssh = self.ssh_config.as_ref().ok_or_else(|| {
                    MailtraceError::config("method = \"ssh\" requires an [ssh_config] section")
                })?;
                if ssh.username.is_empty() {
                    return Err(MailtraceError::config("ssh_config.username must be set"));
                }
                if ssh.password.is_none()
                    && ssh.private_key.is_none()
                    && ssh.ssh_config_file.is_none()
                {
                    return Err(MailtraceError::config(
                        "ssh_config needs a password, a private_key, or an ssh_config_file",
                    ));
                }
                if ssh.sudo && ssh.sudo_pass.is_none() {
                    return Err(MailtraceError::config(
                        "ssh_config.sudo requires sudo_pass (or MAILTRACE_SUDO_PASSWORD)",
                    ));
                }
            }
            Method::Opensearch => {
                let os = self.opensearch_config.as_ref().ok_or_else(|| {
                    MailtraceError::config(
                        "method = \"opensearch\" requires an [opensearch_config] section",
                    )
                })?;
                if os.host.is_empty() || os.index.is_empty() {
                    return Err(MailtraceError::config(
                        "opensearch_config.host and opensearch_config.index must be set",
                    ));
                }
                parse_tz_offset(&os.time_zone)?;
            }
        }
        Ok(())
    }

    /// The physical hosts behind a cluster alias, or None when the
    /// name is not an alias.
    pub fn cluster_members(&self, host: &str) -> Option<&[String]> {
        self.clusters.get(host).map(Vec::as_slice)
    }

    /// Every physical host named in the clusters map, deduplicated.
    pub fn all_cluster_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.clusters.values().flatten().cloned().collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }

    /// Append the configured DNS suffix to a bare host name.
    pub fn qualify_host(&self, host: &str) -> String {
        match &self.domain {
            Some(domain) if !host.contains('.') => format!("{host}.{domain}"),
            _ => host.to_string(),
        }
    }
}

/// Parse a `+HH:MM` / `-HH:MM` offset.
pub fn parse_tz_offset(s: &str) -> Result<FixedOffset, MailtraceError> {
    let err = || MailtraceError::config(format!("invalid timezone offset {s:?}, expected +HH:MM"));
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => return Err(err()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(err)?;
    let hours: i32 = hours.parse().map_err(|_| err())?;
    let minutes: i32 = minutes.parse().map_err(|_| err())?;
    if hours > 14 || minutes > 59 {
        return Err(err());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(err)
}

fn default_log_files() -> Vec<String> {
    vec!["/var/log/mail.log".to_string()]
}

fn default_time_format() -> String {
    "%Y-%m-%d %H:%M:%S".to_string()
}

fn default_time_zone() -> String {
    "+00:00".to_string()
}

fn default_timeout() -> u64 {
    10
}

fn default_port() -> u16 {
    9200
}

fn default_facility_field() -> String {
    "log.syslog.facility.name".to_string()
}

fn default_hostname_field() -> String {
    "host.name".to_string()
}

fn default_message_field() -> String {
    "message".to_string()
}

fn default_timestamp_field() -> String {
    "@timestamp".to_string()
}

fn default_service_field() -> String {
    "log.syslog.appname".to_string()
}

fn default_sleep_seconds() -> u64 {
    60
}

fn default_hold_rounds() -> u32 {
    2
}

fn default_go_back_seconds() -> u64 {
    10
}

fn default_max_concurrent_queries() -> usize {
    8
}
