//! Reads mail logs over a remote shell session.
//!
//! Each query drives one `ssh` subprocess that runs a small script on
//! the target host: probe each configured log file, filter it to the
//! window with a coarse timestamp comparison, then narrow to the
//! keywords with fixed-string greps. The surviving lines are parsed
//! client-side with the per-host parser. Password authentication is
//! delegated to `sshpass` so no tty is required; key and agent based
//! logins go straight to `ssh` in batch mode.

use crate::aggregator::LogWindow;
use crate::config::{parse_tz_offset, Config, HostConfig, SshConfig};
use crate::error::MailtraceError;
use mailtrace_log_types::parser::LineParser;
use mailtrace_log_types::LogRecord;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const MISSING_MARK: &str = "__mailtrace_missing__:";
const NO_FILES_MARK: &str = "__mailtrace_no_files__";

pub struct ShellAggregator {
    config: Arc<Config>,
}

impl ShellAggregator {
    pub fn new(config: Arc<Config>) -> Result<Self, MailtraceError> {
        if config.ssh_config.is_none() {
            return Err(MailtraceError::config(
                "method = \"ssh\" requires an [ssh_config] section",
            ));
        }
        Ok(Self { config })
    }

    fn ssh(&self) -> Result<&SshConfig, MailtraceError> {
        self.config.ssh_config.as_ref().ok_or_else(|| {
            MailtraceError::config("method = \"ssh\" requires an [ssh_config] section")
        })
    }

    pub async fn query(
        &self,
        host: &str,
        keywords: &[String],
        window: &LogWindow,
    ) -> Result<Vec<LogRecord>, MailtraceError> {
        let ssh = self.ssh()?;
        let host_cfg = ssh.host_config(host);
        let tz = parse_tz_offset(&host_cfg.time_zone)?;

        let script = compose_script(&host_cfg, keywords, window, tz);
        let command = if ssh.sudo {
            format!("sudo -S -p '' sh -c {}", shell_quote(&script))
        } else {
            format!("sh -c {}", shell_quote(&script))
        };
        debug!("running on {host}: {command}");

        let output = self.run_remote(host, &command).await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let any_file = !stderr.contains(NO_FILES_MARK);
        for line in stderr.lines() {
            if let Some(path) = line.strip_prefix(MISSING_MARK) {
                warn!("log file not found on {host}: {path}");
            } else if line.trim() == NO_FILES_MARK {
                warn!(
                    "none of the configured log files were found on {host}; \
                     check the log_files setting for this host"
                );
            } else if !line.trim().is_empty() {
                debug!("{host} stderr: {line}");
            }
        }

        if !output.status.success() {
            let message = format!(
                "ssh exited with {}: {}",
                output.status,
                stderr.trim().replace('\n', "; ")
            );
            if is_auth_failure(&stderr) {
                return Err(MailtraceError::Auth {
                    host: host.to_string(),
                    message,
                });
            }
            return Err(MailtraceError::Aggregator {
                host: host.to_string(),
                message,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parser = LineParser::new(host_cfg.parser, tz, window.end);
        let mut records = Vec::new();
        let mut dropped = 0usize;
        for line in stdout.lines() {
            match parser.parse(line) {
                Ok(record) => records.push(record),
                Err(_) => dropped += 1,
            }
        }
        if dropped > 0 {
            debug!("dropped {dropped} unparseable lines from {host}");
        }
        if records.is_empty() && any_file {
            debug!("no records matched the query on {host}");
        }
        Ok(records)
    }

    async fn run_remote(
        &self,
        host: &str,
        command: &str,
    ) -> Result<std::process::Output, MailtraceError> {
        let ssh = self.ssh()?;
        let use_sshpass = ssh.password.is_some();

        let mut cmd = if use_sshpass {
            let mut cmd = Command::new("sshpass");
            cmd.arg("-e");
            if let Some(password) = &ssh.password {
                cmd.env("SSHPASS", password);
            }
            cmd.arg("ssh");
            cmd
        } else {
            let mut cmd = Command::new("ssh");
            cmd.arg("-o").arg("BatchMode=yes");
            cmd
        };

        cmd.arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", ssh.timeout));
        if let Some(config_file) = &ssh.ssh_config_file {
            cmd.arg("-F").arg(config_file);
        }
        if let Some(key) = &ssh.private_key {
            cmd.arg("-i").arg(key);
        }
        cmd.arg("-l").arg(&ssh.username);
        cmd.arg(host);
        cmd.arg(command);

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| MailtraceError::Aggregator {
            host: host.to_string(),
            message: format!("spawning ssh: {err}"),
        })?;

        // sudo -S reads its password from the session's stdin
        let mut stdin = child.stdin.take();
        if ssh.sudo {
            if let (Some(stdin), Some(sudo_pass)) = (stdin.as_mut(), &ssh.sudo_pass) {
                stdin
                    .write_all(format!("{sudo_pass}\n").as_bytes())
                    .await
                    .map_err(|err| MailtraceError::Aggregator {
                        host: host.to_string(),
                        message: format!("writing sudo password: {err}"),
                    })?;
            }
        }
        drop(stdin);

        child
            .wait_with_output()
            .await
            .map_err(|err| MailtraceError::Aggregator {
                host: host.to_string(),
                message: format!("waiting for ssh: {err}"),
            })
    }
}

fn is_auth_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("permission denied")
        || lower.contains("incorrect password")
        || lower.contains("sorry, try again")
        || lower.contains("authentication failed")
}

/// Build the remote script: probe and read each log file, window it,
/// and narrow to the keywords. Always exits zero so that grep finding
/// nothing is not reported as a failure.
fn compose_script(
    host_cfg: &HostConfig,
    keywords: &[String],
    window: &LogWindow,
    tz: chrono::FixedOffset,
) -> String {
    let start = window
        .start
        .with_timezone(&tz)
        .format(&host_cfg.time_format)
        .to_string();
    // the comparison is lexicographic on the whole line, so bump the
    // bound by a second and use a strict compare to keep lines that
    // fall exactly on the window end
    let end = (window.end + chrono::Duration::seconds(1))
        .with_timezone(&tz)
        .format(&host_cfg.time_format)
        .to_string();
    let filter = format!(
        "awk '{{ if ($0 >= \"{start}\" && $0 < \"{end}\") print $0 }}'"
    );

    let keyword_pipe: String = keywords
        .iter()
        .map(|kw| format!(" | grep -F -- {}", shell_quote(kw)))
        .collect();

    let mut script = String::from("found=0\n");
    for file in &host_cfg.log_files {
        let quoted = shell_quote(file);
        script.push_str(&format!(
            "if [ -e {quoted} ]; then\n  found=1\n  {filter} {quoted}{keyword_pipe}\nelse\n  echo '{MISSING_MARK}'{quoted} >&2\nfi\n"
        ));
    }
    script.push_str(&format!(
        "[ \"$found\" = 1 ] || echo '{NO_FILES_MARK}' >&2\nexit 0\n"
    ));
    script
}

/// Quote for POSIX sh.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{Duration, FixedOffset, TimeZone, Utc};
    use mailtrace_log_types::parser::SyslogFormat;

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn script_contains_window_probe_and_keywords() {
        let host_cfg = HostConfig {
            log_files: vec!["/var/log/mail.log".to_string()],
            parser: SyslogFormat::Rfc3164,
            time_format: "%Y-%m-%d %H:%M:%S".to_string(),
            time_zone: "+00:00".to_string(),
        };
        let window = LogWindow::around(
            Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap(),
            Duration::minutes(30),
        );
        let script = compose_script(
            &host_cfg,
            &["user@example.com".to_string()],
            &window,
            FixedOffset::east_opt(0).unwrap(),
        );
        assert!(script.contains(r#"$0 >= "2025-02-01 09:30:00""#), "{script}");
        assert!(script.contains(r#"$0 < "2025-02-01 10:30:01""#), "{script}");
        assert!(script.contains("[ -e '/var/log/mail.log' ]"), "{script}");
        assert!(script.contains("grep -F -- 'user@example.com'"), "{script}");
        assert!(script.contains(MISSING_MARK), "{script}");
        assert!(script.trim_end().ends_with("exit 0"), "{script}");
    }

    #[test]
    fn window_bounds_use_the_host_offset() {
        let host_cfg = HostConfig {
            time_zone: "+08:00".to_string(),
            ..HostConfig::default()
        };
        let window = LogWindow::around(
            Utc.with_ymd_and_hms(2025, 2, 1, 10, 0, 0).unwrap(),
            Duration::minutes(0),
        );
        let script = compose_script(
            &host_cfg,
            &[],
            &window,
            parse_tz_offset(&host_cfg.time_zone).unwrap(),
        );
        assert!(script.contains(r#"$0 >= "2025-02-01 18:00:00""#), "{script}");
    }

    #[test]
    fn auth_failure_detection() {
        assert!(is_auth_failure("ops@mx1: Permission denied (publickey)"));
        assert!(is_auth_failure("Sorry, try again."));
        assert!(!is_auth_failure("Connection refused"));
    }
}
