//! SSH auth log normalisation.
//!
//! Three syslog dialects (Debian `auth.log`, RHEL `secure`, AIX
//! `/var/adm/syslog`) plus `journalctl --output=json` are normalised into
//! [`ParsedAuthEvent`]s. Syslog timestamps carry no year; the year is
//! seeded from the file's mtime and corrected when a line jumps more than
//! 300 days backwards (a file spanning a new-year boundary).

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use keyspider_core::types::{AuthMethod, EventType, LogSource, OsType};
use keyspider_store::NewAccessEvent;
use regex::Regex;

/// How far backwards (in days) a timestamp may jump before we assume the
/// file crossed a year boundary.
const YEAR_ROLLOVER_DAYS: i64 = 300;

/// A parsed SSH authentication event, before store correlation.
#[derive(Debug, Clone)]
pub struct ParsedAuthEvent {
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub username: String,
    pub auth_method: Option<AuthMethod>,
    pub event_type: EventType,
    pub fingerprint: Option<String>,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub raw_line: String,
}

impl ParsedAuthEvent {
    pub fn into_new_event(self, log_source: LogSource) -> NewAccessEvent {
        NewAccessEvent {
            source_ip: self.source_ip,
            username: self.username,
            auth_method: self.auth_method,
            event_type: self.event_type,
            fingerprint: self.fingerprint,
            event_time: self.timestamp,
            raw_log_line: self.raw_line,
            log_source,
        }
    }
}

/// A parsed sudo invocation from syslog.
#[derive(Debug, Clone)]
pub struct ParsedSudoEvent {
    pub timestamp: DateTime<Utc>,
    pub username: String,
    pub tty: String,
    pub working_dir: String,
    pub target_user: String,
    pub command: String,
    pub raw_line: String,
}

/// Outcome of parsing a whole log body.
#[derive(Debug, Default)]
pub struct LogParseOutcome {
    pub events: Vec<ParsedAuthEvent>,
    /// sshd lines that matched no pattern.
    pub malformed_lines: usize,
    /// Events at or before the supplied watermark.
    pub below_watermark: usize,
}

// Debian/Ubuntu /var/log/auth.log and RHEL /var/log/secure share the shape:
// `Mon DD HH:MM:SS hostname sshd[PID]: message`

static ACCEPTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<timestamp>\w+\s+\d+\s+[\d:]+)\s+\S+\s+sshd\[(?P<pid>\d+)\]:\s+Accepted\s+(?P<method>publickey|password|keyboard-interactive)\s+for\s+(?P<username>\S+)\s+from\s+(?P<ip>[\d.]+|[0-9a-fA-F:]+)\s+port\s+(?P<port>\d+)(?:\s+ssh2:\s+\S+\s+(?P<fingerprint>\S+))?",
    )
    .expect("accepted regex")
});

static FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<timestamp>\w+\s+\d+\s+[\d:]+)\s+\S+\s+sshd\[(?P<pid>\d+)\]:\s+Failed\s+(?P<method>publickey|password|keyboard-interactive)\s+for\s+(?:invalid user\s+)?(?P<username>\S+)\s+from\s+(?P<ip>[\d.]+|[0-9a-fA-F:]+)\s+port\s+(?P<port>\d+)(?:\s+ssh2:\s+\S+\s+(?P<fingerprint>\S+))?",
    )
    .expect("failed regex")
});

static INVALID_USER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<timestamp>\w+\s+\d+\s+[\d:]+)\s+\S+\s+sshd\[(?P<pid>\d+)\]:\s+Invalid user\s+(?P<username>\S+)\s+from\s+(?P<ip>[\d.]+|[0-9a-fA-F:]+)\s+port\s+(?P<port>\d+)",
    )
    .expect("invalid user regex")
});

static DISCONNECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<timestamp>\w+\s+\d+\s+[\d:]+)\s+\S+\s+sshd\[(?P<pid>\d+)\]:\s+(?:Disconnected from|Received disconnect from)\s+(?:authenticating\s+)?(?:user\s+(?P<username>\S+)\s+)?(?P<ip>[\d.]+|[0-9a-fA-F:]+)\s+port\s+(?P<port>\d+)",
    )
    .expect("disconnect regex")
});

// AIX syslog: `Mon DD HH:MM:SS hostname auth|security:info sshd[PID]: message`

static AIX_ACCEPTED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<timestamp>\w+\s+\d+\s+[\d:]+)\s+\S+\s+(?:auth|security)[|:]\S*\s+sshd\[(?P<pid>\d+)\]:\s+Accepted\s+(?P<method>publickey|password|keyboard-interactive)\s+for\s+(?P<username>\S+)\s+from\s+(?P<ip>[\d.]+|[0-9a-fA-F:]+)\s+port\s+(?P<port>\d+)(?:\s+ssh2:\s+\S+\s+(?P<fingerprint>\S+))?",
    )
    .expect("aix accepted regex")
});

static AIX_FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<timestamp>\w+\s+\d+\s+[\d:]+)\s+\S+\s+(?:auth|security)[|:]\S*\s+sshd\[(?P<pid>\d+)\]:\s+Failed\s+(?P<method>publickey|password|keyboard-interactive)\s+for\s+(?:invalid user\s+)?(?P<username>\S+)\s+from\s+(?P<ip>[\d.]+|[0-9a-fA-F:]+)\s+port\s+(?P<port>\d+)(?:\s+ssh2:\s+\S+\s+(?P<fingerprint>\S+))?",
    )
    .expect("aix failed regex")
});

static SUDO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<timestamp>\w+\s+\d+\s+[\d:]+)\s+\S+\s+sudo(?:\[\d+\])?:\s+(?P<username>\S+)\s+:\s+TTY=(?P<tty>\S+)\s+;\s+PWD=(?P<pwd>\S+)\s+;\s+USER=(?P<target_user>\S+)\s+;\s+COMMAND=(?P<command>.+)",
    )
    .expect("sudo regex")
});

static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("ws regex"));

/// Parse a syslog timestamp like `Jan  5 14:23:01`.
///
/// The year is seeded from `reference_time` (the file's mtime) or the
/// current year, then corrected:
/// - an event cannot postdate the file's mtime, so a seeded result past
///   `reference_time` belongs to the previous year (Dec lines in a file
///   whose mtime is January);
/// - a jump of more than [`YEAR_ROLLOVER_DAYS`] days backwards from
///   `last_timestamp` means the file crossed a year boundary.
fn parse_syslog_timestamp(
    ts_str: &str,
    reference_time: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let seed_year = reference_time
        .unwrap_or_else(Utc::now)
        .format("%Y")
        .to_string()
        .parse::<i32>()
        .ok()?;
    // Syslog pads single-digit days with a double space.
    let normalized = WS_RE.replace_all(ts_str.trim(), " ");

    let parse_with = |year: i32| -> Option<DateTime<Utc>> {
        let composed = format!("{year} {normalized}");
        NaiveDateTime::parse_from_str(&composed, "%Y %b %d %H:%M:%S")
            .ok()
            .map(|naive| Utc.from_utc_datetime(&naive))
    };

    let dt = parse_with(seed_year)?;

    if let Some(reference) = reference_time {
        if dt > reference + chrono::Duration::days(1) {
            return parse_with(seed_year - 1);
        }
    }
    if let Some(last) = last_timestamp {
        if (last - dt).num_days() > YEAR_ROLLOVER_DAYS {
            return parse_with(seed_year - 1);
        }
    }
    Some(dt)
}

/// Parse a single log line. `None` for lines that are not SSH auth events.
pub fn parse_line(
    line: &str,
    os_type: OsType,
    reference_time: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
) -> Option<ParsedAuthEvent> {
    let line = line.trim();
    if line.is_empty() || !line.contains("sshd[") {
        return None;
    }

    let patterns: &[(&LazyLock<Regex>, EventType)] = match os_type {
        OsType::Aix => &[
            (&AIX_ACCEPTED_RE, EventType::Accepted),
            (&AIX_FAILED_RE, EventType::Failed),
        ],
        _ => &[
            (&ACCEPTED_RE, EventType::Accepted),
            (&FAILED_RE, EventType::Failed),
            (&INVALID_USER_RE, EventType::InvalidUser),
            (&DISCONNECT_RE, EventType::Disconnect),
        ],
    };

    for (pattern, event_type) in patterns {
        let Some(caps) = pattern.captures(line) else {
            continue;
        };

        let timestamp =
            parse_syslog_timestamp(&caps["timestamp"], reference_time, last_timestamp)?;
        return Some(ParsedAuthEvent {
            timestamp,
            source_ip: caps["ip"].to_string(),
            username: caps
                .name("username")
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            auth_method: caps.name("method").and_then(|m| AuthMethod::parse(m.as_str())),
            event_type: *event_type,
            fingerprint: caps.name("fingerprint").map(|m| m.as_str().to_string()),
            port: caps.name("port").and_then(|m| m.as_str().parse().ok()),
            pid: caps.name("pid").and_then(|m| m.as_str().parse().ok()),
            raw_line: line.to_string(),
        });
    }

    None
}

/// Parse a whole log body in file order.
///
/// Timestamps are non-decreasing modulo year-rollover corrections; events
/// at or before `watermark` are discarded and counted.
pub fn parse_log(
    content: &str,
    os_type: OsType,
    reference_time: Option<DateTime<Utc>>,
    watermark: Option<DateTime<Utc>>,
) -> LogParseOutcome {
    let mut outcome = LogParseOutcome::default();
    let mut last_ts: Option<DateTime<Utc>> = None;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match parse_line(trimmed, os_type, reference_time, last_ts) {
            Some(event) => {
                last_ts = Some(event.timestamp);
                if let Some(wm) = watermark {
                    if event.timestamp <= wm {
                        outcome.below_watermark += 1;
                        continue;
                    }
                }
                outcome.events.push(event);
            }
            None => {
                if trimmed.contains("sshd[") {
                    outcome.malformed_lines += 1;
                }
            }
        }
    }

    outcome
}

/// Parse one `journalctl --output=json` line.
///
/// Journald records carry a real `__REALTIME_TIMESTAMP` (microseconds since
/// epoch), so year-rollover handling does not apply.
pub fn parse_journal_line(json_line: &str) -> Option<ParsedAuthEvent> {
    let data: serde_json::Value = serde_json::from_str(json_line).ok()?;

    let identifier = data.get("SYSLOG_IDENTIFIER").and_then(|v| v.as_str())?;
    if !identifier.contains("sshd") {
        return None;
    }
    let message = data.get("MESSAGE").and_then(|v| v.as_str())?;
    if message.is_empty() {
        return None;
    }

    let timestamp = data
        .get("__REALTIME_TIMESTAMP")
        .and_then(|v| v.as_str())
        .and_then(|us| us.parse::<i64>().ok())
        .and_then(|us| Utc.timestamp_micros(us).single())
        .unwrap_or_else(Utc::now);

    let pid = data
        .get("_PID")
        .and_then(|v| v.as_str())
        .and_then(|p| p.parse::<u32>().ok());

    // Reuse the syslog patterns by composing a synthetic line, then swap the
    // timestamp for the journald one.
    let synthetic = format!(
        "Jan  1 00:00:00 host sshd[{}]: {message}",
        pid.unwrap_or(0)
    );
    let mut event = parse_line(&synthetic, OsType::Linux, None, None)?;
    event.timestamp = timestamp;
    event.pid = pid.or(event.pid);
    event.raw_line = json_line.to_string();
    Some(event)
}

/// Parse multi-line journalctl JSON output, applying the watermark.
pub fn parse_journal_output(content: &str, watermark: Option<DateTime<Utc>>) -> LogParseOutcome {
    let mut outcome = LogParseOutcome::default();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_journal_line(trimmed) {
            Some(event) => {
                if let Some(wm) = watermark {
                    if event.timestamp <= wm {
                        outcome.below_watermark += 1;
                        continue;
                    }
                }
                outcome.events.push(event);
            }
            None => {
                if trimmed.contains("sshd") {
                    outcome.malformed_lines += 1;
                }
            }
        }
    }

    outcome
}

/// Parse a sudo syslog line.
pub fn parse_sudo_line(
    line: &str,
    reference_time: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
) -> Option<ParsedSudoEvent> {
    let line = line.trim();
    if line.is_empty() || !line.contains("sudo") {
        return None;
    }

    let caps = SUDO_RE.captures(line)?;
    let timestamp = parse_syslog_timestamp(&caps["timestamp"], reference_time, last_timestamp)?;

    Some(ParsedSudoEvent {
        timestamp,
        username: caps["username"].to_string(),
        tty: caps["tty"].to_string(),
        working_dir: caps["pwd"].to_string(),
        target_user: caps["target_user"].to_string(),
        command: caps["command"].trim().to_string(),
        raw_line: line.to_string(),
    })
}

/// Auth log candidates per OS, in probe order.
pub fn detect_log_paths(os_type: OsType) -> &'static [&'static str] {
    match os_type {
        OsType::Aix => &["/var/adm/syslog", "/var/log/syslog"],
        _ => &["/var/log/auth.log", "/var/log/secure"],
    }
}
