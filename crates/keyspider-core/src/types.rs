//! Core domain types for the SSH access graph.
//!
//! Observations (events, key locations) are append-mostly and produced by
//! the crawl/watch pipelines; aggregates (access paths, unreachable sources)
//! are derived rows keyed on natural identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Identifiers ───────────────────────────────────────────────────

/// Row id of a server in the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(pub i64);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Row id of an SSH key in the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SshKeyId(pub i64);

impl std::fmt::Display for SshKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Servers ───────────────────────────────────────────────────────

/// A host in the fleet, discovered manually or by the spider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub hostname: String,
    pub ip_address: String,
    pub os_type: OsType,
    pub os_version: Option<String>,
    pub ssh_port: u16,
    pub is_reachable: bool,
    pub prefer_agent: bool,
    pub last_scanned_at: Option<DateTime<Utc>>,
    /// Latest fully-processed event time; incremental scans discard events
    /// at or before this. Monotonically non-decreasing.
    pub scan_watermark: Option<DateTime<Utc>>,
    /// Last observed auth log size, for rotation detection.
    pub last_log_size: Option<u64>,
    pub discovered_via: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Linux,
    Aix,
    Unknown,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Aix => "aix",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "linux" => Self::Linux,
            "aix" => Self::Aix,
            _ => Self::Unknown,
        }
    }
}

// ── Keys ──────────────────────────────────────────────────────────

/// A public key identified by its SHA256 fingerprint.
///
/// Private key bytes are never stored; only the path and permissions of a
/// private key file are recorded via [`KeyLocation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshKey {
    pub id: SshKeyId,
    pub fingerprint_sha256: String,
    pub fingerprint_md5: Option<String>,
    pub key_type: KeyType,
    pub key_bits: Option<u32>,
    pub public_key_data: Option<String>,
    pub comment: Option<String>,
    pub is_host_key: bool,
    pub first_seen_at: DateTime<Utc>,
    /// Oldest observed mtime across all locations of this key.
    pub file_mtime: Option<DateTime<Utc>>,
    pub estimated_age_days: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Rsa,
    Ed25519,
    Ecdsa,
    Dsa,
    Unknown,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsa => "rsa",
            Self::Ed25519 => "ed25519",
            Self::Ecdsa => "ecdsa",
            Self::Dsa => "dsa",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "rsa" => Self::Rsa,
            "ed25519" => Self::Ed25519,
            "ecdsa" => Self::Ecdsa,
            "dsa" => Self::Dsa,
            _ => Self::Unknown,
        }
    }
}

/// Where a key was found on a server.
///
/// `graph_layer` is fixed at `"authorization"`: locations describe what a
/// host authorizes. The usage layer is derived from [`AccessEvent`]s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyLocation {
    pub id: i64,
    pub ssh_key_id: SshKeyId,
    pub server_id: ServerId,
    pub file_path: String,
    pub file_type: FileType,
    pub unix_owner: Option<String>,
    pub unix_perms: Option<String>,
    pub file_mtime: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub last_verified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    AuthorizedKeys,
    Identity,
    PrivateKey,
    HostKey,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthorizedKeys => "authorized_keys",
            Self::Identity => "identity",
            Self::PrivateKey => "private_key",
            Self::HostKey => "host_key",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authorized_keys" => Some(Self::AuthorizedKeys),
            "identity" => Some(Self::Identity),
            "private_key" => Some(Self::PrivateKey),
            "host_key" => Some(Self::HostKey),
            _ => None,
        }
    }
}

// ── Events ────────────────────────────────────────────────────────

/// A normalised SSH authentication event from a log line or an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessEvent {
    pub id: i64,
    pub target_server_id: ServerId,
    pub source_ip: String,
    pub source_server_id: Option<ServerId>,
    pub ssh_key_id: Option<SshKeyId>,
    pub fingerprint: Option<String>,
    pub username: String,
    pub auth_method: Option<AuthMethod>,
    pub event_type: EventType,
    pub event_time: DateTime<Utc>,
    pub raw_log_line: String,
    pub log_source: LogSource,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Accepted,
    Failed,
    InvalidUser,
    Disconnect,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Failed => "failed",
            Self::InvalidUser => "invalid_user",
            Self::Disconnect => "disconnect",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(Self::Accepted),
            "failed" => Some(Self::Failed),
            "invalid_user" => Some(Self::InvalidUser),
            "disconnect" => Some(Self::Disconnect),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    Publickey,
    Password,
    KeyboardInteractive,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publickey => "publickey",
            Self::Password => "password",
            Self::KeyboardInteractive => "keyboard-interactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publickey" => Some(Self::Publickey),
            "password" => Some(Self::Password),
            "keyboard-interactive" => Some(Self::KeyboardInteractive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Syslog,
    Journald,
    Agent,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syslog => "syslog",
            Self::Journald => "journald",
            Self::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "journald" => Self::Journald,
            "agent" => Self::Agent,
            _ => Self::Syslog,
        }
    }
}

/// A privilege escalation event from sudo syslog lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SudoEvent {
    pub id: i64,
    pub server_id: ServerId,
    pub username: String,
    pub tty: String,
    pub working_dir: String,
    pub target_user: String,
    pub command: String,
    pub event_time: DateTime<Utc>,
    pub success: bool,
    pub raw_log_line: String,
}

// ── Aggregates ────────────────────────────────────────────────────

/// An edge of the access graph, unique per
/// `(source_server, target_server, ssh_key, username)`.
///
/// `is_authorized` means a matching `authorized_keys` location exists on the
/// target; `is_used` means at least one accepted event was observed. Flags
/// OR-merge on conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessPath {
    pub id: i64,
    pub source_server_id: Option<ServerId>,
    pub target_server_id: ServerId,
    pub ssh_key_id: Option<SshKeyId>,
    pub username: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub event_count: i64,
    pub is_active: bool,
    pub is_authorized: bool,
    pub is_used: bool,
}

/// A source IP seen authenticating that the jump host cannot reach.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreachableSource {
    pub id: i64,
    pub source_ip: String,
    pub reverse_dns: Option<String>,
    pub fingerprint: Option<String>,
    pub ssh_key_id: Option<SshKeyId>,
    pub target_server_id: ServerId,
    pub username: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub event_count: i64,
    pub severity: Severity,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

// ── Jobs & sessions ───────────────────────────────────────────────

/// A crawl job. Terminal states (completed, failed, cancelled) are absorbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: i64,
    pub job_type: ScanJobType,
    pub status: ScanJobStatus,
    pub initiated_by: String,
    pub seed_server_id: Option<ServerId>,
    pub max_depth: u32,
    pub servers_scanned: i64,
    pub servers_failed: i64,
    pub keys_found: i64,
    pub events_parsed: i64,
    pub unreachable_found: i64,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanJobType {
    Full,
    Server,
    Spider,
}

impl ScanJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Server => "server",
            Self::Spider => "spider",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(Self::Full),
            "server" => Some(Self::Server),
            "spider" => Some(Self::Spider),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanJobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A live tail session on one server. At most one active per server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSession {
    pub id: i64,
    pub server_id: ServerId,
    pub status: WatchStatus,
    pub last_event_at: Option<DateTime<Utc>>,
    pub events_captured: i64,
    pub auto_spider: bool,
    pub spider_depth: u32,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WatchStatus {
    Active,
    Paused,
    Stopped,
    Error,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// On-host agent registration. The server stores only the SHA256 of the
/// agent's bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub id: i64,
    pub server_id: ServerId,
    pub token_hash: String,
    pub agent_version: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_serialization_roundtrip() {
        let server = Server {
            id: ServerId(7),
            hostname: "webprod".to_string(),
            ip_address: "10.1.2.3".to_string(),
            os_type: OsType::Linux,
            os_version: Some("Ubuntu 22.04".to_string()),
            ssh_port: 22,
            is_reachable: true,
            prefer_agent: false,
            last_scanned_at: Some(Utc::now()),
            scan_watermark: None,
            last_log_size: Some(1024),
            discovered_via: Some("manual".to_string()),
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&server).unwrap();
        let back: Server = serde_json::from_str(&json).unwrap();
        assert_eq!(server.id, back.id);
        assert_eq!(back.os_type, OsType::Linux);
    }

    #[test]
    fn enums_serialize_lowercase() {
        assert_eq!(serde_json::to_string(&OsType::Aix).unwrap(), "\"aix\"");
        assert_eq!(
            serde_json::to_string(&EventType::InvalidUser).unwrap(),
            "\"invalid_user\""
        );
        assert_eq!(
            serde_json::to_string(&AuthMethod::KeyboardInteractive).unwrap(),
            "\"keyboard-interactive\""
        );
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
    }

    #[test]
    fn enum_str_roundtrip() {
        for ft in [
            FileType::AuthorizedKeys,
            FileType::Identity,
            FileType::PrivateKey,
            FileType::HostKey,
        ] {
            assert_eq!(FileType::parse(ft.as_str()), Some(ft));
        }
        for et in [
            EventType::Accepted,
            EventType::Failed,
            EventType::InvalidUser,
            EventType::Disconnect,
        ] {
            assert_eq!(EventType::parse(et.as_str()), Some(et));
        }
        assert_eq!(OsType::parse("solaris"), OsType::Unknown);
    }

    #[test]
    fn terminal_job_states() {
        assert!(ScanJobStatus::Completed.is_terminal());
        assert!(ScanJobStatus::Cancelled.is_terminal());
        assert!(!ScanJobStatus::Running.is_terminal());
        assert!(!ScanJobStatus::Pending.is_terminal());
    }
}
