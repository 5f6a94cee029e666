//! Configuration for Keyspider services.
//!
//! Loaded from `keyspider.toml` sections or `KEYSPIDER__`-prefixed
//! environment variables; every field has a serde default so a missing
//! config file yields a working setup.

use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration shared by the scanner, watcher, and agent
/// receiver.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeyspiderConfig {
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub spider: SpiderConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub unreachable: UnreachableConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub report: ReportConfig,
}

/// SSH transport and connection pool limits.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Private key used to authenticate from the jump host.
    #[serde(default = "default_key_path")]
    pub key_path: String,

    /// Optional known_hosts file; `None` disables host key checking.
    #[serde(default)]
    pub known_hosts: Option<String>,

    #[serde(default = "default_username")]
    pub username: String,

    /// Global cap on live SSH sessions.
    #[serde(default = "default_max_total")]
    pub max_total: usize,

    /// Cap on live sessions per target host.
    #[serde(default = "default_max_per_server")]
    pub max_per_server: usize,

    /// Dial timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Remote operation timeout in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// How long an acquire may wait for pool capacity, in seconds.
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_secs: u64,

    /// Dial attempts before giving up (auth failures are never retried).
    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpiderConfig {
    #[serde(default = "default_spider_depth")]
    pub default_depth: u32,

    /// Hard ceiling on BFS depth regardless of what a job requests.
    #[serde(default = "default_spider_max_depth")]
    pub max_depth: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    /// Initial reconnect backoff in seconds.
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Backoff cap in seconds.
    #[serde(default = "default_max_reconnect_delay")]
    pub max_reconnect_delay_secs: u64,

    /// Per-consumer fanout channel capacity. A full channel blocks the
    /// fanout task (backpressure); nothing is dropped.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Tail cap for the first scan of a server.
    #[serde(default = "default_max_lines")]
    pub max_lines_initial: usize,

    /// Tail cap for incremental re-scans and rotation recovery.
    #[serde(default = "default_max_lines")]
    pub max_lines_incremental: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnreachableConfig {
    /// Reachability cache TTL in seconds.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    /// Authorized keys whose last accepted event is older than this are
    /// reported stale.
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: i64,
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl WatcherConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }
}

impl UnreachableConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn default_key_path() -> String {
    "/root/.ssh/id_rsa".to_string()
}

fn default_username() -> String {
    "root".to_string()
}

fn default_max_total() -> usize {
    50
}

fn default_max_per_server() -> usize {
    3
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    30
}

fn default_acquire_timeout() -> u64 {
    60
}

fn default_dial_attempts() -> u32 {
    3
}

fn default_spider_depth() -> u32 {
    10
}

fn default_spider_max_depth() -> u32 {
    50
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_max_reconnect_delay() -> u64 {
    300
}

fn default_channel_capacity() -> usize {
    256
}

fn default_max_lines() -> usize {
    50_000
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_store_path() -> String {
    "./keyspider.db".to_string()
}

fn default_listen_addr() -> String {
    "127.0.0.1:8444".to_string()
}

fn default_stale_after_days() -> i64 {
    90
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_path: default_key_path(),
            known_hosts: None,
            username: default_username(),
            max_total: default_max_total(),
            max_per_server: default_max_per_server(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            acquire_timeout_secs: default_acquire_timeout(),
            dial_attempts: default_dial_attempts(),
        }
    }
}

impl Default for SpiderConfig {
    fn default() -> Self {
        Self {
            default_depth: default_spider_depth(),
            max_depth: default_spider_max_depth(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay(),
            max_reconnect_delay_secs: default_max_reconnect_delay(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_lines_initial: default_max_lines(),
            max_lines_incremental: default_max_lines(),
        }
    }
}

impl Default for UnreachableConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            stale_after_days: default_stale_after_days(),
        }
    }
}
