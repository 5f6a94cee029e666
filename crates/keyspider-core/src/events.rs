//! Observation payloads emitted by the crawl and watch pipelines.
//!
//! These are the shapes pushed to watcher subscribers and progress
//! callbacks, and serialized onto outbound result streams.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EventType, ServerId, Severity};

/// A live observation, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Observation {
    /// An auth event was parsed and persisted.
    AuthObserved {
        target_server_id: ServerId,
        source_ip: String,
        username: String,
        event_type: EventType,
        fingerprint: Option<String>,
        event_time: DateTime<Utc>,
    },
    /// A key location was discovered or re-verified.
    KeyObserved {
        server_id: ServerId,
        fingerprint_sha256: String,
        file_path: String,
    },
    /// A source IP was flagged unreachable.
    UnreachableFlagged {
        source_ip: String,
        target_server_id: ServerId,
        severity: Severity,
    },
    /// A watcher lost its connection and is backing off.
    WatchReconnecting {
        server_id: ServerId,
        delay_secs: u64,
    },
    /// A watcher session ended.
    WatchStopped {
        server_id: ServerId,
        events_captured: i64,
    },
}

/// Spider crawl progress, reported monotonically to the registered callback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpiderProgress {
    pub servers_scanned: u64,
    pub servers_failed: u64,
    pub keys_found: u64,
    pub events_parsed: u64,
    pub unreachable_found: u64,
    pub queue_depth: u64,
    pub current_depth: u32,
    pub current_server: String,
}
