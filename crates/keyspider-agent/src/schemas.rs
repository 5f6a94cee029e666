//! Wire payloads for the agent protocol.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEventsPayload {
    pub events: Vec<AgentEvent>,
}

/// One auth event as reported by an agent. `timestamp` is RFC3339.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub timestamp: String,
    pub source_ip: String,
    pub username: String,
    pub auth_method: Option<String>,
    pub event_type: String,
    pub fingerprint: Option<String>,
    pub raw_line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSudoEventsPayload {
    pub events: Vec<AgentSudoEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSudoEvent {
    pub timestamp: String,
    pub username: String,
    pub tty: String,
    pub working_dir: String,
    pub target_user: String,
    pub command: String,
    #[serde(default = "default_true")]
    pub success: bool,
    pub raw_line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentKeyInventory {
    pub locations: Vec<AgentKeyItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentKeyItem {
    pub public_key_data: String,
    pub file_path: String,
    pub file_type: String,
    pub unix_owner: Option<String>,
    pub unix_permissions: Option<String>,
    /// RFC3339, when the agent knows it.
    pub file_mtime: Option<String>,
    pub file_size: Option<u64>,
    #[serde(default)]
    pub is_host_key: bool,
}

/// Generic accepted-count response for event and key batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub accepted: usize,
}

fn default_true() -> bool {
    true
}
