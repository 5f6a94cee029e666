//! Read operations: lookups, batched prefetch maps, and reports.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use keyspider_core::types::{
    AccessEvent, AccessPath, AgentStatus, AuthMethod, EventType, KeyLocation, KeyType, LogSource,
    OsType, ScanJob, ScanJobStatus, ScanJobType, Server, ServerId, Severity, SshKey, SshKeyId,
    UnreachableSource, WatchSession, WatchStatus,
};
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::Serialize;

use crate::store::{Result, Store, StoreError};

// ── Report rows ───────────────────────────────────────────────────

/// An authorized key never seen in an accepted event on its server.
#[derive(Debug, Clone, Serialize)]
pub struct DormantKeyItem {
    pub ssh_key_id: SshKeyId,
    pub fingerprint_sha256: String,
    pub key_type: KeyType,
    pub comment: Option<String>,
    pub server_id: ServerId,
    pub server_hostname: String,
    pub file_path: String,
    pub first_seen_at: DateTime<Utc>,
    pub days_since_first_seen: i64,
}

/// A fingerprint accepted on a server with no key location there.
#[derive(Debug, Clone, Serialize)]
pub struct MysteryKeyItem {
    pub fingerprint: String,
    pub server_id: ServerId,
    pub server_hostname: String,
    pub last_source_ip: String,
    pub last_username: String,
    pub event_count: i64,
    pub last_seen_at: DateTime<Utc>,
}

/// An authorized key whose last accepted use is older than the threshold.
#[derive(Debug, Clone, Serialize)]
pub struct StaleKeyItem {
    pub ssh_key_id: SshKeyId,
    pub fingerprint_sha256: String,
    pub server_id: ServerId,
    pub server_hostname: String,
    pub file_path: String,
    pub last_used_at: DateTime<Utc>,
    pub days_since_last_use: i64,
}

/// A key present on more than one server.
#[derive(Debug, Clone, Serialize)]
pub struct KeyExposureItem {
    pub ssh_key_id: SshKeyId,
    pub fingerprint_sha256: String,
    pub key_type: KeyType,
    pub comment: Option<String>,
    pub server_count: i64,
    pub servers: Vec<String>,
}

impl Store {
    // ── Servers ──────────────────────────────────────────────────

    pub fn get_server(&self, id: ServerId) -> Result<Server> {
        self.conn()
            .query_row(
                &format!("{SERVER_SELECT} WHERE id = ?1"),
                params![id.0],
                map_server,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("server {id}")))
    }

    /// First server registered with this IP, on any port.
    pub fn find_server_by_ip(&self, ip: &str) -> Result<Option<Server>> {
        Ok(self
            .conn()
            .query_row(
                &format!("{SERVER_SELECT} WHERE ip_address = ?1 ORDER BY id LIMIT 1"),
                params![ip],
                map_server,
            )
            .optional()?)
    }

    pub fn list_servers(&self) -> Result<Vec<Server>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SERVER_SELECT} ORDER BY id"))?;
        let rows = stmt.query_map([], map_server)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Batched `ip → server id` prefetch for event correlation.
    pub fn server_ids_by_ips(&self, ips: &HashSet<String>) -> Result<HashMap<String, ServerId>> {
        if ips.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ips.len()].join(", ");
        let sql = format!(
            "SELECT ip_address, MIN(id) FROM servers
             WHERE ip_address IN ({placeholders}) GROUP BY ip_address"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ips.iter()), |row| {
            Ok((row.get::<_, String>(0)?, ServerId(row.get(1)?)))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ── Keys ─────────────────────────────────────────────────────

    pub fn get_ssh_key(&self, id: SshKeyId) -> Result<SshKey> {
        self.conn()
            .query_row(
                &format!("{KEY_SELECT} WHERE id = ?1"),
                params![id.0],
                map_key,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("ssh key {id}")))
    }

    pub fn find_key_by_fingerprint(&self, fingerprint_sha256: &str) -> Result<Option<SshKey>> {
        Ok(self
            .conn()
            .query_row(
                &format!("{KEY_SELECT} WHERE fingerprint_sha256 = ?1"),
                params![fingerprint_sha256],
                map_key,
            )
            .optional()?)
    }

    /// Batched key lookup by id, for decorating graph edges.
    pub fn keys_by_ids(&self, ids: &HashSet<SshKeyId>) -> Result<HashMap<SshKeyId, SshKey>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("{KEY_SELECT} WHERE id IN ({placeholders})");
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter().map(|k| k.0)), map_key)?;
        rows.map(|r| r.map(|k| (k.id, k)))
            .collect::<rusqlite::Result<_>>()
            .map_err(Into::into)
    }

    /// Batched `fingerprint → key id` prefetch for event correlation.
    pub fn key_ids_by_fingerprints(
        &self,
        fingerprints: &HashSet<String>,
    ) -> Result<HashMap<String, SshKeyId>> {
        if fingerprints.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; fingerprints.len()].join(", ");
        let sql = format!(
            "SELECT fingerprint_sha256, id FROM ssh_keys
             WHERE fingerprint_sha256 IN ({placeholders})"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(fingerprints.iter()), |row| {
            Ok((row.get::<_, String>(0)?, SshKeyId(row.get(1)?)))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn key_locations_for_server(&self, server_id: ServerId) -> Result<Vec<KeyLocation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{LOCATION_SELECT} WHERE server_id = ?1"))?;
        let rows = stmt.query_map(params![server_id.0], map_location)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Key ids with an `authorized_keys` location on the server.
    pub fn authorized_key_ids(&self, server_id: ServerId) -> Result<HashSet<SshKeyId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT ssh_key_id FROM key_locations
             WHERE server_id = ?1 AND file_type = 'authorized_keys'",
        )?;
        let rows = stmt.query_map(params![server_id.0], |row| Ok(SshKeyId(row.get(0)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ── Events ───────────────────────────────────────────────────

    pub fn events_for_target(&self, server_id: ServerId) -> Result<Vec<AccessEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{EVENT_SELECT} WHERE target_server_id = ?1 ORDER BY event_time"
        ))?;
        let rows = stmt.query_map(params![server_id.0], map_event)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn count_events(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM access_events", [], |row| row.get(0))?)
    }

    // ── Paths ────────────────────────────────────────────────────

    pub fn list_active_paths(&self) -> Result<Vec<AccessPath>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{PATH_SELECT} WHERE is_active = 1"))?;
        let rows = stmt.query_map([], map_path)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn paths_for_key(&self, key_id: SshKeyId) -> Result<Vec<AccessPath>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{PATH_SELECT} WHERE is_active = 1 AND ssh_key_id = ?1"
        ))?;
        let rows = stmt.query_map(params![key_id.0], map_path)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn paths_touching_server(&self, server_id: ServerId) -> Result<Vec<AccessPath>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{PATH_SELECT} WHERE is_active = 1
             AND (source_server_id = ?1 OR target_server_id = ?1)"
        ))?;
        let rows = stmt.query_map(params![server_id.0], map_path)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ── Unreachable sources ──────────────────────────────────────

    pub fn list_unreachable(&self, only_unacknowledged: bool) -> Result<Vec<UnreachableSource>> {
        let sql = if only_unacknowledged {
            format!("{UNREACHABLE_SELECT} WHERE acknowledged = 0 ORDER BY severity, last_seen_at DESC")
        } else {
            format!("{UNREACHABLE_SELECT} ORDER BY severity, last_seen_at DESC")
        };
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], map_unreachable)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ── Per-server stats for graph nodes ─────────────────────────

    /// `(key_count, event_count)` per server id.
    pub fn server_stats(&self) -> Result<HashMap<ServerId, (i64, i64)>> {
        let conn = self.conn();
        let mut stats: HashMap<ServerId, (i64, i64)> = HashMap::new();

        let mut stmt = conn.prepare(
            "SELECT server_id, COUNT(*) FROM key_locations GROUP BY server_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((ServerId(row.get(0)?), row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (id, count) = row?;
            stats.entry(id).or_default().0 = count;
        }

        let mut stmt = conn.prepare(
            "SELECT target_server_id, COUNT(*) FROM access_events GROUP BY target_server_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((ServerId(row.get(0)?), row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (id, count) = row?;
            stats.entry(id).or_default().1 = count;
        }

        Ok(stats)
    }

    // ── Reports ──────────────────────────────────────────────────

    /// Authorized keys with zero accepted events on their server.
    pub fn dormant_keys(&self) -> Result<Vec<DormantKeyItem>> {
        let now = Utc::now();
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT k.id, k.fingerprint_sha256, k.key_type, k.comment, k.first_seen_at,
                    s.id, s.hostname, kl.file_path
             FROM key_locations kl
             JOIN ssh_keys k ON k.id = kl.ssh_key_id
             JOIN servers s ON s.id = kl.server_id
             WHERE kl.file_type = 'authorized_keys'
               AND NOT EXISTS (
                   SELECT 1 FROM access_events ae
                   WHERE ae.target_server_id = kl.server_id
                     AND ae.ssh_key_id = kl.ssh_key_id
                     AND ae.event_type = 'accepted')
             ORDER BY k.first_seen_at",
        )?;
        let rows = stmt.query_map([], |row| {
            let first_seen_at: DateTime<Utc> = row.get(4)?;
            Ok(DormantKeyItem {
                ssh_key_id: SshKeyId(row.get(0)?),
                fingerprint_sha256: row.get(1)?,
                key_type: KeyType::parse(&row.get::<_, String>(2)?),
                comment: row.get(3)?,
                first_seen_at,
                server_id: ServerId(row.get(5)?),
                server_hostname: row.get(6)?,
                file_path: row.get(7)?,
                days_since_first_seen: (now - first_seen_at).num_days(),
            })
        })?;
        let mut items: Vec<DormantKeyItem> = rows.collect::<rusqlite::Result<_>>()?;
        items.sort_by(|a, b| b.days_since_first_seen.cmp(&a.days_since_first_seen));
        Ok(items)
    }

    /// Accepted fingerprints with no key location on the target server.
    pub fn mystery_keys(&self) -> Result<Vec<MysteryKeyItem>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ae.fingerprint, ae.target_server_id, s.hostname, ae.source_ip,
                    ae.username, COUNT(*), MAX(ae.event_time)
             FROM access_events ae
             JOIN servers s ON s.id = ae.target_server_id
             WHERE ae.event_type = 'accepted'
               AND ae.fingerprint IS NOT NULL
               AND NOT EXISTS (
                   SELECT 1 FROM key_locations kl
                   JOIN ssh_keys k ON k.id = kl.ssh_key_id
                   WHERE kl.server_id = ae.target_server_id
                     AND k.fingerprint_sha256 = ae.fingerprint)
             GROUP BY ae.fingerprint, ae.target_server_id, ae.source_ip, ae.username
             ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MysteryKeyItem {
                fingerprint: row.get(0)?,
                server_id: ServerId(row.get(1)?),
                server_hostname: row.get(2)?,
                last_source_ip: row.get(3)?,
                last_username: row.get(4)?,
                event_count: row.get(5)?,
                last_seen_at: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Authorized keys last accepted before the cutoff.
    pub fn stale_keys(&self, cutoff: DateTime<Utc>) -> Result<Vec<StaleKeyItem>> {
        let now = Utc::now();
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT k.id, k.fingerprint_sha256, s.id, s.hostname, kl.file_path,
                    MAX(ae.event_time) AS last_used
             FROM key_locations kl
             JOIN ssh_keys k ON k.id = kl.ssh_key_id
             JOIN servers s ON s.id = kl.server_id
             JOIN access_events ae
               ON ae.target_server_id = kl.server_id
              AND ae.ssh_key_id = kl.ssh_key_id
              AND ae.event_type = 'accepted'
             WHERE kl.file_type = 'authorized_keys'
             GROUP BY kl.id
             HAVING last_used < ?1",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| {
            let last_used_at: DateTime<Utc> = row.get(5)?;
            Ok(StaleKeyItem {
                ssh_key_id: SshKeyId(row.get(0)?),
                fingerprint_sha256: row.get(1)?,
                server_id: ServerId(row.get(2)?),
                server_hostname: row.get(3)?,
                file_path: row.get(4)?,
                last_used_at,
                days_since_last_use: (now - last_used_at).num_days(),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Keys present on more than one server.
    pub fn key_exposure(&self) -> Result<Vec<KeyExposureItem>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT k.id, k.fingerprint_sha256, k.key_type, k.comment,
                    COUNT(DISTINCT kl.server_id) AS server_count,
                    GROUP_CONCAT(DISTINCT s.hostname)
             FROM ssh_keys k
             JOIN key_locations kl ON kl.ssh_key_id = k.id
             JOIN servers s ON s.id = kl.server_id
             GROUP BY k.id
             HAVING server_count > 1
             ORDER BY server_count DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let servers: String = row.get(5)?;
            Ok(KeyExposureItem {
                ssh_key_id: SshKeyId(row.get(0)?),
                fingerprint_sha256: row.get(1)?,
                key_type: KeyType::parse(&row.get::<_, String>(2)?),
                comment: row.get(3)?,
                server_count: row.get(4)?,
                servers: servers.split(',').map(String::from).collect(),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ── Jobs, watch sessions, agents ─────────────────────────────

    pub fn get_scan_job(&self, id: i64) -> Result<ScanJob> {
        self.conn()
            .query_row(&format!("{JOB_SELECT} WHERE id = ?1"), params![id], map_job)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("scan job {id}")))
    }

    pub fn get_watch_session(&self, id: i64) -> Result<WatchSession> {
        self.conn()
            .query_row(
                &format!("{WATCH_SELECT} WHERE id = ?1"),
                params![id],
                map_watch,
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("watch session {id}")))
    }

    /// The non-stopped session for a server, if any.
    pub fn active_watch_session(&self, server_id: ServerId) -> Result<Option<WatchSession>> {
        Ok(self
            .conn()
            .query_row(
                &format!(
                    "{WATCH_SELECT} WHERE server_id = ?1 AND status IN ('active', 'paused')
                     ORDER BY id DESC LIMIT 1"
                ),
                params![server_id.0],
                map_watch,
            )
            .optional()?)
    }

    pub fn find_agent_by_token_hash(&self, token_hash: &str) -> Result<Option<AgentStatus>> {
        Ok(self
            .conn()
            .query_row(
                &format!("{AGENT_SELECT} WHERE token_hash = ?1"),
                params![token_hash],
                map_agent,
            )
            .optional()?)
    }

    pub fn agent_for_server(&self, server_id: ServerId) -> Result<Option<AgentStatus>> {
        Ok(self
            .conn()
            .query_row(
                &format!("{AGENT_SELECT} WHERE server_id = ?1"),
                params![server_id.0],
                map_agent,
            )
            .optional()?)
    }

    /// Whether the server's agent heartbeated within `max_age_secs`.
    pub fn agent_active(&self, server_id: ServerId, max_age_secs: i64) -> Result<bool> {
        let Some(agent) = self.agent_for_server(server_id)? else {
            return Ok(false);
        };
        Ok(agent
            .last_heartbeat_at
            .map(|hb| (Utc::now() - hb).num_seconds() < max_age_secs)
            .unwrap_or(false))
    }
}

// ── Row mappers ───────────────────────────────────────────────────

const SERVER_SELECT: &str = "SELECT id, hostname, ip_address, os_type, os_version, ssh_port,
    is_reachable, prefer_agent, last_scanned_at, scan_watermark, last_log_size,
    discovered_via, created_at FROM servers";

fn map_server(row: &Row<'_>) -> rusqlite::Result<Server> {
    Ok(Server {
        id: ServerId(row.get(0)?),
        hostname: row.get(1)?,
        ip_address: row.get(2)?,
        os_type: OsType::parse(&row.get::<_, String>(3)?),
        os_version: row.get(4)?,
        ssh_port: row.get(5)?,
        is_reachable: row.get(6)?,
        prefer_agent: row.get(7)?,
        last_scanned_at: row.get(8)?,
        scan_watermark: row.get(9)?,
        last_log_size: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        discovered_via: row.get(11)?,
        created_at: row.get(12)?,
    })
}

const KEY_SELECT: &str = "SELECT id, fingerprint_sha256, fingerprint_md5, key_type, key_bits,
    public_key_data, comment, is_host_key, first_seen_at, file_mtime, estimated_age_days
    FROM ssh_keys";

fn map_key(row: &Row<'_>) -> rusqlite::Result<SshKey> {
    Ok(SshKey {
        id: SshKeyId(row.get(0)?),
        fingerprint_sha256: row.get(1)?,
        fingerprint_md5: row.get(2)?,
        key_type: KeyType::parse(&row.get::<_, String>(3)?),
        key_bits: row.get(4)?,
        public_key_data: row.get(5)?,
        comment: row.get(6)?,
        is_host_key: row.get(7)?,
        first_seen_at: row.get(8)?,
        file_mtime: row.get(9)?,
        estimated_age_days: row.get(10)?,
    })
}

const LOCATION_SELECT: &str = "SELECT id, ssh_key_id, server_id, file_path, file_type,
    unix_owner, unix_perms, file_mtime, file_size, last_verified_at FROM key_locations";

fn map_location(row: &Row<'_>) -> rusqlite::Result<KeyLocation> {
    Ok(KeyLocation {
        id: row.get(0)?,
        ssh_key_id: SshKeyId(row.get(1)?),
        server_id: ServerId(row.get(2)?),
        file_path: row.get(3)?,
        file_type: keyspider_core::types::FileType::parse(&row.get::<_, String>(4)?)
            .unwrap_or(keyspider_core::types::FileType::Identity),
        unix_owner: row.get(5)?,
        unix_perms: row.get(6)?,
        file_mtime: row.get(7)?,
        file_size: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        last_verified_at: row.get(9)?,
    })
}

const EVENT_SELECT: &str = "SELECT id, target_server_id, source_ip, source_server_id, ssh_key_id,
    fingerprint, username, auth_method, event_type, event_time, raw_log_line, log_source
    FROM access_events";

fn map_event(row: &Row<'_>) -> rusqlite::Result<AccessEvent> {
    Ok(AccessEvent {
        id: row.get(0)?,
        target_server_id: ServerId(row.get(1)?),
        source_ip: row.get(2)?,
        source_server_id: row.get::<_, Option<i64>>(3)?.map(ServerId),
        ssh_key_id: row.get::<_, Option<i64>>(4)?.map(SshKeyId),
        fingerprint: row.get(5)?,
        username: row.get(6)?,
        auth_method: row
            .get::<_, Option<String>>(7)?
            .and_then(|m| AuthMethod::parse(&m)),
        event_type: EventType::parse(&row.get::<_, String>(8)?).unwrap_or(EventType::Disconnect),
        event_time: row.get(9)?,
        raw_log_line: row.get(10)?,
        log_source: LogSource::parse(&row.get::<_, String>(11)?),
    })
}

const PATH_SELECT: &str = "SELECT id, source_server_id, target_server_id, ssh_key_id, username,
    first_seen_at, last_seen_at, event_count, is_active, is_authorized, is_used
    FROM access_paths";

fn map_path(row: &Row<'_>) -> rusqlite::Result<AccessPath> {
    Ok(AccessPath {
        id: row.get(0)?,
        source_server_id: row.get::<_, Option<i64>>(1)?.map(ServerId),
        target_server_id: ServerId(row.get(2)?),
        ssh_key_id: row.get::<_, Option<i64>>(3)?.map(SshKeyId),
        username: row.get(4)?,
        first_seen_at: row.get(5)?,
        last_seen_at: row.get(6)?,
        event_count: row.get(7)?,
        is_active: row.get(8)?,
        is_authorized: row.get(9)?,
        is_used: row.get(10)?,
    })
}

const UNREACHABLE_SELECT: &str = "SELECT id, source_ip, reverse_dns, fingerprint, ssh_key_id,
    target_server_id, username, first_seen_at, last_seen_at, event_count, severity, acknowledged
    FROM unreachable_sources";

fn map_unreachable(row: &Row<'_>) -> rusqlite::Result<UnreachableSource> {
    Ok(UnreachableSource {
        id: row.get(0)?,
        source_ip: row.get(1)?,
        reverse_dns: row.get(2)?,
        fingerprint: row.get(3)?,
        ssh_key_id: row.get::<_, Option<i64>>(4)?.map(SshKeyId),
        target_server_id: ServerId(row.get(5)?),
        username: row.get(6)?,
        first_seen_at: row.get(7)?,
        last_seen_at: row.get(8)?,
        event_count: row.get(9)?,
        severity: Severity::parse(&row.get::<_, String>(10)?).unwrap_or(Severity::High),
        acknowledged: row.get(11)?,
    })
}

const JOB_SELECT: &str = "SELECT id, job_type, status, initiated_by, seed_server_id, max_depth,
    servers_scanned, servers_failed, keys_found, events_parsed, unreachable_found,
    error_message, started_at, completed_at, created_at FROM scan_jobs";

fn map_job(row: &Row<'_>) -> rusqlite::Result<ScanJob> {
    Ok(ScanJob {
        id: row.get(0)?,
        job_type: ScanJobType::parse(&row.get::<_, String>(1)?).unwrap_or(ScanJobType::Spider),
        status: ScanJobStatus::parse(&row.get::<_, String>(2)?).unwrap_or(ScanJobStatus::Pending),
        initiated_by: row.get(3)?,
        seed_server_id: row.get::<_, Option<i64>>(4)?.map(ServerId),
        max_depth: row.get(5)?,
        servers_scanned: row.get(6)?,
        servers_failed: row.get(7)?,
        keys_found: row.get(8)?,
        events_parsed: row.get(9)?,
        unreachable_found: row.get(10)?,
        error_message: row.get(11)?,
        started_at: row.get(12)?,
        completed_at: row.get(13)?,
        created_at: row.get(14)?,
    })
}

const WATCH_SELECT: &str = "SELECT id, server_id, status, last_event_at, events_captured,
    auto_spider, spider_depth, error_message, started_at, stopped_at FROM watch_sessions";

fn map_watch(row: &Row<'_>) -> rusqlite::Result<WatchSession> {
    Ok(WatchSession {
        id: row.get(0)?,
        server_id: ServerId(row.get(1)?),
        status: WatchStatus::parse(&row.get::<_, String>(2)?).unwrap_or(WatchStatus::Error),
        last_event_at: row.get(3)?,
        events_captured: row.get(4)?,
        auto_spider: row.get(5)?,
        spider_depth: row.get(6)?,
        error_message: row.get(7)?,
        started_at: row.get(8)?,
        stopped_at: row.get(9)?,
    })
}

const AGENT_SELECT: &str = "SELECT id, server_id, token_hash, agent_version,
    last_heartbeat_at, last_event_at FROM agent_status";

fn map_agent(row: &Row<'_>) -> rusqlite::Result<AgentStatus> {
    Ok(AgentStatus {
        id: row.get(0)?,
        server_id: ServerId(row.get(1)?),
        token_hash: row.get(2)?,
        agent_version: row.get(3)?,
        last_heartbeat_at: row.get(4)?,
        last_event_at: row.get(5)?,
    })
}
