//! Write operations for the observation store.
//!
//! All mutations are idempotent upserts keyed on natural identifiers, so
//! re-scans and retries are safe. Path flags OR-merge on conflict;
//! watermarks only ever advance.

use chrono::{DateTime, Utc};
use keyspider_core::types::{
    OsType, ScanJob, ScanJobStatus, ScanJobType, Server, ServerId, Severity, SshKey, SshKeyId,
    WatchSession, WatchStatus,
};
use rusqlite::{params, OptionalExtension};

use crate::ingest::{NewAccessEvent, NewKeyObservation};
use crate::store::{Result, Store, StoreError};

impl Store {
    // ── Servers ──────────────────────────────────────────────────

    /// Get or create a server row keyed on `(ip_address, ssh_port)`.
    pub fn upsert_server(
        &self,
        hostname: &str,
        ip_address: &str,
        ssh_port: u16,
        os_type: OsType,
        discovered_via: Option<&str>,
    ) -> Result<Server> {
        let now = Utc::now();
        let conn = self.conn();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM servers WHERE ip_address = ?1 AND ssh_port = ?2",
                params![ip_address, ssh_port],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => id,
            None => {
                conn.execute(
                    "INSERT INTO servers
                         (hostname, ip_address, os_type, ssh_port, discovered_via, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        hostname,
                        ip_address,
                        os_type.as_str(),
                        ssh_port,
                        discovered_via,
                        now
                    ],
                )?;
                conn.last_insert_rowid()
            }
        };
        drop(conn);

        self.get_server(ServerId(id))
    }

    pub fn set_server_reachable(&self, id: ServerId, is_reachable: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE servers SET is_reachable = ?2 WHERE id = ?1",
            params![id.0, is_reachable],
        )?;
        Ok(())
    }

    pub fn set_prefer_agent(&self, id: ServerId, prefer_agent: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE servers SET prefer_agent = ?2 WHERE id = ?1",
            params![id.0, prefer_agent],
        )?;
        Ok(())
    }

    pub fn set_server_os(&self, id: ServerId, os_type: OsType) -> Result<()> {
        self.conn().execute(
            "UPDATE servers SET os_type = ?2 WHERE id = ?1",
            params![id.0, os_type.as_str()],
        )?;
        Ok(())
    }

    /// Advance the scan watermark. Regressions are ignored: the watermark
    /// is monotonically non-decreasing per server.
    pub fn advance_watermark(&self, id: ServerId, watermark: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE servers SET scan_watermark = ?2
             WHERE id = ?1 AND (scan_watermark IS NULL OR scan_watermark < ?2)",
            params![id.0, watermark],
        )?;
        Ok(())
    }

    pub fn set_last_log_size(&self, id: ServerId, size: u64) -> Result<()> {
        self.conn().execute(
            "UPDATE servers SET last_log_size = ?2 WHERE id = ?1",
            params![id.0, size as i64],
        )?;
        Ok(())
    }

    pub fn touch_last_scanned(&self, id: ServerId) -> Result<()> {
        self.conn().execute(
            "UPDATE servers SET last_scanned_at = ?2 WHERE id = ?1",
            params![id.0, Utc::now()],
        )?;
        Ok(())
    }

    // ── Keys ─────────────────────────────────────────────────────

    /// Get or create a key row keyed on the SHA256 fingerprint, merging
    /// metadata. The recorded `file_mtime` keeps the oldest observation.
    pub fn upsert_ssh_key(&self, obs: &NewKeyObservation) -> Result<SshKey> {
        let now = Utc::now();
        let conn = self.conn();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM ssh_keys WHERE fingerprint_sha256 = ?1",
                params![obs.fingerprint_sha256],
                |row| row.get(0),
            )
            .optional()?;

        let id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE ssh_keys SET
                         fingerprint_md5 = COALESCE(fingerprint_md5, ?2),
                         key_bits = COALESCE(key_bits, ?3),
                         public_key_data = COALESCE(public_key_data, ?4),
                         comment = COALESCE(comment, ?5),
                         is_host_key = is_host_key OR ?6,
                         file_mtime = CASE
                             WHEN ?7 IS NULL THEN file_mtime
                             WHEN file_mtime IS NULL OR ?7 < file_mtime THEN ?7
                             ELSE file_mtime
                         END
                     WHERE id = ?1",
                    params![
                        id,
                        obs.fingerprint_md5,
                        obs.key_bits,
                        obs.public_key_data,
                        obs.comment,
                        obs.is_host_key,
                        obs.file_mtime,
                    ],
                )?;
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO ssh_keys
                         (fingerprint_sha256, fingerprint_md5, key_type, key_bits,
                          public_key_data, comment, is_host_key, first_seen_at, file_mtime)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        obs.fingerprint_sha256,
                        obs.fingerprint_md5,
                        obs.key_type.as_str(),
                        obs.key_bits,
                        obs.public_key_data,
                        obs.comment,
                        obs.is_host_key,
                        now,
                        obs.file_mtime,
                    ],
                )?;
                conn.last_insert_rowid()
            }
        };

        conn.execute(
            "UPDATE ssh_keys SET estimated_age_days = CAST(
                 (julianday(?2) - julianday(file_mtime)) AS INTEGER)
             WHERE id = ?1 AND file_mtime IS NOT NULL",
            params![id, now],
        )?;
        drop(conn);

        self.get_ssh_key(SshKeyId(id))
    }

    /// Record a key location. Returns `true` when a new row was created;
    /// existing rows get their metadata and `last_verified_at` refreshed.
    pub fn upsert_key_location(
        &self,
        ssh_key_id: SshKeyId,
        server_id: ServerId,
        obs: &NewKeyObservation,
    ) -> Result<bool> {
        let now = Utc::now();
        let conn = self.conn();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM key_locations
                 WHERE ssh_key_id = ?1 AND server_id = ?2 AND file_path = ?3",
                params![ssh_key_id.0, server_id.0, obs.file_path],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE key_locations SET
                         unix_owner = ?2, unix_perms = ?3, file_mtime = ?4,
                         file_size = ?5, last_verified_at = ?6
                     WHERE id = ?1",
                    params![
                        id,
                        obs.unix_owner,
                        obs.unix_perms,
                        obs.file_mtime,
                        obs.file_size.map(|s| s as i64),
                        now
                    ],
                )?;
                Ok(false)
            }
            None => {
                conn.execute(
                    "INSERT INTO key_locations
                         (ssh_key_id, server_id, file_path, file_type, unix_owner,
                          unix_perms, file_mtime, file_size, last_verified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        ssh_key_id.0,
                        server_id.0,
                        obs.file_path,
                        obs.file_type.as_str(),
                        obs.unix_owner,
                        obs.unix_perms,
                        obs.file_mtime,
                        obs.file_size.map(|s| s as i64),
                        now
                    ],
                )?;
                Ok(true)
            }
        }
    }

    // ── Events & paths ───────────────────────────────────────────

    /// Insert an access event, deduplicated on its natural key. Returns
    /// `true` when the row is new.
    pub fn insert_access_event(
        &self,
        target_server_id: ServerId,
        source_server_id: Option<ServerId>,
        ssh_key_id: Option<SshKeyId>,
        event: &NewAccessEvent,
    ) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO access_events
                 (target_server_id, source_ip, source_server_id, ssh_key_id, fingerprint,
                  username, auth_method, event_type, event_time, raw_log_line, log_source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                target_server_id.0,
                event.source_ip,
                source_server_id.map(|s| s.0),
                ssh_key_id.map(|k| k.0),
                event.fingerprint,
                event.username,
                event.auth_method.map(|m| m.as_str()),
                event.event_type.as_str(),
                event.event_time,
                event.raw_log_line,
                event.log_source.as_str(),
            ],
        )?;
        Ok(inserted == 1)
    }

    /// Upsert an access path edge, OR-merging flags and bumping counters.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_access_path(
        &self,
        source_server_id: Option<ServerId>,
        target_server_id: ServerId,
        ssh_key_id: Option<SshKeyId>,
        username: Option<&str>,
        seen_at: DateTime<Utc>,
        is_authorized: bool,
        is_used: bool,
        event_increment: i64,
    ) -> Result<i64> {
        let conn = self.conn();

        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM access_paths
                 WHERE source_server_id IS ?1 AND target_server_id = ?2
                   AND ssh_key_id IS ?3 AND username IS ?4",
                params![
                    source_server_id.map(|s| s.0),
                    target_server_id.0,
                    ssh_key_id.map(|k| k.0),
                    username
                ],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE access_paths SET
                         first_seen_at = MIN(first_seen_at, ?2),
                         last_seen_at = MAX(last_seen_at, ?2),
                         event_count = event_count + ?3,
                         is_authorized = is_authorized OR ?4,
                         is_used = is_used OR ?5
                     WHERE id = ?1",
                    params![id, seen_at, event_increment, is_authorized, is_used],
                )?;
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO access_paths
                         (source_server_id, target_server_id, ssh_key_id, username,
                          first_seen_at, last_seen_at, event_count, is_authorized, is_used)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?7, ?8)",
                    params![
                        source_server_id.map(|s| s.0),
                        target_server_id.0,
                        ssh_key_id.map(|k| k.0),
                        username,
                        seen_at,
                        event_increment,
                        is_authorized,
                        is_used
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    /// Reconcile path flags against the stored evidence: a path is
    /// authorized iff an `authorized_keys` location exists on its target,
    /// used iff an accepted event references its key there.
    pub fn reconcile_path_flags(&self, target_server_id: ServerId) -> Result<()> {
        self.conn().execute(
            "UPDATE access_paths SET
                 is_authorized = EXISTS (
                     SELECT 1 FROM key_locations kl
                     WHERE kl.server_id = access_paths.target_server_id
                       AND kl.ssh_key_id = access_paths.ssh_key_id
                       AND kl.file_type = 'authorized_keys'),
                 is_used = EXISTS (
                     SELECT 1 FROM access_events ae
                     WHERE ae.target_server_id = access_paths.target_server_id
                       AND ae.ssh_key_id = access_paths.ssh_key_id
                       AND ae.event_type = 'accepted')
             WHERE target_server_id = ?1 AND ssh_key_id IS NOT NULL",
            params![target_server_id.0],
        )?;
        Ok(())
    }

    // ── Unreachable sources ──────────────────────────────────────

    /// Record (or refresh) an unreachable source sighting.
    ///
    /// Severity only ever escalates: a later sighting with weaker evidence
    /// (an incremental scan window holding only failed attempts) must not
    /// erase a recorded critical/high finding.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_unreachable_source(
        &self,
        source_ip: &str,
        target_server_id: ServerId,
        username: Option<&str>,
        fingerprint: Option<&str>,
        ssh_key_id: Option<SshKeyId>,
        reverse_dns: Option<&str>,
        severity: Severity,
    ) -> Result<i64> {
        let now = Utc::now();
        let conn = self.conn();

        let existing: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, severity FROM unreachable_sources
                 WHERE source_ip = ?1 AND target_server_id = ?2 AND username IS ?3",
                params![source_ip, target_server_id.0, username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match existing {
            Some((id, stored)) => {
                // Severity derives Ord with Critical first, so min() keeps
                // the more severe of the two.
                let merged = Severity::parse(&stored)
                    .map(|s| s.min(severity))
                    .unwrap_or(severity);
                conn.execute(
                    "UPDATE unreachable_sources SET
                         last_seen_at = ?2,
                         event_count = event_count + 1,
                         severity = ?3,
                         reverse_dns = COALESCE(?4, reverse_dns),
                         fingerprint = COALESCE(?5, fingerprint),
                         ssh_key_id = COALESCE(?6, ssh_key_id)
                     WHERE id = ?1",
                    params![
                        id,
                        now,
                        merged.as_str(),
                        reverse_dns,
                        fingerprint,
                        ssh_key_id.map(|k| k.0)
                    ],
                )?;
                Ok(id)
            }
            None => {
                conn.execute(
                    "INSERT INTO unreachable_sources
                         (source_ip, reverse_dns, fingerprint, ssh_key_id, target_server_id,
                          username, first_seen_at, last_seen_at, severity)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?8)",
                    params![
                        source_ip,
                        reverse_dns,
                        fingerprint,
                        ssh_key_id.map(|k| k.0),
                        target_server_id.0,
                        username,
                        now,
                        severity.as_str()
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            }
        }
    }

    pub fn acknowledge_unreachable(&self, id: i64, acknowledged: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE unreachable_sources SET acknowledged = ?2 WHERE id = ?1",
            params![id, acknowledged],
        )?;
        Ok(())
    }

    // ── Sudo events ──────────────────────────────────────────────

    pub fn insert_sudo_event(
        &self,
        server_id: ServerId,
        username: &str,
        tty: &str,
        working_dir: &str,
        target_user: &str,
        command: &str,
        event_time: DateTime<Utc>,
        success: bool,
        raw_log_line: &str,
    ) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO sudo_events
                 (server_id, username, tty, working_dir, target_user, command,
                  event_time, success, raw_log_line)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                server_id.0,
                username,
                tty,
                working_dir,
                target_user,
                command,
                event_time,
                success,
                raw_log_line
            ],
        )?;
        Ok(inserted == 1)
    }

    // ── Scan jobs ────────────────────────────────────────────────

    pub fn create_scan_job(
        &self,
        job_type: ScanJobType,
        initiated_by: &str,
        seed_server_id: Option<ServerId>,
        max_depth: u32,
    ) -> Result<ScanJob> {
        let now = Utc::now();
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO scan_jobs (job_type, initiated_by, seed_server_id, max_depth, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    job_type.as_str(),
                    initiated_by,
                    seed_server_id.map(|s| s.0),
                    max_depth,
                    now
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.get_scan_job(id)
    }

    /// Transition a job's status. Terminal states are absorbing: returns
    /// `false` without touching the row when the job already finished.
    pub fn set_job_status(
        &self,
        id: i64,
        status: ScanJobStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let current = self.get_scan_job(id)?;
        if current.status.is_terminal() {
            return Ok(false);
        }

        let now = Utc::now();
        let started_at = match (current.started_at, status) {
            (None, ScanJobStatus::Running) => Some(now),
            (existing, _) => existing,
        };
        let completed_at = if status.is_terminal() { Some(now) } else { None };

        self.conn().execute(
            "UPDATE scan_jobs SET status = ?2, error_message = ?3,
                 started_at = ?4, completed_at = ?5
             WHERE id = ?1",
            params![id, status.as_str(), error_message, started_at, completed_at],
        )?;
        Ok(true)
    }

    pub fn update_job_counters(
        &self,
        id: i64,
        servers_scanned: i64,
        servers_failed: i64,
        keys_found: i64,
        events_parsed: i64,
        unreachable_found: i64,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE scan_jobs SET servers_scanned = ?2, servers_failed = ?3,
                 keys_found = ?4, events_parsed = ?5, unreachable_found = ?6
             WHERE id = ?1",
            params![
                id,
                servers_scanned,
                servers_failed,
                keys_found,
                events_parsed,
                unreachable_found
            ],
        )?;
        Ok(())
    }

    // ── Watch sessions ───────────────────────────────────────────

    /// Start a watch session. At most one non-stopped session may exist per
    /// server.
    pub fn create_watch_session(
        &self,
        server_id: ServerId,
        auto_spider: bool,
        spider_depth: u32,
    ) -> Result<WatchSession> {
        if let Some(active) = self.active_watch_session(server_id)? {
            return Err(StoreError::Invalid(format!(
                "server {server_id} already has watch session {} ({})",
                active.id,
                active.status.as_str()
            )));
        }

        let now = Utc::now();
        let id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO watch_sessions (server_id, auto_spider, spider_depth, started_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![server_id.0, auto_spider, spider_depth, now],
            )?;
            conn.last_insert_rowid()
        };
        self.get_watch_session(id)
    }

    pub fn set_watch_status(
        &self,
        id: i64,
        status: WatchStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let stopped_at = match status {
            WatchStatus::Stopped | WatchStatus::Error => Some(Utc::now()),
            _ => None,
        };
        self.conn().execute(
            "UPDATE watch_sessions SET status = ?2, error_message = ?3,
                 stopped_at = COALESCE(?4, stopped_at)
             WHERE id = ?1",
            params![id, status.as_str(), error_message, stopped_at],
        )?;
        Ok(())
    }

    pub fn bump_watch_events(&self, id: i64, count: i64, last_event_at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE watch_sessions SET events_captured = events_captured + ?2,
                 last_event_at = ?3
             WHERE id = ?1",
            params![id, count, last_event_at],
        )?;
        Ok(())
    }

    // ── Agents ───────────────────────────────────────────────────

    /// Register an agent for a server, replacing any previous token hash.
    pub fn register_agent(&self, server_id: ServerId, token_hash: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO agent_status (server_id, token_hash) VALUES (?1, ?2)
             ON CONFLICT (server_id) DO UPDATE SET token_hash = excluded.token_hash",
            params![server_id.0, token_hash],
        )?;
        Ok(())
    }

    pub fn agent_heartbeat(&self, id: i64, agent_version: Option<&str>) -> Result<()> {
        self.conn().execute(
            "UPDATE agent_status SET last_heartbeat_at = ?2,
                 agent_version = COALESCE(?3, agent_version)
             WHERE id = ?1",
            params![id, Utc::now(), agent_version],
        )?;
        Ok(())
    }

    pub fn agent_touch_event(&self, id: i64) -> Result<()> {
        self.conn().execute(
            "UPDATE agent_status SET last_event_at = ?2 WHERE id = ?1",
            params![id, Utc::now()],
        )?;
        Ok(())
    }
}
