//! Connection management and schema.
//!
//! The store wraps one SQLite connection behind a mutex. Calls are short
//! synchronous operations; callers in async contexts never hold the lock
//! across an await point because the lock never leaves this crate.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the observation store. Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (and migrate) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        tracing::info!(path = %path.as_ref().display(), "Store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a fresh in-memory database. Used by tests and one-shot runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS servers (
            id INTEGER PRIMARY KEY,
            hostname TEXT NOT NULL,
            ip_address TEXT NOT NULL,
            os_type TEXT NOT NULL DEFAULT 'unknown',
            os_version TEXT,
            ssh_port INTEGER NOT NULL DEFAULT 22,
            is_reachable INTEGER NOT NULL DEFAULT 1,
            prefer_agent INTEGER NOT NULL DEFAULT 0,
            last_scanned_at TEXT,
            scan_watermark TEXT,
            last_log_size INTEGER,
            discovered_via TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (ip_address, ssh_port)
        );
        CREATE INDEX IF NOT EXISTS idx_servers_hostname ON servers (hostname);

        CREATE TABLE IF NOT EXISTS ssh_keys (
            id INTEGER PRIMARY KEY,
            fingerprint_sha256 TEXT NOT NULL UNIQUE,
            fingerprint_md5 TEXT,
            key_type TEXT NOT NULL,
            key_bits INTEGER,
            public_key_data TEXT,
            comment TEXT,
            is_host_key INTEGER NOT NULL DEFAULT 0,
            first_seen_at TEXT NOT NULL,
            file_mtime TEXT,
            estimated_age_days INTEGER
        );

        CREATE TABLE IF NOT EXISTS key_locations (
            id INTEGER PRIMARY KEY,
            ssh_key_id INTEGER NOT NULL REFERENCES ssh_keys (id) ON DELETE CASCADE,
            server_id INTEGER NOT NULL REFERENCES servers (id) ON DELETE CASCADE,
            file_path TEXT NOT NULL,
            file_type TEXT NOT NULL,
            unix_owner TEXT,
            unix_perms TEXT,
            graph_layer TEXT NOT NULL DEFAULT 'authorization',
            file_mtime TEXT,
            file_size INTEGER,
            last_verified_at TEXT,
            UNIQUE (ssh_key_id, server_id, file_path)
        );
        CREATE INDEX IF NOT EXISTS idx_key_locations_server ON key_locations (server_id);

        CREATE TABLE IF NOT EXISTS access_events (
            id INTEGER PRIMARY KEY,
            target_server_id INTEGER NOT NULL REFERENCES servers (id),
            source_ip TEXT NOT NULL,
            source_server_id INTEGER REFERENCES servers (id),
            ssh_key_id INTEGER REFERENCES ssh_keys (id),
            fingerprint TEXT,
            username TEXT NOT NULL,
            auth_method TEXT,
            event_type TEXT NOT NULL,
            event_time TEXT NOT NULL,
            raw_log_line TEXT NOT NULL,
            log_source TEXT NOT NULL DEFAULT 'syslog',
            UNIQUE (target_server_id, source_ip, username, event_type, event_time)
        );
        CREATE INDEX IF NOT EXISTS idx_access_events_target ON access_events (target_server_id);
        CREATE INDEX IF NOT EXISTS idx_access_events_fingerprint ON access_events (fingerprint);

        CREATE TABLE IF NOT EXISTS access_paths (
            id INTEGER PRIMARY KEY,
            source_server_id INTEGER REFERENCES servers (id),
            target_server_id INTEGER NOT NULL REFERENCES servers (id),
            ssh_key_id INTEGER REFERENCES ssh_keys (id),
            username TEXT,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            event_count INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            is_authorized INTEGER NOT NULL DEFAULT 0,
            is_used INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_access_paths_source ON access_paths (source_server_id);
        CREATE INDEX IF NOT EXISTS idx_access_paths_target ON access_paths (target_server_id);
        CREATE UNIQUE INDEX IF NOT EXISTS ux_access_paths_edge ON access_paths (
            COALESCE(source_server_id, 0),
            target_server_id,
            COALESCE(ssh_key_id, 0),
            COALESCE(username, '')
        );

        CREATE TABLE IF NOT EXISTS unreachable_sources (
            id INTEGER PRIMARY KEY,
            source_ip TEXT NOT NULL,
            reverse_dns TEXT,
            fingerprint TEXT,
            ssh_key_id INTEGER REFERENCES ssh_keys (id),
            target_server_id INTEGER NOT NULL REFERENCES servers (id),
            username TEXT,
            first_seen_at TEXT NOT NULL,
            last_seen_at TEXT NOT NULL,
            event_count INTEGER NOT NULL DEFAULT 1,
            severity TEXT NOT NULL DEFAULT 'high',
            acknowledged INTEGER NOT NULL DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_unreachable_ip ON unreachable_sources (source_ip);

        CREATE TABLE IF NOT EXISTS sudo_events (
            id INTEGER PRIMARY KEY,
            server_id INTEGER NOT NULL REFERENCES servers (id),
            username TEXT NOT NULL,
            tty TEXT NOT NULL,
            working_dir TEXT NOT NULL,
            target_user TEXT NOT NULL,
            command TEXT NOT NULL,
            event_time TEXT NOT NULL,
            success INTEGER NOT NULL DEFAULT 1,
            raw_log_line TEXT NOT NULL,
            UNIQUE (server_id, username, command, event_time)
        );

        CREATE TABLE IF NOT EXISTS scan_jobs (
            id INTEGER PRIMARY KEY,
            job_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            initiated_by TEXT NOT NULL,
            seed_server_id INTEGER REFERENCES servers (id),
            max_depth INTEGER NOT NULL DEFAULT 10,
            servers_scanned INTEGER NOT NULL DEFAULT 0,
            servers_failed INTEGER NOT NULL DEFAULT 0,
            keys_found INTEGER NOT NULL DEFAULT 0,
            events_parsed INTEGER NOT NULL DEFAULT 0,
            unreachable_found INTEGER NOT NULL DEFAULT 0,
            error_message TEXT,
            started_at TEXT,
            completed_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS watch_sessions (
            id INTEGER PRIMARY KEY,
            server_id INTEGER NOT NULL REFERENCES servers (id),
            status TEXT NOT NULL DEFAULT 'active',
            last_event_at TEXT,
            events_captured INTEGER NOT NULL DEFAULT 0,
            auto_spider INTEGER NOT NULL DEFAULT 0,
            spider_depth INTEGER NOT NULL DEFAULT 3,
            error_message TEXT,
            started_at TEXT NOT NULL,
            stopped_at TEXT
        );

        CREATE TABLE IF NOT EXISTS agent_status (
            id INTEGER PRIMARY KEY,
            server_id INTEGER NOT NULL UNIQUE REFERENCES servers (id),
            token_hash TEXT NOT NULL,
            agent_version TEXT,
            last_heartbeat_at TEXT,
            last_event_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_agent_token ON agent_status (token_hash);",
    )
}
