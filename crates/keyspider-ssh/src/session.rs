//! The transport seam: dialer and session traits.
//!
//! The engine never constructs sockets itself; it receives an
//! [`SshDialer`] at startup and leases [`SshSession`]s from the pool. File
//! content is always fetched over SFTP, never via remote shell, which keeps
//! command execution limited to the fixed probes the engine issues itself
//! (`journalctl`, `tail`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::Result;

/// Output of a remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_status: u32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

/// File metadata from SFTP stat.
#[derive(Debug, Clone, Default)]
pub struct FileStat {
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    /// Raw mode bits, when the server reports them.
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl FileStat {
    /// Permission bits as a zero-padded octal string, e.g. `"0644"`.
    pub fn perm_octal(&self) -> Option<String> {
        self.mode.map(|m| format!("{:04o}", m & 0o7777))
    }
}

/// An authenticated SSH session to one host.
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Run a fixed remote command and wait for it to exit.
    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    /// Read up to `max_bytes` starting at `offset` via SFTP.
    /// `Ok(None)` when the path does not exist.
    async fn sftp_read(&self, path: &str, offset: u64, max_bytes: u64) -> Result<Option<Vec<u8>>>;

    /// Stat a path via SFTP. `Ok(None)` when the path does not exist.
    async fn sftp_stat(&self, path: &str) -> Result<Option<FileStat>>;

    /// List directory entry names via SFTP. `Ok(None)` when the path does
    /// not exist.
    async fn sftp_list_dir(&self, path: &str) -> Result<Option<Vec<String>>>;

    /// Start a long-running command and stream its stdout line by line.
    async fn stream_lines(&self, command: &str)
        -> Result<BoxStream<'static, std::io::Result<String>>>;

    /// Cheap keepalive probe. Must not be called while holding pool locks.
    async fn is_alive(&self) -> bool;

    /// Close the session. Idempotent.
    async fn close(&self);
}

/// Dials new sessions. One implementation per transport.
#[async_trait]
pub trait SshDialer: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<Arc<dyn SshSession>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perm_octal_masks_file_type_bits() {
        let stat = FileStat {
            size: 10,
            mtime: None,
            mode: Some(0o100644),
            uid: Some(0),
            gid: Some(0),
        };
        assert_eq!(stat.perm_octal().as_deref(), Some("0644"));

        let none = FileStat::default();
        assert_eq!(none.perm_octal(), None);
    }
}
