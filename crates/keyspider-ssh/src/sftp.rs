//! Bounded remote file reads over any [`SshSession`].
//!
//! Every read is capped so a corrupt or runaway file cannot exhaust memory
//! on the jump host. Absent paths are a distinguished `Ok(None)`, not an
//! error: missing `authorized_keys` files are the common case, not a fault.

use crate::error::Result;
use crate::session::{FileStat, SshSession};

/// Default byte cap for whole-file reads (10 MiB).
pub const DEFAULT_MAX_READ_BYTES: u64 = 10 * 1024 * 1024;

/// Default byte cap for tail reads (50 MiB).
pub const DEFAULT_TAIL_MAX_BYTES: u64 = 50 * 1024 * 1024;

pub struct SftpReader;

impl SftpReader {
    /// Read a whole file, capped at `max_bytes`.
    pub async fn read_file(
        session: &dyn SshSession,
        path: &str,
        max_bytes: u64,
    ) -> Result<Option<String>> {
        let Some(stat) = session.sftp_stat(path).await? else {
            return Ok(None);
        };
        if stat.size > max_bytes {
            tracing::warn!(
                path = %path,
                size = stat.size,
                max_bytes,
                "File exceeds read cap, truncating"
            );
        }

        let Some(raw) = session.sftp_read(path, 0, max_bytes).await? else {
            return Ok(None);
        };
        Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
    }

    /// Read the last `max_lines` lines of a file.
    ///
    /// Seeks close to the end (bounded by `max_bytes`), drops the leading
    /// partial line when the read did not start at offset zero, and trims to
    /// the requested line count.
    pub async fn read_file_tail(
        session: &dyn SshSession,
        path: &str,
        max_lines: usize,
        max_bytes: u64,
    ) -> Result<Option<String>> {
        let Some(stat) = session.sftp_stat(path).await? else {
            return Ok(None);
        };
        if stat.size == 0 {
            return Ok(Some(String::new()));
        }

        let read_size = stat.size.min(max_bytes);
        let offset = stat.size - read_size;

        let Some(raw) = session.sftp_read(path, offset, read_size).await? else {
            return Ok(None);
        };

        let content = String::from_utf8_lossy(&raw);
        let mut lines: Vec<&str> = content.lines().collect();
        if offset > 0 && !lines.is_empty() {
            lines.remove(0);
        }
        if lines.len() > max_lines {
            lines.drain(..lines.len() - max_lines);
        }
        Ok(Some(lines.join("\n")))
    }

    /// Stat a path. `Ok(None)` for absent paths.
    pub async fn stat(session: &dyn SshSession, path: &str) -> Result<Option<FileStat>> {
        session.sftp_stat(path).await
    }

    /// List directory entry names. `Ok(None)` for absent paths.
    pub async fn list_dir(session: &dyn SshSession, path: &str) -> Result<Option<Vec<String>>> {
        session.sftp_list_dir(path).await
    }

    /// Whether a path exists.
    pub async fn exists(session: &dyn SshSession, path: &str) -> Result<bool> {
        Ok(session.sftp_stat(path).await?.is_some())
    }
}
