//! Error types for the SSH transport.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connect failed to {host}:{port}: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed for {host}:{port}")]
    AuthFailed { host: String, port: u16 },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("SFTP error: {0}")]
    Sftp(String),

    #[error("Session closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SshError {
    /// Auth failures are terminal; everything else may be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, SshError>;
