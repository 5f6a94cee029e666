use thiserror::Error;

/// Top-level error type for the Keyspider platform.
#[derive(Error, Debug)]
pub enum KeyspiderError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] crate::fingerprint::FingerprintError),

    #[error("Scan error: {0}")]
    Scan(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
