//! Error types for the discovery engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("SSH error: {0}")]
    Ssh(#[from] keyspider_ssh::SshError),

    #[error("Store error: {0}")]
    Store(#[from] keyspider_store::StoreError),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] keyspider_core::fingerprint::FingerprintError),

    #[error("Scan cancelled")]
    Cancelled,

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ScanError>;
