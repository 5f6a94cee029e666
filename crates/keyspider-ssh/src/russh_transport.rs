//! Production SSH transport over russh + russh-sftp.
//!
//! One [`RusshSession`] wraps one authenticated connection. SFTP subsystems
//! are opened per operation on their own channel, so a stuck transfer never
//! wedges command execution on the same session.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use keyspider_core::config::SshConfig;
use russh::client;
use russh::keys::{load_secret_key, PrivateKeyWithHashAlg};
use russh::ChannelMsg;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::StatusCode;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::time::timeout;

use crate::error::{Result, SshError};
use crate::session::{ExecOutput, FileStat, SshDialer, SshSession};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Dialer that authenticates with the jump host's private key.
pub struct RusshDialer {
    config: SshConfig,
}

impl RusshDialer {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SshDialer for RusshDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<Arc<dyn SshSession>> {
        let client_config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        let handler = HostKeyPolicy {
            known_hosts: self.config.known_hosts.clone(),
            host: host.to_string(),
            port,
        };

        let mut handle = client::connect(client_config, (host, port), handler)
            .await
            .map_err(|e| SshError::ConnectFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;

        let key = load_secret_key(&self.config.key_path, None).map_err(|e| {
            SshError::ConnectFailed {
                host: host.to_string(),
                port,
                reason: format!("cannot load client key {}: {e}", self.config.key_path),
            }
        })?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| SshError::ConnectFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?
            .flatten();

        let auth = handle
            .authenticate_publickey(
                &self.config.username,
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(|e| SshError::ConnectFailed {
                host: host.to_string(),
                port,
                reason: e.to_string(),
            })?;

        if !auth.success() {
            return Err(SshError::AuthFailed {
                host: host.to_string(),
                port,
            });
        }

        tracing::debug!(host = %host, port, user = %self.config.username, "SSH session established");

        Ok(Arc::new(RusshSession {
            handle,
            host: host.to_string(),
            port,
            command_timeout: self.config.command_timeout(),
        }))
    }
}

/// Accepts the server key, or verifies it against a known_hosts file when
/// one is configured.
struct HostKeyPolicy {
    known_hosts: Option<String>,
    host: String,
    port: u16,
}

impl client::Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.known_hosts {
            None => Ok(true),
            Some(path) => {
                let known = russh::keys::known_hosts::check_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    path,
                )
                .unwrap_or(false);
                if !known {
                    tracing::warn!(host = %self.host, port = self.port, "Host key not in known_hosts");
                }
                Ok(known)
            }
        }
    }
}

pub struct RusshSession {
    handle: client::Handle<HostKeyPolicy>,
    host: String,
    port: u16,
    command_timeout: Duration,
}

impl RusshSession {
    async fn open_sftp(&self) -> Result<SftpSession> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))
    }
}

fn sftp_not_found(err: &russh_sftp::client::error::Error) -> bool {
    matches!(
        err,
        russh_sftp::client::error::Error::Status(status)
            if status.status_code == StatusCode::NoSuchFile
    )
}

#[async_trait]
impl SshSession for RusshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let run = async {
            let mut channel =
                self.handle
                    .channel_open_session()
                    .await
                    .map_err(|e| SshError::ConnectFailed {
                        host: self.host.clone(),
                        port: self.port,
                        reason: e.to_string(),
                    })?;
            channel
                .exec(true, command)
                .await
                .map_err(|e| SshError::Sftp(e.to_string()))?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut exit_status = 0u32;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext: 1 } => {
                        stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status: code } => exit_status = code,
                    _ => {}
                }
            }

            Ok(ExecOutput {
                exit_status,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        };

        timeout(self.command_timeout, run)
            .await
            .map_err(|_| SshError::Timeout(self.command_timeout))?
    }

    async fn sftp_read(&self, path: &str, offset: u64, max_bytes: u64) -> Result<Option<Vec<u8>>> {
        let run = async {
            let sftp = self.open_sftp().await?;
            let mut file = match sftp.open(path).await {
                Ok(f) => f,
                Err(e) if sftp_not_found(&e) => return Ok(None),
                Err(e) => return Err(SshError::Sftp(e.to_string())),
            };

            if offset > 0 {
                file.seek(SeekFrom::Start(offset))
                    .await
                    .map_err(SshError::Io)?;
            }

            let mut buf = Vec::new();
            file.take(max_bytes)
                .read_to_end(&mut buf)
                .await
                .map_err(SshError::Io)?;
            Ok(Some(buf))
        };

        timeout(self.command_timeout, run)
            .await
            .map_err(|_| SshError::Timeout(self.command_timeout))?
    }

    async fn sftp_stat(&self, path: &str) -> Result<Option<FileStat>> {
        let run = async {
            let sftp = self.open_sftp().await?;
            match sftp.metadata(path).await {
                Ok(attrs) => Ok(Some(FileStat {
                    size: attrs.size.unwrap_or(0),
                    mtime: attrs
                        .mtime
                        .and_then(|secs| DateTime::<Utc>::from_timestamp(i64::from(secs), 0)),
                    mode: attrs.permissions,
                    uid: attrs.uid,
                    gid: attrs.gid,
                })),
                Err(e) if sftp_not_found(&e) => Ok(None),
                Err(e) => Err(SshError::Sftp(e.to_string())),
            }
        };

        timeout(self.command_timeout, run)
            .await
            .map_err(|_| SshError::Timeout(self.command_timeout))?
    }

    async fn sftp_list_dir(&self, path: &str) -> Result<Option<Vec<String>>> {
        let run = async {
            let sftp = self.open_sftp().await?;
            match sftp.read_dir(path).await {
                Ok(entries) => Ok(Some(entries.map(|e| e.file_name()).collect())),
                Err(e) if sftp_not_found(&e) => Ok(None),
                Err(e) => Err(SshError::Sftp(e.to_string())),
            }
        };

        timeout(self.command_timeout, run)
            .await
            .map_err(|_| SshError::Timeout(self.command_timeout))?
    }

    async fn stream_lines(
        &self,
        command: &str,
    ) -> Result<BoxStream<'static, std::io::Result<String>>> {
        let mut channel =
            self.handle
                .channel_open_session()
                .await
                .map_err(|e| SshError::ConnectFailed {
                    host: self.host.clone(),
                    port: self.port,
                    reason: e.to_string(),
                })?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::Sftp(e.to_string()))?;

        let lines = BufReader::new(channel.into_stream()).lines();
        let stream = futures::stream::unfold(lines, |mut lines| async move {
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), lines)),
                Ok(None) => None,
                Err(e) => Some((Err(e), lines)),
            }
        });
        Ok(Box::pin(stream))
    }

    async fn is_alive(&self) -> bool {
        if self.handle.is_closed() {
            return false;
        }
        // Opening and closing a session channel doubles as a keepalive.
        match timeout(PROBE_TIMEOUT, self.handle.channel_open_session()).await {
            Ok(Ok(mut channel)) => {
                let _ = channel.close().await;
                true
            }
            _ => false,
        }
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
    }
}
