//! Scripted SSH fleet for engine tests: in-memory hosts with files, a
//! journald flag, and per-host reachability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::stream::BoxStream;
use keyspider_scan::unreachable::ReachabilityProbe;
use keyspider_ssh::{ExecOutput, FileStat, SshDialer, SshError, SshSession};

#[derive(Clone, Default)]
pub struct FakeHost {
    /// path → (content, mode).
    pub files: HashMap<String, (String, u32)>,
    /// `journalctl` output; `None` means no journald on this host.
    pub journal: Option<String>,
    pub auth_fails: bool,
}

impl FakeHost {
    pub fn with_file(mut self, path: &str, content: &str, mode: u32) -> Self {
        self.files.insert(path.to_string(), (content.to_string(), mode));
        self
    }
}

pub struct FleetDialer {
    hosts: Mutex<HashMap<String, FakeHost>>,
    pub dials: AtomicUsize,
}

impl FleetDialer {
    pub fn new(hosts: &[(&str, FakeHost)]) -> Arc<Self> {
        Arc::new(Self {
            hosts: Mutex::new(
                hosts
                    .iter()
                    .map(|(ip, host)| (ip.to_string(), host.clone()))
                    .collect(),
            ),
            dials: AtomicUsize::new(0),
        })
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshDialer for FleetDialer {
    async fn dial(&self, host: &str, port: u16) -> Result<Arc<dyn SshSession>, SshError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let hosts = self.hosts.lock().unwrap();
        match hosts.get(host) {
            Some(fake) if fake.auth_fails => Err(SshError::AuthFailed {
                host: host.to_string(),
                port,
            }),
            Some(fake) => Ok(Arc::new(FleetSession { host: fake.clone() })),
            None => Err(SshError::ConnectFailed {
                host: host.to_string(),
                port,
                reason: "no route to host".to_string(),
            }),
        }
    }
}

pub struct FleetSession {
    host: FakeHost,
}

#[async_trait]
impl SshSession for FleetSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput, SshError> {
        if command.starts_with("journalctl") {
            if let Some(journal) = &self.host.journal {
                return Ok(ExecOutput {
                    exit_status: 0,
                    stdout: journal.clone(),
                    stderr: String::new(),
                });
            }
            return Ok(ExecOutput {
                exit_status: 1,
                stdout: String::new(),
                stderr: "journalctl: command not found".to_string(),
            });
        }
        Ok(ExecOutput {
            exit_status: 1,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn sftp_read(
        &self,
        path: &str,
        offset: u64,
        max_bytes: u64,
    ) -> Result<Option<Vec<u8>>, SshError> {
        Ok(self.host.files.get(path).map(|(content, _)| {
            let data = content.as_bytes();
            let start = (offset as usize).min(data.len());
            let end = (start + max_bytes as usize).min(data.len());
            data[start..end].to_vec()
        }))
    }

    async fn sftp_stat(&self, path: &str) -> Result<Option<FileStat>, SshError> {
        Ok(self.host.files.get(path).map(|(content, mode)| FileStat {
            size: content.len() as u64,
            mtime: Some(chrono::Utc::now()),
            mode: Some(*mode),
            uid: Some(0),
            gid: Some(0),
        }))
    }

    async fn sftp_list_dir(&self, _path: &str) -> Result<Option<Vec<String>>, SshError> {
        Ok(None)
    }

    async fn stream_lines(
        &self,
        _command: &str,
    ) -> Result<BoxStream<'static, std::io::Result<String>>, SshError> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

/// Probe backed by a fixed set of reachable IPs.
pub struct FleetProbe {
    reachable: Vec<String>,
}

impl FleetProbe {
    pub fn new(reachable: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            reachable: reachable.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl ReachabilityProbe for FleetProbe {
    async fn probe(&self, ip: &str, _port: u16) -> bool {
        self.reachable.iter().any(|r| r == ip)
    }
}

/// A valid ed25519 authorized_keys line with a deterministic body.
pub fn ed25519_key_line(seed: u8, comment: &str) -> String {
    let mut blob = Vec::new();
    for field in [b"ssh-ed25519".as_slice(), &[seed; 32]] {
        blob.extend_from_slice(&(field.len() as u32).to_be_bytes());
        blob.extend_from_slice(field);
    }
    format!("ssh-ed25519 {} {comment}", STANDARD.encode(&blob))
}
