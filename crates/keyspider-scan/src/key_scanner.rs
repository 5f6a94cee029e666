//! Key material discovery on a remote server.
//!
//! Enumerates users from `/etc/passwd`, then reads `authorized_keys`,
//! identity public keys, and host keys, all over SFTP. Private key files
//! are recorded by path and permissions only; their contents are never
//! read, and the fingerprint comes from the sibling `.pub` when present.

use std::collections::HashSet;

use keyspider_core::fingerprint::{parse_public_key, ParsedKey};
use keyspider_core::types::FileType;
use keyspider_ssh::{FileStat, SftpReader, SshSession};
use keyspider_store::NewKeyObservation;

use crate::error::Result;

const PASSWD_MAX_BYTES: u64 = 1024 * 1024;
const KEY_FILE_MAX_BYTES: u64 = 1024 * 1024;

const IDENTITY_PUB_FILES: &[&str] = &[
    "id_rsa.pub",
    "id_ed25519.pub",
    "id_ecdsa.pub",
    "id_dsa.pub",
];

const PRIVATE_KEY_FILES: &[&str] = &["id_rsa", "id_ed25519", "id_ecdsa", "id_dsa"];

const HOST_KEY_FILES: &[&str] = &[
    "/etc/ssh/ssh_host_rsa_key.pub",
    "/etc/ssh/ssh_host_ed25519_key.pub",
    "/etc/ssh/ssh_host_ecdsa_key.pub",
    "/etc/ssh/ssh_host_dsa_key.pub",
];

/// Result of one key scan.
#[derive(Debug, Default)]
pub struct KeyScanOutcome {
    pub observations: Vec<NewKeyObservation>,
    /// Key lines that failed to parse.
    pub malformed_keys: usize,
}

/// Discover all public key material on a server.
pub async fn scan_server_keys(session: &dyn SshSession) -> Result<KeyScanOutcome> {
    let mut outcome = KeyScanOutcome::default();
    // Dedup by (path, fingerprint) within one scan.
    let mut seen: HashSet<(String, String)> = HashSet::new();

    let homes = user_home_dirs(session).await?;
    for (username, home) in &homes {
        scan_user_ssh_dir(session, username, home, &mut outcome, &mut seen).await;
    }

    scan_host_keys(session, &mut outcome, &mut seen).await;

    tracing::info!(
        keys = outcome.observations.len(),
        malformed = outcome.malformed_keys,
        users = homes.len(),
        "Key scan complete"
    );
    Ok(outcome)
}

/// Users with a login shell and a usable home directory, from `/etc/passwd`.
/// Falls back to root when the file is unreadable or empty.
async fn user_home_dirs(session: &dyn SshSession) -> Result<Vec<(String, String)>> {
    let Some(passwd) = SftpReader::read_file(session, "/etc/passwd", PASSWD_MAX_BYTES).await?
    else {
        tracing::warn!("Could not read /etc/passwd, scanning root only");
        return Ok(vec![("root".to_string(), "/root".to_string())]);
    };

    let mut users = Vec::new();
    for line in passwd.lines() {
        let fields: Vec<&str> = line.trim().split(':').collect();
        if fields.len() < 6 {
            continue;
        }
        let username = fields[0];
        let home = fields[5];
        let shell = fields.get(6).copied().unwrap_or("");

        if matches!(
            shell,
            "/sbin/nologin" | "/usr/sbin/nologin" | "/bin/false" | "/usr/bin/false"
        ) {
            continue;
        }
        if home.is_empty() || home.starts_with("/dev") {
            continue;
        }
        users.push((username.to_string(), home.to_string()));
    }

    if users.is_empty() {
        users.push(("root".to_string(), "/root".to_string()));
    }
    Ok(users)
}

async fn scan_user_ssh_dir(
    session: &dyn SshSession,
    username: &str,
    home: &str,
    outcome: &mut KeyScanOutcome,
    seen: &mut HashSet<(String, String)>,
) {
    let ssh_dir = format!("{home}/.ssh");

    for name in ["authorized_keys", "authorized_keys2"] {
        let path = format!("{ssh_dir}/{name}");
        scan_authorized_keys(session, &path, username, outcome, seen).await;
    }

    for name in IDENTITY_PUB_FILES {
        let path = format!("{ssh_dir}/{name}");
        scan_public_key_file(session, &path, username, FileType::Identity, false, outcome, seen)
            .await;
    }

    for name in PRIVATE_KEY_FILES {
        let path = format!("{ssh_dir}/{name}");
        scan_private_key(session, &path, username, outcome, seen).await;
    }
}

/// Parse every key line of an authorized_keys file.
async fn scan_authorized_keys(
    session: &dyn SshSession,
    path: &str,
    owner: &str,
    outcome: &mut KeyScanOutcome,
    seen: &mut HashSet<(String, String)>,
) {
    let content = match SftpReader::read_file(session, path, KEY_FILE_MAX_BYTES).await {
        Ok(Some(content)) => content,
        Ok(None) => return,
        Err(e) => {
            tracing::debug!(path = %path, error = %e, "authorized_keys read failed");
            return;
        }
    };
    let stat = stat_quiet(session, path).await;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_public_key(line) {
            Ok(parsed) => {
                push_observation(
                    outcome,
                    seen,
                    &parsed,
                    path,
                    FileType::AuthorizedKeys,
                    Some(owner),
                    stat.as_ref(),
                    false,
                );
            }
            Err(e) => {
                outcome.malformed_keys += 1;
                tracing::debug!(path = %path, error = %e, "Skipping malformed key line");
            }
        }
    }
}

/// Read a single-key public key file (identity or host key).
#[allow(clippy::too_many_arguments)]
async fn scan_public_key_file(
    session: &dyn SshSession,
    path: &str,
    owner: &str,
    file_type: FileType,
    is_host_key: bool,
    outcome: &mut KeyScanOutcome,
    seen: &mut HashSet<(String, String)>,
) {
    let content = match SftpReader::read_file(session, path, KEY_FILE_MAX_BYTES).await {
        Ok(Some(content)) => content,
        Ok(None) => return,
        Err(e) => {
            tracing::debug!(path = %path, error = %e, "Key file read failed");
            return;
        }
    };
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return;
    }

    match parse_public_key(trimmed) {
        Ok(parsed) => {
            let stat = stat_quiet(session, path).await;
            push_observation(
                outcome,
                seen,
                &parsed,
                path,
                file_type,
                Some(owner),
                stat.as_ref(),
                is_host_key,
            );
        }
        Err(e) => {
            outcome.malformed_keys += 1;
            tracing::debug!(path = %path, error = %e, "Skipping malformed key file");
        }
    }
}

/// Note a private key by path and permissions. The fingerprint is derived
/// from the sibling `.pub`; without one the file is skipped, because keys
/// are identified by fingerprint and we never read private contents.
async fn scan_private_key(
    session: &dyn SshSession,
    path: &str,
    owner: &str,
    outcome: &mut KeyScanOutcome,
    seen: &mut HashSet<(String, String)>,
) {
    let Some(stat) = stat_quiet(session, path).await else {
        return;
    };

    let pub_path = format!("{path}.pub");
    let Ok(Some(pub_content)) = SftpReader::read_file(session, &pub_path, KEY_FILE_MAX_BYTES).await
    else {
        tracing::debug!(path = %path, "Private key without readable .pub, skipping");
        return;
    };
    let Ok(parsed) = parse_public_key(pub_content.trim()) else {
        outcome.malformed_keys += 1;
        return;
    };

    push_observation(
        outcome,
        seen,
        &parsed,
        path,
        FileType::PrivateKey,
        Some(owner),
        Some(&stat),
        false,
    );
}

async fn scan_host_keys(
    session: &dyn SshSession,
    outcome: &mut KeyScanOutcome,
    seen: &mut HashSet<(String, String)>,
) {
    for path in HOST_KEY_FILES {
        scan_public_key_file(session, path, "root", FileType::HostKey, true, outcome, seen).await;
    }
}

#[allow(clippy::too_many_arguments)]
fn push_observation(
    outcome: &mut KeyScanOutcome,
    seen: &mut HashSet<(String, String)>,
    parsed: &ParsedKey,
    path: &str,
    file_type: FileType,
    owner: Option<&str>,
    stat: Option<&FileStat>,
    is_host_key: bool,
) {
    let fingerprint = parsed.sha256_fingerprint();
    if !seen.insert((path.to_string(), fingerprint.clone())) {
        return;
    }

    outcome.observations.push(NewKeyObservation {
        fingerprint_sha256: fingerprint,
        fingerprint_md5: Some(parsed.md5_fingerprint()),
        key_type: parsed.key_type,
        key_bits: parsed.key_bits(),
        // Never the blob for private key paths; this is the .pub body.
        public_key_data: match file_type {
            FileType::PrivateKey => None,
            _ => Some(format!("{} {}", parsed.type_token, parsed.body_b64)),
        },
        comment: parsed.comment.clone(),
        is_host_key,
        file_path: path.to_string(),
        file_type,
        unix_owner: owner.map(String::from),
        unix_perms: stat.and_then(FileStat::perm_octal),
        file_mtime: stat.and_then(|s| s.mtime),
        file_size: stat.map(|s| s.size),
    });
}

async fn stat_quiet(session: &dyn SshSession, path: &str) -> Option<FileStat> {
    match SftpReader::stat(session, path).await {
        Ok(stat) => stat,
        Err(e) => {
            tracing::debug!(path = %path, error = %e, "stat failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use futures::stream::BoxStream;
    use keyspider_ssh::{ExecOutput, SshError};

    use super::*;

    struct MemSession {
        files: HashMap<String, (Vec<u8>, u32)>,
    }

    impl MemSession {
        fn new(files: &[(&str, &str, u32)]) -> Arc<Self> {
            Arc::new(Self {
                files: files
                    .iter()
                    .map(|(p, c, mode)| (p.to_string(), (c.as_bytes().to_vec(), *mode)))
                    .collect(),
            })
        }
    }

    #[async_trait]
    impl SshSession for MemSession {
        async fn exec(&self, _command: &str) -> std::result::Result<ExecOutput, SshError> {
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
        ) -> std::result::Result<Option<Vec<u8>>, SshError> {
            Ok(self.files.get(path).map(|(data, _)| {
                let start = (offset as usize).min(data.len());
                let end = (start + max_bytes as usize).min(data.len());
                data[start..end].to_vec()
            }))
        }

        async fn sftp_stat(&self, path: &str) -> std::result::Result<Option<FileStat>, SshError> {
            Ok(self.files.get(path).map(|(data, mode)| FileStat {
                size: data.len() as u64,
                mtime: None,
                mode: Some(*mode),
                uid: Some(0),
                gid: Some(0),
            }))
        }

        async fn sftp_list_dir(&self, _path: &str) -> std::result::Result<Option<Vec<String>>, SshError> {
            Ok(None)
        }

        async fn stream_lines(
            &self,
            _command: &str,
        ) -> std::result::Result<BoxStream<'static, std::io::Result<String>>, SshError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn is_alive(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    fn ed25519_line(comment: &str) -> String {
        let mut blob = Vec::new();
        for field in [b"ssh-ed25519".as_slice(), &[0x7Au8; 32]] {
            blob.extend_from_slice(&(field.len() as u32).to_be_bytes());
            blob.extend_from_slice(field);
        }
        format!("ssh-ed25519 {} {comment}", STANDARD.encode(&blob))
    }

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
deploy:x:1001:1001::/home/deploy:/bin/bash
backup:x:34:34:backup:/var/backups:/usr/sbin/nologin";

    #[tokio::test]
    async fn passwd_filtering() {
        let session = MemSession::new(&[("/etc/passwd", PASSWD, 0o644)]);
        let users = user_home_dirs(&*session).await.unwrap();
        assert_eq!(
            users,
            vec![
                ("root".to_string(), "/root".to_string()),
                ("deploy".to_string(), "/home/deploy".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn missing_passwd_falls_back_to_root() {
        let session = MemSession::new(&[]);
        let users = user_home_dirs(&*session).await.unwrap();
        assert_eq!(users, vec![("root".to_string(), "/root".to_string())]);
    }

    #[tokio::test]
    async fn scans_authorized_keys_with_options_and_comments() {
        let key_line = ed25519_line("alice@jump");
        let ak = format!(
            "# managed by ansible\n\ncommand=\"/bin/backup\",from=\"10.0.0.0/8\" {key_line}\nnot a key line at all\n"
        );
        let session = MemSession::new(&[
            ("/etc/passwd", "deploy:x:1001:1001::/home/deploy:/bin/bash", 0o644),
            ("/home/deploy/.ssh/authorized_keys", &ak, 0o600),
        ]);

        let outcome = scan_server_keys(&*session).await.unwrap();
        let auth: Vec<_> = outcome
            .observations
            .iter()
            .filter(|o| o.file_type == FileType::AuthorizedKeys)
            .collect();
        assert_eq!(auth.len(), 1);
        assert_eq!(auth[0].comment.as_deref(), Some("alice@jump"));
        assert_eq!(auth[0].key_type, keyspider_core::types::KeyType::Ed25519);
        assert!(auth.iter().all(|o| o.unix_owner.as_deref() == Some("deploy")));
        assert!(auth.iter().all(|o| o.unix_perms.as_deref() == Some("0600")));
        assert_eq!(outcome.malformed_keys, 1);
    }

    #[tokio::test]
    async fn identity_and_private_keys() {
        let pub_line = ed25519_line("deploy@deploy-host");
        let session = MemSession::new(&[
            ("/etc/passwd", "deploy:x:1001:1001::/home/deploy:/bin/bash", 0o644),
            ("/home/deploy/.ssh/id_ed25519.pub", &pub_line, 0o644),
            ("/home/deploy/.ssh/id_ed25519", "PRIVATE KEY MATERIAL", 0o600),
        ]);

        let outcome = scan_server_keys(&*session).await.unwrap();

        let identity: Vec<_> = outcome
            .observations
            .iter()
            .filter(|o| o.file_type == FileType::Identity)
            .collect();
        assert_eq!(identity.len(), 1);
        assert!(identity[0].public_key_data.is_some());

        let private: Vec<_> = outcome
            .observations
            .iter()
            .filter(|o| o.file_type == FileType::PrivateKey)
            .collect();
        assert_eq!(private.len(), 1);
        assert_eq!(private[0].file_path, "/home/deploy/.ssh/id_ed25519");
        assert_eq!(private[0].unix_perms.as_deref(), Some("0600"));
        // Never private contents.
        assert!(private[0].public_key_data.is_none());
        assert_eq!(private[0].fingerprint_sha256, identity[0].fingerprint_sha256);
    }

    #[tokio::test]
    async fn private_key_without_pub_is_skipped() {
        let session = MemSession::new(&[
            ("/etc/passwd", "deploy:x:1001:1001::/home/deploy:/bin/bash", 0o644),
            ("/home/deploy/.ssh/id_rsa", "PRIVATE KEY MATERIAL", 0o600),
        ]);

        let outcome = scan_server_keys(&*session).await.unwrap();
        assert!(outcome.observations.is_empty());
    }

    #[tokio::test]
    async fn host_keys_are_flagged() {
        let host_line = ed25519_line("root@host");
        let session = MemSession::new(&[
            ("/etc/passwd", "root:x:0:0:root:/root:/bin/bash", 0o644),
            ("/etc/ssh/ssh_host_ed25519_key.pub", &host_line, 0o644),
        ]);

        let outcome = scan_server_keys(&*session).await.unwrap();
        let host: Vec<_> = outcome
            .observations
            .iter()
            .filter(|o| o.file_type == FileType::HostKey)
            .collect();
        assert_eq!(host.len(), 1);
        assert!(host[0].is_host_key);
        assert_eq!(host[0].unix_owner.as_deref(), Some("root"));
    }
}
