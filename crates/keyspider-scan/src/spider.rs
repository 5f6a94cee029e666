//! Bounded-depth BFS crawl over the SSH trust graph.
//!
//! From a seed server, the spider parses auth logs, inventories key files,
//! correlates both into access paths, and follows reachable source IPs up
//! to `max_depth`. Per-server failures are counted and never abort the
//! crawl; cancellation is observed at server boundaries, after the
//! in-flight server's writes are committed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keyspider_core::config::KeyspiderConfig;
use keyspider_core::events::SpiderProgress;
use keyspider_core::types::{LogSource, OsType, ScanJobStatus, Server};
use keyspider_ssh::{ConnectionPool, SftpReader, SshError, SshSession};
use keyspider_store::{ingest, NewAccessEvent, Store};

use crate::error::{Result, ScanError};
use crate::log_parser::{self, LogParseOutcome};
use crate::key_scanner;
use crate::unreachable::{classify_severity, is_private_ip, UnreachableDetector};

/// Heartbeats older than this mean the agent is not authoritative.
const AGENT_FRESH_SECS: i64 = 300;

const LOG_TAIL_MAX_BYTES: u64 = 50 * 1024 * 1024;

pub type ProgressFn = Arc<dyn Fn(&SpiderProgress) + Send + Sync>;

/// What the auth log showed about one source IP, used for severity.
#[derive(Debug, Default, Clone)]
struct SourceEvidence {
    has_accepted_key: bool,
    accepted_root: bool,
    username: Option<String>,
    fingerprint: Option<String>,
}

pub struct SpiderEngine {
    pool: ConnectionPool,
    store: Store,
    detector: Arc<UnreachableDetector>,
    max_depth: u32,
    depth_ceiling: u32,
    max_lines_initial: usize,
    max_lines_incremental: usize,
    progress_callback: Option<ProgressFn>,
    cancelled: Arc<AtomicBool>,
    job_id: Option<i64>,
    progress: SpiderProgress,
    visited: HashSet<String>,
    enqueued: HashSet<String>,
    queue: VecDeque<(String, u16, u32)>,
}

impl SpiderEngine {
    pub fn new(
        pool: ConnectionPool,
        store: Store,
        detector: Arc<UnreachableDetector>,
        config: &KeyspiderConfig,
    ) -> Self {
        Self {
            pool,
            store,
            detector,
            max_depth: config.spider.default_depth.min(config.spider.max_depth),
            depth_ceiling: config.spider.max_depth,
            max_lines_initial: config.log.max_lines_initial,
            max_lines_incremental: config.log.max_lines_incremental,
            progress_callback: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            job_id: None,
            progress: SpiderProgress::default(),
            visited: HashSet::new(),
            enqueued: HashSet::new(),
            queue: VecDeque::new(),
        }
    }

    /// Requested depth, clamped to the configured hard ceiling.
    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth.min(self.depth_ceiling);
        self
    }

    pub fn with_progress(mut self, callback: ProgressFn) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Attach a scan job row; status and counters track the crawl.
    pub fn with_job(mut self, job_id: i64) -> Self {
        self.job_id = Some(job_id);
        self
    }

    /// Cancellation flag. Setting it stops the crawl at the next server
    /// boundary; the in-flight server's commit completes first.
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    /// Crawl from a seed. Returns the final progress counters.
    pub async fn crawl(mut self, seed_host: &str, seed_port: u16) -> Result<SpiderProgress> {
        if let Some(job_id) = self.job_id {
            self.store.set_job_status(job_id, ScanJobStatus::Running, None)?;
        }

        self.enqueue(seed_host, seed_port, 0);

        while let Some((host, port, depth)) = self.queue.pop_front() {
            if self.cancelled.load(Ordering::SeqCst) {
                tracing::info!("Crawl cancelled, stopping at server boundary");
                break;
            }

            let server_key = format!("{host}:{port}");
            if !self.visited.insert(server_key) {
                continue;
            }
            if depth > self.max_depth {
                continue;
            }

            self.progress.current_depth = depth;
            self.progress.current_server = host.clone();
            self.progress.queue_depth = self.queue.len() as u64;
            self.notify_progress();

            match self.process_server(&host, port, depth).await {
                Ok(()) => {
                    self.progress.servers_scanned += 1;
                }
                Err(e) => {
                    self.progress.servers_failed += 1;
                    tracing::error!(host = %host, port, error = %e, "Server scan failed");
                    if let ScanError::Ssh(
                        SshError::ConnectFailed { .. } | SshError::AuthFailed { .. },
                    ) = &e
                    {
                        if let Ok(Some(server)) = self.store.find_server_by_ip(&host) {
                            let _ = self.store.set_server_reachable(server.id, false);
                        }
                    }
                }
            }

            self.update_job_counters()?;
            self.notify_progress();
        }

        if let Some(job_id) = self.job_id {
            let status = if self.cancelled.load(Ordering::SeqCst) {
                ScanJobStatus::Cancelled
            } else {
                ScanJobStatus::Completed
            };
            self.store.set_job_status(job_id, status, None)?;
            self.update_job_counters()?;
        }

        self.notify_progress();
        Ok(self.progress)
    }

    fn enqueue(&mut self, host: &str, port: u16, depth: u32) {
        let key = format!("{host}:{port}");
        if self.visited.contains(&key) || !self.enqueued.insert(key) {
            return;
        }
        self.queue.push_back((host.to_string(), port, depth));
    }

    async fn process_server(&mut self, host: &str, port: u16, depth: u32) -> Result<()> {
        let discovered_via = if depth == 0 { "manual" } else { "scan" };
        let server = self
            .store
            .upsert_server(host, host, port, OsType::Unknown, Some(discovered_via))?;

        // A fresh agent heartbeat makes the agent authoritative for this
        // cycle; skip SSH scanning entirely.
        if server.prefer_agent && self.store.agent_active(server.id, AGENT_FRESH_SECS)? {
            tracing::info!(host = %host, "Agent is fresh, skipping SSH scan");
            self.store.touch_last_scanned(server.id)?;
            return Ok(());
        }

        let lease = self.pool.acquire(host, port).await?;
        let result = self.scan_over_session(&server, lease.session().clone()).await;
        self.pool.release(lease).await;

        let evidence = result?;

        // Follow or flag each source IP seen in this server's events.
        for (source_ip, evidence) in evidence {
            self.process_source_ip(&source_ip, &server, depth, &evidence)
                .await?;
        }

        self.store.set_server_reachable(server.id, true)?;
        self.store.touch_last_scanned(server.id)?;
        Ok(())
    }

    /// Log parse + key scan + correlation for one server. Returns per-source
    /// evidence for the follow/flag pass.
    async fn scan_over_session(
        &mut self,
        server: &Server,
        session: Arc<dyn SshSession>,
    ) -> Result<HashMap<String, SourceEvidence>> {
        let (outcome, log_source) = self.read_auth_logs(server, &*session).await?;
        let events: Vec<NewAccessEvent> = outcome
            .events
            .iter()
            .map(|e| e.clone().into_new_event(log_source))
            .collect();
        self.progress.events_parsed += events.len() as u64;
        if outcome.malformed_lines > 0 {
            tracing::debug!(
                host = %server.hostname,
                malformed = outcome.malformed_lines,
                "Skipped unparseable sshd lines"
            );
        }

        let evidence = build_source_evidence(&outcome);

        let keys = match key_scanner::scan_server_keys(&*session).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(host = %server.hostname, error = %e, "Key scan failed");
                Default::default()
            }
        };
        self.progress.keys_found += keys.observations.len() as u64;

        ingest::ingest_keys(&self.store, server.id, &keys.observations)?;
        let event_outcome =
            ingest::ingest_events(&self.store, server.id, &events, server.scan_watermark)?;
        ingest::cross_reference(&self.store, server.id)?;

        if let Some(max_time) = event_outcome.max_event_time {
            self.store.advance_watermark(server.id, max_time)?;
        }

        Ok(evidence)
    }

    /// journald first (structured, real timestamps), syslog files second.
    async fn read_auth_logs(
        &self,
        server: &Server,
        session: &dyn SshSession,
    ) -> Result<(LogParseOutcome, LogSource)> {
        let max_lines = if server.scan_watermark.is_some() {
            self.max_lines_incremental
        } else {
            self.max_lines_initial
        };

        let mut cmd = format!("journalctl -u sshd -u ssh --output=json -n {max_lines}");
        if let Some(wm) = server.scan_watermark {
            // Hint only; the watermark filter below is the guarantee.
            cmd.push_str(&format!(" --since=\"{}\"", wm.format("%Y-%m-%d %H:%M:%S")));
        }

        if let Ok(output) = session.exec(&cmd).await {
            if output.success() && !output.stdout.trim().is_empty() {
                let outcome =
                    log_parser::parse_journal_output(&output.stdout, server.scan_watermark);
                if !outcome.events.is_empty() {
                    return Ok((outcome, LogSource::Journald));
                }
            }
        }

        // Fall back to syslog files over SFTP.
        for path in log_parser::detect_log_paths(server.os_type) {
            let Some(stat) = SftpReader::stat(session, path).await? else {
                continue;
            };

            // A shrunken file means rotation: re-read a bounded tail from
            // the start of the new file.
            let mut effective_lines = max_lines;
            if let Some(last_size) = server.last_log_size {
                if stat.size < last_size {
                    effective_lines = self.max_lines_initial;
                    tracing::info!(host = %server.hostname, path = %path, "Log rotation detected");
                }
            }

            let Some(content) =
                SftpReader::read_file_tail(session, path, effective_lines, LOG_TAIL_MAX_BYTES)
                    .await?
            else {
                continue;
            };

            let outcome = log_parser::parse_log(
                &content,
                server.os_type,
                stat.mtime,
                server.scan_watermark,
            );
            self.store.set_last_log_size(server.id, stat.size)?;
            return Ok((outcome, LogSource::Syslog));
        }

        Ok((LogParseOutcome::default(), LogSource::Syslog))
    }

    async fn process_source_ip(
        &mut self,
        source_ip: &str,
        target: &Server,
        depth: u32,
        evidence: &SourceEvidence,
    ) -> Result<()> {
        if source_ip == target.ip_address {
            return Ok(());
        }

        if let Some(existing) = self.store.find_server_by_ip(source_ip)? {
            self.enqueue(&existing.ip_address, existing.ssh_port, depth + 1);
            return Ok(());
        }

        if self.detector.check_reachable(source_ip, 22).await {
            self.store
                .upsert_server(source_ip, source_ip, 22, OsType::Unknown, Some("scan"))?;
            self.enqueue(source_ip, 22, depth + 1);
        } else {
            let severity = classify_severity(
                evidence.accepted_root,
                is_private_ip(source_ip),
                evidence.has_accepted_key,
            );
            let reverse_dns = self.detector.reverse_lookup(source_ip).await;

            self.store.upsert_unreachable_source(
                source_ip,
                target.id,
                evidence.username.as_deref(),
                evidence.fingerprint.as_deref(),
                None,
                reverse_dns.as_deref(),
                severity,
            )?;
            self.progress.unreachable_found += 1;
            tracing::warn!(
                source_ip = %source_ip,
                target = %target.hostname,
                severity = severity.as_str(),
                "Unreachable source flagged"
            );
        }

        Ok(())
    }

    fn update_job_counters(&self) -> Result<()> {
        if let Some(job_id) = self.job_id {
            self.store.update_job_counters(
                job_id,
                self.progress.servers_scanned as i64,
                self.progress.servers_failed as i64,
                self.progress.keys_found as i64,
                self.progress.events_parsed as i64,
                self.progress.unreachable_found as i64,
            )?;
        }
        Ok(())
    }

    fn notify_progress(&self) {
        if let Some(callback) = &self.progress_callback {
            callback(&self.progress);
        }
    }
}

fn build_source_evidence(outcome: &LogParseOutcome) -> HashMap<String, SourceEvidence> {
    let mut evidence: HashMap<String, SourceEvidence> = HashMap::new();
    for event in &outcome.events {
        let entry = evidence.entry(event.source_ip.clone()).or_default();
        if event.event_type == keyspider_core::types::EventType::Accepted {
            if event.fingerprint.is_some() {
                entry.has_accepted_key = true;
                if entry.fingerprint.is_none() {
                    entry.fingerprint = event.fingerprint.clone();
                }
            }
            if event.username == "root" {
                entry.accepted_root = true;
            }
            if entry.username.is_none() {
                entry.username = Some(event.username.clone());
            }
        } else if entry.username.is_none() {
            entry.username = Some(event.username.clone());
        }
    }
    evidence
}

/// Convenience: per-server scan job (depth 0 crawl over one host).
pub async fn scan_single_server(
    pool: ConnectionPool,
    store: Store,
    detector: Arc<UnreachableDetector>,
    config: &KeyspiderConfig,
    host: &str,
    port: u16,
) -> Result<SpiderProgress> {
    let engine = SpiderEngine::new(pool, store, detector, config).with_max_depth(0);
    engine.crawl(host, port).await
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use keyspider_core::types::{AuthMethod, EventType};

    use super::*;
    use crate::log_parser::ParsedAuthEvent;

    fn parsed(ip: &str, user: &str, event_type: EventType, fp: Option<&str>) -> ParsedAuthEvent {
        ParsedAuthEvent {
            timestamp: Utc.with_ymd_and_hms(2026, 2, 5, 13, 0, 0).unwrap(),
            source_ip: ip.to_string(),
            username: user.to_string(),
            auth_method: Some(AuthMethod::Publickey),
            event_type,
            fingerprint: fp.map(String::from),
            port: Some(50000),
            pid: Some(1),
            raw_line: String::new(),
        }
    }

    #[test]
    fn evidence_aggregates_per_source() {
        let outcome = LogParseOutcome {
            events: vec![
                parsed("10.0.0.9", "deploy", EventType::Accepted, Some("SHA256:a")),
                parsed("10.0.0.9", "root", EventType::Accepted, Some("SHA256:b")),
                parsed("203.0.113.7", "admin", EventType::Failed, None),
            ],
            malformed_lines: 0,
            below_watermark: 0,
        };

        let evidence = build_source_evidence(&outcome);
        assert_eq!(evidence.len(), 2);

        let internal = &evidence["10.0.0.9"];
        assert!(internal.has_accepted_key);
        assert!(internal.accepted_root);
        assert_eq!(internal.fingerprint.as_deref(), Some("SHA256:a"));

        let external = &evidence["203.0.113.7"];
        assert!(!external.has_accepted_key);
        assert!(!external.accepted_root);
        assert_eq!(external.username.as_deref(), Some("admin"));
    }
}
