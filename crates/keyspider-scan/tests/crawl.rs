//! End-to-end spider crawls over a scripted two-host fleet.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use keyspider_core::config::KeyspiderConfig;
use keyspider_core::types::{FileType, ScanJobStatus, ScanJobType, Severity};
use keyspider_scan::spider::SpiderEngine;
use keyspider_scan::unreachable::UnreachableDetector;
use keyspider_ssh::ConnectionPool;
use keyspider_store::Store;

use common::{ed25519_key_line, FakeHost, FleetDialer, FleetProbe};

const JUMP: &str = "10.0.1.1";
const WEB: &str = "10.0.1.2";
const GHOST_PUBLIC: &str = "203.0.113.7";
const GHOST_FAILED: &str = "198.51.100.9";

fn jump_auth_log() -> String {
    format!(
        "Feb  5 13:04:01 jump1 sshd[100]: Accepted publickey for deploy from {WEB} port 50000 ssh2: ED25519 SHA256:webkey\n\
         Feb  5 13:05:00 jump1 sshd[101]: Accepted publickey for root from {GHOST_PUBLIC} port 50001 ssh2: ED25519 SHA256:ghostkey\n\
         Feb  5 13:06:00 jump1 sshd[102]: Failed password for admin from {GHOST_FAILED} port 50002 ssh2\n"
    )
}

fn jump_host() -> FakeHost {
    let auth_log = jump_auth_log();
    FakeHost::default()
        .with_file(
            "/etc/passwd",
            "root:x:0:0:root:/root:/bin/bash\ndeploy:x:1001:1001::/home/deploy:/bin/bash",
            0o644,
        )
        .with_file("/var/log/auth.log", &auth_log, 0o640)
        .with_file(
            "/root/.ssh/authorized_keys",
            &ed25519_key_line(0x01, "ops@laptop"),
            0o600,
        )
}

fn web_host() -> FakeHost {
    // web2 has journald; events arrive as journalctl JSON.
    let ts = Utc
        .with_ymd_and_hms(2026, 2, 5, 12, 0, 0)
        .unwrap()
        .timestamp_micros();
    let journal = serde_json::json!({
        "SYSLOG_IDENTIFIER": "sshd",
        "MESSAGE": format!("Accepted publickey for root from {JUMP} port 40000 ssh2: ED25519 SHA256:jumpkey"),
        "__REALTIME_TIMESTAMP": ts.to_string(),
        "_PID": "200",
    })
    .to_string();

    let mut host = FakeHost::default()
        .with_file("/etc/passwd", "root:x:0:0:root:/root:/bin/bash", 0o644)
        .with_file(
            "/root/.ssh/authorized_keys",
            &ed25519_key_line(0x02, "root@jump1"),
            0o600,
        );
    host.journal = Some(journal);
    host
}

fn test_setup(hosts: &[(&str, FakeHost)], reachable: &[&str]) -> (Arc<FleetDialer>, Store, SpiderEngine) {
    let mut config = KeyspiderConfig::default();
    config.ssh.acquire_timeout_secs = 2;
    config.ssh.connect_timeout_secs = 2;
    config.ssh.dial_attempts = 1;

    let dialer = FleetDialer::new(hosts);
    let pool = ConnectionPool::new(dialer.clone(), config.ssh.clone());
    let detector = Arc::new(UnreachableDetector::new(
        FleetProbe::new(reachable),
        Duration::from_secs(3600),
    ));
    let store = Store::open_in_memory().unwrap();
    let engine = SpiderEngine::new(pool, store.clone(), detector, &config);
    (dialer, store, engine)
}

#[tokio::test]
async fn crawl_discovers_fleet_and_flags_unreachables() {
    let (_dialer, store, engine) =
        test_setup(&[(JUMP, jump_host()), (WEB, web_host())], &[JUMP, WEB]);

    let progress = engine.crawl(JUMP, 22).await.unwrap();

    assert_eq!(progress.servers_scanned, 2);
    assert_eq!(progress.servers_failed, 0);
    assert_eq!(progress.events_parsed, 4);
    assert!(progress.keys_found >= 2);
    assert_eq!(progress.unreachable_found, 2);

    // Both fleet members have rows, watermarks, and scan stamps.
    let jump = store.find_server_by_ip(JUMP).unwrap().unwrap();
    let web = store.find_server_by_ip(WEB).unwrap().unwrap();
    for server in [&jump, &web] {
        assert!(server.is_reachable);
        assert!(server.last_scanned_at.is_some());
        assert!(server.scan_watermark.is_some());
    }

    // The unreachable sources got severity-classified: accepted root key
    // from a public address is critical, failures only are low.
    let unreachable = store.list_unreachable(true).unwrap();
    assert_eq!(unreachable.len(), 2);
    let ghost = unreachable
        .iter()
        .find(|u| u.source_ip == GHOST_PUBLIC)
        .unwrap();
    assert_eq!(ghost.severity, Severity::Critical);
    assert_eq!(ghost.username.as_deref(), Some("root"));
    let failed = unreachable
        .iter()
        .find(|u| u.source_ip == GHOST_FAILED)
        .unwrap();
    assert_eq!(failed.severity, Severity::Low);

    // web2's event (seen second) correlates its source to the jump host.
    let web_events = store.events_for_target(web.id).unwrap();
    assert_eq!(web_events.len(), 1);
    assert_eq!(web_events[0].source_server_id, Some(jump.id));
    assert_eq!(
        web_events[0].log_source,
        keyspider_core::types::LogSource::Journald
    );

    // Authorization edges exist for the authorized_keys locations.
    let paths = store.list_active_paths().unwrap();
    assert!(paths.iter().any(|p| p.is_authorized));
    assert!(paths.iter().any(|p| p.is_used));

    // Key locations carry stat metadata.
    let locations = store.key_locations_for_server(jump.id).unwrap();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].file_type, FileType::AuthorizedKeys);
    assert_eq!(locations[0].unix_perms.as_deref(), Some("0600"));
}

#[tokio::test]
async fn rescan_is_idempotent() {
    let hosts = [(JUMP, jump_host()), (WEB, web_host())];
    let (_dialer, store, engine) = test_setup(&hosts, &[JUMP, WEB]);
    engine.crawl(JUMP, 22).await.unwrap();

    let events_before = store.count_events().unwrap();
    let paths_before = store.list_active_paths().unwrap();

    // Same fleet, unchanged logs: the watermark filters everything and the
    // natural-key index catches the rest.
    let mut config = KeyspiderConfig::default();
    config.ssh.dial_attempts = 1;
    let dialer = FleetDialer::new(&hosts);
    let pool = ConnectionPool::new(dialer, config.ssh.clone());
    let detector = Arc::new(UnreachableDetector::new(
        FleetProbe::new(&[JUMP, WEB]),
        Duration::from_secs(3600),
    ));
    let engine2 = SpiderEngine::new(pool, store.clone(), detector, &config);
    engine2.crawl(JUMP, 22).await.unwrap();

    assert_eq!(store.count_events().unwrap(), events_before);
    let paths_after = store.list_active_paths().unwrap();
    assert_eq!(paths_after.len(), paths_before.len());
    for (before, after) in paths_before.iter().zip(paths_after.iter()) {
        assert_eq!(before.event_count, after.event_count);
        assert_eq!(before.is_authorized, after.is_authorized);
        assert_eq!(before.is_used, after.is_used);
    }
}

#[tokio::test]
async fn rescan_with_weaker_evidence_keeps_severity() {
    let (_dialer, store, engine) =
        test_setup(&[(JUMP, jump_host()), (WEB, web_host())], &[JUMP, WEB]);
    engine.crawl(JUMP, 22).await.unwrap();

    let ghost = store
        .list_unreachable(true)
        .unwrap()
        .into_iter()
        .find(|u| u.source_ip == GHOST_PUBLIC)
        .unwrap();
    assert_eq!(ghost.severity, Severity::Critical);
    assert_eq!(ghost.event_count, 1);

    // The next scan window holds only a fresh failed attempt from the same
    // source: weaker evidence classifies low, but the recorded critical
    // finding must not downgrade.
    let weaker_log = format!(
        "{}Feb  5 13:07:00 jump1 sshd[103]: Failed password for root from {GHOST_PUBLIC} port 50003 ssh2\n",
        jump_auth_log()
    );
    let hosts = [
        (JUMP, jump_host().with_file("/var/log/auth.log", &weaker_log, 0o640)),
        (WEB, web_host()),
    ];
    let mut config = KeyspiderConfig::default();
    config.ssh.dial_attempts = 1;
    let pool = ConnectionPool::new(FleetDialer::new(&hosts), config.ssh.clone());
    let detector = Arc::new(UnreachableDetector::new(
        FleetProbe::new(&[JUMP, WEB]),
        Duration::from_secs(3600),
    ));
    let engine2 = SpiderEngine::new(pool, store.clone(), detector, &config);
    engine2.crawl(JUMP, 22).await.unwrap();

    let ghost = store
        .list_unreachable(true)
        .unwrap()
        .into_iter()
        .find(|u| u.source_ip == GHOST_PUBLIC)
        .unwrap();
    assert_eq!(ghost.severity, Severity::Critical, "severity must not downgrade");
    assert_eq!(ghost.event_count, 2);
}

#[tokio::test]
async fn max_depth_zero_scans_only_the_seed() {
    let (_dialer, store, engine) =
        test_setup(&[(JUMP, jump_host()), (WEB, web_host())], &[JUMP, WEB]);

    let progress = engine.with_max_depth(0).crawl(JUMP, 22).await.unwrap();

    assert_eq!(progress.servers_scanned, 1);
    let web = store.find_server_by_ip(WEB).unwrap().unwrap();
    // Discovered as a reachable source, but never scanned.
    assert!(web.last_scanned_at.is_none());
}

#[tokio::test]
async fn fresh_agent_heartbeat_skips_ssh_scan() {
    let (dialer, store, engine) = test_setup(&[(JUMP, jump_host())], &[JUMP]);

    let seed = store
        .upsert_server(
            JUMP,
            JUMP,
            22,
            keyspider_core::types::OsType::Linux,
            Some("manual"),
        )
        .unwrap();
    store.set_prefer_agent(seed.id, true).unwrap();
    store.register_agent(seed.id, "deadbeef").unwrap();
    let agent = store.agent_for_server(seed.id).unwrap().unwrap();
    store.agent_heartbeat(agent.id, Some("1.0.0")).unwrap();

    let progress = engine.crawl(JUMP, 22).await.unwrap();

    assert_eq!(progress.servers_scanned, 1);
    assert_eq!(dialer.dial_count(), 0, "agent data is authoritative");
    assert!(store
        .get_server(seed.id)
        .unwrap()
        .last_scanned_at
        .is_some());
}

#[tokio::test]
async fn per_server_failure_does_not_abort_crawl() {
    let mut bad = FakeHost::default();
    bad.auth_fails = true;

    let (_dialer, store, engine) =
        test_setup(&[(JUMP, jump_host()), (WEB, bad)], &[JUMP, WEB]);

    let progress = engine.crawl(JUMP, 22).await.unwrap();

    // The seed scanned fine; the follow-on host failed auth and was marked
    // unreachable without killing the job.
    assert_eq!(progress.servers_scanned, 1);
    assert_eq!(progress.servers_failed, 1);
    let web = store.find_server_by_ip(WEB).unwrap().unwrap();
    assert!(!web.is_reachable);
}

#[tokio::test]
async fn cancellation_is_observed_at_server_boundary() {
    let (_dialer, store, engine) =
        test_setup(&[(JUMP, jump_host()), (WEB, web_host())], &[JUMP, WEB]);

    let job = store
        .create_scan_job(ScanJobType::Spider, "test", None, 10)
        .unwrap();
    let engine = engine.with_job(job.id);
    let cancel = engine.cancel_token();
    cancel.store(true, Ordering::SeqCst);

    let progress = engine.crawl(JUMP, 22).await.unwrap();

    assert_eq!(progress.servers_scanned, 0);
    let job = store.get_scan_job(job.id).unwrap();
    assert_eq!(job.status, ScanJobStatus::Cancelled);
    assert!(job.status.is_terminal());
}

#[tokio::test]
async fn job_counters_track_progress() {
    let (_dialer, store, engine) =
        test_setup(&[(JUMP, jump_host()), (WEB, web_host())], &[JUMP, WEB]);

    let job = store
        .create_scan_job(ScanJobType::Spider, "test", None, 10)
        .unwrap();
    engine.with_job(job.id).crawl(JUMP, 22).await.unwrap();

    let job = store.get_scan_job(job.id).unwrap();
    assert_eq!(job.status, ScanJobStatus::Completed);
    assert_eq!(job.servers_scanned, 2);
    assert_eq!(job.events_parsed, 4);
    assert_eq!(job.unreachable_found, 2);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
}
