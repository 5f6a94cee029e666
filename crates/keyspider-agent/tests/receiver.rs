//! End-to-end tests for the agent ingest endpoints.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use keyspider_agent::auth::hash_token;
use keyspider_agent::{router, AppState};
use keyspider_core::types::{OsType, ServerId};
use keyspider_store::Store;
use serde_json::{json, Value};
use tower::ServiceExt;

const TOKEN: &str = "agent-token-1";

fn setup() -> (axum::Router, Store, ServerId) {
    let store = Store::open_in_memory().unwrap();
    let server = store
        .upsert_server("agenthost", "10.0.0.8", 22, OsType::Linux, Some("manual"))
        .unwrap();
    store.register_agent(server.id, &hash_token(TOKEN)).unwrap();

    let app = router(AppState {
        store: store.clone(),
    });
    (app, store, server.id)
}

fn post(path: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("Content-Type", "application/json");
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn missing_or_bad_token_is_401() {
    let (app, _store, _server) = setup();

    let response = app
        .clone()
        .oneshot(post(
            "/api/agent/heartbeat",
            None,
            json!({"agent_version": "1.0"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(post(
            "/api/agent/heartbeat",
            Some("wrong-token"),
            json!({"agent_version": "1.0"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn heartbeat_updates_agent_row() {
    let (app, store, server_id) = setup();

    let response = app
        .oneshot(post(
            "/api/agent/heartbeat",
            Some(TOKEN),
            json!({"agent_version": "1.4.2"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let agent = store.agent_for_server(server_id).unwrap().unwrap();
    assert_eq!(agent.agent_version.as_deref(), Some("1.4.2"));
    assert!(agent.last_heartbeat_at.is_some());
    assert!(store.agent_active(server_id, 300).unwrap());
}

#[tokio::test]
async fn events_merge_with_crawl_invariants() {
    let (app, store, server_id) = setup();

    let payload = json!({
        "events": [
            {
                "timestamp": "2026-02-05T13:04:01Z",
                "source_ip": "10.1.2.3",
                "username": "deploy",
                "auth_method": "publickey",
                "event_type": "accepted",
                "fingerprint": "SHA256:abcd1234",
                "raw_line": "Accepted publickey for deploy from 10.1.2.3 port 55123 ssh2"
            },
            {
                "timestamp": "2026-02-05T13:05:00Z",
                "source_ip": "10.1.2.3",
                "username": "deploy",
                "auth_method": "password",
                "event_type": "failed",
                "fingerprint": null,
                "raw_line": "Failed password for deploy from 10.1.2.3 port 55124 ssh2"
            }
        ]
    });

    let response = app
        .clone()
        .oneshot(post("/api/agent/events", Some(TOKEN), payload.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["accepted"], 2);

    let events = store.events_for_target(server_id).unwrap();
    assert_eq!(events.len(), 2);
    assert!(events
        .iter()
        .all(|e| e.log_source == keyspider_core::types::LogSource::Agent));

    // The accepted event created a usage edge.
    let paths = store.list_active_paths().unwrap();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].is_used);

    // Watermark advanced to the latest event.
    let server = store.get_server(server_id).unwrap();
    assert!(server.scan_watermark.is_some());

    // Re-pushing the same batch dedupes on the natural key.
    let response = app
        .oneshot(post("/api/agent/events", Some(TOKEN), payload))
        .await
        .unwrap();
    assert_eq!(body_json(response).await["accepted"], 0);
    assert_eq!(store.events_for_target(server_id).unwrap().len(), 2);
    assert_eq!(store.list_active_paths().unwrap()[0].event_count, 1);
}

#[tokio::test]
async fn sudo_events_are_stored() {
    let (app, _store, _server) = setup();

    let payload = json!({
        "events": [{
            "timestamp": "2026-02-05T14:30:00Z",
            "username": "admin",
            "tty": "pts/0",
            "working_dir": "/home/admin",
            "target_user": "root",
            "command": "/usr/bin/apt update",
            "raw_line": "admin : TTY=pts/0 ; PWD=/home/admin ; USER=root ; COMMAND=/usr/bin/apt update"
        }]
    });

    let response = app
        .oneshot(post("/api/agent/sudo-events", Some(TOKEN), payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["accepted"], 1);
}

#[tokio::test]
async fn key_inventory_merges_and_dedupes() {
    let (app, store, server_id) = setup();

    // A syntactically valid ed25519 authorized_keys line.
    let blob: Vec<u8> = {
        let mut b = Vec::new();
        for field in [b"ssh-ed25519".as_slice(), &[0x11u8; 32]] {
            b.extend_from_slice(&(field.len() as u32).to_be_bytes());
            b.extend_from_slice(field);
        }
        b
    };
    let key_line = format!("ssh-ed25519 {} ops@agenthost", {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD.encode(&blob)
    });

    let payload = json!({
        "locations": [
            {
                "public_key_data": key_line,
                "file_path": "/home/ops/.ssh/authorized_keys",
                "file_type": "authorized_keys",
                "unix_owner": "ops",
                "unix_permissions": "0600",
                "file_mtime": "2026-01-01T00:00:00Z",
                "file_size": 120,
                "is_host_key": false
            },
            {
                "public_key_data": "garbage that is not a key",
                "file_path": "/home/ops/.ssh/authorized_keys",
                "file_type": "authorized_keys",
                "unix_owner": "ops",
                "unix_permissions": "0600",
                "file_mtime": null,
                "file_size": null,
                "is_host_key": false
            }
        ]
    });

    let response = app
        .clone()
        .oneshot(post("/api/agent/keys", Some(TOKEN), payload.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    // The garbage entry is skipped; one real key stored.
    assert_eq!(body_json(response).await["accepted"], 1);

    let locations = store.key_locations_for_server(server_id).unwrap();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].unix_owner.as_deref(), Some("ops"));

    // The authorized key created an authorization edge with no source.
    let paths = store.list_active_paths().unwrap();
    assert_eq!(paths.len(), 1);
    assert!(paths[0].is_authorized);
    assert!(paths[0].source_server_id.is_none());

    // Delta re-push dedupes.
    let response = app
        .oneshot(post("/api/agent/keys", Some(TOKEN), payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(store.key_locations_for_server(server_id).unwrap().len(), 1);
}
