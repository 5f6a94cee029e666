//! Ingest endpoints.
//!
//! Every endpoint authenticates via [`crate::auth::verify_agent`] and
//! merges its payload through `keyspider-store::ingest`, so agent-pushed
//! data obeys the same invariants as the SSH crawl.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use keyspider_core::fingerprint::{key_type_of, md5_of_key_data, sha256_of_key_data};
use keyspider_core::types::{AuthMethod, EventType, FileType, KeyType, LogSource};
use keyspider_store::{ingest, NewAccessEvent, NewKeyObservation, Store};

use crate::auth::verify_agent;
use crate::schemas::{
    AcceptedResponse, AgentEventsPayload, AgentHeartbeat, AgentKeyInventory,
    AgentSudoEventsPayload,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/agent/heartbeat", post(heartbeat))
        .route("/api/agent/events", post(events))
        .route("/api/agent/sudo-events", post(sudo_events))
        .route("/api/agent/keys", post(keys))
        .with_state(state)
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AgentHeartbeat>,
) -> Result<StatusCode, StatusCode> {
    let agent = verify_agent(&state.store, &headers)?;
    state
        .store
        .agent_heartbeat(agent.id, payload.agent_version.as_deref())
        .map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AgentEventsPayload>,
) -> Result<Json<AcceptedResponse>, StatusCode> {
    let agent = verify_agent(&state.store, &headers)?;

    let events: Vec<NewAccessEvent> = payload
        .events
        .iter()
        .filter_map(|event| {
            let event_type = EventType::parse(&event.event_type)?;
            Some(NewAccessEvent {
                source_ip: event.source_ip.clone(),
                username: event.username.clone(),
                auth_method: event.auth_method.as_deref().and_then(AuthMethod::parse),
                event_type,
                fingerprint: event.fingerprint.clone(),
                event_time: parse_time(&event.timestamp),
                raw_log_line: event.raw_line.clone(),
                log_source: LogSource::Agent,
            })
        })
        .collect();

    let outcome =
        ingest::ingest_events(&state.store, agent.server_id, &events, None).map_err(internal)?;
    ingest::cross_reference(&state.store, agent.server_id).map_err(internal)?;
    if let Some(max_time) = outcome.max_event_time {
        state
            .store
            .advance_watermark(agent.server_id, max_time)
            .map_err(internal)?;
    }
    state.store.agent_touch_event(agent.id).map_err(internal)?;

    tracing::info!(
        server_id = %agent.server_id,
        accepted = outcome.inserted,
        duplicates = outcome.duplicates,
        "Agent events merged"
    );
    Ok(Json(AcceptedResponse {
        accepted: outcome.inserted,
    }))
}

async fn sudo_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AgentSudoEventsPayload>,
) -> Result<Json<AcceptedResponse>, StatusCode> {
    let agent = verify_agent(&state.store, &headers)?;

    let mut accepted = 0;
    for event in &payload.events {
        let inserted = state
            .store
            .insert_sudo_event(
                agent.server_id,
                &event.username,
                &event.tty,
                &event.working_dir,
                &event.target_user,
                &event.command,
                parse_time(&event.timestamp),
                event.success,
                &event.raw_line,
            )
            .map_err(internal)?;
        if inserted {
            accepted += 1;
        }
    }
    state.store.agent_touch_event(agent.id).map_err(internal)?;

    Ok(Json(AcceptedResponse { accepted }))
}

async fn keys(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<AgentKeyInventory>,
) -> Result<Json<AcceptedResponse>, StatusCode> {
    let agent = verify_agent(&state.store, &headers)?;

    let observations: Vec<NewKeyObservation> = payload
        .locations
        .iter()
        .filter_map(|item| {
            let data = item.public_key_data.trim();
            let fingerprint_sha256 = sha256_of_key_data(data)?;
            Some(NewKeyObservation {
                fingerprint_sha256,
                fingerprint_md5: md5_of_key_data(data),
                key_type: key_type_of(data).unwrap_or(KeyType::Unknown),
                key_bits: None,
                public_key_data: Some(data.to_string()),
                comment: None,
                is_host_key: item.is_host_key,
                file_path: item.file_path.clone(),
                file_type: FileType::parse(&item.file_type).unwrap_or(FileType::AuthorizedKeys),
                unix_owner: item.unix_owner.clone(),
                unix_perms: item.unix_permissions.clone(),
                file_mtime: item
                    .file_mtime
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc)),
                file_size: item.file_size,
            })
        })
        .collect();

    let outcome =
        ingest::ingest_keys(&state.store, agent.server_id, &observations).map_err(internal)?;
    ingest::cross_reference(&state.store, agent.server_id).map_err(internal)?;
    state.store.agent_touch_event(agent.id).map_err(internal)?;

    tracing::info!(
        server_id = %agent.server_id,
        stored = outcome.keys_stored,
        "Agent key inventory merged"
    );
    Ok(Json(AcceptedResponse {
        accepted: outcome.keys_stored,
    }))
}

fn parse_time(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn internal<E: std::fmt::Display>(err: E) -> StatusCode {
    tracing::error!(error = %err, "Agent ingest failed");
    StatusCode::INTERNAL_SERVER_ERROR
}
