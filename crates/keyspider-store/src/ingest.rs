//! Shared correlation path for observations.
//!
//! Both the SSH crawl and the agent receiver funnel their events and key
//! inventories through these functions, so the two sources obey identical
//! invariants: watermark discipline, natural-key dedup, and OR-merged path
//! flags.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use keyspider_core::fingerprint::normalize_fingerprint;
use keyspider_core::types::{
    AuthMethod, EventType, FileType, KeyType, LogSource, ServerId, SshKeyId,
};

use crate::store::{Result, Store};

/// An auth event ready for persistence, before id correlation.
#[derive(Debug, Clone)]
pub struct NewAccessEvent {
    pub source_ip: String,
    pub username: String,
    pub auth_method: Option<AuthMethod>,
    pub event_type: EventType,
    pub fingerprint: Option<String>,
    pub event_time: DateTime<Utc>,
    pub raw_log_line: String,
    pub log_source: LogSource,
}

/// A discovered key plus the location it was found at.
#[derive(Debug, Clone)]
pub struct NewKeyObservation {
    pub fingerprint_sha256: String,
    pub fingerprint_md5: Option<String>,
    pub key_type: KeyType,
    pub key_bits: Option<u32>,
    pub public_key_data: Option<String>,
    pub comment: Option<String>,
    pub is_host_key: bool,
    pub file_path: String,
    pub file_type: FileType,
    pub unix_owner: Option<String>,
    pub unix_perms: Option<String>,
    pub file_mtime: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
}

/// Result of an event batch merge.
#[derive(Debug, Clone, Default)]
pub struct EventOutcome {
    /// Events newly inserted.
    pub inserted: usize,
    /// Events at or before the supplied watermark, discarded.
    pub below_watermark: usize,
    /// Events already present (natural-key duplicates).
    pub duplicates: usize,
    /// Latest event time in the accepted batch; the caller advances the
    /// server watermark to this.
    pub max_event_time: Option<DateTime<Utc>>,
}

/// Result of a key inventory merge.
#[derive(Debug, Clone, Default)]
pub struct KeysOutcome {
    pub keys_stored: usize,
    pub locations_created: usize,
}

/// Merge a batch of events for one target server.
///
/// Fingerprint→key and ip→server lookups are batched up front; events are
/// deduplicated on their natural key, and accepted events upsert usage
/// edges. `event_count` on a path only grows for events that were actually
/// inserted, so re-ingesting the same window is a no-op.
pub fn ingest_events(
    store: &Store,
    target_server_id: ServerId,
    events: &[NewAccessEvent],
    watermark: Option<DateTime<Utc>>,
) -> Result<EventOutcome> {
    let mut outcome = EventOutcome::default();
    if events.is_empty() {
        return Ok(outcome);
    }

    let mut kept: Vec<NewAccessEvent> = Vec::with_capacity(events.len());
    for event in events {
        if let Some(wm) = watermark {
            if event.event_time <= wm {
                outcome.below_watermark += 1;
                continue;
            }
        }
        let mut event = event.clone();
        event.fingerprint = event.fingerprint.as_deref().map(normalize_fingerprint);
        kept.push(event);
    }
    if kept.is_empty() {
        return Ok(outcome);
    }

    let fingerprints: HashSet<String> = kept
        .iter()
        .filter_map(|e| e.fingerprint.clone())
        .collect();
    let source_ips: HashSet<String> = kept.iter().map(|e| e.source_ip.clone()).collect();

    let key_map = store.key_ids_by_fingerprints(&fingerprints)?;
    let ip_map = store.server_ids_by_ips(&source_ips)?;

    for event in &kept {
        let ssh_key_id: Option<SshKeyId> = event
            .fingerprint
            .as_deref()
            .and_then(|fp| key_map.get(fp).copied());
        let source_server_id = ip_map.get(&event.source_ip).copied();

        let inserted =
            store.insert_access_event(target_server_id, source_server_id, ssh_key_id, event)?;
        if inserted {
            outcome.inserted += 1;
            outcome.max_event_time = Some(match outcome.max_event_time {
                Some(t) => t.max(event.event_time),
                None => event.event_time,
            });

            if event.event_type == EventType::Accepted {
                store.upsert_access_path(
                    source_server_id,
                    target_server_id,
                    ssh_key_id,
                    Some(&event.username),
                    event.event_time,
                    false,
                    true,
                    1,
                )?;
            }
        } else {
            outcome.duplicates += 1;
        }
    }

    Ok(outcome)
}

/// Merge a key inventory for one server.
///
/// Each `authorized_keys` location also upserts an authorization edge with
/// an unknown-source placeholder, keyed on the account the key authorizes.
pub fn ingest_keys(
    store: &Store,
    server_id: ServerId,
    observations: &[NewKeyObservation],
) -> Result<KeysOutcome> {
    let mut outcome = KeysOutcome::default();

    for obs in observations {
        let mut obs = obs.clone();
        obs.fingerprint_sha256 = normalize_fingerprint(&obs.fingerprint_sha256);

        let key = store.upsert_ssh_key(&obs)?;
        outcome.keys_stored += 1;

        if store.upsert_key_location(key.id, server_id, &obs)? {
            outcome.locations_created += 1;
        }

        if obs.file_type == FileType::AuthorizedKeys {
            store.upsert_access_path(
                None,
                server_id,
                Some(key.id),
                obs.unix_owner.as_deref(),
                Utc::now(),
                true,
                false,
                0,
            )?;
        }
    }

    Ok(outcome)
}

/// Reconcile the authorization/usage flags on every path targeting the
/// server against the stored locations and events.
pub fn cross_reference(store: &Store, server_id: ServerId) -> Result<()> {
    store.reconcile_path_flags(server_id)
}
