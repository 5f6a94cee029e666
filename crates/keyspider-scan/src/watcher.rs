//! Live auth log tailing.
//!
//! One persistent SSH session per watched server runs `journalctl --follow`
//! (when journald is present) or `tail -F`. Parsed events are persisted
//! through the same ingest path as the crawl and fanned out to subscribers
//! over bounded channels: a slow consumer applies backpressure, nothing is
//! dropped. `stop()` closes every consumer channel, so a waiting consumer
//! unblocks unconditionally once it has drained its buffer, even if that
//! buffer was full at shutdown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use keyspider_core::config::{LogConfig, WatcherConfig};
use keyspider_core::events::Observation;
use keyspider_core::types::{EventType, LogSource, Server, WatchStatus};
use keyspider_ssh::{SftpReader, SshDialer, SshSession};
use keyspider_store::{ingest, Store};
use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::log_parser::{self, ParsedAuthEvent};

const PAUSE_POLL: Duration = Duration::from_millis(200);
const TAIL_CATCHUP_MAX_BYTES: u64 = 50 * 1024 * 1024;

/// A crawl seed produced by auto-spider mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpiderSeed {
    pub source_ip: String,
    pub depth: u32,
}

struct Consumer {
    id: u64,
    tx: mpsc::Sender<Observation>,
}

struct WatchShared {
    running: AtomicBool,
    paused: AtomicBool,
    consumers: StdMutex<Vec<Consumer>>,
    next_consumer_id: AtomicU64,
    stop_tx: watch::Sender<bool>,
    channel_capacity: usize,
}

/// Subscription handle. Dropping it deregisters the consumer.
pub struct EventStream {
    id: u64,
    rx: mpsc::Receiver<Observation>,
    shared: Arc<WatchShared>,
}

impl EventStream {
    /// Next observation, or `None` once the watcher stops.
    ///
    /// Buffered observations are still delivered after `stop()`; the
    /// channel closing is what ends the stream.
    pub async fn recv(&mut self) -> Option<Observation> {
        self.rx.recv().await
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let mut consumers = self.shared.consumers.lock().expect("consumer list poisoned");
        consumers.retain(|c| c.id != self.id);
    }
}

pub struct Watcher {
    dialer: Arc<dyn SshDialer>,
    store: Store,
    server: Server,
    config: WatcherConfig,
    log_config: LogConfig,
    auto_spider: Option<(mpsc::Sender<SpiderSeed>, u32)>,
    shared: Arc<WatchShared>,
    stop_rx: watch::Receiver<bool>,
}

impl Watcher {
    pub fn new(
        dialer: Arc<dyn SshDialer>,
        store: Store,
        server: Server,
        config: WatcherConfig,
        log_config: LogConfig,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let channel_capacity = config.channel_capacity;
        Self {
            dialer,
            store,
            server,
            config,
            log_config,
            auto_spider: None,
            shared: Arc::new(WatchShared {
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                consumers: StdMutex::new(Vec::new()),
                next_consumer_id: AtomicU64::new(0),
                stop_tx,
                channel_capacity,
            }),
            stop_rx,
        }
    }

    /// Feed accepted events from unseen sources into a spider queue, at
    /// depth 1, bounded by `spider_depth`.
    pub fn with_auto_spider(mut self, seeds: mpsc::Sender<SpiderSeed>, spider_depth: u32) -> Self {
        self.auto_spider = Some((seeds, spider_depth));
        self
    }

    /// Register a consumer. The channel is bounded; when it fills, the
    /// watcher's fanout awaits (sender-blocks backpressure). Late
    /// subscribers receive no backlog.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::channel::<Observation>(self.shared.channel_capacity);
        let id = self.shared.next_consumer_id.fetch_add(1, Ordering::SeqCst);
        self.shared
            .consumers
            .lock()
            .expect("consumer list poisoned")
            .push(Consumer { id, tx });
        EventStream {
            id,
            rx,
            shared: self.shared.clone(),
        }
    }

    /// Control handle usable from other tasks.
    pub fn handle(&self) -> WatchHandle {
        WatchHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Tail until stopped. Reconnects with full-jitter exponential backoff
    /// on any transport error; only `stop()` ends the loop.
    pub async fn run(mut self) -> Result<()> {
        let session_row = self.store.create_watch_session(
            self.server.id,
            self.auto_spider.is_some(),
            self.auto_spider.as_ref().map(|(_, d)| *d).unwrap_or(0),
        )?;
        self.shared.running.store(true, Ordering::SeqCst);

        let mut delay = self.config.reconnect_delay();
        let max_delay = self.config.max_reconnect_delay();
        let mut seen_sources: HashSet<String> = HashSet::new();
        let mut last_offset: u64 = 0;
        let mut events_total: i64 = 0;

        while self.shared.running.load(Ordering::SeqCst) {
            match self
                .connect_and_tail(session_row.id, &mut seen_sources, &mut last_offset, &mut events_total)
                .await
            {
                Ok(()) => break,
                Err(e) => {
                    if !self.shared.running.load(Ordering::SeqCst) {
                        break;
                    }
                    let jittered = full_jitter(delay);
                    tracing::warn!(
                        host = %self.server.hostname,
                        error = %e,
                        delay_secs = jittered.as_secs(),
                        "Watcher connection lost, reconnecting"
                    );
                    self.broadcast(Observation::WatchReconnecting {
                        server_id: self.server.id,
                        delay_secs: jittered.as_secs(),
                    })
                    .await;
                    tokio::time::sleep(jittered).await;
                    delay = (delay * 2).min(max_delay);
                }
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        self.store
            .set_watch_status(session_row.id, WatchStatus::Stopped, None)?;
        // Best effort only: a full channel at shutdown must not stall the
        // stop. The closure below is the delivery guarantee.
        self.shared.try_broadcast(Observation::WatchStopped {
            server_id: self.server.id,
            events_captured: events_total,
        });
        self.shared.close_consumers();
        tracing::info!(host = %self.server.hostname, events = events_total, "Watcher stopped");
        Ok(())
    }

    async fn connect_and_tail(
        &mut self,
        session_row_id: i64,
        seen_sources: &mut HashSet<String>,
        last_offset: &mut u64,
        events_total: &mut i64,
    ) -> Result<()> {
        let session = self
            .dialer
            .dial(&self.server.ip_address, self.server.ssh_port)
            .await?;

        let use_journald = session
            .exec("journalctl --version")
            .await
            .map(|out| out.success())
            .unwrap_or(false);

        let log_path = log_parser::detect_log_paths(self.server.os_type)[0];

        if !use_journald {
            self.catch_up(
                &*session,
                session_row_id,
                log_path,
                seen_sources,
                last_offset,
                events_total,
            )
            .await?;
        }

        let command = if use_journald {
            "journalctl -u sshd -u ssh --output=json --follow -n 0".to_string()
        } else {
            format!("tail -F {log_path} 2>/dev/null")
        };

        let mut lines = session.stream_lines(&command).await?;
        tracing::info!(
            host = %self.server.hostname,
            journald = use_journald,
            "Watcher tailing"
        );

        let mut stop_rx = self.stop_rx.clone();
        loop {
            // Pause holds the connection and simply stops consuming.
            while self.shared.paused.load(Ordering::SeqCst)
                && self.shared.running.load(Ordering::SeqCst)
            {
                tokio::time::sleep(PAUSE_POLL).await;
            }
            if !self.shared.running.load(Ordering::SeqCst) {
                session.close().await;
                return Ok(());
            }

            let line = tokio::select! {
                line = lines.next() => line,
                _ = stop_rx.changed() => {
                    session.close().await;
                    return Ok(());
                }
            };

            let Some(line) = line else {
                // Remote closed the stream.
                session.close().await;
                return Err(crate::error::ScanError::Ssh(keyspider_ssh::SshError::Closed));
            };
            let line = line.map_err(keyspider_ssh::SshError::Io)?;
            *last_offset += line.len() as u64 + 1;

            let parsed = if use_journald {
                log_parser::parse_journal_line(&line)
            } else {
                log_parser::parse_line(&line, self.server.os_type, Some(Utc::now()), None)
            };
            let Some(event) = parsed else { continue };

            let source = if use_journald {
                LogSource::Journald
            } else {
                LogSource::Syslog
            };
            self.handle_event(session_row_id, event, source, seen_sources, events_total)
                .await?;
        }
    }

    /// After a reconnect, recover lines written while we were away: rotated
    /// files are re-read from the start (bounded), grown files from the
    /// last byte offset.
    async fn catch_up(
        &self,
        session: &dyn SshSession,
        session_row_id: i64,
        log_path: &str,
        seen_sources: &mut HashSet<String>,
        last_offset: &mut u64,
        events_total: &mut i64,
    ) -> Result<()> {
        let Some(stat) = SftpReader::stat(session, log_path).await? else {
            return Ok(());
        };

        let content = if stat.size < *last_offset {
            tracing::info!(host = %self.server.hostname, path = %log_path, "Log rotated while disconnected");
            SftpReader::read_file_tail(
                session,
                log_path,
                self.log_config.max_lines_incremental,
                TAIL_CATCHUP_MAX_BYTES,
            )
            .await?
        } else if stat.size > *last_offset && *last_offset > 0 {
            session
                .sftp_read(log_path, *last_offset, stat.size - *last_offset)
                .await?
                .map(|raw| String::from_utf8_lossy(&raw).into_owned())
        } else {
            None
        };
        *last_offset = stat.size;

        let Some(content) = content else {
            return Ok(());
        };
        let outcome = log_parser::parse_log(
            &content,
            self.server.os_type,
            stat.mtime,
            self.server.scan_watermark,
        );
        for event in outcome.events {
            self.handle_event(
                session_row_id,
                event,
                LogSource::Syslog,
                seen_sources,
                events_total,
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_event(
        &self,
        session_row_id: i64,
        event: ParsedAuthEvent,
        source: LogSource,
        seen_sources: &mut HashSet<String>,
        events_total: &mut i64,
    ) -> Result<()> {
        let new_event = event.clone().into_new_event(source);
        let outcome = ingest::ingest_events(
            &self.store,
            self.server.id,
            std::slice::from_ref(&new_event),
            None,
        )?;

        if outcome.inserted > 0 {
            *events_total += 1;
            if session_row_id > 0 {
                self.store
                    .bump_watch_events(session_row_id, 1, event.timestamp)?;
            }
            self.store.advance_watermark(self.server.id, event.timestamp)?;
        }

        self.broadcast(Observation::AuthObserved {
            target_server_id: self.server.id,
            source_ip: event.source_ip.clone(),
            username: event.username.clone(),
            event_type: event.event_type,
            fingerprint: event.fingerprint.clone(),
            event_time: event.timestamp,
        })
        .await;

        if event.event_type == EventType::Accepted {
            if let Some((seeds, spider_depth)) = &self.auto_spider {
                if *spider_depth >= 1 && seen_sources.insert(event.source_ip.clone()) {
                    let seed = SpiderSeed {
                        source_ip: event.source_ip.clone(),
                        depth: 1,
                    };
                    if seeds.send(seed).await.is_err() {
                        tracing::debug!("Auto-spider queue closed");
                    }
                }
            }
        }

        Ok(())
    }

    /// Deliver to every consumer in subscription order. Awaits on full
    /// channels: backpressure instead of drops.
    async fn broadcast(&self, observation: Observation) {
        let senders: Vec<mpsc::Sender<Observation>> = {
            let consumers = self.shared.consumers.lock().expect("consumer list poisoned");
            consumers.iter().map(|c| c.tx.clone()).collect()
        };
        for tx in senders {
            // A closed receiver just means the consumer dropped its stream.
            let _ = tx.send(observation.clone()).await;
        }
    }
}

impl WatchShared {
    /// Non-blocking delivery for informational shutdown notices.
    fn try_broadcast(&self, observation: Observation) {
        let consumers = self.consumers.lock().expect("consumer list poisoned");
        for consumer in consumers.iter() {
            let _ = consumer.tx.try_send(observation.clone());
        }
    }

    /// Drop every registered sender. Each consumer's `recv()` then drains
    /// its buffered observations and returns `None` on the closed channel.
    fn close_consumers(&self) {
        let mut consumers = self.consumers.lock().expect("consumer list poisoned");
        consumers.clear();
    }
}

/// Cloneable control handle for a running watcher.
#[derive(Clone)]
pub struct WatchHandle {
    shared: Arc<WatchShared>,
}

impl WatchHandle {
    /// Stop the watcher and unblock every consumer by closing its channel.
    /// Buffered observations are still delivered before the stream ends.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.stop_tx.send(true);
        self.shared.close_consumers();
    }

    /// Suspend reading. The connection is held.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Resume reading at the held tail position.
    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }
}

/// Full jitter: uniform in `[0, delay]`.
fn full_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}
