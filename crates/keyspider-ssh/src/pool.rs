//! Bounded SSH connection pool.
//!
//! Two FIFO semaphores bound concurrency: one global, one per server. Idle
//! sessions are reused after a keepalive probe; the probe and all dialing
//! run after the state lock is dropped, so an unhealthy remote never stalls
//! lessors for other hosts. Dial failures retry with full-jitter exponential
//! backoff; authentication failures do not retry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use keyspider_core::config::SshConfig;
use rand::Rng;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use uuid::Uuid;

use crate::error::{Result, SshError};
use crate::session::{SshDialer, SshSession};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// A leased session. Capacity is returned when the lease is dropped;
/// the session itself is only reused if returned via
/// [`ConnectionPool::release`].
pub struct Lease {
    id: Uuid,
    session: Arc<dyn SshSession>,
    server_key: String,
    _per_server: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("server_key", &self.server_key)
            .finish()
    }
}

impl Lease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session(&self) -> &Arc<dyn SshSession> {
        &self.session
    }

    pub fn server_key(&self) -> &str {
        &self.server_key
    }
}

struct ServerSlot {
    limiter: Arc<Semaphore>,
    idle: Vec<Arc<dyn SshSession>>,
}

struct PoolInner {
    dialer: Arc<dyn SshDialer>,
    config: SshConfig,
    global: Arc<Semaphore>,
    state: Mutex<HashMap<String, ServerSlot>>,
}

/// The process-wide SSH session pool. Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(dialer: Arc<dyn SshDialer>, config: SshConfig) -> Self {
        let global = Arc::new(Semaphore::new(config.max_total));
        Self {
            inner: Arc::new(PoolInner {
                dialer,
                config,
                global,
                state: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Lease a session for `host:port`, waiting FIFO for capacity up to the
    /// configured acquire timeout.
    pub async fn acquire(&self, host: &str, port: u16) -> Result<Lease> {
        let key = server_key(host, port);
        let acquire_timeout = self.inner.config.acquire_timeout();

        let global = timeout(acquire_timeout, self.inner.global.clone().acquire_owned())
            .await
            .map_err(|_| SshError::PoolExhausted)?
            .map_err(|_| SshError::Closed)?;

        let limiter = {
            let mut state = self.inner.state.lock().await;
            state
                .entry(key.clone())
                .or_insert_with(|| ServerSlot {
                    limiter: Arc::new(Semaphore::new(self.inner.config.max_per_server)),
                    idle: Vec::new(),
                })
                .limiter
                .clone()
        };

        let per_server = timeout(acquire_timeout, limiter.acquire_owned())
            .await
            .map_err(|_| SshError::PoolExhausted)?
            .map_err(|_| SshError::Closed)?;

        // Reuse an idle session if one survives its probe. The probe runs
        // with no lock held.
        loop {
            let candidate = {
                let mut state = self.inner.state.lock().await;
                state.get_mut(&key).and_then(|slot| slot.idle.pop())
            };
            let Some(session) = candidate else { break };

            match timeout(PROBE_TIMEOUT, session.is_alive()).await {
                Ok(true) => {
                    return Ok(Lease {
                        id: Uuid::new_v4(),
                        session,
                        server_key: key,
                        _per_server: per_server,
                        _global: global,
                    });
                }
                _ => {
                    tracing::debug!(server = %key, "Idle session failed probe, redialing");
                    session.close().await;
                }
            }
        }

        let session = self.dial_with_retry(host, port).await?;
        Ok(Lease {
            id: Uuid::new_v4(),
            session,
            server_key: key,
            _per_server: per_server,
            _global: global,
        })
    }

    /// Return a lease's session to the idle set for reuse.
    ///
    /// Dropping a lease without calling this releases capacity but discards
    /// the session.
    pub async fn release(&self, lease: Lease) {
        let Lease {
            session,
            server_key,
            ..
        } = lease;
        let mut state = self.inner.state.lock().await;
        if let Some(slot) = state.get_mut(&server_key) {
            slot.idle.push(session);
        }
        // Permits drop here, waking FIFO waiters.
    }

    /// One-shot reachability probe: dial once without touching pool
    /// capacity, close immediately.
    pub async fn check_reachable(&self, host: &str, port: u16) -> bool {
        match timeout(
            self.inner.config.connect_timeout(),
            self.inner.dialer.dial(host, port),
        )
        .await
        {
            Ok(Ok(session)) => {
                session.close().await;
                true
            }
            _ => false,
        }
    }

    /// Close every idle session. In-flight leases keep their sessions.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<dyn SshSession>> = {
            let mut state = self.inner.state.lock().await;
            state
                .values_mut()
                .flat_map(|slot| slot.idle.drain(..))
                .collect()
        };
        for session in drained {
            session.close().await;
        }
    }

    async fn dial_with_retry(&self, host: &str, port: u16) -> Result<Arc<dyn SshSession>> {
        let attempts = self.inner.config.dial_attempts.max(1);
        let connect_timeout = self.inner.config.connect_timeout();
        let mut delay = BACKOFF_BASE;
        let mut last_err = SshError::ConnectFailed {
            host: host.to_string(),
            port,
            reason: "no attempts made".to_string(),
        };

        for attempt in 1..=attempts {
            let dialed = timeout(connect_timeout, self.inner.dialer.dial(host, port)).await;
            match dialed {
                Ok(Ok(session)) => return Ok(session),
                Ok(Err(err @ SshError::AuthFailed { .. })) => return Err(err),
                Ok(Err(err)) => last_err = err,
                Err(_) => last_err = SshError::Timeout(connect_timeout),
            }

            if attempt < attempts {
                let jittered = full_jitter(delay);
                tracing::warn!(
                    host = %host,
                    port,
                    attempt,
                    delay_ms = jittered.as_millis() as u64,
                    error = %last_err,
                    "Dial failed, backing off"
                );
                tokio::time::sleep(jittered).await;
                delay = (delay * 2).min(BACKOFF_CAP);
            }
        }

        Err(last_err)
    }
}

fn server_key(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

/// Full jitter: uniform in `[0, delay]`.
fn full_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}
