//! Unreachable source detection and severity classification.
//!
//! A source IP seen in an auth log is probed from the jump host with a
//! plain TCP connect on the target's SSH port. Probe results are cached
//! with a TTL. Reverse DNS is attempted opportunistically and never fatal.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use ipnet::IpNet;
use keyspider_core::types::Severity;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// RFC1918 ranges plus the IPv6 ULA block.
fn private_ranges() -> [IpNet; 4] {
    [
        "10.0.0.0/8".parse().expect("static cidr"),
        "172.16.0.0/12".parse().expect("static cidr"),
        "192.168.0.0/16".parse().expect("static cidr"),
        "fc00::/7".parse().expect("static cidr"),
    ]
}

/// Whether an IP falls in a private (RFC1918/ULA) range.
pub fn is_private_ip(ip: &str) -> bool {
    let Ok(addr) = ip.parse::<IpAddr>() else {
        return false;
    };
    private_ranges().iter().any(|net| net.contains(&addr))
}

/// Severity of an unreachable source. Pure in its inputs:
///
/// | severity | condition |
/// |---|---|
/// | critical | accepted key event as root |
/// | high     | accepted key event, public source |
/// | medium   | accepted key event, private source |
/// | low      | failed attempts only |
pub fn classify_severity(is_root: bool, is_private: bool, has_accepted: bool) -> Severity {
    match (has_accepted, is_root, is_private) {
        (true, true, _) => Severity::Critical,
        (true, false, false) => Severity::High,
        (true, false, true) => Severity::Medium,
        (false, _, _) => Severity::Low,
    }
}

/// A reachability probe from the jump host.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self, ip: &str, port: u16) -> bool;
}

/// TCP connect probe with a bounded timeout.
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self, ip: &str, port: u16) -> bool {
        matches!(
            timeout(self.connect_timeout, TcpStream::connect((ip, port))).await,
            Ok(Ok(_))
        )
    }
}

/// Caching detector over a probe implementation.
pub struct UnreachableDetector {
    probe: Arc<dyn ReachabilityProbe>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, (bool, Instant)>>,
    resolver: Option<TokioAsyncResolver>,
}

impl UnreachableDetector {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, cache_ttl: Duration) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| {
                tracing::debug!(error = %e, "No system resolver, reverse DNS disabled");
                e
            })
            .ok();
        Self {
            probe,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
            resolver,
        }
    }

    /// Probe an IP, serving cached verdicts inside the TTL.
    pub async fn check_reachable(&self, ip: &str, port: u16) -> bool {
        let cache_key = format!("{ip}:{port}");

        {
            let cache = self.cache.lock().await;
            if let Some((verdict, probed_at)) = cache.get(&cache_key) {
                if probed_at.elapsed() < self.cache_ttl {
                    return *verdict;
                }
            }
        }

        let verdict = self.probe.probe(ip, port).await;
        self.cache
            .lock()
            .await
            .insert(cache_key, (verdict, Instant::now()));
        verdict
    }

    /// Opportunistic reverse DNS. `None` on any failure.
    pub async fn reverse_lookup(&self, ip: &str) -> Option<String> {
        let resolver = self.resolver.as_ref()?;
        let addr: IpAddr = ip.parse().ok()?;
        let response = resolver.reverse_lookup(addr).await.ok()?;
        response
            .iter()
            .next()
            .map(|name| name.to_utf8().trim_end_matches('.').to_string())
    }
}
