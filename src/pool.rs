/*!
 * # Upstream Pool Module
 *
 * Holds the upstream proxy descriptors, their live concurrency counters and
 * health results, and picks the least-loaded upstream for each request.
 *
 * The pool order is the selector's iteration order. It is re-sorted after
 * every health pass under a single ordering lock; selection reads the order
 * lock-free and may observe any recent version, which is acceptable because
 * selection is advisory. Counter and health writes are serialized per URL
 * by lazily created keyed locks.
 */

use std::cmp::Reverse;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::Mutex;
use url::Url;

use crate::error::{ProxyError, Result};

/// Default per-upstream connection capacity
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1000;

/// Default upstream priority (1 = high, 2 = medium, 3 = low)
pub const DEFAULT_PRIORITY: u8 = 2;

/// One configured upstream proxy
///
/// Created from a `[scheme://][user:pass@]host[:port]` spec. Normalization
/// prepends `http://` when the scheme is missing and moves any userinfo out
/// of the URL into `credentials`, so the stored URL never carries
/// credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
    url: String,
    host: String,
    port: Option<u16>,
    max_connections: u32,
    priority: u8,
    credentials: Option<String>,
}

impl Upstream {
    /// Parse an upstream spec with default capacity and priority
    pub fn parse(spec: &str) -> Result<Self> {
        Self::with_limits(spec, DEFAULT_MAX_CONNECTIONS, DEFAULT_PRIORITY)
    }

    /// Parse an upstream spec with explicit capacity and priority
    pub fn with_limits(spec: &str, max_connections: u32, priority: u8) -> Result<Self> {
        if max_connections == 0 {
            return Err(ProxyError::Config(
                "upstream max_connections must be at least 1".to_string(),
            ));
        }

        let raw = if spec.contains("://") {
            spec.to_string()
        } else {
            format!("http://{}", spec.trim_start_matches('/'))
        };
        let mut url = Url::parse(&raw)?;

        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("upstream URL has no host: {}", spec)))?
            .to_string();

        let credentials = if url.username().is_empty() {
            None
        } else {
            Some(format!(
                "{}:{}",
                url.username(),
                url.password().unwrap_or("")
            ))
        };
        if credentials.is_some()
            && (url.set_username("").is_err() || url.set_password(None).is_err())
        {
            return Err(ProxyError::Config(format!(
                "cannot strip credentials from upstream URL: {}",
                spec
            )));
        }

        let port = url.port();
        Ok(Self {
            url: url.to_string(),
            host,
            port,
            max_connections,
            priority,
            credentials,
        })
    }

    /// Normalized URL, without userinfo
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Connect port, defaulting to 80 when the URL did not carry one
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(80)
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// `user:pass` extracted from the URL, if any
    pub fn credentials(&self) -> Option<&str> {
        self.credentials.as_deref()
    }
}

/// Latest probe result for one upstream
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthEntry {
    /// Wall time of the most recent successful TCP connect, seconds
    pub latency: Option<f64>,
    pub healthy: bool,
}

/// The pool of upstream proxies and their shared runtime state
pub struct UpstreamPool {
    order: ArcSwap<Vec<Arc<Upstream>>>,
    concurrent: DashMap<String, u32>,
    health: DashMap<String, HealthEntry>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    order_lock: Mutex<()>,
}

impl UpstreamPool {
    /// Build a pool, deduplicating by normalized URL in first-seen order
    pub fn new(upstreams: Vec<Upstream>) -> Self {
        let pool = Self {
            order: ArcSwap::from_pointee(Vec::new()),
            concurrent: DashMap::new(),
            health: DashMap::new(),
            locks: DashMap::new(),
            order_lock: Mutex::new(()),
        };
        for upstream in upstreams {
            pool.push(upstream);
        }
        pool
    }

    /// Append an upstream unless its URL is already present
    pub fn push(&self, upstream: Upstream) -> bool {
        let mut order = self.order.load_full().as_ref().clone();
        if order.iter().any(|existing| existing.url() == upstream.url()) {
            return false;
        }
        self.concurrent.entry(upstream.url().to_string()).or_insert(0);
        order.push(Arc::new(upstream));
        self.order.store(Arc::new(order));
        true
    }

    pub fn len(&self) -> usize {
        self.order.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.load().is_empty()
    }

    /// Current pool order
    pub fn snapshot(&self) -> Arc<Vec<Arc<Upstream>>> {
        self.order.load_full()
    }

    /// Pick the upstream for one request
    ///
    /// Walks the pool in its current order. An idle upstream (load ratio 0,
    /// below capacity) is returned immediately, preferring earlier
    /// positions; otherwise the smallest `current / max_connections` ratio
    /// wins, ties resolved by pool order.
    pub fn choose_upstream(&self) -> Result<Arc<Upstream>> {
        let order = self.order.load_full();

        let mut best: Option<&Arc<Upstream>> = None;
        let mut best_ratio = f64::INFINITY;

        for upstream in order.iter() {
            let current = self.current(upstream.url());
            let cap = upstream.max_connections().max(1) as f64;
            let ratio = current as f64 / cap;

            if ratio == 0.0 && current < upstream.max_connections() {
                return Ok(Arc::clone(upstream));
            }
            if ratio < best_ratio {
                best_ratio = ratio;
                best = Some(upstream);
            }
        }

        best.map(Arc::clone).ok_or(ProxyError::NoUpstream)
    }

    /// Live connection count for a URL, 0 when unknown
    pub fn current(&self, url: &str) -> u32 {
        self.concurrent.get(url).map(|count| *count).unwrap_or(0)
    }

    /// Count one request dispatched to `url`
    ///
    /// Must run before the upstream socket is opened.
    pub async fn increment(&self, url: &str) {
        let lock = self.lock_for(url);
        let _guard = lock.lock().await;
        *self.concurrent.entry(url.to_string()).or_insert(0) += 1;
    }

    /// Count one request completed on `url`, saturating at 0
    ///
    /// Must run on every terminal path, including failure.
    pub async fn decrement(&self, url: &str) {
        let lock = self.lock_for(url);
        let _guard = lock.lock().await;
        if let Some(mut count) = self.concurrent.get_mut(url) {
            *count = count.saturating_sub(1);
        }
    }

    /// Store the latest probe result for `url`
    pub async fn record_health(&self, url: &str, entry: HealthEntry) {
        let lock = self.lock_for(url);
        let _guard = lock.lock().await;
        self.health.insert(url.to_string(), entry);
    }

    pub fn health_of(&self, url: &str) -> Option<HealthEntry> {
        self.health.get(url).map(|entry| *entry)
    }

    /// Re-sort the pool after a health pass
    ///
    /// Sort key: unknown latency last, then latency ascending, then
    /// priority ascending, then larger capacity first. Runs under the
    /// single pool-ordering lock; the sort is stable, so equal keys keep
    /// their first-seen order.
    pub async fn reorder(&self) {
        let _guard = self.order_lock.lock().await;

        let order = self.order.load_full();
        let mut keyed: Vec<((bool, u64, u8, Reverse<u32>), Arc<Upstream>)> = order
            .iter()
            .map(|upstream| {
                let latency = self
                    .health
                    .get(upstream.url())
                    .and_then(|entry| entry.latency);
                let key = (
                    latency.is_none(),
                    latency.map(|l| (l * 1000.0) as u64).unwrap_or(u64::MAX),
                    upstream.priority(),
                    Reverse(upstream.max_connections()),
                );
                (key, Arc::clone(upstream))
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));

        self.order
            .store(Arc::new(keyed.into_iter().map(|(_, u)| u).collect()));
    }

    /// The per-URL lock, created on first touch
    fn lock_for(&self, url: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(spec: &str, max_connections: u32, priority: u8) -> Upstream {
        Upstream::with_limits(spec, max_connections, priority).unwrap()
    }

    #[test]
    fn test_scheme_prepended_when_missing() {
        let upstream = Upstream::parse("proxy1.example:3128").unwrap();
        assert_eq!(upstream.url(), "http://proxy1.example:3128/");
        assert_eq!(upstream.host(), "proxy1.example");
        assert_eq!(upstream.port(), 3128);
        assert_eq!(upstream.max_connections(), DEFAULT_MAX_CONNECTIONS);
        assert_eq!(upstream.priority(), DEFAULT_PRIORITY);
    }

    #[test]
    fn test_userinfo_moved_to_credentials() {
        let upstream = Upstream::parse("user:pass@10.0.0.1:8080").unwrap();
        assert_eq!(upstream.credentials(), Some("user:pass"));
        assert!(!upstream.url().contains('@'));
        assert_eq!(upstream.host(), "10.0.0.1");
        assert_eq!(upstream.port(), 8080);
    }

    #[test]
    fn test_port_defaults_to_80() {
        let upstream = Upstream::parse("http://proxy.example").unwrap();
        assert_eq!(upstream.port(), 80);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(Upstream::with_limits("proxy.example", 0, 1).is_err());
    }

    #[test]
    fn test_pool_deduplicates_first_seen() {
        let pool = UpstreamPool::new(vec![
            upstream("a.example", 10, 1),
            upstream("b.example", 20, 2),
            upstream("a.example", 99, 3),
        ]);
        assert_eq!(pool.len(), 2);
        let order = pool.snapshot();
        assert_eq!(order[0].host(), "a.example");
        assert_eq!(order[0].max_connections(), 10);
        assert_eq!(order[1].host(), "b.example");
    }

    #[test]
    fn test_choose_empty_pool_fails() {
        let pool = UpstreamPool::new(vec![]);
        assert!(matches!(
            pool.choose_upstream(),
            Err(ProxyError::NoUpstream)
        ));
    }

    #[tokio::test]
    async fn test_choose_prefers_first_idle_upstream() {
        let pool = UpstreamPool::new(vec![
            upstream("a.example", 2, 2),
            upstream("b.example", 2, 2),
        ]);

        let first = pool.choose_upstream().unwrap();
        assert_eq!(first.host(), "a.example");
        pool.increment(first.url()).await;

        // A is busy now, so the idle B wins
        let second = pool.choose_upstream().unwrap();
        assert_eq!(second.host(), "b.example");
    }

    #[tokio::test]
    async fn test_choose_spreads_load_up_to_capacity() {
        let pool = UpstreamPool::new(vec![
            upstream("a.example", 2, 2),
            upstream("b.example", 2, 2),
        ]);

        for _ in 0..4 {
            let chosen = pool.choose_upstream().unwrap();
            pool.increment(chosen.url()).await;
        }

        let order = pool.snapshot();
        assert_eq!(pool.current(order[0].url()), 2);
        assert_eq!(pool.current(order[1].url()), 2);

        // every upstream saturated: smallest ratio ties resolve to pool order
        let fifth = pool.choose_upstream().unwrap();
        assert_eq!(fifth.host(), "a.example");
    }

    #[tokio::test]
    async fn test_choose_smallest_ratio_wins() {
        let pool = UpstreamPool::new(vec![
            upstream("a.example", 2, 2),
            upstream("b.example", 4, 2),
        ]);
        // a: 1/2, b: 1/4
        pool.increment("http://a.example/").await;
        pool.increment("http://b.example/").await;

        let chosen = pool.choose_upstream().unwrap();
        assert_eq!(chosen.host(), "b.example");
    }

    #[tokio::test]
    async fn test_concurrent_counting_quiesces() {
        let pool = Arc::new(UpstreamPool::new(vec![upstream("a.example", 100, 2)]));
        let url = pool.snapshot()[0].url().to_string();

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let pool = Arc::clone(&pool);
            let url = url.clone();
            tasks.push(tokio::spawn(async move { pool.increment(&url).await }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(pool.current(&url), 50);

        let mut tasks = Vec::new();
        for _ in 0..60 {
            let pool = Arc::clone(&pool);
            let url = url.clone();
            tasks.push(tokio::spawn(async move { pool.decrement(&url).await }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(pool.current(&url), 0);
    }

    #[tokio::test]
    async fn test_decrement_unknown_url_is_harmless() {
        let pool = UpstreamPool::new(vec![]);
        pool.decrement("http://nowhere.example/").await;
        assert_eq!(pool.current("http://nowhere.example/"), 0);
    }

    #[tokio::test]
    async fn test_reorder_by_latency_then_priority_then_capacity() {
        let pool = UpstreamPool::new(vec![
            upstream("slow.example", 10, 1),
            upstream("unknown.example", 10, 1),
            upstream("fast.example", 10, 3),
            upstream("big.example", 100, 1),
            upstream("small.example", 10, 1),
        ]);

        let entry = |latency| HealthEntry {
            latency,
            healthy: latency.is_some(),
        };
        pool.record_health("http://slow.example/", entry(Some(0.5))).await;
        pool.record_health("http://fast.example/", entry(Some(0.1))).await;
        pool.record_health("http://unknown.example/", entry(None)).await;
        // big and small share a latency: priority ties, capacity breaks it
        pool.record_health("http://big.example/", entry(Some(0.5))).await;
        pool.record_health("http://small.example/", entry(Some(0.5))).await;

        pool.reorder().await;

        let order = pool.snapshot();
        let hosts: Vec<&str> = order.iter().map(|u| u.host()).collect();
        assert_eq!(
            hosts,
            vec![
                "fast.example",
                "big.example",
                "slow.example",
                "small.example",
                "unknown.example"
            ]
        );
    }
}
