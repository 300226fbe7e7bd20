//! In-memory TTL cache + per-key singleflight coalescing.
//!
//! The cache map, primitive map, and last-access map are `DashMap`s — lock-free
//! reads, atomic single-key mutation, no cross-key transactions,
//! the same shape this project family uses for its own concurrent routing
//! tables (`lunaroute-routing`'s `DashMap<String, Arc<...>>`).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Map as JsonMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::key::RequestKey;

const DEFAULT_DURATION: Duration = Duration::from_secs(300);
const DEFAULT_MAX_SIZE: usize = 1_000;
const ENTRY_SWEEP_PERIOD: Duration = Duration::from_secs(60);
const PRIMITIVE_SWEEP_PERIOD: Duration = Duration::from_secs(300);
const PRIMITIVE_GRACE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CachedEntry {
    tool_name: String,
    response: String,
    cached_at: Instant,
    expires_at: Instant,
    hit_count: u64,
}

impl CachedEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupStats {
    pub total_requests: u64,
    pub unique_requests: u64,
    pub deduplicated_requests: u64,
    pub cache_size: usize,
}

struct Inner {
    cache: DashMap<String, CachedEntry>,
    primitives: DashMap<String, Arc<AsyncMutex<()>>>,
    last_access: DashMap<String, Instant>,
    total_requests: AtomicU64,
    unique_requests: AtomicU64,
    deduplicated_requests: AtomicU64,
    max_size: usize,
    default_duration: Duration,
}

impl Inner {
    fn evict_least_used(&self) {
        if self.cache.len() < self.max_size {
            return;
        }
        let evict_count = (self.max_size / 10).max(1);
        let mut entries: Vec<(String, Instant, u64)> = self
            .cache
            .iter()
            .map(|e| (e.key().clone(), e.cached_at, e.hit_count))
            .collect();
        // least-used, then oldest (the reference calls this "LRU" but
        // it's really (hit_count asc, cached_at asc)).
        entries.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.1.cmp(&b.1)));
        for (fp, _, _) in entries.into_iter().take(evict_count) {
            self.cache.remove(&fp);
        }
    }

    fn entry_sweep_tick(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        for fp in &expired {
            self.cache.remove(fp);
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "dedup entry sweep removed expired entries");
        }
    }

    fn primitive_sweep_tick(&self) {
        let now = Instant::now();
        let stale: Vec<String> = self
            .last_access
            .iter()
            .filter(|e| {
                let idle = now.saturating_duration_since(*e.value()) >= PRIMITIVE_GRACE;
                idle && !self.cache.contains_key(e.key())
            })
            .map(|e| e.key().clone())
            .collect();
        for fp in &stale {
            self.primitives.remove(fp);
            self.last_access.remove(fp);
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "dedup primitive sweep dropped idle primitives");
        }
    }
}

/// Coalesces concurrent identical tool invocations and caches their results
/// for a bounded time. See the module-level docs for the full pipeline contract.
pub struct RequestDeduplicator {
    inner: Arc<Inner>,
    entry_sweep: JoinHandle<()>,
    primitive_sweep: JoinHandle<()>,
}

impl RequestDeduplicator {
    pub fn new() -> Self {
        Self::with_config(DEFAULT_MAX_SIZE, DEFAULT_DURATION)
    }

    pub fn with_config(max_size: usize, default_duration: Duration) -> Self {
        let inner = Arc::new(Inner {
            cache: DashMap::new(),
            primitives: DashMap::new(),
            last_access: DashMap::new(),
            total_requests: AtomicU64::new(0),
            unique_requests: AtomicU64::new(0),
            deduplicated_requests: AtomicU64::new(0),
            max_size,
            default_duration,
        });

        let entry_inner = inner.clone();
        let entry_sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ENTRY_SWEEP_PERIOD);
            loop {
                ticker.tick().await;
                entry_inner.entry_sweep_tick();
            }
        });

        let primitive_inner = inner.clone();
        let primitive_sweep = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRIMITIVE_SWEEP_PERIOD);
            loop {
                ticker.tick().await;
                primitive_inner.primitive_sweep_tick();
            }
        });

        Self {
            inner,
            entry_sweep,
            primitive_sweep,
        }
    }

    /// Run `executor` through the singleflight + TTL cache pipeline.
    /// `executor` runs at most once per key per this call (it may be shared
    /// with concurrent waiters on the same key).
    pub async fn process<F, Fut>(
        &self,
        tool: &str,
        params: JsonMap<String, Value>,
        executor: F,
        cache_duration: Option<Duration>,
    ) -> Result<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String>>,
    {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
        let key = RequestKey::make(tool, Some(params))?;
        let fp = key.fingerprint().to_string();

        if let Some(hit) = self.try_fast_path(&fp) {
            return Ok(hit);
        }

        let primitive = self
            .inner
            .primitives
            .entry(fp.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        self.inner.last_access.insert(fp.clone(), Instant::now());

        let _guard = primitive.lock().await;

        // Double-check: another waiter may have populated the cache while we
        // waited for the lock.
        if let Some(hit) = self.try_fast_path(&fp) {
            return Ok(hit);
        }

        self.inner.unique_requests.fetch_add(1, Ordering::Relaxed);
        let response = executor().await?;

        self.inner.evict_least_used();
        let now = Instant::now();
        let duration = cache_duration.unwrap_or(self.inner.default_duration);
        self.inner.cache.insert(
            fp,
            CachedEntry {
                tool_name: tool.to_string(),
                response: response.clone(),
                cached_at: now,
                expires_at: now + duration,
                hit_count: 0,
            },
        );

        Ok(response)
        // `_guard` drops here, releasing the primitive for reuse — it is not
        // removed eagerly, since imminent duplicate requests may still need it.
    }

    fn try_fast_path(&self, fp: &str) -> Option<String> {
        let now = Instant::now();
        let mut entry = self.inner.cache.get_mut(fp)?;
        if entry.is_expired(now) {
            return None;
        }
        entry.hit_count += 1;
        self.inner.deduplicated_requests.fetch_add(1, Ordering::Relaxed);
        Some(entry.response.clone())
    }

    /// Drop every cached entry for `tool`, regardless of parameters.
    pub fn invalidate_tool(&self, tool: &str) {
        let stale: Vec<String> = self
            .inner
            .cache
            .iter()
            .filter(|e| e.tool_name == tool)
            .map(|e| e.key().clone())
            .collect();
        for fp in stale {
            self.inner.cache.remove(&fp);
        }
    }

    pub fn invalidate(&self, tool: &str, params: JsonMap<String, Value>) -> Result<()> {
        let key = RequestKey::make(tool, Some(params))?;
        self.inner.cache.remove(key.fingerprint());
        Ok(())
    }

    pub fn clear(&self) {
        self.inner.cache.clear();
        self.inner.primitives.clear();
        self.inner.last_access.clear();
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            total_requests: self.inner.total_requests.load(Ordering::Relaxed),
            unique_requests: self.inner.unique_requests.load(Ordering::Relaxed),
            deduplicated_requests: self.inner.deduplicated_requests.load(Ordering::Relaxed),
            cache_size: self.inner.cache.len(),
        }
    }

    pub fn cached(&self, tool: &str, params: JsonMap<String, Value>) -> Result<bool> {
        let key = RequestKey::make(tool, Some(params))?;
        let now = Instant::now();
        Ok(self
            .inner
            .cache
            .get(key.fingerprint())
            .is_some_and(|e| !e.is_expired(now)))
    }

    /// Count of live, unexpired entries belonging to `tool`.
    pub fn cached_for(&self, tool: &str) -> usize {
        let now = Instant::now();
        self.inner
            .cache
            .iter()
            .filter(|e| e.tool_name == tool && !e.is_expired(now))
            .count()
    }

    /// Exposed for the primitive-leak-freedom property.
    pub fn primitive_count(&self) -> usize {
        self.inner.primitives.len()
    }

    pub fn dispose(self) {
        self.entry_sweep.abort();
        self.primitive_sweep.abort();
        self.inner.cache.clear();
        self.inner.primitives.clear();
        self.inner.last_access.clear();
    }
}

impl Default for RequestDeduplicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RequestDeduplicator {
    fn drop(&mut self) {
        self.entry_sweep.abort();
        self.primitive_sweep.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn params(pairs: &[(&str, Value)]) -> JsonMap<String, Value> {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[tokio::test]
    async fn cache_hit_skips_executor() {
        let dedup = RequestDeduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        let r1 = dedup
            .process("Q", params(&[("q", Value::String("a".into()))]), move || {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Ok("r".to_string()) }
            }, None)
            .await
            .unwrap();
        assert_eq!(r1, "r");

        let c = calls.clone();
        let r2 = dedup
            .process("Q", params(&[("q", Value::String("a".into()))]), move || {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Ok("should not run".to_string()) }
            }, None)
            .await
            .unwrap();

        assert_eq!(r2, "r");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn singleflight_runs_executor_once_under_concurrency() {
        let dedup = Arc::new(RequestDeduplicator::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let d = dedup.clone();
            let c = calls.clone();
            handles.push(tokio::spawn(async move {
                d.process("T", params(&[("x", Value::from(1))]), move || {
                    let c = c.clone();
                    async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        c.fetch_add(1, Ordering::SeqCst);
                        Ok("r".to_string())
                    }
                }, None)
                .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "r");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executor_failure_is_not_cached() {
        let dedup = RequestDeduplicator::new();
        let result = dedup
            .process("T", params(&[]), || async move {
                Err(CoreError::ExecutorFailure("boom".into()))
            }, None)
            .await;
        assert!(result.is_err());
        assert_eq!(dedup.stats().cache_size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry_reinvokes_executor() {
        let dedup = RequestDeduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c = calls.clone();
        dedup
            .process("T", params(&[]), move || {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Ok("r".to_string()) }
            }, Some(Duration::from_millis(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_millis(20)).await;

        let c = calls.clone();
        dedup
            .process("T", params(&[]), move || {
                c.fetch_add(1, Ordering::SeqCst);
                async move { Ok("r2".to_string()) }
            }, Some(Duration::from_millis(10)))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_removes_entry() {
        let dedup = RequestDeduplicator::new();
        dedup
            .process("T", params(&[]), || async move { Ok("r".to_string()) }, None)
            .await
            .unwrap();
        assert!(dedup.cached("T", params(&[])).unwrap());
        dedup.invalidate("T", params(&[])).unwrap();
        assert!(!dedup.cached("T", params(&[])).unwrap());
    }

    #[tokio::test]
    async fn clear_empties_cache_and_primitives() {
        let dedup = RequestDeduplicator::new();
        dedup
            .process("T", params(&[]), || async move { Ok("r".to_string()) }, None)
            .await
            .unwrap();
        dedup.clear();
        assert_eq!(dedup.stats().cache_size, 0);
        assert_eq!(dedup.primitive_count(), 0);
    }

    #[tokio::test]
    async fn invalidate_tool_only_drops_matching_tool() {
        let dedup = RequestDeduplicator::new();
        dedup
            .process("A", params(&[("x", Value::from(1))]), || async move { Ok("a".to_string()) }, None)
            .await
            .unwrap();
        dedup
            .process("B", params(&[("x", Value::from(1))]), || async move { Ok("b".to_string()) }, None)
            .await
            .unwrap();

        assert_eq!(dedup.cached_for("A"), 1);
        assert_eq!(dedup.cached_for("B"), 1);

        dedup.invalidate_tool("A");

        assert_eq!(dedup.cached_for("A"), 0);
        assert_eq!(dedup.cached_for("B"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn primitive_sweep_clears_idle_primitive_after_grace() {
        let dedup = RequestDeduplicator::with_config(DEFAULT_MAX_SIZE, Duration::from_millis(1));
        dedup
            .process("T", params(&[]), || async move { Ok("r".to_string()) }, None)
            .await
            .unwrap();
        assert_eq!(dedup.primitive_count(), 1);

        tokio::time::advance(PRIMITIVE_SWEEP_PERIOD * 2 + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(dedup.primitive_count(), 0);

        // Re-running for the same key still works: no corruption from the sweep.
        let result = dedup
            .process("T", params(&[]), || async move { Ok("r2".to_string()) }, None)
            .await
            .unwrap();
        assert_eq!(result, "r2");
    }
}
