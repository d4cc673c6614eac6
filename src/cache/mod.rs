//! Result cache (spec.md §4.6): keyed, TTL'd, single-flight, with LRU and
//! approximate byte-size eviction.
//!
//! The `DashMap<String, _>` keyed-store shape follows `server/manager.rs`'s
//! `Manager`; the "a concurrent winner already produced a value, adopt it"
//! short-circuit follows the retry loop in the teacher's API client.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use regex::Regex;
use tokio::sync::Notify;

use crate::engine::spec::ExecutionResult;
use crate::error::CrossExecError;
use crate::events::{Event, EventBus};

/// What gets stored per key: a snapshot of the settled result, its TTL and
/// bookkeeping for LRU/eviction.
#[derive(Clone)]
struct CacheEntry {
    value: ExecutionResult,
    ttl: Duration,
    inserted_at: Instant,
    hits: u64,
}

impl CacheEntry {
    fn is_stale(&self) -> bool {
        self.inserted_at.elapsed() >= self.ttl
    }

    fn approx_bytes(&self) -> usize {
        self.value.stdout.len() + self.value.stderr.len()
    }
}

/// Single-flight slot: either nothing is in flight, or a set of waiters is
/// parked on a `Notify` for the winner to publish its result.
enum InFlight {
    Running(Arc<Notify>),
}

/// Predicate deciding whether a settled result is admitted into the cache.
/// Default: only `ok() == true` results are cached (spec.md invariant 5).
pub type AdmissionPredicate = Arc<dyn Fn(&ExecutionResult) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct CachePolicy {
    pub key: String,
    pub ttl: Duration,
    pub admit: AdmissionPredicate,
}

impl CachePolicy {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
            admit: Arc::new(|r: &ExecutionResult| r.ok()),
        }
    }

    pub fn with_admission(mut self, admit: AdmissionPredicate) -> Self {
        self.admit = admit;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub approx_bytes: usize,
    pub evictions: u64,
}

pub struct ResultCache {
    entries: DashMap<String, CacheEntry>,
    /// Recency order for LRU eviction; front = least recently used.
    /// Guarded separately since DashMap gives no global ordering.
    lru: parking_lot::Mutex<VecDeque<String>>,
    in_flight: DashMap<String, InFlight>,
    max_entries: usize,
    max_bytes: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    events: Option<EventBus>,
}

impl ResultCache {
    pub fn new(max_entries: usize, max_bytes: usize, events: Option<EventBus>) -> Self {
        Self {
            entries: DashMap::new(),
            lru: parking_lot::Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            max_entries,
            max_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            events,
        }
    }

    fn touch_lru(&self, key: &str) {
        let mut lru = self.lru.lock();
        if let Some(pos) = lru.iter().position(|k| k == key) {
            lru.remove(pos);
        }
        lru.push_back(key.to_string());
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    /// Looks up a fresh (non-stale) entry, or registers interest in an
    /// in-flight build and awaits it. Returns `Ok(None)` when this caller is
    /// the one that must dispatch (no entry, nothing in flight, and it has
    /// claimed the in-flight slot).
    pub async fn get_or_claim(
        &self,
        key: &str,
    ) -> Result<Option<ExecutionResult>, CrossExecError> {
        loop {
            if let Some(mut entry) = self.entries.get_mut(key) {
                if !entry.is_stale() {
                    entry.hits += 1;
                    let value = entry.value.clone();
                    drop(entry);
                    self.touch_lru(key);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    self.emit(Event::CacheHit { key: key.to_string() });
                    return Ok(Some(value));
                }
            }

            // No fresh entry. Either join an in-flight build or claim it.
            let notify = match self.in_flight.get(key) {
                Some(slot) => match &*slot {
                    InFlight::Running(n) => n.clone(),
                },
                None => {
                    // Try to claim; if a racer beat us, loop and join them.
                    let notify = Arc::new(Notify::new());
                    let claimed = self
                        .in_flight
                        .entry(key.to_string())
                        .or_insert_with(|| InFlight::Running(notify.clone()));
                    match &*claimed {
                        InFlight::Running(n) if Arc::ptr_eq(n, &notify) => {
                            self.misses.fetch_add(1, Ordering::Relaxed);
                            self.emit(Event::CacheMiss { key: key.to_string() });
                            return Ok(None);
                        }
                        InFlight::Running(n) => n.clone(),
                    }
                }
            };

            notify.notified().await;
            // Winner published (or failed and cleared); loop to re-check.
            if self.in_flight.contains_key(key) {
                // Winner failed without publishing an entry: surface a miss
                // to this waiter too, it may retry independently.
                continue;
            }
        }
    }

    /// Called by whichever caller claimed the in-flight slot. Always clears
    /// the slot and wakes joiners, whether or not the result was admitted.
    pub fn publish(&self, key: &str, policy: &CachePolicy, result: &ExecutionResult) {
        if (policy.admit)(result) {
            self.insert(key, result.clone(), policy.ttl);
        }
        if let Some((_, InFlight::Running(notify))) = self.in_flight.remove(key) {
            notify.notify_waiters();
        }
    }

    /// Called when the claiming dispatch itself failed before producing a
    /// result (e.g. adapter error). Clears the slot without caching.
    pub fn abort_claim(&self, key: &str) {
        if let Some((_, InFlight::Running(notify))) = self.in_flight.remove(key) {
            notify.notify_waiters();
        }
    }

    fn insert(&self, key: &str, value: ExecutionResult, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                ttl,
                inserted_at: Instant::now(),
                hits: 0,
            },
        );
        self.touch_lru(key);
        self.evict_if_needed();
    }

    fn evict_if_needed(&self) {
        loop {
            let over_count = self.entries.len() > self.max_entries;
            let over_bytes = self.approx_bytes() > self.max_bytes;
            if !over_count && !over_bytes {
                break;
            }
            let victim = {
                let mut lru = self.lru.lock();
                lru.pop_front()
            };
            match victim {
                Some(key) => {
                    if self.entries.remove(&key).is_some() {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        self.emit(Event::CacheEvict { key });
                    }
                }
                None => break,
            }
        }
    }

    fn approx_bytes(&self) -> usize {
        self.entries.iter().map(|e| e.approx_bytes()).sum()
    }

    pub fn delete(&self, key: &str) -> bool {
        let removed = self.entries.remove(key).is_some();
        if removed {
            self.lru.lock().retain(|k| k != key);
        }
        removed
    }

    pub fn clear_pattern(&self, pattern: &Regex) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| pattern.is_match(k))
            .collect();
        for key in &keys {
            self.delete(key);
        }
        keys.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.lru.lock().clear();
    }

    /// By-command invalidation: drops every entry whose key starts with
    /// `command_prefix`. Fires only after a successful settle, never on
    /// failure (DESIGN.md open-question decision).
    pub fn invalidate_on(&self, command_prefix: &str) {
        let keys: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(command_prefix))
            .collect();
        for key in &keys {
            self.delete(key);
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
            approx_bytes: self.approx_bytes(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn sample_result(ok: bool) -> ExecutionResult {
        ExecutionResult {
            command: "echo hi".into(),
            stdout: Bytes::from_static(b"hi\n"),
            stderr: Bytes::new(),
            exit_code: Some(if ok { 0 } else { 1 }),
            signal: None,
            started_at: chrono::Utc::now(),
            ended_at: chrono::Utc::now(),
            duration: Duration::from_millis(1),
            adapter_tag: "local",
            target_descriptor: "local".into(),
            cause: None,
            cached_at: None,
        }
    }

    #[tokio::test]
    async fn hit_after_publish() {
        let cache = ResultCache::new(100, 1_000_000, None);
        let policy = CachePolicy::new("k1", Duration::from_secs(60));
        assert!(cache.get_or_claim("k1").await.unwrap().is_none());
        let result = sample_result(true);
        cache.publish("k1", &policy, &result);
        let hit = cache.get_or_claim("k1").await.unwrap();
        assert!(hit.is_some());
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn admission_rejects_failed_result() {
        let cache = ResultCache::new(100, 1_000_000, None);
        let policy = CachePolicy::new("k2", Duration::from_secs(60));
        assert!(cache.get_or_claim("k2").await.unwrap().is_none());
        cache.publish("k2", &policy, &sample_result(false));
        assert!(cache.get_or_claim("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ttl_expiry_forces_miss() {
        let cache = ResultCache::new(100, 1_000_000, None);
        let policy = CachePolicy::new("k3", Duration::from_millis(1));
        assert!(cache.get_or_claim("k3").await.unwrap().is_none());
        cache.publish("k3", &policy, &sample_result(true));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get_or_claim("k3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn single_flight_joiner_sees_published_result() {
        let cache = Arc::new(ResultCache::new(100, 1_000_000, None));
        let policy = CachePolicy::new("k4", Duration::from_secs(60));

        assert!(cache.get_or_claim("k4").await.unwrap().is_none());

        let joiner_cache = cache.clone();
        let joiner = tokio::spawn(async move { joiner_cache.get_or_claim("k4").await });

        tokio::task::yield_now().await;
        cache.publish("k4", &policy, &sample_result(true));

        let joined = joiner.await.unwrap().unwrap();
        assert!(joined.is_some());
    }

    #[test]
    fn delete_and_clear_pattern() {
        let cache = ResultCache::new(100, 1_000_000, None);
        cache.insert("cmd:foo:1", sample_result(true), Duration::from_secs(60));
        cache.insert("cmd:foo:2", sample_result(true), Duration::from_secs(60));
        cache.insert("cmd:bar:1", sample_result(true), Duration::from_secs(60));
        let removed = cache.clear_pattern(&Regex::new("^cmd:foo:").unwrap());
        assert_eq!(removed, 2);
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn byte_eviction_drops_least_recently_used() {
        let cache = ResultCache::new(100, 6, None);
        cache.insert("a", sample_result(true), Duration::from_secs(60));
        cache.insert("b", sample_result(true), Duration::from_secs(60));
        assert!(cache.stats().entries <= 1 || cache.stats().approx_bytes <= 6);
    }
}
