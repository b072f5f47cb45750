//! TTL correlation caches: fingerprint → protocol-specific incident
//! identity.
//!
//! One cache exists per protocol family, shared by every publisher of
//! that family, so a resolve correlates with its trigger even if the
//! configured endpoint URL moved between refreshes. Entries expire 24h
//! after creation; expiry is lazy on read plus an hourly sweep. The
//! sweep never holds a write lock across the scan.

use crate::clock::{Clock, MonotonicClock};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Dedup key held by the paging service for a running incident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagerCorrelation {
    pub dedup_key: String,
}

/// Incident id assigned by the incident tracker on creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerCorrelation {
    pub incident_id: String,
}

/// Chat message anchor: replies for the same fingerprint thread under
/// the first message's timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatCorrelation {
    pub message_ts: String,
    pub thread_ts: String,
}

struct Entry<V> {
    value: V,
    created_at_millis: u64,
}

/// A TTL map from alert fingerprint to correlation value.
pub struct CorrelationCache<V> {
    name: &'static str,
    entries: RwLock<HashMap<String, Entry<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<V: Clone + Send + Sync> CorrelationCache<V> {
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self::with_clock(name, ttl, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(name: &'static str, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { name, entries: RwLock::new(HashMap::new()), ttl, clock }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn set(&self, fingerprint: &str, value: V) {
        let now = self.clock.now_millis();
        self.entries
            .write()
            .expect("CorrelationCache.set: lock poisoned")
            .insert(fingerprint.to_string(), Entry { value, created_at_millis: now });
    }

    /// Look up a fingerprint. An expired entry is deleted and reported
    /// as a miss.
    pub fn get(&self, fingerprint: &str) -> Option<V> {
        let now = self.clock.now_millis();
        {
            let entries = self.entries.read().expect("CorrelationCache.get: lock poisoned");
            match entries.get(fingerprint) {
                None => return None,
                Some(entry) if !self.expired(entry, now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }
        // Expired: upgrade to a write lock and re-check before removal.
        let mut entries = self.entries.write().expect("CorrelationCache.get: lock poisoned");
        if let Some(entry) = entries.get(fingerprint) {
            if self.expired(entry, now) {
                entries.remove(fingerprint);
            } else {
                return Some(entry.value.clone());
            }
        }
        None
    }

    pub fn delete(&self, fingerprint: &str) {
        self.entries
            .write()
            .expect("CorrelationCache.delete: lock poisoned")
            .remove(fingerprint);
    }

    /// Remove every expired entry. Expired keys are collected under a
    /// read lock, then removed one by one with a fresh expiry check.
    pub fn cleanup(&self) -> usize {
        let now = self.clock.now_millis();
        let expired: Vec<String> = {
            let entries = self.entries.read().expect("CorrelationCache.cleanup: lock poisoned");
            entries
                .iter()
                .filter(|(_, e)| self.expired(e, now))
                .map(|(k, _)| k.clone())
                .collect()
        };
        let mut removed = 0;
        for key in expired {
            let mut entries =
                self.entries.write().expect("CorrelationCache.cleanup: lock poisoned");
            if let Some(entry) = entries.get(&key) {
                if self.expired(entry, now) {
                    entries.remove(&key);
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::debug!(cache = self.name, removed, "correlation cache sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("CorrelationCache.len: lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, entry: &Entry<V>, now_millis: u64) -> bool {
        now_millis.saturating_sub(entry.created_at_millis) >= self.ttl.as_millis() as u64
    }
}

impl<V> std::fmt::Debug for CorrelationCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.entries.read().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("CorrelationCache")
            .field("name", &self.name)
            .field("len", &len)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Anything the background sweeper can clean.
pub trait Sweepable: Send + Sync {
    fn sweep(&self) -> usize;
    fn sweep_name(&self) -> &'static str;
}

impl<V: Clone + Send + Sync> Sweepable for CorrelationCache<V> {
    fn sweep(&self) -> usize {
        self.cleanup()
    }

    fn sweep_name(&self) -> &'static str {
        self.name
    }
}

/// Owner handle for the periodic sweep task.
pub struct SweeperHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

/// Spawn the periodic sweep over the given caches. The task exits when
/// [`SweeperHandle::stop`] is called.
pub fn spawn_sweeper(caches: Vec<Arc<dyn Sweepable>>, interval: Duration) -> SweeperHandle {
    let (stop, mut stopped) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first sweep
        // happens one interval after startup.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for cache in &caches {
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::info!(cache = cache.sweep_name(), removed, "swept expired correlations");
                        }
                    }
                }
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        return;
                    }
                }
            }
        }
    });
    SweeperHandle { stop, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const DAY_MS: u64 = 24 * 60 * 60 * 1000;

    fn cache(clock: &ManualClock) -> CorrelationCache<PagerCorrelation> {
        CorrelationCache::with_clock(
            "pager",
            Duration::from_millis(DAY_MS),
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn set_get_round_trip() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        cache.set("fp1", PagerCorrelation { dedup_key: "dk1".into() });
        assert_eq!(cache.get("fp1").unwrap().dedup_key, "dk1");
    }

    #[test]
    fn get_is_a_miss_after_ttl() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        cache.set("fp1", PagerCorrelation { dedup_key: "dk1".into() });

        clock.advance(DAY_MS - 1);
        assert!(cache.get("fp1").is_some());

        clock.advance(1);
        assert!(cache.get("fp1").is_none());
        // The lazy expiry also removed the entry.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn delete_removes_entry() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        cache.set("fp1", PagerCorrelation { dedup_key: "dk1".into() });
        cache.delete("fp1");
        assert!(cache.get("fp1").is_none());
    }

    #[test]
    fn set_refreshes_created_at() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        cache.set("fp1", PagerCorrelation { dedup_key: "dk1".into() });
        clock.advance(DAY_MS / 2);
        cache.set("fp1", PagerCorrelation { dedup_key: "dk2".into() });
        clock.advance(DAY_MS / 2);
        assert_eq!(cache.get("fp1").unwrap().dedup_key, "dk2");
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let clock = ManualClock::new();
        let cache = cache(&clock);
        cache.set("old", PagerCorrelation { dedup_key: "a".into() });
        clock.advance(DAY_MS / 2);
        cache.set("fresh", PagerCorrelation { dedup_key: "b".into() });
        clock.advance(DAY_MS / 2);

        assert_eq!(cache.cleanup(), 1);
        assert!(cache.get("old").is_none());
        assert!(cache.get("fresh").is_some());
    }

    #[tokio::test]
    async fn sweeper_runs_and_stops() {
        let clock = ManualClock::new();
        let cache = Arc::new(CorrelationCache::with_clock(
            "pager",
            Duration::from_millis(10),
            Arc::new(clock.clone()),
        ));
        cache.set("fp1", PagerCorrelation { dedup_key: "dk".into() });
        clock.advance(11);

        let handle = spawn_sweeper(
            vec![Arc::clone(&cache) as Arc<dyn Sweepable>],
            Duration::from_millis(5),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.len(), 0);
        handle.stop().await;
    }
}
