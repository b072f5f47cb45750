//! Token-bucket rate limiting for outbound publishers.
//!
//! Chat webhooks are limited to one message per second per webhook;
//! the pager client carries a configurable bucket (default 120/min).
//! `acquire` blocks by sleeping through the [`Sleeper`] seam, so a
//! caller bounds the wait by wrapping the future in a deadline and the
//! wait is cancelled by dropping the future.

use crate::clock::{Clock, MonotonicClock};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill_millis: u64,
}

/// A token bucket replenishing at `rate` tokens per second up to
/// `capacity`.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    capacity: f64,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl TokenBucket {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self::with_parts(
            rate,
            capacity,
            Arc::new(MonotonicClock::default()),
            Arc::new(TokioSleeper),
        )
    }

    pub fn with_parts(
        rate: f64,
        capacity: f64,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            state: Mutex::new(BucketState { tokens: capacity, last_refill_millis: now }),
            rate: rate.max(f64::MIN_POSITIVE),
            capacity: capacity.max(1.0),
            clock,
            sleeper,
        }
    }

    /// Take one token immediately, or report how long to wait.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock().expect("TokenBucket.try_acquire: mutex poisoned");
        let now = self.clock.now_millis();
        let elapsed_secs = now.saturating_sub(state.last_refill_millis) as f64 / 1000.0;
        state.tokens = (state.tokens + elapsed_secs * self.rate).min(self.capacity);
        state.last_refill_millis = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / self.rate))
        }
    }

    /// Take one token, sleeping until one is available. Cancelled by
    /// dropping the returned future.
    pub async fn acquire(&self) {
        loop {
            match self.try_acquire() {
                Ok(()) => return,
                Err(wait) => self.sleeper.sleep(wait).await,
            }
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Buckets keyed by endpoint (webhook URL), created lazily with shared
/// settings so every publisher of a family throttles per endpoint.
pub struct LimiterMap {
    inner: Mutex<HashMap<String, Arc<TokenBucket>>>,
    rate: f64,
    capacity: f64,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl LimiterMap {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self::with_parts(
            rate,
            capacity,
            Arc::new(MonotonicClock::default()),
            Arc::new(TokioSleeper),
        )
    }

    pub fn with_parts(
        rate: f64,
        capacity: f64,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self { inner: Mutex::new(HashMap::new()), rate, capacity, clock, sleeper }
    }

    pub fn for_key(&self, key: &str) -> Arc<TokenBucket> {
        let mut map = self.inner.lock().expect("LimiterMap.for_key: mutex poisoned");
        map.entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(TokenBucket::with_parts(
                    self.rate,
                    self.capacity,
                    Arc::clone(&self.clock),
                    Arc::clone(&self.sleeper),
                ))
            })
            .clone()
    }
}

impl std::fmt::Debug for LimiterMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys = self.inner.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("LimiterMap")
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .field("buckets", &keys)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;

    /// Sleeper that advances a manual clock instead of waiting, so
    /// blocking acquires resolve deterministically.
    #[derive(Debug, Clone)]
    struct AdvancingSleeper {
        clock: ManualClock,
        slept: Arc<Mutex<Vec<Duration>>>,
    }

    #[async_trait]
    impl Sleeper for AdvancingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
            self.clock.advance(duration.as_millis() as u64 + 1);
        }
    }

    fn one_per_second(clock: &ManualClock) -> (TokenBucket, Arc<Mutex<Vec<Duration>>>) {
        let slept = Arc::new(Mutex::new(Vec::new()));
        let sleeper = AdvancingSleeper { clock: clock.clone(), slept: Arc::clone(&slept) };
        let bucket =
            TokenBucket::with_parts(1.0, 1.0, Arc::new(clock.clone()), Arc::new(sleeper));
        (bucket, slept)
    }

    #[test]
    fn first_acquire_is_immediate() {
        let clock = ManualClock::new();
        let (bucket, _) = one_per_second(&clock);
        assert!(bucket.try_acquire().is_ok());
    }

    #[test]
    fn exhausted_bucket_reports_wait() {
        let clock = ManualClock::new();
        let (bucket, _) = one_per_second(&clock);
        bucket.try_acquire().unwrap();
        let wait = bucket.try_acquire().unwrap_err();
        assert!(wait > Duration::from_millis(900), "wait was {wait:?}");
    }

    #[test]
    fn tokens_replenish_with_time() {
        let clock = ManualClock::new();
        let (bucket, _) = one_per_second(&clock);
        bucket.try_acquire().unwrap();
        clock.advance(1000);
        assert!(bucket.try_acquire().is_ok());
    }

    #[test]
    fn capacity_caps_refill() {
        let clock = ManualClock::new();
        let (bucket, _) = one_per_second(&clock);
        clock.advance(60_000);
        bucket.try_acquire().unwrap();
        // Only one token fits in a capacity-1 bucket however long we wait.
        assert!(bucket.try_acquire().is_err());
    }

    #[tokio::test]
    async fn blocking_acquire_spaces_consecutive_messages() {
        let clock = ManualClock::new();
        let (bucket, slept) = one_per_second(&clock);

        bucket.acquire().await;
        bucket.acquire().await;
        bucket.acquire().await;

        let waits = slept.lock().unwrap();
        assert_eq!(waits.len(), 2, "second and third acquires must wait");
        for wait in waits.iter() {
            assert!(*wait >= Duration::from_millis(900));
        }
    }

    #[test]
    fn limiter_map_shares_buckets_per_key() {
        let map = LimiterMap::new(1.0, 1.0);
        let a = map.for_key("https://hooks.example.com/a");
        let b = map.for_key("https://hooks.example.com/a");
        let other = map.for_key("https://hooks.example.com/b");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn pager_bucket_allows_burst_up_to_capacity() {
        let clock = ManualClock::new();
        let bucket = TokenBucket::with_parts(
            2.0,
            120.0,
            Arc::new(clock.clone()),
            Arc::new(crate::sleeper::InstantSleeper),
        );
        for _ in 0..120 {
            assert!(bucket.try_acquire().is_ok());
        }
        assert!(bucket.try_acquire().is_err());
    }
}
