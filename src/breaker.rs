//! Per-target circuit breakers with lock-free atomics.
//!
//! One breaker exists per target name, shared by the dispatch queue and
//! the fan-out path. State mutations for a target are serialized by the
//! atomic transitions; a lost compare-exchange means another caller
//! already performed the same transition.

use crate::clock::{Clock, MonotonicClock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_OPEN => BreakerState::Open,
            STATE_HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures in closed state before opening.
    pub failure_threshold: u32,
    /// How long an open breaker refuses attempts.
    pub open_timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

/// Hook invoked on every state transition, for metrics.
pub type TransitionHook = Arc<dyn Fn(&str, BreakerState, BreakerState) + Send + Sync>;

pub struct CircuitBreaker {
    name: String,
    state: AtomicU8,
    failures: AtomicU32,
    half_open_successes: AtomicU32,
    opened_at_millis: AtomicU64,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    on_transition: Option<TransitionHook>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failures", &self.failures.load(Ordering::Relaxed))
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: BreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            state: AtomicU8::new(STATE_CLOSED),
            failures: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            config,
            clock,
            on_transition: None,
        }
    }

    pub fn with_transition_hook(mut self, hook: TransitionHook) -> Self {
        self.on_transition = Some(hook);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        BreakerState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    /// Whether a request may be attempted right now. The first call
    /// after the open timeout elapses moves the breaker to half-open
    /// and is permitted.
    pub fn can_attempt(&self) -> bool {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED | STATE_HALF_OPEN => true,
            STATE_OPEN => {
                let opened_at = self.opened_at_millis.load(Ordering::Acquire);
                let elapsed = self.clock.now_millis().saturating_sub(opened_at);
                if elapsed < self.config.open_timeout.as_millis() as u64 {
                    return false;
                }
                match self.state.compare_exchange(
                    STATE_OPEN,
                    STATE_HALF_OPEN,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.half_open_successes.store(0, Ordering::Release);
                        self.emit(BreakerState::Open, BreakerState::HalfOpen);
                        tracing::info!(target_name = %self.name, "circuit breaker → half-open");
                        true
                    }
                    // Lost the race: someone else already transitioned.
                    Err(raw) => raw != STATE_OPEN,
                }
            }
            _ => true,
        }
    }

    pub fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.failures.store(0, Ordering::Release);
            }
            STATE_HALF_OPEN => {
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.failures.store(0, Ordering::Release);
                    self.half_open_successes.store(0, Ordering::Release);
                    self.opened_at_millis.store(0, Ordering::Release);
                    self.emit(BreakerState::HalfOpen, BreakerState::Closed);
                    tracing::info!(target_name = %self.name, "circuit breaker → closed");
                }
            }
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    self.emit(BreakerState::Closed, BreakerState::Open);
                    tracing::warn!(
                        target_name = %self.name,
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker → open"
                    );
                }
            }
            STATE_HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.opened_at_millis.store(self.clock.now_millis(), Ordering::Release);
                    self.half_open_successes.store(0, Ordering::Release);
                    self.emit(BreakerState::HalfOpen, BreakerState::Open);
                    tracing::warn!(target_name = %self.name, "circuit breaker: probe failed → open");
                }
            }
            _ => {
                // Already open; nothing to count.
            }
        }
    }

    fn emit(&self, from: BreakerState, to: BreakerState) {
        if let Some(hook) = &self.on_transition {
            hook(&self.name, from, to);
        }
    }
}

/// Lazily created, shared breakers keyed by target name.
#[derive(Clone)]
pub struct BreakerMap {
    inner: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    on_transition: Option<TransitionHook>,
}

impl BreakerMap {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), config, clock, on_transition: None }
    }

    pub fn with_transition_hook(mut self, hook: TransitionHook) -> Self {
        self.on_transition = Some(hook);
        self
    }

    /// Breaker for the given target, created on first use and shared
    /// thereafter.
    pub fn for_target(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut map = self.inner.lock().expect("BreakerMap.for_target: mutex poisoned");
        map.entry(name.to_string())
            .or_insert_with(|| {
                let mut breaker =
                    CircuitBreaker::with_clock(name, self.config, Arc::clone(&self.clock));
                if let Some(hook) = &self.on_transition {
                    breaker = breaker.with_transition_hook(Arc::clone(hook));
                }
                Arc::new(breaker)
            })
            .clone()
    }

    /// Snapshot of all breaker states, sorted by target name.
    pub fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let map = self.inner.lock().expect("BreakerMap.snapshot: mutex poisoned");
        let mut entries: Vec<(String, BreakerState)> =
            map.iter().map(|(k, v)| (k.clone(), v.state())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

impl std::fmt::Debug for BreakerMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerMap").field("breakers", &self.snapshot()).finish()
    }
}
