//! Dispatch mode: `normal` when at least one enabled target exists,
//! `metrics-only` otherwise.
//!
//! The mode is cached for sub-microsecond reads on the hot dispatch
//! path and re-derived on registry changes plus a periodic safety-net
//! recheck.

use crate::metrics::Metrics;
use crate::registry::TargetRegistry;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishingMode {
    Normal,
    MetricsOnly,
}

impl PublishingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishingMode::Normal => "normal",
            PublishingMode::MetricsOnly => "metrics-only",
        }
    }
}

/// Reason attached to a transition notification.
pub const REASON_TARGETS_AVAILABLE: &str = "targets_available";
pub const REASON_NO_ENABLED_TARGETS: &str = "no_enabled_targets";

/// Transition callback: `(from, to, reason)`.
pub type ModeSubscriber = Arc<dyn Fn(PublishingMode, PublishingMode, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct ModeManager {
    registry: TargetRegistry,
    metrics: Arc<Metrics>,
    current: RwLock<PublishingMode>,
    subscribers: Mutex<HashMap<u64, ModeSubscriber>>,
    next_subscription: AtomicU64,
}

impl ModeManager {
    pub fn new(registry: TargetRegistry, metrics: Arc<Metrics>) -> Arc<Self> {
        let initial = Self::derive(&registry);
        Arc::new(Self {
            registry,
            metrics,
            current: RwLock::new(initial),
            subscribers: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        })
    }

    fn derive(registry: &TargetRegistry) -> PublishingMode {
        if registry.enabled_count() > 0 {
            PublishingMode::Normal
        } else {
            PublishingMode::MetricsOnly
        }
    }

    pub fn current_mode(&self) -> PublishingMode {
        *self.current.read().expect("ModeManager.current_mode: lock poisoned")
    }

    pub fn is_metrics_only(&self) -> bool {
        self.current_mode() == PublishingMode::MetricsOnly
    }

    /// Re-derive the mode from the registry. Returns the mode and
    /// whether it changed.
    pub fn check_mode_transition(&self) -> (PublishingMode, bool) {
        let desired = Self::derive(&self.registry);
        let previous = {
            let mut current =
                self.current.write().expect("ModeManager.check_mode_transition: lock poisoned");
            let previous = *current;
            *current = desired;
            previous
        };
        if previous == desired {
            return (desired, false);
        }

        let reason = match desired {
            PublishingMode::Normal => REASON_TARGETS_AVAILABLE,
            PublishingMode::MetricsOnly => REASON_NO_ENABLED_TARGETS,
        };
        self.metrics.record_mode_transition();
        tracing::info!(from = previous.as_str(), to = desired.as_str(), reason, "mode transition");

        let subscribers: Vec<ModeSubscriber> = {
            let map = self.subscribers.lock().expect("ModeManager subscribers: mutex poisoned");
            map.values().cloned().collect()
        };
        for subscriber in subscribers {
            subscriber(previous, desired, reason);
        }
        (desired, true)
    }

    /// Cheap invalidation hook, wired to the registry's changed hook.
    pub fn on_targets_changed(&self) {
        let _ = self.check_mode_transition();
    }

    pub fn subscribe(&self, subscriber: ModeSubscriber) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("ModeManager.subscribe: mutex poisoned")
            .insert(id, subscriber);
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers
            .lock()
            .expect("ModeManager.unsubscribe: mutex poisoned")
            .remove(&id.0);
    }

    /// Periodic safety-net recheck, in addition to event-driven
    /// invalidation.
    pub fn start(self: &Arc<Self>, interval: Duration) -> RecheckHandle {
        let manager = Arc::clone(self);
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let _ = manager.check_mode_transition();
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        RecheckHandle { stop, handle }
    }
}

impl std::fmt::Debug for ModeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModeManager").field("mode", &self.current_mode()).finish()
    }
}

/// Owner handle for the recheck task.
pub struct RecheckHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RecheckHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}
