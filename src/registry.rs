//! Target registry: a refreshing catalog of publishing endpoints.
//!
//! Targets are discovered from an external config store, validated,
//! and atomically swapped into a name-keyed map. Readers see either the
//! entire pre-swap set or the entire post-swap set, never a mixture.

use crate::format::PayloadFormat;
use crate::metrics::Metrics;
use crate::target::{PublishingTarget, TargetKind};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Raw record as returned by the config store, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub format: Option<String>,
    /// Comma-separated `key=value` pairs; values may contain `=`.
    #[serde(default)]
    pub headers: String,
}

pub type ConfigStoreError = Box<dyn std::error::Error + Send + Sync>;

/// Read-only enumeration of configured targets.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<TargetRecord>, ConfigStoreError>;
}

/// Why a record was rejected during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub name: String,
    pub reason: String,
}

fn parse_headers(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Validate one record into a target, or explain the rejection.
pub fn validate_record(record: &TargetRecord) -> Result<PublishingTarget, RejectedRecord> {
    let reject = |reason: &str| RejectedRecord {
        name: record.name.clone(),
        reason: reason.to_string(),
    };

    if record.name.trim().is_empty() {
        return Err(reject("missing name"));
    }
    if record.kind.trim().is_empty() {
        return Err(reject("missing type"));
    }
    if record.url.trim().is_empty() {
        return Err(reject("missing url"));
    }
    let kind: TargetKind = record
        .kind
        .parse()
        .map_err(|_| reject(&format!("unknown type `{}`", record.kind)))?;
    let format = match &record.format {
        None => None,
        Some(raw) if raw.trim().is_empty() => None,
        Some(raw) => Some(
            raw.parse::<PayloadFormat>()
                .map_err(|_| reject(&format!("unknown format `{raw}`")))?,
        ),
    };

    Ok(PublishingTarget {
        name: record.name.trim().to_string(),
        kind,
        url: record.url.trim().to_string(),
        enabled: record.enabled.unwrap_or(true),
        format,
        headers: parse_headers(&record.headers),
    })
}

type TargetMap = HashMap<String, Arc<PublishingTarget>>;

/// Hook invoked after every swap that changed the target set.
pub type TargetsChangedHook = Arc<dyn Fn() + Send + Sync>;

/// The refreshing catalog. Cheap to clone; all clones share the map.
#[derive(Clone)]
pub struct TargetRegistry {
    store: Arc<dyn ConfigStore>,
    targets: Arc<ArcSwap<TargetMap>>,
    metrics: Arc<Metrics>,
    on_targets_changed: Option<TargetsChangedHook>,
    refresh_now: Arc<Notify>,
}

impl TargetRegistry {
    pub fn new(store: Arc<dyn ConfigStore>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            targets: Arc::new(ArcSwap::from_pointee(TargetMap::new())),
            metrics,
            on_targets_changed: None,
            refresh_now: Arc::new(Notify::new()),
        }
    }

    pub fn with_targets_changed_hook(mut self, hook: TargetsChangedHook) -> Self {
        self.on_targets_changed = Some(hook);
        self
    }

    /// All targets, disabled ones included (they keep their identity).
    pub fn list(&self) -> Vec<Arc<PublishingTarget>> {
        let map = self.targets.load();
        let mut targets: Vec<_> = map.values().cloned().collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        targets
    }

    pub fn get(&self, name: &str) -> Option<Arc<PublishingTarget>> {
        self.targets.load().get(name).cloned()
    }

    pub fn count(&self) -> usize {
        self.targets.load().len()
    }

    /// Enabled targets only; the set dispatch actually uses.
    pub fn enabled(&self) -> Vec<Arc<PublishingTarget>> {
        self.list().into_iter().filter(|t| t.enabled).collect()
    }

    pub fn enabled_count(&self) -> usize {
        self.targets.load().values().filter(|t| t.enabled).count()
    }

    /// Query the config store, validate, and atomically swap in the new
    /// set. Returns the number of rejected records.
    pub async fn discover(&self) -> Result<usize, ConfigStoreError> {
        let records = self.store.list_targets().await?;
        let mut next = TargetMap::with_capacity(records.len());
        let mut rejected = 0usize;

        for record in &records {
            match validate_record(record) {
                Ok(target) => {
                    if next.insert(target.name.clone(), Arc::new(target)).is_some() {
                        tracing::warn!(name = %record.name, "duplicate target name; keeping the last record");
                    }
                }
                Err(rejection) => {
                    rejected += 1;
                    tracing::warn!(
                        name = %rejection.name,
                        reason = %rejection.reason,
                        "rejected target record"
                    );
                }
            }
        }

        let previous = self.targets.load_full();
        let changed = !same_target_set(&previous, &next);
        let enabled = next.values().filter(|t| t.enabled).count();
        let total = next.len();
        self.targets.store(Arc::new(next));
        self.metrics.record_refresh(rejected);

        tracing::info!(total, enabled, rejected, "target registry refreshed");
        if enabled == 0 {
            tracing::warn!("registry has no enabled targets");
        }
        if changed {
            if let Some(hook) = &self.on_targets_changed {
                hook();
            }
        }
        Ok(rejected)
    }

    /// Trigger an immediate refresh from the admin surface.
    pub async fn refresh_now(&self) -> Result<usize, ConfigStoreError> {
        self.discover().await
    }

    /// Start the periodic refresh loop. An initial discovery runs
    /// immediately; afterwards the loop ticks on the interval and on
    /// demand.
    pub fn start(&self, interval: Duration) -> RefreshHandle {
        let registry = self.clone();
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            if let Err(e) = registry.discover().await {
                tracing::error!(error = %e, "initial target discovery failed");
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = registry.refresh_now.notified() => {}
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            return;
                        }
                        continue;
                    }
                }
                if let Err(e) = registry.discover().await {
                    tracing::error!(error = %e, "target discovery failed");
                }
            }
        });
        RefreshHandle { stop, handle }
    }

    /// Nudge the running refresh loop without waiting for the result.
    pub fn request_refresh(&self) {
        self.refresh_now.notify_one();
    }
}

fn same_target_set(a: &TargetMap, b: &TargetMap) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(name, target)| {
        b.get(name).is_some_and(|other| {
            target.enabled == other.enabled
                && target.url == other.url
                && target.kind == other.kind
                && target.format == other.format
                && target.headers == other.headers
        })
    })
}

/// Owner handle for the refresh loop task.
pub struct RefreshHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RefreshHandle {
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("targets", &self.count())
            .field("enabled", &self.enabled_count())
            .finish()
    }
}
