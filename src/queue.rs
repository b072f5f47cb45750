//! Bounded multi-priority dispatch queue and worker pool.
//!
//! `submit` never blocks: a full buffer rejects synchronously so the
//! upstream ingestion path is never back-pressured. Workers drain three
//! FIFO buffers in strict priority order with an occasional
//! lower-priority pick so sustained high-priority load cannot starve
//! the rest. Failed attempts are classified, retried with capped
//! exponential backoff, and terminally routed to the dead-letter store.

use crate::alert::{AlertStatus, EnrichedAlert, Severity};
use crate::breaker::BreakerMap;
use crate::classify::classify;
use crate::config::PublishingConfig;
use crate::dlq::{DlqEntry, DlqStore};
use crate::error::{ErrorClass, PublishError, SubmitError};
use crate::metrics::Metrics;
use crate::publish::PublisherFactory;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::target::PublishingTarget;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Dispatch tier, derived from the alert at submit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Critical-and-firing alerts page first; resolves and info-level
    /// noise yield to everything else.
    pub fn for_alert(alert: &EnrichedAlert) -> Self {
        if alert.status == AlertStatus::Resolved {
            return Priority::Low;
        }
        match alert.severity() {
            Severity::Critical => Priority::High,
            Severity::Info => Priority::Low,
            Severity::Warning => Priority::Medium,
        }
    }

    fn index(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(()),
        }
    }
}

/// One unit of dispatch work. Owned by a queue slot until a worker
/// pulls it, then by that worker until it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct PublishingJob {
    pub id: Uuid,
    pub alert: Arc<EnrichedAlert>,
    pub target: Arc<PublishingTarget>,
    pub priority: Priority,
    pub submitted_at: DateTime<Utc>,
    /// Attempts completed so far.
    pub attempt: u32,
    pub last_error: Option<String>,
    pub last_class: Option<ErrorClass>,
}

impl PublishingJob {
    pub fn new(
        alert: Arc<EnrichedAlert>,
        target: Arc<PublishingTarget>,
        priority: Priority,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert,
            target,
            priority,
            submitted_at: Utc::now(),
            attempt: 0,
            last_error: None,
            last_class: None,
        }
    }
}

/// Admin-facing view of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub depth_high: usize,
    pub depth_medium: usize,
    pub depth_low: usize,
    pub capacity_per_priority: usize,
    pub utilization_percent: f64,
    pub running: bool,
}

struct QueueInner {
    config: PublishingConfig,
    senders: [mpsc::Sender<PublishingJob>; 3],
    receivers: [tokio::sync::Mutex<mpsc::Receiver<PublishingJob>>; 3],
    notify: Notify,
    accepting: AtomicBool,
    running: AtomicBool,
    draining: watch::Sender<bool>,
    factory: Arc<PublisherFactory>,
    breakers: BreakerMap,
    dlq: Arc<dyn DlqStore>,
    metrics: Arc<Metrics>,
    sleeper: Arc<dyn Sleeper>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// The dispatch queue. Cheap to clone; all clones share the buffers.
#[derive(Clone)]
pub struct DispatchQueue {
    inner: Arc<QueueInner>,
}

impl DispatchQueue {
    pub fn new(
        config: PublishingConfig,
        factory: Arc<PublisherFactory>,
        breakers: BreakerMap,
        dlq: Arc<dyn DlqStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::with_sleeper(config, factory, breakers, dlq, metrics, Arc::new(TokioSleeper))
    }

    pub fn with_sleeper(
        config: PublishingConfig,
        factory: Arc<PublisherFactory>,
        breakers: BreakerMap,
        dlq: Arc<dyn DlqStore>,
        metrics: Arc<Metrics>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let capacity = config.queue_capacity;
        let (tx_high, rx_high) = mpsc::channel(capacity);
        let (tx_medium, rx_medium) = mpsc::channel(capacity);
        let (tx_low, rx_low) = mpsc::channel(capacity);
        let (draining, _) = watch::channel(false);

        Self {
            inner: Arc::new(QueueInner {
                config,
                senders: [tx_high, tx_medium, tx_low],
                receivers: [
                    tokio::sync::Mutex::new(rx_high),
                    tokio::sync::Mutex::new(rx_medium),
                    tokio::sync::Mutex::new(rx_low),
                ],
                notify: Notify::new(),
                accepting: AtomicBool::new(true),
                running: AtomicBool::new(false),
                draining,
                factory,
                breakers,
                dlq,
                metrics,
                sleeper,
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Non-blocking submit. A full buffer rejects synchronously; the
    /// job is not added.
    pub fn submit(
        &self,
        alert: Arc<EnrichedAlert>,
        target: Arc<PublishingTarget>,
    ) -> Result<Uuid, SubmitError> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::Acquire) {
            inner.metrics.record_rejected_shutting_down();
            return Err(SubmitError::ShuttingDown);
        }

        let priority = Priority::for_alert(&alert);
        let job = PublishingJob::new(alert, target, priority);
        let job_id = job.id;

        match inner.senders[priority.index()].try_send(job) {
            Ok(()) => {
                inner.metrics.record_submitted();
                self.update_depth_gauges();
                inner.notify.notify_one();
                Ok(job_id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                inner.metrics.record_rejected_queue_full();
                tracing::warn!(priority = %priority, "queue full; submission rejected");
                Err(SubmitError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                inner.metrics.record_rejected_shutting_down();
                Err(SubmitError::ShuttingDown)
            }
        }
    }

    /// Spawn the worker pool. Idempotent.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.inner.workers.lock().expect("DispatchQueue.start: poisoned");
        for worker_id in 0..self.inner.config.worker_count {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                worker_loop(inner, worker_id).await;
            }));
        }
        tracing::info!(workers = self.inner.config.worker_count, "dispatch queue started");
    }

    /// Stop accepting submissions, drain running workers up to the
    /// timeout, then cancel them. Jobs still buffered at the hard
    /// deadline are lost.
    pub async fn stop(&self, timeout: Duration) {
        self.inner.accepting.store(false, Ordering::Release);
        let _ = self.inner.draining.send(true);
        self.inner.notify.notify_waiters();

        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.inner.workers.lock().expect("DispatchQueue.stop: poisoned");
            guard.drain(..).collect()
        };
        let abort_handles: Vec<_> = workers.iter().map(|w| w.abort_handle()).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(workers)).await.is_err() {
            tracing::warn!("drain deadline reached; cancelling workers");
            for handle in abort_handles {
                handle.abort();
            }
        }
        self.inner.running.store(false, Ordering::Release);
        tracing::info!("dispatch queue stopped");
    }

    pub fn status(&self) -> QueueStatus {
        let depth = |idx: usize| {
            let sender = &self.inner.senders[idx];
            sender.max_capacity() - sender.capacity()
        };
        let (high, medium, low) = (depth(0), depth(1), depth(2));
        let capacity = self.inner.config.queue_capacity;
        QueueStatus {
            depth_high: high,
            depth_medium: medium,
            depth_low: low,
            capacity_per_priority: capacity,
            utilization_percent: (high + medium + low) as f64 / (capacity * 3) as f64 * 100.0,
            running: self.inner.running.load(Ordering::Acquire),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn update_depth_gauges(&self) {
        let depth = |idx: usize| {
            let sender = &self.inner.senders[idx];
            sender.max_capacity() - sender.capacity()
        };
        self.inner.metrics.set_queue_depths(depth(0), depth(1), depth(2));
    }
}

impl std::fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue").field("status", &self.status()).finish()
    }
}

async fn worker_loop(inner: Arc<QueueInner>, worker_id: usize) {
    let mut draining = inner.draining.subscribe();
    tracing::debug!(worker_id, "worker started");
    loop {
        if let Some(job) = pull_next(&inner).await {
            process_job(&inner, job).await;
            continue;
        }
        if *draining.borrow() {
            tracing::debug!(worker_id, "worker drained");
            return;
        }
        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            _ = draining.changed() => {}
        }
    }
}

/// Pull from the highest non-empty buffer. One pick in sixteen scans
/// lowest-first so the low tier drains under sustained high load.
async fn pull_next(inner: &Arc<QueueInner>) -> Option<PublishingJob> {
    let reversed = rand::rng().random_ratio(1, 16);
    let order: [usize; 3] = if reversed { [2, 1, 0] } else { [0, 1, 2] };
    for idx in order {
        let job = { inner.receivers[idx].lock().await.try_recv().ok() };
        if let Some(job) = job {
            let depth = |i: usize| inner.senders[i].max_capacity() - inner.senders[i].capacity();
            inner.metrics.set_queue_depths(depth(0), depth(1), depth(2));
            return Some(job);
        }
    }
    None
}

async fn process_job(inner: &Arc<QueueInner>, mut job: PublishingJob) {
    let breaker = inner.breakers.for_target(&job.target.name);
    if !breaker.can_attempt() {
        inner.metrics.record_breaker_skip();
        tracing::info!(
            target_name = %job.target.name,
            job_id = %job.id,
            "breaker open; job skipped"
        );
        return;
    }

    let publisher = inner.factory.for_kind(job.target.kind);
    let max_attempts = inner.config.max_retries + 1;

    loop {
        let started = Instant::now();
        match publisher.publish(&job.alert, &job.target).await {
            Ok(()) => {
                breaker.record_success();
                inner.metrics.record_published(started.elapsed());
                tracing::debug!(
                    job_id = %job.id,
                    target_name = %job.target.name,
                    publisher = publisher.name(),
                    attempt = job.attempt + 1,
                    "job published"
                );
                return;
            }
            Err(err) => {
                let class = classify(&err);
                breaker.record_failure();
                inner.metrics.record_failure(class);
                if matches!(err, PublishError::Format(_)) {
                    inner.metrics.record_format_error();
                }
                job.attempt += 1;
                job.last_class = Some(class);
                let retry_after = err.retry_after();
                job.last_error = Some(err.to_string());

                if class == ErrorClass::Permanent {
                    tracing::warn!(
                        job_id = %job.id,
                        target_name = %job.target.name,
                        error = %job.last_error.as_deref().unwrap_or_default(),
                        "permanent failure; routing to dead letters"
                    );
                    write_dead_letter(inner, &job, class).await;
                    return;
                }
                if job.attempt >= max_attempts {
                    tracing::warn!(
                        job_id = %job.id,
                        target_name = %job.target.name,
                        attempts = job.attempt,
                        "retries exhausted; routing to dead letters"
                    );
                    write_dead_letter(inner, &job, class).await;
                    return;
                }

                let delay = retry_after
                    .unwrap_or_else(|| backoff_delay(&inner.config, job.attempt));
                inner.metrics.record_retry();
                tracing::debug!(
                    job_id = %job.id,
                    attempt = job.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );
                inner.sleeper.sleep(delay).await;
            }
        }
    }
}

/// `min(base · 2^(retry-1), ceiling)`, optionally with full jitter.
/// `Retry-After` hints bypass this entirely.
fn backoff_delay(config: &PublishingConfig, retry: u32) -> Duration {
    let exponent = retry.saturating_sub(1).min(16);
    let computed = config
        .retry_base
        .checked_mul(2u32.saturating_pow(exponent))
        .unwrap_or(config.retry_ceiling)
        .min(config.retry_ceiling);
    if config.retry_jitter && computed > Duration::ZERO {
        rand::rng().random_range(Duration::ZERO..=computed)
    } else {
        computed
    }
}

async fn write_dead_letter(inner: &Arc<QueueInner>, job: &PublishingJob, class: ErrorClass) {
    let entry = match DlqEntry::from_job(
        job,
        job.last_error.clone().unwrap_or_default(),
        class,
    ) {
        Ok(entry) => entry,
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "failed to build dead-letter entry");
            return;
        }
    };
    match inner.dlq.write(entry).await {
        Ok(()) => inner.metrics.record_dlq_write(),
        Err(e) => {
            tracing::error!(job_id = %job.id, error = %e, "dead-letter write failed; job lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::Classification;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn alert(status: AlertStatus, severity_label: Option<&str>) -> EnrichedAlert {
        let mut labels = BTreeMap::new();
        if let Some(severity) = severity_label {
            labels.insert("severity".to_string(), severity.to_string());
        }
        EnrichedAlert {
            fingerprint: "fp".into(),
            name: "A".into(),
            status,
            labels,
            annotations: BTreeMap::new(),
            starts_at: Utc::now(),
            generator_url: None,
            classification: None,
        }
    }

    #[test]
    fn critical_firing_is_high_priority() {
        assert_eq!(
            Priority::for_alert(&alert(AlertStatus::Firing, Some("critical"))),
            Priority::High
        );
    }

    #[test]
    fn classification_critical_is_high_priority() {
        let mut a = alert(AlertStatus::Firing, None);
        a.classification = Some(Classification {
            severity: Severity::Critical,
            confidence: 1.0,
            reasoning: String::new(),
            recommendations: vec![],
        });
        assert_eq!(Priority::for_alert(&a), Priority::High);
    }

    #[test]
    fn resolved_is_low_priority_even_when_critical() {
        assert_eq!(
            Priority::for_alert(&alert(AlertStatus::Resolved, Some("critical"))),
            Priority::Low
        );
    }

    #[test]
    fn info_is_low_and_default_is_medium() {
        assert_eq!(Priority::for_alert(&alert(AlertStatus::Firing, Some("info"))), Priority::Low);
        assert_eq!(Priority::for_alert(&alert(AlertStatus::Firing, None)), Priority::Medium);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = PublishingConfig { retry_jitter: false, ..Default::default() };
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(16));
        assert_eq!(backoff_delay(&config, 5), Duration::from_secs(30), "capped at the ceiling");
        assert_eq!(backoff_delay(&config, 60), Duration::from_secs(30));
    }

    #[test]
    fn jittered_backoff_stays_under_the_computed_delay() {
        let config = PublishingConfig::default();
        for retry in 1..6 {
            let no_jitter = backoff_delay(
                &PublishingConfig { retry_jitter: false, ..config.clone() },
                retry,
            );
            for _ in 0..20 {
                assert!(backoff_delay(&config, retry) <= no_jitter);
            }
        }
    }
}
