//! Parallel fan-out: one alert, many targets, bounded wall-clock.
//!
//! Fan-out shares the publishers, breakers, caches, and metrics with
//! the queue path. Partial success is success; an aggregate error is
//! returned only when every attempted target failed or the enumeration
//! produced no targets at all.

use crate::alert::EnrichedAlert;
use crate::breaker::BreakerMap;
use crate::error::{FanoutError, PublishError};
use crate::health::{HealthFilter, HealthMonitor};
use crate::metrics::Metrics;
use crate::mode::ModeManager;
use crate::publish::PublisherFactory;
use crate::registry::TargetRegistry;
use crate::target::{PublishingTarget, TargetKind};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Outcome of one target's attempt within a fan-out.
#[derive(Debug, Clone, Serialize)]
pub struct TargetPublishResult {
    pub target_name: String,
    pub target_kind: TargetKind,
    pub success: bool,
    pub error: Option<String>,
    pub status: Option<u16>,
    pub duration_ms: u64,
    pub skipped: bool,
    pub skip_reason: Option<String>,
}

impl TargetPublishResult {
    fn skipped(target: &PublishingTarget, reason: &str) -> Self {
        Self {
            target_name: target.name.clone(),
            target_kind: target.kind,
            success: false,
            error: None,
            status: None,
            duration_ms: 0,
            skipped: true,
            skip_reason: Some(reason.to_string()),
        }
    }

    fn from_outcome(
        target: &PublishingTarget,
        outcome: Result<(), PublishError>,
        duration: Duration,
    ) -> Self {
        let (success, error, status) = match outcome {
            Ok(()) => (true, None, None),
            Err(e) => {
                let status = e.status();
                (false, Some(e.to_string()), status)
            }
        };
        Self {
            target_name: target.name.clone(),
            target_kind: target.kind,
            success,
            error,
            status,
            duration_ms: duration.as_millis() as u64,
            skipped: false,
            skip_reason: None,
        }
    }
}

/// Aggregate of a fan-out run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FanoutResult {
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub skipped_count: usize,
    pub is_partial_success: bool,
    pub results: Vec<TargetPublishResult>,
    pub duration_ms: u64,
}

impl FanoutResult {
    fn aggregate(results: Vec<TargetPublishResult>, duration: Duration) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        let skipped_count = results.iter().filter(|r| r.skipped).count();
        let failure_count = results.len() - success_count - skipped_count;
        Self {
            total: results.len(),
            success_count,
            failure_count,
            skipped_count,
            is_partial_success: success_count > 0 && failure_count > 0,
            results,
            duration_ms: duration.as_millis() as u64,
        }
    }
}

pub struct FanoutPublisher {
    factory: Arc<PublisherFactory>,
    registry: TargetRegistry,
    mode: Arc<ModeManager>,
    health: Arc<dyn HealthMonitor>,
    breakers: BreakerMap,
    metrics: Arc<Metrics>,
    timeout: Duration,
    health_filter: HealthFilter,
}

impl FanoutPublisher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        factory: Arc<PublisherFactory>,
        registry: TargetRegistry,
        mode: Arc<ModeManager>,
        health: Arc<dyn HealthMonitor>,
        breakers: BreakerMap,
        metrics: Arc<Metrics>,
        timeout: Duration,
        health_filter: HealthFilter,
    ) -> Self {
        Self { factory, registry, mode, health, breakers, metrics, timeout, health_filter }
    }

    /// Broadcast to an explicit target list.
    pub async fn publish_to_multiple(
        &self,
        alert: &EnrichedAlert,
        targets: Vec<Arc<PublishingTarget>>,
    ) -> Result<FanoutResult, FanoutError> {
        if targets.is_empty() {
            return Err(FanoutError::NoEnabledTargets);
        }
        if self.mode.is_metrics_only() {
            tracing::debug!("metrics-only mode; fan-out skipped");
            return Ok(FanoutResult::default());
        }
        self.fan_out(alert, targets).await
    }

    /// Broadcast to every enabled target.
    pub async fn publish_to_all(
        &self,
        alert: &EnrichedAlert,
    ) -> Result<FanoutResult, FanoutError> {
        if self.mode.is_metrics_only() {
            tracing::debug!("metrics-only mode; fan-out skipped");
            return Ok(FanoutResult::default());
        }
        let targets = self.registry.enabled();
        if targets.is_empty() {
            return Err(FanoutError::NoEnabledTargets);
        }
        self.fan_out(alert, targets).await
    }

    /// Broadcast to enabled targets that pass the health filter.
    /// Unknown health fails open.
    pub async fn publish_to_healthy(
        &self,
        alert: &EnrichedAlert,
    ) -> Result<FanoutResult, FanoutError> {
        if self.mode.is_metrics_only() {
            tracing::debug!("metrics-only mode; fan-out skipped");
            return Ok(FanoutResult::default());
        }
        let enabled = self.registry.enabled();
        if enabled.is_empty() {
            return Err(FanoutError::NoEnabledTargets);
        }

        let mut healthy = Vec::with_capacity(enabled.len());
        for target in enabled {
            let status = self.health.health_by_name(&target.name).await;
            if self.health_filter.includes(status) {
                healthy.push(target);
            } else {
                tracing::info!(
                    target_name = %target.name,
                    status = ?status,
                    "target filtered out by health"
                );
            }
        }
        if healthy.is_empty() {
            return Err(FanoutError::NoHealthyTargets);
        }
        self.fan_out(alert, healthy).await
    }

    async fn fan_out(
        &self,
        alert: &EnrichedAlert,
        targets: Vec<Arc<PublishingTarget>>,
    ) -> Result<FanoutResult, FanoutError> {
        let started = Instant::now();
        let alert = Arc::new(alert.clone());
        let mut tasks: JoinSet<TargetPublishResult> = JoinSet::new();
        let mut results = Vec::with_capacity(targets.len());

        for target in targets {
            let breaker = self.breakers.for_target(&target.name);
            if !breaker.can_attempt() {
                self.metrics.record_breaker_skip();
                results.push(TargetPublishResult::skipped(&target, "breaker-open"));
                continue;
            }
            let publisher = self.factory.for_kind(target.kind);
            let alert = Arc::clone(&alert);
            tasks.spawn(async move {
                let attempt_started = Instant::now();
                let outcome = publisher.publish(&alert, &target).await;
                match &outcome {
                    Ok(()) => breaker.record_success(),
                    Err(_) => breaker.record_failure(),
                }
                TargetPublishResult::from_outcome(&target, outcome, attempt_started.elapsed())
            });
        }

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok(result)) => results.push(result),
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "fan-out task failed to join");
                        }
                        None => break,
                    }
                }
                _ = &mut deadline => {
                    tracing::warn!(
                        collected = results.len(),
                        outstanding = tasks.len(),
                        timeout_ms = self.timeout.as_millis() as u64,
                        "fan-out deadline reached; aggregating partial results"
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        let aggregate = FanoutResult::aggregate(results, started.elapsed());
        self.metrics.record_fanout(aggregate.is_partial_success);

        let attempted = aggregate.total - aggregate.skipped_count;
        if aggregate.success_count == 0 && attempted > 0 {
            tracing::warn!(attempted, "fan-out: every attempted target failed");
            return Err(FanoutError::AllTargetsFailed { attempted });
        }
        Ok(aggregate)
    }
}

impl std::fmt::Debug for FanoutPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutPublisher")
            .field("timeout", &self.timeout)
            .field("health_filter", &self.health_filter)
            .finish()
    }
}
