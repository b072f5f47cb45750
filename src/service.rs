//! The publishing service facade.
//!
//! Owns the process-wide singletons (registry, breakers, correlation
//! caches, metrics, queue, fan-out) and their background tasks. The
//! admin surface is an external collaborator; this facade exposes
//! exactly the queries it needs.

use crate::alert::{AlertStatus, EnrichedAlert};
use crate::breaker::{BreakerMap, BreakerState};
use crate::config::{ConfigError, PublishingConfig};
use crate::dlq::{DlqFilters, DlqReplayer, DlqStats, DlqStore};
use crate::error::{FanoutError, SubmitError};
use crate::fanout::{FanoutPublisher, FanoutResult};
use crate::health::{HealthFilter, HealthMonitor, UnknownHealthMonitor};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::mode::{ModeManager, PublishingMode, RecheckHandle};
use crate::publish::{HttpTransport, PublisherFactory, ReqwestTransport};
use crate::queue::{DispatchQueue, QueueStatus};
use crate::registry::{ConfigStore, ConfigStoreError, RefreshHandle, TargetRegistry};
use crate::target::PublishingTarget;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build http transport: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no target named `{0}`")]
    UnknownTarget(String),
    #[error("target `{0}` is disabled")]
    TargetDisabled(String),
    #[error("target `{name}` is a {actual}, expected {expected}")]
    WrongTargetKind { name: String, actual: &'static str, expected: &'static str },
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Publish(#[from] crate::error::PublishError),
}

/// Admin-facing service statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PublishingStats {
    pub total_targets: usize,
    pub enabled_targets: usize,
    pub targets_by_type: BTreeMap<String, usize>,
    pub queue: QueueStatus,
    pub mode: PublishingMode,
}

/// Result of a one-shot target test. Publisher failures land in
/// `error`, they are not propagated as service faults.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub target_name: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub struct PublishingServiceBuilder {
    config: PublishingConfig,
    store: Arc<dyn ConfigStore>,
    dlq: Arc<dyn DlqStore>,
    health: Arc<dyn HealthMonitor>,
    health_filter: HealthFilter,
    transport: Option<Arc<dyn HttpTransport>>,
}

impl PublishingServiceBuilder {
    pub fn new(
        config: PublishingConfig,
        store: Arc<dyn ConfigStore>,
        dlq: Arc<dyn DlqStore>,
    ) -> Self {
        Self {
            config,
            store,
            dlq,
            health: Arc::new(UnknownHealthMonitor),
            health_filter: HealthFilter::SkipUnhealthy,
            transport: None,
        }
    }

    pub fn health_monitor(mut self, health: Arc<dyn HealthMonitor>) -> Self {
        self.health = health;
        self
    }

    pub fn health_filter(mut self, filter: HealthFilter) -> Self {
        self.health_filter = filter;
        self
    }

    /// Override the wire seam, for tests.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<PublishingService, BuildError> {
        self.config.validate()?;
        let metrics = Arc::new(Metrics::new());

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                ReqwestTransport::new(&self.config)
                    .map_err(|e| BuildError::Transport(e.to_string()))?,
            ) as Arc<dyn HttpTransport>,
        };

        let breaker_metrics = Arc::clone(&metrics);
        let breakers = BreakerMap::new(self.config.breaker()).with_transition_hook(Arc::new(
            move |_name, _from, to| breaker_metrics.record_breaker_transition(to),
        ));

        let registry = TargetRegistry::new(self.store, Arc::clone(&metrics));
        let mode = ModeManager::new(registry.clone(), Arc::clone(&metrics));
        let registry = {
            let mode = Arc::clone(&mode);
            registry.with_targets_changed_hook(Arc::new(move || mode.on_targets_changed()))
        };

        let factory = Arc::new(PublisherFactory::new(&self.config, transport));
        let queue = DispatchQueue::new(
            self.config.clone(),
            Arc::clone(&factory),
            breakers.clone(),
            Arc::clone(&self.dlq),
            Arc::clone(&metrics),
        );
        let fanout = FanoutPublisher::new(
            Arc::clone(&factory),
            registry.clone(),
            Arc::clone(&mode),
            self.health,
            breakers.clone(),
            Arc::clone(&metrics),
            self.config.fanout_timeout,
            self.health_filter,
        );
        let replayer =
            DlqReplayer::new(Arc::clone(&self.dlq), queue.clone(), Arc::clone(&metrics));

        Ok(PublishingService {
            config: self.config,
            metrics,
            registry,
            mode,
            breakers,
            factory,
            queue,
            fanout,
            replayer,
            dlq: self.dlq,
            handles: Mutex::new(None),
        })
    }
}

struct BackgroundHandles {
    refresh: RefreshHandle,
    recheck: RecheckHandle,
}

pub struct PublishingService {
    config: PublishingConfig,
    metrics: Arc<Metrics>,
    registry: TargetRegistry,
    mode: Arc<ModeManager>,
    breakers: BreakerMap,
    factory: Arc<PublisherFactory>,
    queue: DispatchQueue,
    fanout: FanoutPublisher,
    replayer: DlqReplayer,
    dlq: Arc<dyn DlqStore>,
    handles: Mutex<Option<BackgroundHandles>>,
}

impl PublishingService {
    pub fn builder(
        config: PublishingConfig,
        store: Arc<dyn ConfigStore>,
        dlq: Arc<dyn DlqStore>,
    ) -> PublishingServiceBuilder {
        PublishingServiceBuilder::new(config, store, dlq)
    }

    /// Start workers, the refresh loop, the mode recheck, and the
    /// cache sweeper. Idempotent.
    pub fn start(&self) {
        let mut handles = self.handles.lock().expect("PublishingService.start: poisoned");
        if handles.is_some() {
            return;
        }
        self.queue.start();
        self.factory.start_sweeper();
        *handles = Some(BackgroundHandles {
            refresh: self.registry.start(self.config.refresh_interval),
            recheck: self.mode.start(self.config.mode_recheck_interval),
        });
        tracing::info!("publishing service started");
    }

    /// Stop intake, drain workers up to the timeout, and stop every
    /// background task.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.queue.stop(drain_timeout).await;
        let handles =
            self.handles.lock().expect("PublishingService.shutdown: poisoned").take();
        if let Some(handles) = handles {
            handles.refresh.stop().await;
            handles.recheck.stop().await;
        }
        self.factory.shutdown().await;
        tracing::info!("publishing service stopped");
    }

    /// Library entrypoint: enqueue one alert for one target.
    pub fn submit(
        &self,
        alert: Arc<EnrichedAlert>,
        target: Arc<PublishingTarget>,
    ) -> Result<Uuid, SubmitError> {
        self.queue.submit(alert, target)
    }

    /// Enqueue for a registered target by name.
    pub fn submit_by_name(
        &self,
        alert: Arc<EnrichedAlert>,
        target_name: &str,
    ) -> Result<Uuid, ServiceError> {
        let target = self
            .registry
            .get(target_name)
            .ok_or_else(|| ServiceError::UnknownTarget(target_name.to_string()))?;
        if !target.enabled {
            return Err(ServiceError::TargetDisabled(target_name.to_string()));
        }
        Ok(self.queue.submit(alert, target)?)
    }

    pub async fn publish_to_all(&self, alert: &EnrichedAlert) -> Result<FanoutResult, FanoutError> {
        self.fanout.publish_to_all(alert).await
    }

    pub async fn publish_to_healthy(
        &self,
        alert: &EnrichedAlert,
    ) -> Result<FanoutResult, FanoutError> {
        self.fanout.publish_to_healthy(alert).await
    }

    pub async fn publish_to_multiple(
        &self,
        alert: &EnrichedAlert,
        targets: Vec<Arc<PublishingTarget>>,
    ) -> Result<FanoutResult, FanoutError> {
        self.fanout.publish_to_multiple(alert, targets).await
    }

    /// Acknowledge the running pager incident for this alert's
    /// fingerprint.
    pub async fn acknowledge(
        &self,
        alert: &EnrichedAlert,
        target_name: &str,
    ) -> Result<(), ServiceError> {
        let target = self
            .registry
            .get(target_name)
            .ok_or_else(|| ServiceError::UnknownTarget(target_name.to_string()))?;
        if target.kind != crate::target::TargetKind::Pager {
            return Err(ServiceError::WrongTargetKind {
                name: target.name.clone(),
                actual: target.kind.as_str(),
                expected: "pager",
            });
        }
        self.factory.pager().acknowledge(alert, &target).await?;
        Ok(())
    }

    /// One-shot test publish against a registered target. Publisher
    /// failures are reported in the outcome, never as an error.
    pub async fn test_target(&self, target_name: &str) -> Result<TestOutcome, ServiceError> {
        let target = self
            .registry
            .get(target_name)
            .ok_or_else(|| ServiceError::UnknownTarget(target_name.to_string()))?;

        let alert = EnrichedAlert {
            fingerprint: format!("test-{}", Uuid::new_v4()),
            name: "PublishingTargetTest".into(),
            status: AlertStatus::Firing,
            labels: BTreeMap::from([
                ("severity".to_string(), "info".to_string()),
                ("test".to_string(), "true".to_string()),
            ]),
            annotations: BTreeMap::from([(
                "summary".to_string(),
                "Synthetic alert verifying target connectivity".to_string(),
            )]),
            starts_at: Utc::now(),
            generator_url: None,
            classification: None,
        };

        let publisher = self.factory.for_kind(target.kind);
        let started = Instant::now();
        let outcome = publisher.publish(&alert, &target).await;
        Ok(TestOutcome {
            target_name: target.name.clone(),
            success: outcome.is_ok(),
            error: outcome.err().map(|e| e.to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    // Admin-facing queries. None of these fail on an empty registry.

    pub fn stats(&self) -> PublishingStats {
        let targets = self.registry.list();
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        for target in &targets {
            *by_type.entry(target.kind.as_str().to_string()).or_default() += 1;
        }
        PublishingStats {
            total_targets: targets.len(),
            enabled_targets: targets.iter().filter(|t| t.enabled).count(),
            targets_by_type: by_type,
            queue: self.queue.status(),
            mode: self.mode.current_mode(),
        }
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub fn mode(&self) -> PublishingMode {
        self.mode.current_mode()
    }

    pub fn mode_manager(&self) -> Arc<ModeManager> {
        Arc::clone(&self.mode)
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn breaker_states(&self) -> Vec<(String, BreakerState)> {
        self.breakers.snapshot()
    }

    pub async fn refresh_targets(&self) -> Result<usize, ConfigStoreError> {
        self.registry.refresh_now().await
    }

    // Dead-letter operations.

    pub async fn replay_dead_letter(&self, id: Uuid) -> Result<Uuid, crate::error::DlqError> {
        self.replayer.replay(id).await
    }

    pub async fn read_dead_letters(
        &self,
        filters: &DlqFilters,
    ) -> Result<Vec<crate::dlq::DlqEntry>, crate::error::DlqError> {
        self.dlq.read(filters).await
    }

    pub async fn purge_dead_letters(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, crate::error::DlqError> {
        self.dlq.purge(older_than).await
    }

    pub async fn dead_letter_stats(&self) -> Result<DlqStats, crate::error::DlqError> {
        self.dlq.stats().await
    }
}

impl std::fmt::Debug for PublishingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishingService")
            .field("registry", &self.registry)
            .field("mode", &self.mode.current_mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::MemoryDlqStore;
    use crate::error::PublishError;
    use crate::publish::{HttpRequest, HttpResponse};
    use crate::registry::TargetRecord;
    use async_trait::async_trait;

    struct StaticStore {
        records: Vec<TargetRecord>,
    }

    #[async_trait]
    impl ConfigStore for StaticStore {
        async fn list_targets(&self) -> Result<Vec<TargetRecord>, ConfigStoreError> {
            Ok(self.records.clone())
        }
    }

    struct OkTransport;

    #[async_trait]
    impl HttpTransport for OkTransport {
        async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, PublishError> {
            Ok(HttpResponse { status: 200, body: "{}".into(), retry_after: None })
        }
    }

    fn record(name: &str) -> TargetRecord {
        TargetRecord {
            name: name.into(),
            kind: "generic-http".into(),
            url: "https://receiver.example.com".into(),
            enabled: Some(true),
            format: None,
            headers: String::new(),
        }
    }

    fn service(records: Vec<TargetRecord>) -> PublishingService {
        PublishingService::builder(
            PublishingConfig::default(),
            Arc::new(StaticStore { records }),
            Arc::new(MemoryDlqStore::new()),
        )
        .transport(Arc::new(OkTransport))
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn stats_work_on_an_empty_registry() {
        let svc = service(vec![]);
        let stats = svc.stats();
        assert_eq!(stats.total_targets, 0);
        assert_eq!(stats.mode, PublishingMode::MetricsOnly);
        assert!((stats.queue.utilization_percent - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn submit_by_name_rejects_unknown_and_disabled_targets() {
        let mut disabled = record("quiet");
        disabled.enabled = Some(false);
        let svc = service(vec![record("loud"), disabled]);
        svc.refresh_targets().await.unwrap();

        let alert = Arc::new(EnrichedAlert {
            fingerprint: "fp".into(),
            name: "A".into(),
            status: AlertStatus::Firing,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            starts_at: Utc::now(),
            generator_url: None,
            classification: None,
        });

        assert!(svc.submit_by_name(Arc::clone(&alert), "loud").is_ok());
        assert!(matches!(
            svc.submit_by_name(Arc::clone(&alert), "ghost"),
            Err(ServiceError::UnknownTarget(_))
        ));
        assert!(matches!(
            svc.submit_by_name(alert, "quiet"),
            Err(ServiceError::TargetDisabled(_))
        ));
    }

    #[tokio::test]
    async fn test_target_reports_failure_without_erroring() {
        struct FailTransport;

        #[async_trait]
        impl HttpTransport for FailTransport {
            async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, PublishError> {
                Ok(HttpResponse { status: 500, body: "boom".into(), retry_after: None })
            }
        }

        let svc = PublishingService::builder(
            PublishingConfig::default(),
            Arc::new(StaticStore { records: vec![record("t1")] }),
            Arc::new(MemoryDlqStore::new()),
        )
        .transport(Arc::new(FailTransport))
        .build()
        .unwrap();
        svc.refresh_targets().await.unwrap();

        let outcome = svc.test_target("t1").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn start_and_shutdown_are_clean() {
        let svc = service(vec![record("t1")]);
        svc.start();
        svc.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(svc.queue_status().running);
        assert_eq!(svc.mode(), PublishingMode::Normal, "initial discovery flipped the mode");
        svc.shutdown(Duration::from_millis(200)).await;
        assert!(!svc.queue_status().running);
    }
}
