#![forbid(unsafe_code)]

//! # alertpost
//!
//! The publishing subsystem of an alert-history service: enriched
//! alerts go in and are delivered to heterogeneous incident-management
//! endpoints (incident trackers, paging services, chat webhooks,
//! generic HTTP receivers) reliably, without back-pressuring the
//! ingestion path.
//!
//! ## Features
//!
//! - **Target registry** refreshed from an external config store, with
//!   atomic swaps and stable identity across refreshes
//! - **Bounded multi-priority queue** with a worker pool, per-target
//!   circuit breakers, classified retries, and a dead-letter store
//! - **Lifecycle publishers** that correlate trigger/resolve through
//!   per-protocol TTL caches (dedup keys, incident ids, chat threads)
//! - **Parallel fan-out** with health filtering, partial-success
//!   semantics, and a bounded wall clock
//! - **Mode fallback**: with no enabled targets the service records
//!   metrics but performs no outbound calls
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use alertpost::registry::{ConfigStore, ConfigStoreError, TargetRecord};
//! use alertpost::{MemoryDlqStore, PublishingConfig, PublishingService};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! struct StaticStore;
//!
//! #[async_trait::async_trait]
//! impl ConfigStore for StaticStore {
//!     async fn list_targets(&self) -> Result<Vec<TargetRecord>, ConfigStoreError> {
//!         Ok(vec![])
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = PublishingService::builder(
//!         PublishingConfig::default(),
//!         Arc::new(StaticStore),
//!         Arc::new(MemoryDlqStore::new()),
//!     )
//!     .build()?;
//!
//!     service.start();
//!     // ... submit alerts ...
//!     service.shutdown(Duration::from_secs(10)).await;
//!     Ok(())
//! }
//! ```

pub mod alert;
pub mod breaker;
pub mod classify;
pub mod clock;
pub mod config;
pub mod correlation;
pub mod dlq;
pub mod error;
pub mod fanout;
pub mod format;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod mode;
pub mod publish;
pub mod queue;
pub mod registry;
pub mod service;
pub mod sleeper;
pub mod target;

// Re-exports
pub use alert::{AlertStatus, Classification, EnrichedAlert, Severity};
pub use breaker::{BreakerConfig, BreakerMap, BreakerState, CircuitBreaker};
pub use classify::classify;
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, PublishingConfig};
pub use correlation::{ChatCorrelation, CorrelationCache, PagerCorrelation, TrackerCorrelation};
pub use dlq::{DlqEntry, DlqFilters, DlqReplayer, DlqStats, DlqStore, MemoryDlqStore};
pub use error::{DlqError, ErrorClass, FanoutError, PublishError, SubmitError, TransportKind};
pub use fanout::{FanoutPublisher, FanoutResult, TargetPublishResult};
pub use format::{format_alert, FormatError, PayloadFormat};
pub use health::{HealthFilter, HealthMonitor, HealthStatus, UnknownHealthMonitor};
pub use limiter::{LimiterMap, TokenBucket};
pub use metrics::{Metrics, MetricsSnapshot};
pub use mode::{ModeManager, PublishingMode};
pub use publish::{
    ChatPublisher, GenericHttpPublisher, HttpTransport, IncidentTrackerPublisher, PagerPublisher,
    Publisher, PublisherFactory, ReqwestTransport,
};
pub use queue::{DispatchQueue, Priority, PublishingJob, QueueStatus};
pub use registry::{ConfigStore, TargetRecord, TargetRegistry};
pub use service::{
    BuildError, PublishingService, PublishingServiceBuilder, PublishingStats, ServiceError,
    TestOutcome,
};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use target::{PublishingTarget, TargetKind};

pub mod prelude;
