//! Convenience re-exports for the common path: build a service, submit
//! alerts, fan out, inspect the dead-letter store.

pub use crate::alert::{AlertStatus, Classification, EnrichedAlert, Severity};
pub use crate::config::PublishingConfig;
pub use crate::dlq::{DlqFilters, DlqStore, MemoryDlqStore};
pub use crate::error::{ErrorClass, FanoutError, PublishError, SubmitError};
pub use crate::fanout::FanoutResult;
pub use crate::health::{HealthFilter, HealthMonitor, HealthStatus};
pub use crate::mode::PublishingMode;
pub use crate::queue::Priority;
pub use crate::registry::{ConfigStore, TargetRecord};
pub use crate::service::{PublishingService, PublishingServiceBuilder};
pub use crate::target::{PublishingTarget, TargetKind};
