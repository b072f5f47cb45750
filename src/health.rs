//! Endpoint health, as reported by an external monitor.
//!
//! Only the parallel fan-out consults health; the queue path relies on
//! circuit breakers instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// How fan-out filters targets by health. Unknown health always fails
/// open: the target is included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthFilter {
    SkipUnhealthy,
    SkipUnhealthyAndDegraded,
    PublishToAll,
}

impl HealthFilter {
    /// Whether a target with the given status participates in fan-out.
    pub fn includes(&self, status: HealthStatus) -> bool {
        match self {
            HealthFilter::PublishToAll => true,
            HealthFilter::SkipUnhealthy => status != HealthStatus::Unhealthy,
            HealthFilter::SkipUnhealthyAndDegraded => {
                !matches!(status, HealthStatus::Unhealthy | HealthStatus::Degraded)
            }
        }
    }
}

/// External health monitor collaborator.
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    async fn health_by_name(&self, target_name: &str) -> HealthStatus;
}

/// Monitor that knows nothing; every lookup is `Unknown`, so filters
/// fail open.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownHealthMonitor;

#[async_trait]
impl HealthMonitor for UnknownHealthMonitor {
    async fn health_by_name(&self, _target_name: &str) -> HealthStatus {
        HealthStatus::Unknown
    }
}
