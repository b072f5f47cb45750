//! Incident-tracker publisher with incident-id correlation.
//!
//! Lifecycle: a firing alert with no cached incident creates one (POST)
//! and caches the returned id; a firing alert with a cached id updates
//! it (PUT); a resolved alert with a cached id resolves it and clears
//! the cache. Resolving without a cached id is a defined warning case.

use crate::alert::EnrichedAlert;
use crate::correlation::{CorrelationCache, TrackerCorrelation};
use crate::error::PublishError;
use crate::format::{format_alert, PayloadFormat};
use crate::publish::transport::{HttpRequest, HttpTransport};
use crate::publish::Publisher;
use crate::target::PublishingTarget;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// What a resolve does when no incident id is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolveFallback {
    /// Log a warning and succeed without touching the tracker.
    #[default]
    WarnOnly,
    /// Create the incident, then immediately resolve it, so the
    /// tracker still records the occurrence.
    CreateThenResolve,
}

pub struct IncidentTrackerPublisher {
    transport: Arc<dyn HttpTransport>,
    cache: Arc<CorrelationCache<TrackerCorrelation>>,
    resolve_fallback: ResolveFallback,
}

impl IncidentTrackerPublisher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        cache: Arc<CorrelationCache<TrackerCorrelation>>,
    ) -> Self {
        Self { transport, cache, resolve_fallback: ResolveFallback::default() }
    }

    pub fn with_resolve_fallback(mut self, fallback: ResolveFallback) -> Self {
        self.resolve_fallback = fallback;
        self
    }

    async fn create(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
    ) -> Result<Option<String>, PublishError> {
        let payload = format_alert(alert, target.format.unwrap_or(PayloadFormat::IncidentTracker))?;
        let request = HttpRequest::post(&target.url, payload).with_headers(target.headers.iter());
        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }

        let incident_id = response
            .json()
            .and_then(|body| {
                body.get("id")
                    .or_else(|| body.get("incident_id"))
                    .and_then(|v| v.as_str().map(str::to_string))
            });
        if incident_id.is_none() {
            tracing::warn!(
                target_name = %target.name,
                fingerprint = %alert.fingerprint,
                "tracker create response carried no incident id; resolve will not correlate"
            );
        }
        Ok(incident_id)
    }

    async fn update(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
        incident_id: &str,
    ) -> Result<(), PublishError> {
        let payload = format_alert(alert, target.format.unwrap_or(PayloadFormat::IncidentTracker))?;
        let url = format!("{}/{incident_id}", target.url.trim_end_matches('/'));
        let request = HttpRequest::put(url, payload).with_headers(target.headers.iter());
        let response = self.transport.execute(request).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(response.into_error())
        }
    }

    async fn resolve(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
        incident_id: &str,
    ) -> Result<(), PublishError> {
        let url = format!("{}/{incident_id}/resolve", target.url.trim_end_matches('/'));
        let body = json!({
            "status": "resolved",
            "fingerprint": alert.fingerprint,
        });
        let request = HttpRequest::post(url, body).with_headers(target.headers.iter());
        let response = self.transport.execute(request).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(response.into_error())
        }
    }
}

#[async_trait]
impl Publisher for IncidentTrackerPublisher {
    async fn publish(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
    ) -> Result<(), PublishError> {
        let fingerprint = alert.fingerprint.as_str();
        if alert.status.is_firing() {
            match self.cache.get(fingerprint) {
                None => {
                    if let Some(incident_id) = self.create(alert, target).await? {
                        tracing::info!(
                            target_name = %target.name,
                            fingerprint,
                            incident_id = %incident_id,
                            "incident created"
                        );
                        self.cache.set(fingerprint, TrackerCorrelation { incident_id });
                    }
                    Ok(())
                }
                Some(correlation) => {
                    self.update(alert, target, &correlation.incident_id).await
                }
            }
        } else {
            match self.cache.get(fingerprint) {
                Some(correlation) => {
                    self.resolve(alert, target, &correlation.incident_id).await?;
                    self.cache.delete(fingerprint);
                    tracing::info!(
                        target_name = %target.name,
                        fingerprint,
                        incident_id = %correlation.incident_id,
                        "incident resolved"
                    );
                    Ok(())
                }
                None => {
                    tracing::warn!(
                        target_name = %target.name,
                        fingerprint,
                        "resolve without a cached incident id"
                    );
                    match self.resolve_fallback {
                        ResolveFallback::WarnOnly => Ok(()),
                        ResolveFallback::CreateThenResolve => {
                            if let Some(incident_id) = self.create(alert, target).await? {
                                self.resolve(alert, target, &incident_id).await?;
                            }
                            Ok(())
                        }
                    }
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "incident-tracker"
    }
}
