//! Paging-service publisher with dedup-key correlation.
//!
//! A firing alert triggers an event with `dedup_key = fingerprint` and
//! caches whatever dedup key the service echoes back. A resolved alert
//! resolves under the cached key and clears it. A `change_event=true`
//! label short-circuits the lifecycle and sends a change event instead.
//! Explicit acknowledgement is supported via [`PagerPublisher::acknowledge`].

use crate::alert::EnrichedAlert;
use crate::correlation::{CorrelationCache, PagerCorrelation};
use crate::error::PublishError;
use crate::format::{format_alert, PayloadFormat};
use crate::limiter::TokenBucket;
use crate::publish::transport::{HttpRequest, HttpTransport};
use crate::publish::Publisher;
use crate::target::PublishingTarget;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Label that redirects a submit into a change event.
pub const CHANGE_EVENT_LABEL: &str = "change_event";

pub struct PagerPublisher {
    transport: Arc<dyn HttpTransport>,
    cache: Arc<CorrelationCache<PagerCorrelation>>,
    limiter: Arc<TokenBucket>,
    /// Bound on waiting for a rate-limit token.
    acquire_timeout: Duration,
}

impl PagerPublisher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        cache: Arc<CorrelationCache<PagerCorrelation>>,
        limiter: Arc<TokenBucket>,
        acquire_timeout: Duration,
    ) -> Self {
        Self { transport, cache, limiter, acquire_timeout }
    }

    fn routing_key(target: &PublishingTarget) -> Result<String, PublishError> {
        target
            .routing_key()
            .map(str::to_string)
            .ok_or_else(|| PublishError::Auth("pager target has no routing key".into()))
    }

    async fn acquire_token(&self) -> Result<(), PublishError> {
        tokio::time::timeout(self.acquire_timeout, self.limiter.acquire()).await.map_err(|_| {
            PublishError::RateLimited { retry_after: self.limiter.try_acquire().err() }
        })
    }

    async fn send_event(
        &self,
        target: &PublishingTarget,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, PublishError> {
        self.acquire_token().await?;
        let request = HttpRequest::post(&target.url, body).with_headers(
            target.headers.iter().filter(|(k, _)| !k.eq_ignore_ascii_case("routing_key")),
        );
        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }
        Ok(response.json().unwrap_or(json!({})))
    }

    async fn trigger(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        let payload = format_alert(alert, target.format.unwrap_or(PayloadFormat::Pager))?;
        let body = json!({
            "routing_key": routing_key,
            "event_action": "trigger",
            "dedup_key": alert.fingerprint,
            "payload": payload,
        });
        let response = self.send_event(target, body).await?;

        let dedup_key = response
            .get("dedup_key")
            .and_then(|v| v.as_str())
            .unwrap_or(alert.fingerprint.as_str())
            .to_string();
        tracing::info!(
            target_name = %target.name,
            fingerprint = %alert.fingerprint,
            "pager incident triggered"
        );
        self.cache.set(&alert.fingerprint, PagerCorrelation { dedup_key });
        Ok(())
    }

    async fn resolve(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        let dedup_key = match self.cache.get(&alert.fingerprint) {
            Some(correlation) => correlation.dedup_key,
            None => {
                tracing::warn!(
                    target_name = %target.name,
                    fingerprint = %alert.fingerprint,
                    "resolve without a cached dedup key; falling back to the fingerprint"
                );
                alert.fingerprint.clone()
            }
        };
        let body = json!({
            "routing_key": routing_key,
            "event_action": "resolve",
            "dedup_key": dedup_key,
        });
        self.send_event(target, body).await?;
        self.cache.delete(&alert.fingerprint);
        tracing::info!(
            target_name = %target.name,
            fingerprint = %alert.fingerprint,
            "pager incident resolved"
        );
        Ok(())
    }

    async fn change_event(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
        routing_key: &str,
    ) -> Result<(), PublishError> {
        let payload = format_alert(alert, target.format.unwrap_or(PayloadFormat::Pager))?;
        let body = json!({
            "routing_key": routing_key,
            "event_action": "change",
            "payload": payload,
        });
        self.send_event(target, body).await?;
        Ok(())
    }

    /// Acknowledge the running incident for this alert's fingerprint.
    pub async fn acknowledge(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
    ) -> Result<(), PublishError> {
        let routing_key = Self::routing_key(target)?;
        let dedup_key = self
            .cache
            .get(&alert.fingerprint)
            .map(|c| c.dedup_key)
            .unwrap_or_else(|| alert.fingerprint.clone());
        let body = json!({
            "routing_key": routing_key,
            "event_action": "acknowledge",
            "dedup_key": dedup_key,
        });
        self.send_event(target, body).await?;
        Ok(())
    }
}

#[async_trait]
impl Publisher for PagerPublisher {
    async fn publish(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
    ) -> Result<(), PublishError> {
        let routing_key = Self::routing_key(target)?;

        if alert.label(CHANGE_EVENT_LABEL) == Some("true") {
            return self.change_event(alert, target, &routing_key).await;
        }
        if alert.status.is_firing() {
            self.trigger(alert, target, &routing_key).await
        } else {
            self.resolve(alert, target, &routing_key).await
        }
    }

    fn name(&self) -> &'static str {
        "pager"
    }
}
