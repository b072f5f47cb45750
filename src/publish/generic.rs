//! Generic HTTP publisher: one POST per alert, no lifecycle state.
//!
//! Covers plain JSON receivers and alertmanager-compatible endpoints;
//! the only difference between the two is the payload format.

use crate::alert::EnrichedAlert;
use crate::error::PublishError;
use crate::format::{format_alert, PayloadFormat};
use crate::publish::transport::{HttpRequest, HttpTransport};
use crate::publish::Publisher;
use crate::target::{PublishingTarget, TargetKind};
use async_trait::async_trait;
use std::sync::Arc;

pub struct GenericHttpPublisher {
    transport: Arc<dyn HttpTransport>,
}

impl GenericHttpPublisher {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    fn format_for(target: &PublishingTarget) -> PayloadFormat {
        target.format.unwrap_or(match target.kind {
            TargetKind::AlertmanagerCompat => PayloadFormat::Alertmanager,
            _ => PayloadFormat::GenericJson,
        })
    }
}

#[async_trait]
impl Publisher for GenericHttpPublisher {
    async fn publish(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
    ) -> Result<(), PublishError> {
        let payload = format_alert(alert, Self::format_for(target))?;
        let request = HttpRequest::post(&target.url, payload).with_headers(target.headers.iter());
        let response = self.transport.execute(request).await?;
        if response.is_success() {
            tracing::debug!(
                target_name = %target.name,
                url = %target.masked_url(),
                status = response.status,
                "published alert"
            );
            Ok(())
        } else {
            Err(response.into_error())
        }
    }

    fn name(&self) -> &'static str {
        "generic-http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertStatus;
    use crate::publish::transport::HttpResponse;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct ScriptedTransport {
        requests: Mutex<Vec<HttpRequest>>,
        status: u16,
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, PublishError> {
            self.requests.lock().unwrap().push(request);
            Ok(HttpResponse { status: self.status, body: String::new(), retry_after: None })
        }
    }

    fn alert() -> EnrichedAlert {
        EnrichedAlert {
            fingerprint: "fp".into(),
            name: "A".into(),
            status: AlertStatus::Firing,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            starts_at: Utc::now(),
            generator_url: None,
            classification: None,
        }
    }

    fn target(kind: TargetKind) -> PublishingTarget {
        PublishingTarget {
            name: "t".into(),
            kind,
            url: "https://receiver.example.com/hook".into(),
            enabled: true,
            format: None,
            headers: BTreeMap::from([("X-Env".to_string(), "prod".to_string())]),
        }
    }

    #[tokio::test]
    async fn posts_payload_with_target_headers() {
        let transport =
            Arc::new(ScriptedTransport { requests: Mutex::new(Vec::new()), status: 200 });
        let publisher = GenericHttpPublisher::new(Arc::clone(&transport) as Arc<dyn HttpTransport>);

        publisher.publish(&alert(), &target(TargetKind::GenericHttp)).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://receiver.example.com/hook");
        assert!(requests[0].headers.iter().any(|(k, v)| k == "X-Env" && v == "prod"));
        assert_eq!(requests[0].body["fingerprint"], "fp");
    }

    #[tokio::test]
    async fn alertmanager_targets_get_list_payloads() {
        let transport =
            Arc::new(ScriptedTransport { requests: Mutex::new(Vec::new()), status: 200 });
        let publisher = GenericHttpPublisher::new(Arc::clone(&transport) as Arc<dyn HttpTransport>);

        publisher.publish(&alert(), &target(TargetKind::AlertmanagerCompat)).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert!(requests[0].body.is_array());
    }

    #[tokio::test]
    async fn non_2xx_becomes_http_error() {
        let transport =
            Arc::new(ScriptedTransport { requests: Mutex::new(Vec::new()), status: 503 });
        let publisher = GenericHttpPublisher::new(transport as Arc<dyn HttpTransport>);

        let err = publisher.publish(&alert(), &target(TargetKind::GenericHttp)).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
    }
}
