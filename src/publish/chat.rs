//! Chat-webhook publisher with message-timestamp threading.
//!
//! The first firing message for a fingerprint opens a thread; later
//! updates and the resolve reply inside it. Each webhook is limited to
//! one message per second.

use crate::alert::EnrichedAlert;
use crate::correlation::{ChatCorrelation, CorrelationCache};
use crate::error::PublishError;
use crate::format::{format_alert, PayloadFormat};
use crate::limiter::LimiterMap;
use crate::publish::transport::{HttpRequest, HttpTransport};
use crate::publish::Publisher;
use crate::target::PublishingTarget;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub struct ChatPublisher {
    transport: Arc<dyn HttpTransport>,
    cache: Arc<CorrelationCache<ChatCorrelation>>,
    limiters: Arc<LimiterMap>,
    /// Bound on waiting for a rate-limit token.
    acquire_timeout: Duration,
}

impl ChatPublisher {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        cache: Arc<CorrelationCache<ChatCorrelation>>,
        limiters: Arc<LimiterMap>,
        acquire_timeout: Duration,
    ) -> Self {
        Self { transport, cache, limiters, acquire_timeout }
    }

    async fn post_message(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
        thread_ts: Option<&str>,
    ) -> Result<Option<String>, PublishError> {
        let limiter = self.limiters.for_key(&target.url);
        tokio::time::timeout(self.acquire_timeout, limiter.acquire()).await.map_err(|_| {
            PublishError::RateLimited { retry_after: limiter.try_acquire().err() }
        })?;

        let mut payload = format_alert(alert, target.format.unwrap_or(PayloadFormat::ChatMessage))?;
        if let Some(ts) = thread_ts {
            payload["thread_ts"] = serde_json::Value::String(ts.to_string());
        }
        let request = HttpRequest::post(&target.url, payload).with_headers(target.headers.iter());
        let response = self.transport.execute(request).await?;
        if !response.is_success() {
            return Err(response.into_error());
        }

        Ok(response
            .json()
            .and_then(|body| body.get("ts").and_then(|v| v.as_str().map(str::to_string))))
    }
}

#[async_trait]
impl Publisher for ChatPublisher {
    async fn publish(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
    ) -> Result<(), PublishError> {
        let fingerprint = alert.fingerprint.as_str();
        let cached = self.cache.get(fingerprint);

        if alert.status.is_firing() {
            match cached {
                None => {
                    let ts = self.post_message(alert, target, None).await?;
                    match ts {
                        Some(message_ts) => {
                            tracing::info!(
                                target_name = %target.name,
                                fingerprint,
                                "chat thread opened"
                            );
                            self.cache.set(
                                fingerprint,
                                ChatCorrelation {
                                    thread_ts: message_ts.clone(),
                                    message_ts,
                                },
                            );
                        }
                        None => {
                            tracing::warn!(
                                target_name = %target.name,
                                fingerprint,
                                "chat response carried no message ts; updates will not thread"
                            );
                        }
                    }
                    Ok(())
                }
                Some(correlation) => {
                    self.post_message(alert, target, Some(&correlation.thread_ts)).await?;
                    Ok(())
                }
            }
        } else {
            match cached {
                Some(correlation) => {
                    self.post_message(alert, target, Some(&correlation.thread_ts)).await?;
                    self.cache.delete(fingerprint);
                    tracing::info!(
                        target_name = %target.name,
                        fingerprint,
                        "chat thread resolved"
                    );
                    Ok(())
                }
                None => {
                    tracing::warn!(
                        target_name = %target.name,
                        fingerprint,
                        "resolve without a cached chat thread; posting standalone message"
                    );
                    self.post_message(alert, target, None).await?;
                    Ok(())
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "chat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::AlertStatus;
    use crate::clock::ManualClock;
    use crate::publish::transport::HttpResponse;
    use crate::sleeper::Sleeper;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct ScriptedTransport {
        requests: Mutex<Vec<HttpRequest>>,
        responses: Mutex<Vec<HttpResponse>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<HttpResponse>) -> Arc<Self> {
            Arc::new(Self { requests: Mutex::new(Vec::new()), responses: Mutex::new(responses) })
        }

        fn ok(body: &str) -> HttpResponse {
            HttpResponse { status: 200, body: body.into(), retry_after: None }
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, PublishError> {
            self.requests.lock().unwrap().push(request);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(Self::ok("{}"))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    /// Sleeper that advances the shared manual clock so rate-limit
    /// waits resolve without real time passing.
    #[derive(Debug, Clone)]
    struct AdvancingSleeper {
        clock: ManualClock,
        waits: Arc<Mutex<Vec<Duration>>>,
    }

    #[async_trait]
    impl Sleeper for AdvancingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.waits.lock().unwrap().push(duration);
            self.clock.advance(duration.as_millis() as u64 + 1);
        }
    }

    fn alert(status: AlertStatus, fp: &str) -> EnrichedAlert {
        EnrichedAlert {
            fingerprint: fp.into(),
            name: "A".into(),
            status,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            starts_at: Utc::now(),
            generator_url: None,
            classification: None,
        }
    }

    fn target() -> PublishingTarget {
        PublishingTarget {
            name: "chat-ops".into(),
            kind: crate::target::TargetKind::Chat,
            url: "https://hooks.example.com/services/W1".into(),
            enabled: true,
            format: None,
            headers: BTreeMap::new(),
        }
    }

    fn publisher(
        transport: Arc<ScriptedTransport>,
    ) -> (ChatPublisher, Arc<Mutex<Vec<Duration>>>) {
        let clock = ManualClock::new();
        let waits = Arc::new(Mutex::new(Vec::new()));
        let sleeper = AdvancingSleeper { clock: clock.clone(), waits: Arc::clone(&waits) };
        let limiters = Arc::new(LimiterMap::with_parts(
            1.0,
            1.0,
            Arc::new(clock),
            Arc::new(sleeper),
        ));
        let publisher = ChatPublisher::new(
            transport as Arc<dyn HttpTransport>,
            Arc::new(CorrelationCache::new("chat", Duration::from_secs(86_400))),
            limiters,
            Duration::from_secs(30),
        );
        (publisher, waits)
    }

    #[tokio::test]
    async fn threading_follows_the_first_message() {
        let transport = ScriptedTransport::new(vec![
            ScriptedTransport::ok(r#"{"ts":"1700000000.1"}"#),
            ScriptedTransport::ok(r#"{"ts":"1700000000.2"}"#),
            ScriptedTransport::ok(r#"{"ts":"1700000000.3"}"#),
        ]);
        let (publisher, waits) = publisher(Arc::clone(&transport));
        let t = target();

        publisher.publish(&alert(AlertStatus::Firing, "fp2"), &t).await.unwrap();
        publisher.publish(&alert(AlertStatus::Firing, "fp2"), &t).await.unwrap();
        publisher.publish(&alert(AlertStatus::Resolved, "fp2"), &t).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 3);
        assert!(requests[0].body.get("thread_ts").is_none(), "first message opens the thread");
        assert_eq!(requests[1].body["thread_ts"], "1700000000.1");
        assert_eq!(requests[2].body["thread_ts"], "1700000000.1");
        assert!(publisher.cache.get("fp2").is_none(), "resolve clears the thread anchor");

        let waits = waits.lock().unwrap();
        assert_eq!(waits.len(), 2, "second and third messages wait for the 1/s bucket");
        assert!(waits.iter().all(|w| *w >= Duration::from_millis(900)));
    }

    #[tokio::test]
    async fn resolve_without_thread_posts_standalone() {
        let transport = ScriptedTransport::new(vec![]);
        let (publisher, _) = publisher(Arc::clone(&transport));

        publisher.publish(&alert(AlertStatus::Resolved, "fp3"), &target()).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].body.get("thread_ts").is_none());
    }

    #[tokio::test]
    async fn missing_ts_in_response_leaves_cache_empty() {
        let transport = ScriptedTransport::new(vec![ScriptedTransport::ok("{}")]);
        let (publisher, _) = publisher(Arc::clone(&transport));

        publisher.publish(&alert(AlertStatus::Firing, "fp4"), &target()).await.unwrap();
        assert!(publisher.cache.get("fp4").is_none());
    }

    #[tokio::test]
    async fn webhook_error_propagates() {
        let transport = ScriptedTransport::new(vec![HttpResponse {
            status: 404,
            body: "no_service".into(),
            retry_after: None,
        }]);
        let (publisher, _) = publisher(Arc::clone(&transport));

        let err =
            publisher.publish(&alert(AlertStatus::Firing, "fp5"), &target()).await.unwrap_err();
        assert_eq!(err.status(), Some(404));
    }
}
