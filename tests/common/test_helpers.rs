//! Shared helpers for the scenario suites: a scriptable transport, a
//! mutable config store, and alert builders.

#![allow(dead_code)]

use alertpost::publish::{HttpRequest, HttpResponse, HttpTransport};
use alertpost::registry::{ConfigStore, ConfigStoreError, TargetRecord};
use alertpost::{AlertStatus, EnrichedAlert, PublishError};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Transport that records every request and answers from per-URL
/// scripts: one-shot responses first, then a sticky status, then
/// `200 {}`.
#[derive(Default)]
pub struct RecordingTransport {
    requests: Mutex<Vec<(HttpRequest, Instant)>>,
    one_shot: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    sticky: Mutex<HashMap<String, u16>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue a one-shot response body for the given URL.
    pub fn enqueue_ok(&self, url: &str, body: &str) {
        self.enqueue(
            url,
            HttpResponse { status: 200, body: body.to_string(), retry_after: None },
        );
    }

    pub fn enqueue(&self, url: &str, response: HttpResponse) {
        self.one_shot.lock().unwrap().entry(url.to_string()).or_default().push_back(response);
    }

    /// Answer every request to the URL with this status until changed.
    pub fn set_status(&self, url: &str, status: u16) {
        self.sticky.lock().unwrap().insert(url.to_string(), status);
    }

    pub fn clear_status(&self, url: &str) {
        self.sticky.lock().unwrap().remove(url);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests_to(&self, url: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r.url == url)
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn all_requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().iter().map(|(r, _)| r.clone()).collect()
    }

    /// Arrival instants, for asserting rate-limit spacing.
    pub fn request_times(&self) -> Vec<Instant> {
        self.requests.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }
}

#[async_trait]
impl HttpTransport for RecordingTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, PublishError> {
        let url = request.url.clone();
        self.requests.lock().unwrap().push((request, Instant::now()));

        if let Some(queue) = self.one_shot.lock().unwrap().get_mut(&url) {
            if let Some(response) = queue.pop_front() {
                return Ok(response);
            }
        }
        if let Some(status) = self.sticky.lock().unwrap().get(&url) {
            return Ok(HttpResponse { status: *status, body: "scripted".into(), retry_after: None });
        }
        Ok(HttpResponse { status: 200, body: "{}".into(), retry_after: None })
    }
}

/// Config store whose record set can be swapped mid-test.
#[derive(Default)]
pub struct MutableConfigStore {
    records: Mutex<Vec<TargetRecord>>,
}

impl MutableConfigStore {
    pub fn new(records: Vec<TargetRecord>) -> Arc<Self> {
        Arc::new(Self { records: Mutex::new(records) })
    }

    pub fn set(&self, records: Vec<TargetRecord>) {
        *self.records.lock().unwrap() = records;
    }
}

#[async_trait]
impl ConfigStore for MutableConfigStore {
    async fn list_targets(&self) -> Result<Vec<TargetRecord>, ConfigStoreError> {
        Ok(self.records.lock().unwrap().clone())
    }
}

pub fn record(name: &str, kind: &str, url: &str, headers: &str) -> TargetRecord {
    TargetRecord {
        name: name.into(),
        kind: kind.into(),
        url: url.into(),
        enabled: Some(true),
        format: None,
        headers: headers.into(),
    }
}

pub fn alert(fingerprint: &str, status: AlertStatus, severity: &str) -> EnrichedAlert {
    EnrichedAlert {
        fingerprint: fingerprint.into(),
        name: "HighLatency".into(),
        status,
        labels: BTreeMap::from([("severity".to_string(), severity.to_string())]),
        annotations: BTreeMap::from([(
            "summary".to_string(),
            "p99 latency above threshold".to_string(),
        )]),
        starts_at: Utc::now(),
        generator_url: None,
        classification: None,
    }
}

/// Poll until the condition holds or the timeout elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
