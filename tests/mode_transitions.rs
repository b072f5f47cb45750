//! Mode fallback: an empty registry puts the service in metrics-only
//! mode (no outbound calls); gaining a target flips it back to normal
//! and notifies subscribers.

mod common;

use alertpost::mode::REASON_TARGETS_AVAILABLE;
use alertpost::{
    AlertStatus, MemoryDlqStore, PublishingConfig, PublishingMode, PublishingService,
};
use common::test_helpers::{alert, record, MutableConfigStore, RecordingTransport};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn empty_registry_means_metrics_only_and_no_attempts() {
    let transport = RecordingTransport::new();
    let store = MutableConfigStore::new(vec![]);
    let service = PublishingService::builder(
        PublishingConfig::default(),
        Arc::clone(&store) as Arc<dyn alertpost::ConfigStore>,
        Arc::new(MemoryDlqStore::new()),
    )
    .transport(Arc::clone(&transport) as Arc<dyn alertpost::publish::HttpTransport>)
    .build()
    .unwrap();
    service.refresh_targets().await.unwrap();

    assert!(service.mode_manager().is_metrics_only());
    assert_eq!(service.mode(), PublishingMode::MetricsOnly);

    let result = service
        .publish_to_all(&alert("fp9", AlertStatus::Firing, "critical"))
        .await
        .unwrap();
    assert_eq!(result.total, 0);
    assert_eq!(result.success_count, 0);
    assert_eq!(transport.request_count(), 0, "metrics-only mode must not touch the wire");

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn gaining_a_target_transitions_to_normal_and_notifies() {
    let transport = RecordingTransport::new();
    let store = MutableConfigStore::new(vec![]);
    let service = PublishingService::builder(
        PublishingConfig::default(),
        Arc::clone(&store) as Arc<dyn alertpost::ConfigStore>,
        Arc::new(MemoryDlqStore::new()),
    )
    .transport(Arc::clone(&transport) as Arc<dyn alertpost::publish::HttpTransport>)
    .build()
    .unwrap();
    service.refresh_targets().await.unwrap();
    assert!(service.mode_manager().is_metrics_only());

    let transitions: Arc<Mutex<Vec<(PublishingMode, PublishingMode, String)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&transitions);
    service.mode_manager().subscribe(Arc::new(move |from, to, reason| {
        sink.lock().unwrap().push((from, to, reason.to_string()));
    }));

    store.set(vec![record("t1", "generic-http", "https://t1.example.com", "")]);
    service.refresh_targets().await.unwrap();

    assert_eq!(service.mode(), PublishingMode::Normal);
    let seen = transitions.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, PublishingMode::MetricsOnly);
    assert_eq!(seen[0].1, PublishingMode::Normal);
    assert_eq!(seen[0].2, REASON_TARGETS_AVAILABLE);

    // Back in normal mode, fan-out reaches the wire again.
    let result = service
        .publish_to_all(&alert("fp10", AlertStatus::Firing, "critical"))
        .await
        .unwrap();
    assert_eq!(result.success_count, 1);
    assert_eq!(transport.request_count(), 1);

    service.shutdown(Duration::from_secs(1)).await;
}
