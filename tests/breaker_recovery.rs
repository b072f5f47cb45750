//! A flaky target trips its breaker after five consecutive failures,
//! skips further jobs while open, and recovers through half-open after
//! two probe successes.

mod common;

use alertpost::{
    AlertStatus, BreakerState, MemoryDlqStore, PublishingConfig, PublishingService,
};
use common::test_helpers::{alert, record, wait_until, MutableConfigStore, RecordingTransport};
use std::sync::Arc;
use std::time::Duration;

const FLAKY_URL: &str = "https://flaky.example.com/hook";

fn breaker_state(service: &PublishingService, name: &str) -> Option<BreakerState> {
    service.breaker_states().into_iter().find(|(n, _)| n == name).map(|(_, s)| s)
}

#[tokio::test]
async fn breaker_trips_skips_and_recovers() {
    let transport = RecordingTransport::new();
    transport.set_status(FLAKY_URL, 503);

    let store = MutableConfigStore::new(vec![record("flaky", "generic-http", FLAKY_URL, "")]);
    let config = PublishingConfig {
        // One attempt per job so five jobs produce exactly five
        // breaker failures.
        max_retries: 0,
        breaker_open_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let service = PublishingService::builder(
        config,
        Arc::clone(&store) as Arc<dyn alertpost::ConfigStore>,
        Arc::new(MemoryDlqStore::new()),
    )
    .transport(Arc::clone(&transport) as Arc<dyn alertpost::publish::HttpTransport>)
    .build()
    .unwrap();
    service.refresh_targets().await.unwrap();
    service.start();

    for i in 0..5u64 {
        let a = Arc::new(alert(&format!("fp-{i}"), AlertStatus::Firing, "warning"));
        service.submit_by_name(a, "flaky").unwrap();
        assert!(
            wait_until(|| service.metrics().failed == i + 1, Duration::from_secs(5)).await,
            "failure {i} not recorded"
        );
    }
    assert_eq!(breaker_state(&service, "flaky"), Some(BreakerState::Open));
    assert_eq!(service.metrics().breaker_opened, 1);

    // While open, a submit is accepted but the job is skipped without
    // reaching the wire.
    let wire_before = transport.request_count();
    service
        .submit_by_name(Arc::new(alert("fp-skip", AlertStatus::Firing, "warning")), "flaky")
        .unwrap();
    assert!(
        wait_until(|| service.metrics().breaker_skips == 1, Duration::from_secs(5)).await,
        "skip not recorded"
    );
    assert_eq!(transport.request_count(), wire_before, "open breaker must not attempt");

    // Recovery: endpoint heals, the open window elapses, and two
    // consecutive successes close the breaker.
    transport.set_status(FLAKY_URL, 200);
    tokio::time::sleep(Duration::from_millis(350)).await;

    service
        .submit_by_name(Arc::new(alert("fp-a", AlertStatus::Firing, "warning")), "flaky")
        .unwrap();
    assert!(wait_until(|| service.metrics().published == 1, Duration::from_secs(5)).await);
    assert_eq!(breaker_state(&service, "flaky"), Some(BreakerState::HalfOpen));

    service
        .submit_by_name(Arc::new(alert("fp-b", AlertStatus::Firing, "warning")), "flaky")
        .unwrap();
    assert!(wait_until(|| service.metrics().published == 2, Duration::from_secs(5)).await);
    assert_eq!(breaker_state(&service, "flaky"), Some(BreakerState::Closed));
    assert_eq!(service.metrics().breaker_closed, 1);

    service.shutdown(Duration::from_secs(1)).await;
}
