//! Protocol publishers and the factory that owns their shared state.
//!
//! Each protocol family implements [`Publisher`]. The
//! [`PublisherFactory`] resolves a publisher from a target's kind and
//! owns the singletons the families share: the correlation caches, the
//! rate limiters, the HTTP transport, and the cache sweeper.

use crate::alert::EnrichedAlert;
use crate::clock::{Clock, MonotonicClock};
use crate::config::PublishingConfig;
use crate::correlation::{
    spawn_sweeper, ChatCorrelation, CorrelationCache, PagerCorrelation, Sweepable, SweeperHandle,
    TrackerCorrelation,
};
use crate::error::PublishError;
use crate::limiter::{LimiterMap, TokenBucket};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::target::{PublishingTarget, TargetKind};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

pub mod chat;
pub mod generic;
pub mod pager;
pub mod tracker;
pub mod transport;

pub use chat::ChatPublisher;
pub use generic::GenericHttpPublisher;
pub use pager::PagerPublisher;
pub use tracker::{IncidentTrackerPublisher, ResolveFallback};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

/// A single-endpoint publisher for one protocol family.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        alert: &EnrichedAlert,
        target: &PublishingTarget,
    ) -> Result<(), PublishError>;

    /// Stable name, used in logs and metrics labels.
    fn name(&self) -> &'static str;
}

/// Owns the per-protocol singletons and resolves publishers by target
/// kind.
pub struct PublisherFactory {
    generic: Arc<GenericHttpPublisher>,
    tracker: Arc<IncidentTrackerPublisher>,
    pager: Arc<PagerPublisher>,
    chat: Arc<ChatPublisher>,
    pager_cache: Arc<CorrelationCache<PagerCorrelation>>,
    tracker_cache: Arc<CorrelationCache<TrackerCorrelation>>,
    chat_cache: Arc<CorrelationCache<ChatCorrelation>>,
    sweep_interval: std::time::Duration,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl PublisherFactory {
    pub fn new(config: &PublishingConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_parts(
            config,
            transport,
            Arc::new(MonotonicClock::default()),
            Arc::new(TokioSleeper),
        )
    }

    /// Construction with injected time seams, for deterministic tests.
    pub fn with_parts(
        config: &PublishingConfig,
        transport: Arc<dyn HttpTransport>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let pager_cache = Arc::new(CorrelationCache::with_clock(
            "pager",
            config.correlation_ttl,
            Arc::clone(&clock),
        ));
        let tracker_cache = Arc::new(CorrelationCache::with_clock(
            "incident-tracker",
            config.correlation_ttl,
            Arc::clone(&clock),
        ));
        let chat_cache = Arc::new(CorrelationCache::with_clock(
            "chat",
            config.correlation_ttl,
            Arc::clone(&clock),
        ));

        let pager_limiter = Arc::new(TokenBucket::with_parts(
            config.pager_rate_per_minute / 60.0,
            config.pager_rate_per_minute,
            Arc::clone(&clock),
            Arc::clone(&sleeper),
        ));
        let chat_limiters = Arc::new(LimiterMap::with_parts(
            config.chat_rate_per_second,
            1.0,
            Arc::clone(&clock),
            Arc::clone(&sleeper),
        ));

        Self {
            generic: Arc::new(GenericHttpPublisher::new(Arc::clone(&transport))),
            tracker: Arc::new(IncidentTrackerPublisher::new(
                Arc::clone(&transport),
                Arc::clone(&tracker_cache),
            )),
            pager: Arc::new(PagerPublisher::new(
                Arc::clone(&transport),
                Arc::clone(&pager_cache),
                pager_limiter,
                config.http_request_timeout,
            )),
            chat: Arc::new(ChatPublisher::new(
                transport,
                Arc::clone(&chat_cache),
                chat_limiters,
                config.http_request_timeout,
            )),
            pager_cache,
            tracker_cache,
            chat_cache,
            sweep_interval: config.sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    /// Resolve the publisher for a target kind.
    pub fn for_kind(&self, kind: TargetKind) -> Arc<dyn Publisher> {
        match kind {
            TargetKind::IncidentTracker => Arc::clone(&self.tracker) as Arc<dyn Publisher>,
            TargetKind::Pager => Arc::clone(&self.pager) as Arc<dyn Publisher>,
            TargetKind::Chat => Arc::clone(&self.chat) as Arc<dyn Publisher>,
            TargetKind::GenericHttp | TargetKind::AlertmanagerCompat => {
                Arc::clone(&self.generic) as Arc<dyn Publisher>
            }
        }
    }

    /// The pager publisher with its inherent operations (acknowledge).
    pub fn pager(&self) -> Arc<PagerPublisher> {
        Arc::clone(&self.pager)
    }

    pub fn pager_cache(&self) -> Arc<CorrelationCache<PagerCorrelation>> {
        Arc::clone(&self.pager_cache)
    }

    pub fn tracker_cache(&self) -> Arc<CorrelationCache<TrackerCorrelation>> {
        Arc::clone(&self.tracker_cache)
    }

    pub fn chat_cache(&self) -> Arc<CorrelationCache<ChatCorrelation>> {
        Arc::clone(&self.chat_cache)
    }

    /// Start the periodic correlation sweep. Requires a running
    /// runtime; idempotent.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().expect("PublisherFactory.start_sweeper: poisoned");
        if sweeper.is_some() {
            return;
        }
        let caches: Vec<Arc<dyn Sweepable>> = vec![
            Arc::clone(&self.pager_cache) as Arc<dyn Sweepable>,
            Arc::clone(&self.tracker_cache) as Arc<dyn Sweepable>,
            Arc::clone(&self.chat_cache) as Arc<dyn Sweepable>,
        ];
        *sweeper = Some(spawn_sweeper(caches, self.sweep_interval));
    }

    /// Stop the sweeper. Idle HTTP connections close when the
    /// transport is dropped with the factory.
    pub async fn shutdown(&self) {
        let handle =
            self.sweeper.lock().expect("PublisherFactory.shutdown: poisoned").take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }
}

impl std::fmt::Debug for PublisherFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherFactory")
            .field("pager_cache", &self.pager_cache)
            .field("tracker_cache", &self.tracker_cache)
            .field("chat_cache", &self.chat_cache)
            .finish()
    }
}
