//! Dead-letter store: durable home for terminally failed jobs.
//!
//! The store itself is a trait; the queue writes entries through it and
//! the replayer re-submits them. An in-memory implementation ships for
//! tests and embedded use, a Postgres one for production.

use crate::alert::EnrichedAlert;
use crate::error::{DlqError, ErrorClass};
use crate::metrics::Metrics;
use crate::queue::{DispatchQueue, Priority, PublishingJob};
use crate::target::{PublishingTarget, TargetKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub mod postgres;

/// One terminally failed job, with enough state to replay it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub job_id: Uuid,
    pub fingerprint: String,
    pub target_name: String,
    pub target_kind: TargetKind,
    /// Serialized [`EnrichedAlert`] snapshot.
    pub alert: serde_json::Value,
    /// Serialized [`PublishingTarget`] snapshot at submit time.
    pub target: serde_json::Value,
    pub error_message: String,
    pub error_class: ErrorClass,
    pub retry_count: u32,
    pub priority: Priority,
    pub failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub replayed: bool,
    pub replayed_at: Option<DateTime<Utc>>,
    pub replay_result: Option<String>,
}

impl DlqEntry {
    /// Capture a failed job.
    pub fn from_job(
        job: &PublishingJob,
        error_message: String,
        error_class: ErrorClass,
    ) -> Result<Self, DlqError> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            fingerprint: job.alert.fingerprint.clone(),
            target_name: job.target.name.clone(),
            target_kind: job.target.kind,
            alert: serde_json::to_value(job.alert.as_ref())?,
            target: serde_json::to_value(job.target.as_ref())?,
            error_message,
            error_class,
            // Attempts minus the first one: how many times we retried.
            retry_count: job.attempt.saturating_sub(1),
            priority: job.priority,
            failed_at: now,
            created_at: now,
            updated_at: now,
            replayed: false,
            replayed_at: None,
            replay_result: None,
        })
    }

    pub fn alert(&self) -> Result<EnrichedAlert, DlqError> {
        Ok(serde_json::from_value(self.alert.clone())?)
    }

    pub fn target(&self) -> Result<PublishingTarget, DlqError> {
        Ok(serde_json::from_value(self.target.clone())?)
    }
}

/// Read filters; all fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct DlqFilters {
    pub target_name: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub priority: Option<Priority>,
    pub replayed: Option<bool>,
    pub failed_after: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl DlqFilters {
    fn matches(&self, entry: &DlqEntry) -> bool {
        if let Some(name) = &self.target_name {
            if &entry.target_name != name {
                return false;
            }
        }
        if let Some(class) = self.error_class {
            if entry.error_class != class {
                return false;
            }
        }
        if let Some(priority) = self.priority {
            if entry.priority != priority {
                return false;
            }
        }
        if let Some(replayed) = self.replayed {
            if entry.replayed != replayed {
                return false;
            }
        }
        if let Some(after) = self.failed_after {
            if entry.failed_at <= after {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DlqStats {
    pub total: u64,
    pub replayed: u64,
    pub by_class: BTreeMap<String, u64>,
    pub by_target: BTreeMap<String, u64>,
    pub oldest_failed_at: Option<DateTime<Utc>>,
    pub newest_failed_at: Option<DateTime<Utc>>,
}

/// Durable storage contract for dead letters.
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn write(&self, entry: DlqEntry) -> Result<(), DlqError>;

    /// Load exactly one entry by id.
    async fn get(&self, id: Uuid) -> Result<DlqEntry, DlqError>;

    /// Newest-first listing under the filters.
    async fn read(&self, filters: &DlqFilters) -> Result<Vec<DlqEntry>, DlqError>;

    /// Flag an entry replayed. Fails with [`DlqError::AlreadyReplayed`]
    /// when the flag is already set.
    async fn mark_replayed(&self, id: Uuid, result: &str) -> Result<(), DlqError>;

    /// Delete entries with `failed_at` strictly before the cutoff.
    async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64, DlqError>;

    async fn stats(&self) -> Result<DlqStats, DlqError>;
}

/// Replays dead letters back through the dispatch queue.
pub struct DlqReplayer {
    store: Arc<dyn DlqStore>,
    queue: DispatchQueue,
    metrics: Arc<Metrics>,
}

impl DlqReplayer {
    pub fn new(store: Arc<dyn DlqStore>, queue: DispatchQueue, metrics: Arc<Metrics>) -> Self {
        Self { store, queue, metrics }
    }

    /// Re-submit the stored job and mark the entry replayed. Replaying
    /// an already-replayed entry fails without touching the queue.
    pub async fn replay(&self, id: Uuid) -> Result<Uuid, DlqError> {
        let entry = self.store.get(id).await?;
        if entry.replayed {
            return Err(DlqError::AlreadyReplayed(id));
        }

        let alert = entry.alert()?;
        let target = entry.target()?;
        let job_id = self
            .queue
            .submit(Arc::new(alert), Arc::new(target))
            .map_err(|e| DlqError::Resubmit(id, e))?;

        self.store
            .mark_replayed(id, &format!("resubmitted as job {job_id}"))
            .await?;
        self.metrics.record_dlq_replay();
        tracing::info!(entry_id = %id, %job_id, "dead-letter entry replayed");
        Ok(job_id)
    }
}

/// In-memory store for tests and embedded deployments.
#[derive(Default)]
pub struct MemoryDlqStore {
    entries: Mutex<BTreeMap<Uuid, DlqEntry>>,
}

impl MemoryDlqStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DlqStore for MemoryDlqStore {
    async fn write(&self, entry: DlqEntry) -> Result<(), DlqError> {
        self.entries
            .lock()
            .expect("MemoryDlqStore.write: mutex poisoned")
            .insert(entry.id, entry);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<DlqEntry, DlqError> {
        self.entries
            .lock()
            .expect("MemoryDlqStore.get: mutex poisoned")
            .get(&id)
            .cloned()
            .ok_or(DlqError::NotFound(id))
    }

    async fn read(&self, filters: &DlqFilters) -> Result<Vec<DlqEntry>, DlqError> {
        let entries = self.entries.lock().expect("MemoryDlqStore.read: mutex poisoned");
        let mut matched: Vec<DlqEntry> =
            entries.values().filter(|e| filters.matches(e)).cloned().collect();
        matched.sort_by(|a, b| b.failed_at.cmp(&a.failed_at));

        let offset = filters.offset.unwrap_or(0);
        let matched: Vec<DlqEntry> = matched.into_iter().skip(offset).collect();
        Ok(match filters.limit {
            Some(limit) => matched.into_iter().take(limit).collect(),
            None => matched,
        })
    }

    async fn mark_replayed(&self, id: Uuid, result: &str) -> Result<(), DlqError> {
        let mut entries =
            self.entries.lock().expect("MemoryDlqStore.mark_replayed: mutex poisoned");
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        if entry.replayed {
            return Err(DlqError::AlreadyReplayed(id));
        }
        entry.replayed = true;
        entry.replayed_at = Some(Utc::now());
        entry.replay_result = Some(result.to_string());
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64, DlqError> {
        let mut entries = self.entries.lock().expect("MemoryDlqStore.purge: mutex poisoned");
        let before = entries.len();
        entries.retain(|_, e| e.failed_at >= older_than);
        Ok((before - entries.len()) as u64)
    }

    async fn stats(&self) -> Result<DlqStats, DlqError> {
        let entries = self.entries.lock().expect("MemoryDlqStore.stats: mutex poisoned");
        let mut by_class: BTreeMap<String, u64> = BTreeMap::new();
        let mut by_target: BTreeMap<String, u64> = BTreeMap::new();
        for entry in entries.values() {
            *by_class.entry(entry.error_class.as_str().to_string()).or_default() += 1;
            *by_target.entry(entry.target_name.clone()).or_default() += 1;
        }
        Ok(DlqStats {
            total: entries.len() as u64,
            replayed: entries.values().filter(|e| e.replayed).count() as u64,
            by_class,
            by_target,
            oldest_failed_at: entries.values().map(|e| e.failed_at).min(),
            newest_failed_at: entries.values().map(|e| e.failed_at).max(),
        })
    }
}
