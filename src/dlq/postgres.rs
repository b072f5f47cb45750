//! Postgres-backed dead-letter store.
//!
//! One table, runtime-checked queries. Alert and target snapshots are
//! stored as JSONB blobs; enums are stored as their lowercase text
//! forms.

use super::{DlqEntry, DlqFilters, DlqStats, DlqStore};
use crate::error::DlqError;
use crate::queue::Priority;
use crate::target::TargetKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};
use std::collections::BTreeMap;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS dlq_entries (
    id            UUID PRIMARY KEY,
    job_id        UUID NOT NULL,
    fingerprint   TEXT NOT NULL,
    target_name   TEXT NOT NULL,
    target_kind   TEXT NOT NULL,
    alert         JSONB NOT NULL,
    target        JSONB NOT NULL,
    error_message TEXT NOT NULL,
    error_class   TEXT NOT NULL,
    retry_count   INTEGER NOT NULL,
    priority      TEXT NOT NULL,
    failed_at     TIMESTAMPTZ NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL,
    replayed      BOOLEAN NOT NULL DEFAULT FALSE,
    replayed_at   TIMESTAMPTZ,
    replay_result TEXT
);
CREATE INDEX IF NOT EXISTS idx_dlq_entries_failed_at ON dlq_entries (failed_at DESC);
CREATE INDEX IF NOT EXISTS idx_dlq_entries_target_name ON dlq_entries (target_name);
"#;

pub struct PostgresDlqStore {
    pool: PgPool,
}

impl PostgresDlqStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table and indexes if they are absent.
    pub async fn ensure_schema(&self) -> Result<(), DlqError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await.map_err(storage)?;
        }
        Ok(())
    }
}

fn storage(e: sqlx::Error) -> DlqError {
    DlqError::Storage(e.to_string())
}

fn row_to_entry(row: &PgRow) -> Result<DlqEntry, DlqError> {
    let kind_raw: String = row.try_get("target_kind").map_err(storage)?;
    let class_raw: String = row.try_get("error_class").map_err(storage)?;
    let priority_raw: String = row.try_get("priority").map_err(storage)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(storage)?;

    Ok(DlqEntry {
        id: row.try_get("id").map_err(storage)?,
        job_id: row.try_get("job_id").map_err(storage)?,
        fingerprint: row.try_get("fingerprint").map_err(storage)?,
        target_name: row.try_get("target_name").map_err(storage)?,
        target_kind: kind_raw
            .parse::<TargetKind>()
            .map_err(|_| DlqError::Storage(format!("unknown target kind `{kind_raw}`")))?,
        alert: row.try_get("alert").map_err(storage)?,
        target: row.try_get("target").map_err(storage)?,
        error_message: row.try_get("error_message").map_err(storage)?,
        error_class: class_raw
            .parse()
            .map_err(|_| DlqError::Storage(format!("unknown error class `{class_raw}`")))?,
        retry_count: retry_count.max(0) as u32,
        priority: priority_raw
            .parse::<Priority>()
            .map_err(|_| DlqError::Storage(format!("unknown priority `{priority_raw}`")))?,
        failed_at: row.try_get("failed_at").map_err(storage)?,
        created_at: row.try_get("created_at").map_err(storage)?,
        updated_at: row.try_get("updated_at").map_err(storage)?,
        replayed: row.try_get("replayed").map_err(storage)?,
        replayed_at: row.try_get("replayed_at").map_err(storage)?,
        replay_result: row.try_get("replay_result").map_err(storage)?,
    })
}

#[async_trait]
impl DlqStore for PostgresDlqStore {
    async fn write(&self, entry: DlqEntry) -> Result<(), DlqError> {
        sqlx::query(
            r#"
            INSERT INTO dlq_entries (
                id, job_id, fingerprint, target_name, target_kind,
                alert, target, error_message, error_class, retry_count,
                priority, failed_at, created_at, updated_at,
                replayed, replayed_at, replay_result
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(entry.id)
        .bind(entry.job_id)
        .bind(&entry.fingerprint)
        .bind(&entry.target_name)
        .bind(entry.target_kind.as_str())
        .bind(&entry.alert)
        .bind(&entry.target)
        .bind(&entry.error_message)
        .bind(entry.error_class.as_str())
        .bind(entry.retry_count as i32)
        .bind(entry.priority.as_str())
        .bind(entry.failed_at)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .bind(entry.replayed)
        .bind(entry.replayed_at)
        .bind(&entry.replay_result)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<DlqEntry, DlqError> {
        let row = sqlx::query("SELECT * FROM dlq_entries WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(DlqError::NotFound(id))?;
        row_to_entry(&row)
    }

    async fn read(&self, filters: &DlqFilters) -> Result<Vec<DlqEntry>, DlqError> {
        let mut builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("SELECT * FROM dlq_entries WHERE 1 = 1");
        if let Some(name) = &filters.target_name {
            builder.push(" AND target_name = ").push_bind(name.clone());
        }
        if let Some(class) = filters.error_class {
            builder.push(" AND error_class = ").push_bind(class.as_str());
        }
        if let Some(priority) = filters.priority {
            builder.push(" AND priority = ").push_bind(priority.as_str());
        }
        if let Some(replayed) = filters.replayed {
            builder.push(" AND replayed = ").push_bind(replayed);
        }
        if let Some(after) = filters.failed_after {
            builder.push(" AND failed_at > ").push_bind(after);
        }
        builder.push(" ORDER BY failed_at DESC");
        if let Some(limit) = filters.limit {
            builder.push(" LIMIT ").push_bind(limit as i64);
        }
        if let Some(offset) = filters.offset {
            builder.push(" OFFSET ").push_bind(offset as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await.map_err(storage)?;
        rows.iter().map(row_to_entry).collect()
    }

    async fn mark_replayed(&self, id: Uuid, result: &str) -> Result<(), DlqError> {
        let updated = sqlx::query(
            r#"
            UPDATE dlq_entries
            SET replayed = TRUE, replayed_at = NOW(), replay_result = $2, updated_at = NOW()
            WHERE id = $1 AND replayed = FALSE
            "#,
        )
        .bind(id)
        .bind(result)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        // No row changed: either missing or already replayed.
        let exists: Option<bool> =
            sqlx::query_scalar("SELECT replayed FROM dlq_entries WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        match exists {
            None => Err(DlqError::NotFound(id)),
            Some(_) => Err(DlqError::AlreadyReplayed(id)),
        }
    }

    async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64, DlqError> {
        let deleted = sqlx::query("DELETE FROM dlq_entries WHERE failed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(deleted.rows_affected())
    }

    async fn stats(&self) -> Result<DlqStats, DlqError> {
        let totals = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE replayed) AS replayed,
                MIN(failed_at) AS oldest,
                MAX(failed_at) AS newest
            FROM dlq_entries
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;

        let by_class_rows =
            sqlx::query("SELECT error_class, COUNT(*) AS n FROM dlq_entries GROUP BY error_class")
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
        let by_target_rows =
            sqlx::query("SELECT target_name, COUNT(*) AS n FROM dlq_entries GROUP BY target_name")
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;

        let mut by_class = BTreeMap::new();
        for row in &by_class_rows {
            let class: String = row.try_get("error_class").map_err(storage)?;
            let n: i64 = row.try_get("n").map_err(storage)?;
            by_class.insert(class, n.max(0) as u64);
        }
        let mut by_target = BTreeMap::new();
        for row in &by_target_rows {
            let name: String = row.try_get("target_name").map_err(storage)?;
            let n: i64 = row.try_get("n").map_err(storage)?;
            by_target.insert(name, n.max(0) as u64);
        }

        let total: i64 = totals.try_get("total").map_err(storage)?;
        let replayed: i64 = totals.try_get("replayed").map_err(storage)?;
        Ok(DlqStats {
            total: total.max(0) as u64,
            replayed: replayed.max(0) as u64,
            by_class,
            by_target,
            oldest_failed_at: totals.try_get("oldest").map_err(storage)?,
            newest_failed_at: totals.try_get("newest").map_err(storage)?,
        })
    }
}
