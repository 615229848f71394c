use crate::error::{ServingError, ServingResult};
use crate::jobs::{
    job_not_found, BatchJob, JobId, JobRegistry, JobSpec, JobStatus, TransitionFields,
};
use crate::model::{FeatureReference, StagingLocation};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{FromRow, Pool, Row, Sqlite};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS batch_jobs (
    id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    features TEXT NOT NULL,
    source_uris TEXT NOT NULL,
    backend_handle TEXT,
    output_uri TEXT,
    output_expires_at_ms INTEGER,
    error TEXT,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL
)";

const SELECT_JOB: &str = "SELECT id, job_type, status, features, source_uris, backend_handle, \
     output_uri, output_expires_at_ms, error, created_at_ms, updated_at_ms \
     FROM batch_jobs WHERE id = ?";

const SELECT_BY_STATUS: &str = "SELECT id, job_type, status, features, source_uris, \
     backend_handle, output_uri, output_expires_at_ms, error, created_at_ms, updated_at_ms \
     FROM batch_jobs WHERE status = ? ORDER BY created_at_ms, id";

pub struct ConnectionOptions {
    max_connections: u32,
    acquire_timeout: Duration,
    busy_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            acquire_timeout: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Job registry persisted in a SQLite database. Timestamps are stored as unix milliseconds.
///
/// Reads go through the pool concurrently. Writes of this process hold `writer`, so SQLite
/// never has to arbitrate between two of our own transactions.
pub struct SqliteJobRegistry {
    connection_pool: Pool<Sqlite>,
    writer: Mutex<()>,
}

#[derive(Debug)]
struct JobRow {
    id: String,
    job_type: String,
    status: String,
    features: String,
    source_uris: String,
    backend_handle: Option<String>,
    output_uri: Option<String>,
    output_expires_at_ms: Option<i64>,
    error: Option<String>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl FromRow<'_, SqliteRow> for JobRow {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Self {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            status: row.try_get("status")?,
            features: row.try_get("features")?,
            source_uris: row.try_get("source_uris")?,
            backend_handle: row.try_get("backend_handle")?,
            output_uri: row.try_get("output_uri")?,
            output_expires_at_ms: row.try_get("output_expires_at_ms")?,
            error: row.try_get("error")?,
            created_at_ms: row.try_get("created_at_ms")?,
            updated_at_ms: row.try_get("updated_at_ms")?,
        })
    }
}

/// The job as it reads back from the store.
fn stored(mut job: BatchJob) -> BatchJob {
    job.created_at = job.created_at.trunc_subsecs(3);
    job.updated_at = job.updated_at.trunc_subsecs(3);
    if let Some(output) = job.output.as_mut() {
        output.expires_at = output.expires_at.trunc_subsecs(3);
    }
    job
}

fn from_millis(millis: i64) -> ServingResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| ServingError::internal(format!("Invalid stored timestamp {}", millis)))
}

fn corrupt(id: &str, err: impl std::fmt::Display) -> ServingError {
    ServingError::internal(format!("Corrupt job record {}: {}", id, err))
}

fn store_error(err: sqlx::Error) -> ServingError {
    ServingError::internal(format!("Job store error: {}", err))
}

impl TryFrom<JobRow> for BatchJob {
    type Error = ServingError;

    fn try_from(row: JobRow) -> ServingResult<Self> {
        let features: Vec<FeatureReference> =
            serde_json::from_str(&row.features).map_err(|e| corrupt(&row.id, e))?;
        let source_uris: Vec<String> =
            serde_json::from_str(&row.source_uris).map_err(|e| corrupt(&row.id, e))?;
        let output = match (row.output_uri, row.output_expires_at_ms) {
            (Some(uri), Some(expires_at_ms)) => Some(StagingLocation {
                uri,
                expires_at: from_millis(expires_at_ms)?,
            }),
            _ => None,
        };
        Ok(BatchJob {
            id: row.id.parse().map_err(|e| corrupt(&row.id, e))?,
            job_type: row.job_type.parse()?,
            status: row.status.parse()?,
            features,
            source_uris,
            backend_handle: row.backend_handle,
            output,
            error: row.error,
            created_at: from_millis(row.created_at_ms)?,
            updated_at: from_millis(row.updated_at_ms)?,
        })
    }
}

impl SqliteJobRegistry {
    pub async fn connect(path: &Path) -> Result<Self> {
        Self::from_options(path, ConnectionOptions::default()).await
    }

    pub async fn from_options(path: &Path, connection_options: ConnectionOptions) -> Result<Self> {
        let connect_options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(connection_options.busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(connection_options.max_connections)
            .acquire_timeout(connection_options.acquire_timeout)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("Failed to open job store {:?}", path))?;
        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .context("Failed to create batch_jobs table")?;
        Ok(Self {
            connection_pool: pool,
            writer: Mutex::new(()),
        })
    }
}

#[async_trait]
impl JobRegistry for SqliteJobRegistry {
    async fn create(&self, spec: JobSpec) -> ServingResult<BatchJob> {
        let id = JobId::new_v4();
        let job = stored(BatchJob::new(id, spec, Utc::now()));
        let features = serde_json::to_string(&job.features)
            .map_err(|e| ServingError::internal(e.to_string()))?;
        let source_uris = serde_json::to_string(&job.source_uris)
            .map_err(|e| ServingError::internal(e.to_string()))?;
        let _writer = self.writer.lock().await;
        sqlx::query(
            "INSERT INTO batch_jobs (id, job_type, status, features, source_uris, \
             created_at_ms, updated_at_ms) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(features)
        .bind(source_uris)
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.timestamp_millis())
        .execute(&self.connection_pool)
        .await
        .map_err(store_error)?;
        Ok(job)
    }

    async fn get(&self, id: JobId) -> ServingResult<BatchJob> {
        let row: Option<JobRow> = sqlx::query_as(SELECT_JOB)
            .bind(id.to_string())
            .fetch_optional(&self.connection_pool)
            .await
            .map_err(store_error)?;
        row.ok_or_else(|| job_not_found(id))?.try_into()
    }

    async fn list_by_status(&self, status: JobStatus) -> ServingResult<Vec<BatchJob>> {
        let rows: Vec<JobRow> = sqlx::query_as(SELECT_BY_STATUS)
            .bind(status.as_str())
            .fetch_all(&self.connection_pool)
            .await
            .map_err(store_error)?;
        rows.into_iter().map(BatchJob::try_from).collect()
    }

    async fn transition(
        &self,
        id: JobId,
        next: JobStatus,
        fields: TransitionFields,
    ) -> ServingResult<BatchJob> {
        let _writer = self.writer.lock().await;
        let mut tx = self.connection_pool.begin().await.map_err(store_error)?;
        let row: Option<JobRow> = sqlx::query_as(SELECT_JOB)
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_error)?;
        let mut job: BatchJob = row.ok_or_else(|| job_not_found(id))?.try_into()?;
        let previous = job.status;
        job.apply(next, fields, Utc::now())?;
        let job = stored(job);

        let updated = sqlx::query(
            "UPDATE batch_jobs SET status = ?, backend_handle = ?, output_uri = ?, \
             output_expires_at_ms = ?, error = ?, updated_at_ms = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(job.status.as_str())
        .bind(job.backend_handle.as_deref())
        .bind(job.output.as_ref().map(|o| o.uri.as_str()))
        .bind(job.output.as_ref().map(|o| o.expires_at.timestamp_millis()))
        .bind(job.error.as_deref())
        .bind(job.updated_at.timestamp_millis())
        .bind(id.to_string())
        .bind(previous.as_str())
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;
        if updated.rows_affected() != 1 {
            return Err(ServingError::internal(format!(
                "Job {} changed state concurrently while moving {} -> {}",
                id, previous, next
            )));
        }
        tx.commit().await.map_err(store_error)?;
        debug!(job_id = %id, "Job moved {} -> {}", previous, next);
        Ok(job)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> ServingResult<usize> {
        let _writer = self.writer.lock().await;
        let result = sqlx::query(
            "DELETE FROM batch_jobs WHERE status IN ('DONE', 'ERROR') AND updated_at_ms < ?",
        )
        .bind(older_than.timestamp_millis())
        .execute(&self.connection_pool)
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::{download_spec, exercise_concurrent_transitions, exercise_registry};
    use std::sync::Arc;

    #[tokio::test]
    async fn sqlite_registry_lifecycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = SqliteJobRegistry::connect(&dir.path().join("jobs.db")).await?;
        exercise_registry(&registry).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_transitions_of_different_jobs_all_land() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = SqliteJobRegistry::connect(&dir.path().join("jobs.db")).await?;
        exercise_concurrent_transitions(Arc::new(registry)).await
    }

    #[tokio::test]
    async fn jobs_survive_reopening_the_database() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("jobs.db");
        let id = {
            let registry = SqliteJobRegistry::connect(&path).await?;
            let id = registry.create(download_spec()).await?.id;
            registry
                .transition(id, JobStatus::Running, TransitionFields::backend_handle("local-1"))
                .await?;
            registry.connection_pool.close().await;
            id
        };
        let registry = SqliteJobRegistry::connect(&path).await?;
        let job = registry.get(id).await?;
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.backend_handle.as_deref(), Some("local-1"));
        assert_eq!(job.source_uris, download_spec().source_uris);
        Ok(())
    }
}
