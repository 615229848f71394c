//! Batch job records and the registry that owns their lifecycle.
//!
//! A job moves `PENDING -> RUNNING -> DONE | ERROR`, or straight from `PENDING` to `ERROR`
//! when it fails before a worker picks it up. Terminal states are final.

mod memory;
mod sqlite;

use crate::config::JobStoreConfig;
use crate::error::{ServingError, ServingResult};
use crate::model::{FeatureReference, StagingLocation};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub use memory::MemoryJobRegistry;
pub use sqlite::SqliteJobRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = ServingError;

    fn from_str(s: &str) -> ServingResult<Self> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|_| ServingError::invalid_argument(format!("Invalid job id '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Error)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Error)
        )
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ServingError;

    fn from_str(s: &str) -> ServingResult<Self> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "DONE" => Ok(JobStatus::Done),
            "ERROR" => Ok(JobStatus::Error),
            other => Err(ServingError::internal(format!(
                "Unknown job status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Extract features for a set of entity rows.
    Download,
    /// Consolidate previously uploaded entity datasets.
    Load,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Download => "DOWNLOAD",
            JobType::Load => "LOAD",
        }
    }
}

impl FromStr for JobType {
    type Err = ServingError;

    fn from_str(s: &str) -> ServingResult<Self> {
        match s {
            "DOWNLOAD" => Ok(JobType::Download),
            "LOAD" => Ok(JobType::Load),
            other => Err(ServingError::internal(format!("Unknown job type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobSpec {
    pub job_type: JobType,
    pub features: Vec<FeatureReference>,
    pub source_uris: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub features: Vec<FeatureReference>,
    pub source_uris: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<StagingLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields recorded together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionFields {
    pub backend_handle: Option<String>,
    pub output: Option<StagingLocation>,
    pub error: Option<String>,
}

impl TransitionFields {
    pub fn backend_handle(handle: impl Into<String>) -> Self {
        Self {
            backend_handle: Some(handle.into()),
            ..Self::default()
        }
    }

    pub fn output(location: StagingLocation) -> Self {
        Self {
            output: Some(location),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }
}

impl BatchJob {
    pub fn new(id: JobId, spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type: spec.job_type,
            status: JobStatus::Pending,
            features: spec.features,
            source_uris: spec.source_uris,
            backend_handle: None,
            output: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Applies a status change. Illegal transitions and terminal states missing their
    /// payload are orchestration bugs and fail with `Internal`.
    pub(crate) fn apply(
        &mut self,
        next: JobStatus,
        fields: TransitionFields,
        now: DateTime<Utc>,
    ) -> ServingResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(ServingError::internal(format!(
                "Illegal transition {} -> {} for job {}",
                self.status, next, self.id
            )));
        }
        match next {
            JobStatus::Done if fields.output.is_none() => {
                return Err(ServingError::internal(format!(
                    "Job {} cannot be DONE without an output location",
                    self.id
                )));
            }
            JobStatus::Error if fields.error.is_none() => {
                return Err(ServingError::internal(format!(
                    "Job {} cannot be ERROR without an error message",
                    self.id
                )));
            }
            _ => {}
        }
        let TransitionFields {
            backend_handle,
            output,
            error,
        } = fields;
        if backend_handle.is_some() {
            self.backend_handle = backend_handle;
        }
        if output.is_some() {
            self.output = output;
        }
        if error.is_some() {
            self.error = error;
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Records a new PENDING job and returns it.
    async fn create(&self, spec: JobSpec) -> ServingResult<BatchJob>;

    async fn get(&self, id: JobId) -> ServingResult<BatchJob>;

    /// Jobs currently in `status`, oldest first.
    async fn list_by_status(&self, status: JobStatus) -> ServingResult<Vec<BatchJob>>;

    /// Moves a job to `next`. Transitions of one job are serialized.
    async fn transition(
        &self,
        id: JobId,
        next: JobStatus,
        fields: TransitionFields,
    ) -> ServingResult<BatchJob>;

    /// Removes terminal jobs last updated before `older_than`, returning how many were removed.
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> ServingResult<usize>;
}

fn job_not_found(id: JobId) -> ServingError {
    ServingError::not_found(format!("Job {} not found", id))
}

pub async fn get_job_registry(
    config: &JobStoreConfig,
    cwd: Option<&str>,
) -> Result<Arc<dyn JobRegistry>> {
    match config {
        JobStoreConfig::Memory => {
            debug!("Create in-memory job registry");
            Ok(Arc::new(MemoryJobRegistry::default()))
        }
        JobStoreConfig::Sqlite { path } => {
            let mut full_path = PathBuf::new();
            full_path.push(cwd.unwrap_or(""));
            full_path.push(path);
            debug!("Create sqlite job registry at {:?}", full_path);
            Ok(Arc::new(SqliteJobRegistry::connect(&full_path).await?))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use chrono::Duration;

    pub(crate) fn download_spec() -> JobSpec {
        JobSpec {
            job_type: JobType::Download,
            features: vec![FeatureReference::new("driver", 1, "rating")],
            source_uris: vec!["file:///tmp/entities.jsonl".to_string()],
        }
    }

    fn location() -> StagingLocation {
        StagingLocation {
            uri: "file:///tmp/staging/out.jsonl".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    /// Shared behaviour every registry implementation must have.
    pub(crate) async fn exercise_registry(registry: &dyn JobRegistry) -> Result<()> {
        let created = registry.create(download_spec()).await?;
        let id = created.id;
        let job = registry.get(id).await?;
        assert_eq!(job, created);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.features, download_spec().features);
        assert_eq!(job.job_type, JobType::Download);

        let err = registry
            .transition(id, JobStatus::Done, TransitionFields::output(location()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        let running = registry
            .transition(id, JobStatus::Running, TransitionFields::backend_handle("h-1"))
            .await?;
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.backend_handle.as_deref(), Some("h-1"));

        let err = registry
            .transition(id, JobStatus::Done, TransitionFields::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        let done = registry
            .transition(id, JobStatus::Done, TransitionFields::output(location()))
            .await?;
        assert_eq!(done.status, JobStatus::Done);
        assert_eq!(done.output.as_ref().map(|o| o.uri.as_str()), Some("file:///tmp/staging/out.jsonl"));
        assert_eq!(done.backend_handle.as_deref(), Some("h-1"));
        assert_eq!(registry.get(id).await?, done);

        for next in [JobStatus::Running, JobStatus::Pending] {
            let err = registry
                .transition(id, next, TransitionFields::default())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Internal);
        }

        let failed_id = registry.create(download_spec()).await?.id;
        let failed = registry
            .transition(failed_id, JobStatus::Error, TransitionFields::error("no backend"))
            .await?;
        assert_eq!(failed.error.as_deref(), Some("no backend"));
        let err = registry
            .transition(failed_id, JobStatus::Done, TransitionFields::output(location()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        let unknown = JobId::new_v4();
        assert_eq!(registry.get(unknown).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            registry
                .transition(unknown, JobStatus::Running, TransitionFields::default())
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::NotFound
        );

        let pending_id = registry.create(download_spec()).await?.id;
        let pending: Vec<JobId> = registry
            .list_by_status(JobStatus::Pending)
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(pending, vec![pending_id]);
        let terminal = registry.list_by_status(JobStatus::Done).await?;
        assert_eq!(terminal, vec![done.clone()]);
        assert!(registry.list_by_status(JobStatus::Running).await?.is_empty());
        assert_eq!(registry.purge_terminal(Utc::now() - Duration::hours(1)).await?, 0);
        assert_eq!(registry.purge_terminal(Utc::now() + Duration::seconds(1)).await?, 2);
        assert_eq!(registry.get(id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(registry.get(pending_id).await?.status, JobStatus::Pending);
        Ok(())
    }

    /// Moves many different jobs at once; every transition must land.
    pub(crate) async fn exercise_concurrent_transitions(
        registry: Arc<dyn JobRegistry>,
    ) -> Result<()> {
        let mut ids = vec![];
        for _ in 0..64 {
            ids.push(registry.create(download_spec()).await?.id);
        }
        let mut handles = vec![];
        for id in ids.iter().copied() {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .transition(id, JobStatus::Running, TransitionFields::backend_handle("h"))
                    .await
            }));
        }
        for handle in handles {
            handle.await??;
        }
        let running = registry.list_by_status(JobStatus::Running).await?;
        assert_eq!(running.len(), ids.len());
        Ok(())
    }

    #[test]
    fn allowed_transitions() {
        use JobStatus::*;
        let all = [Pending, Running, Done, Error];
        let allowed: Vec<(JobStatus, JobStatus)> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();
        assert_eq!(
            allowed,
            vec![(Pending, Running), (Pending, Error), (Running, Done), (Running, Error)]
        );
        assert!(Done.is_terminal() && Error.is_terminal());
        assert!(!Pending.is_terminal() && !Running.is_terminal());
    }

    #[test]
    fn job_ids_parse_and_serialize_as_strings() -> Result<()> {
        let id = JobId::new_v4();
        let parsed: JobId = id.to_string().parse()?;
        assert_eq!(parsed, id);
        assert_eq!(serde_json::to_value(id)?, serde_json::json!(id.to_string()));
        assert_eq!(
            "not-a-uuid".parse::<JobId>().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        Ok(())
    }
}
