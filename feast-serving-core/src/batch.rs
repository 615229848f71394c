//! Batch compute backends. A backend runs DOWNLOAD and LOAD work behind an opaque handle
//! that the orchestrator polls until it reaches a terminal state.

use crate::error::{ServingError, ServingResult};
use crate::jobs::{BatchJob, JobId, JobType};
use crate::model::{EntityRow, EntityValue, FeatureReference, FeatureValue, StagingLocation};
use crate::resolver::OnlineFeatureResolver;
use crate::staging::StagingClient;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap as HashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchTask {
    pub job_id: JobId,
    pub job_type: JobType,
    pub features: Vec<FeatureReference>,
    pub source_uris: Vec<String>,
}

impl From<&BatchJob> for BatchTask {
    fn from(job: &BatchJob) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            features: job.features.clone(),
            source_uris: job.source_uris.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendJobState {
    Pending,
    Running,
    Done(StagingLocation),
    Failed(String),
}

impl BackendJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendJobState::Done(_) | BackendJobState::Failed(_))
    }
}

#[async_trait]
pub trait BatchComputeBackend: Send + Sync {
    /// Starts the task and returns a handle to poll it with.
    async fn submit(&self, task: BatchTask) -> ServingResult<String>;

    async fn poll(&self, handle: &str) -> ServingResult<BackendJobState>;
}

#[derive(Serialize)]
struct OutputRecord<'a> {
    entities: &'a BTreeMap<String, EntityValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_timestamp: Option<DateTime<Utc>>,
    features: BTreeMap<&'a str, FeatureValue>,
}

/// Parses JSON lines of entity rows, skipping blank lines.
pub fn parse_entity_rows(data: &[u8], uri: &str) -> Result<Vec<EntityRow>> {
    let text = std::str::from_utf8(data).with_context(|| format!("{} is not UTF-8", uri))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line_no, line)| {
            let row: EntityRow = serde_json::from_str(line)
                .with_context(|| format!("Invalid entity row at {}:{}", uri, line_no + 1))?;
            if row.fields.is_empty() {
                return Err(anyhow!("Empty entity row at {}:{}", uri, line_no + 1));
            }
            Ok(row)
        })
        .collect()
}

#[derive(Clone)]
struct LocalWorker {
    resolver: Option<Arc<OnlineFeatureResolver>>,
    staging: Arc<dyn StagingClient>,
    chunk_size: usize,
}

impl LocalWorker {
    async fn run(&self, task: &BatchTask) -> Result<StagingLocation> {
        match task.job_type {
            JobType::Download => self.download(task).await,
            JobType::Load => self.load(task).await,
        }
    }

    async fn download(&self, task: &BatchTask) -> Result<StagingLocation> {
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| anyhow!("No online store is configured for DOWNLOAD jobs"))?;
        let mut output: Vec<u8> = vec![];
        let mut written = 0usize;
        for uri in &task.source_uris {
            let rows = parse_entity_rows(&self.staging.get(uri).await?, uri)?;
            for chunk in rows.chunks(self.chunk_size.max(1)) {
                let resolved = resolver.resolve(chunk, &task.features).await?;
                let field_names = resolved.field_names();
                for (row, values) in chunk.iter().zip(resolved.rows) {
                    let record = OutputRecord {
                        entities: &row.fields,
                        entity_timestamp: row.entity_timestamp,
                        features: field_names.iter().map(String::as_str).zip(values).collect(),
                    };
                    serde_json::to_writer(&mut output, &record)?;
                    output.push(b'\n');
                    written += 1;
                }
            }
            debug!(job_id = %task.job_id, uri = %uri, "Resolved entity source");
        }
        let location = self.staging.location(Some("output"))?;
        self.staging.put(&location.uri, output).await?;
        info!(job_id = %task.job_id, rows = written, uri = %location.uri, "Wrote batch features");
        Ok(location)
    }

    async fn load(&self, task: &BatchTask) -> Result<StagingLocation> {
        let mut output: Vec<u8> = vec![];
        let mut loaded = 0usize;
        for uri in &task.source_uris {
            for row in parse_entity_rows(&self.staging.get(uri).await?, uri)? {
                serde_json::to_writer(&mut output, &row)?;
                output.push(b'\n');
                loaded += 1;
            }
        }
        let location = self.staging.location(Some("load"))?;
        self.staging.put(&location.uri, output).await?;
        info!(job_id = %task.job_id, rows = loaded, uri = %location.uri, "Consolidated entity datasets");
        Ok(location)
    }
}

/// Runs each batch task on the tokio runtime of this process.
pub struct LocalBatchBackend {
    worker: LocalWorker,
    states: Arc<RwLock<HashMap<String, BackendJobState>>>,
}

impl LocalBatchBackend {
    pub fn new(
        resolver: Option<Arc<OnlineFeatureResolver>>,
        staging: Arc<dyn StagingClient>,
        chunk_size: usize,
    ) -> Self {
        Self {
            worker: LocalWorker {
                resolver,
                staging,
                chunk_size,
            },
            states: Arc::new(RwLock::new(HashMap::default())),
        }
    }
}

#[async_trait]
impl BatchComputeBackend for LocalBatchBackend {
    async fn submit(&self, task: BatchTask) -> ServingResult<String> {
        let handle = format!("local-{}", Uuid::new_v4().simple());
        self.states
            .write()
            .await
            .insert(handle.clone(), BackendJobState::Pending);

        let states = self.states.clone();
        let worker = self.worker.clone();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            states
                .write()
                .await
                .insert(task_handle.clone(), BackendJobState::Running);
            let job_id = task.job_id;
            let work = tokio::spawn(async move { worker.run(&task).await });
            let state = match work.await {
                Ok(Ok(location)) => BackendJobState::Done(location),
                Ok(Err(err)) => {
                    error!(job_id = %job_id, "Batch task failed: {:#}", err);
                    BackendJobState::Failed(format!("{:#}", err))
                }
                Err(join_error) => {
                    error!(job_id = %job_id, "Batch task aborted: {}", join_error);
                    BackendJobState::Failed(format!("Batch task aborted: {}", join_error))
                }
            };
            states.write().await.insert(task_handle, state);
        });
        Ok(handle)
    }

    async fn poll(&self, handle: &str) -> ServingResult<BackendJobState> {
        self.states
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| ServingError::not_found(format!("Unknown backend handle '{}'", handle)))
    }
}
