//! Asynchronous batch job orchestration.
//!
//! Submissions are validated and recorded as PENDING, then handed to a fixed pool of
//! workers over a bounded queue. A worker submits the job to the compute backend, records
//! the handle as RUNNING, and polls until the backend reports a terminal state.
//!
//! The queue lives in memory. On startup [`BatchJobOrchestrator::recover`] re-enqueues jobs
//! left PENDING and resumes polling jobs left RUNNING by a previous process.

use crate::batch::{BackendJobState, BatchComputeBackend, BatchTask};
use crate::config::BatchConfig;
use crate::error::{ErrorKind, ServingError, ServingResult};
use crate::jobs::{BatchJob, JobId, JobRegistry, JobSpec, JobStatus, JobType, TransitionFields};
use crate::model::{FeatureReference, StagingLocation};
use crate::registry::FeatureSetRegistry;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

const RECORD_ATTEMPTS: u32 = 5;
const RECORD_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    pub poll_interval: Duration,
}

impl From<&BatchConfig> for OrchestratorOptions {
    fn from(config: &BatchConfig) -> Self {
        Self {
            workers: config.workers,
            queue_capacity: config.queue_capacity,
            poll_interval: config.poll_interval(),
        }
    }
}

struct JobRunner {
    registry: Arc<dyn JobRegistry>,
    backend: Arc<dyn BatchComputeBackend>,
    poll_interval: Duration,
}

impl JobRunner {
    /// Records a transition. Losing a race against another writer that already moved the
    /// job to a terminal state, or to `next` itself, yields the stored job instead of an error.
    async fn apply(
        &self,
        id: JobId,
        next: JobStatus,
        fields: TransitionFields,
    ) -> ServingResult<BatchJob> {
        match self.registry.transition(id, next, fields).await {
            Err(err) if err.kind() == ErrorKind::Internal => {
                let current = self.registry.get(id).await?;
                if current.status.is_terminal() || current.status == next {
                    debug!(job_id = %id, status = %current.status, "Job already moved");
                    Ok(current)
                } else {
                    Err(err)
                }
            }
            result => result,
        }
    }

    /// [`Self::apply`] retried with exponential backoff. A missing job is not retried.
    async fn record(
        &self,
        id: JobId,
        next: JobStatus,
        fields: TransitionFields,
    ) -> ServingResult<BatchJob> {
        let mut backoff = RECORD_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.apply(id, next, fields.clone()).await {
                Err(err) if attempt < RECORD_ATTEMPTS && !err.is_not_found() => {
                    warn!(job_id = %id, attempt, "Cannot record {} yet: {}", next, err);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Polls the backend for a RUNNING job and records a terminal outcome.
    async fn refresh(&self, job: BatchJob) -> ServingResult<BatchJob> {
        if job.status != JobStatus::Running {
            return Ok(job);
        }
        let Some(handle) = job.backend_handle.clone() else {
            return Ok(job);
        };
        match self.backend.poll(&handle).await {
            Ok(BackendJobState::Done(location)) => {
                info!(job_id = %job.id, uri = %location.uri, "Job finished");
                self.apply(job.id, JobStatus::Done, TransitionFields::output(location))
                    .await
            }
            Ok(BackendJobState::Failed(message)) => {
                error!(job_id = %job.id, "Job failed: {}", message);
                self.apply(job.id, JobStatus::Error, TransitionFields::error(message))
                    .await
            }
            Ok(BackendJobState::Pending | BackendJobState::Running) => Ok(job),
            Err(err) if err.is_not_found() => {
                error!(job_id = %job.id, handle = %handle, "Backend lost the job");
                self.apply(
                    job.id,
                    JobStatus::Error,
                    TransitionFields::error(format!("Backend lost job handle '{}'", handle)),
                )
                .await
            }
            Err(err) => Err(err),
        }
    }

    #[instrument(skip_all, fields(job_id = %id))]
    async fn process(&self, id: JobId) {
        let job = match self.registry.get(id).await {
            Ok(job) if job.status == JobStatus::Pending => job,
            Ok(job) => {
                debug!(status = %job.status, "Skipping job that is no longer pending");
                return;
            }
            Err(err) => {
                error!("Cannot load queued job: {}", err);
                return;
            }
        };
        let handle = match self.backend.submit(BatchTask::from(&job)).await {
            Ok(handle) => handle,
            Err(err) => {
                error!("Backend rejected job: {}", err);
                self.fail(id, format!("Backend submission failed: {}", err)).await;
                return;
            }
        };
        let job = match self
            .record(id, JobStatus::Running, TransitionFields::backend_handle(&handle))
            .await
        {
            Ok(job) => job,
            Err(err) => {
                error!(handle = %handle, "Cannot record job pickup: {}", err);
                self.fail(id, format!("Cannot record backend handle '{}': {}", handle, err))
                    .await;
                return;
            }
        };
        info!(handle = %handle, "Job picked up");
        self.watch(job).await;
    }

    /// Moves a job that never reached RUNNING to ERROR. If even that cannot be written the
    /// job stays PENDING and is picked up again by the next [`BatchJobOrchestrator::recover`].
    async fn fail(&self, id: JobId, message: String) {
        if let Err(err) = self
            .record(id, JobStatus::Error, TransitionFields::error(message))
            .await
        {
            error!(job_id = %id, "Cannot record job failure, job stays PENDING: {}", err);
        }
    }

    /// Polls a RUNNING job until it is terminal.
    async fn watch(&self, mut job: BatchJob) {
        while !job.status.is_terminal() {
            tokio::time::sleep(self.poll_interval).await;
            job = match self.refresh(job.clone()).await {
                Ok(job) => job,
                Err(err) => {
                    warn!("Polling job failed, retrying: {}", err);
                    job
                }
            };
        }
    }
}

/// Jobs found unfinished by [`BatchJobOrchestrator::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveredJobs {
    pub requeued: usize,
    pub reconciled: usize,
}

pub struct BatchJobOrchestrator {
    runner: Arc<JobRunner>,
    features: Arc<dyn FeatureSetRegistry>,
    sender: Mutex<Option<mpsc::Sender<JobId>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BatchJobOrchestrator {
    /// Creates the orchestrator and spawns its workers on the current runtime.
    pub fn start(
        features: Arc<dyn FeatureSetRegistry>,
        registry: Arc<dyn JobRegistry>,
        backend: Arc<dyn BatchComputeBackend>,
        options: OrchestratorOptions,
    ) -> Self {
        let runner = Arc::new(JobRunner {
            registry,
            backend,
            poll_interval: options.poll_interval,
        });
        let (sender, receiver) = mpsc::channel::<JobId>(options.queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let workers = (0..options.workers.max(1))
            .map(|worker| {
                let runner = runner.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        match next {
                            Some(id) => runner.process(id).await,
                            None => break,
                        }
                    }
                    debug!(worker, "Batch worker stopped");
                })
            })
            .collect();
        info!(
            workers = options.workers.max(1),
            queue_capacity = options.queue_capacity.max(1),
            "Started batch job orchestrator"
        );
        Self {
            runner,
            features,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    fn sender(&self) -> ServingResult<mpsc::Sender<JobId>> {
        self.sender
            .lock()
            .map_err(|_| ServingError::internal("orchestrator lock poisoned"))?
            .clone()
            .ok_or_else(|| ServingError::service_unavailable("Batch orchestrator is shut down"))
    }

    /// Picks up jobs a previous process left unfinished. PENDING jobs go back on the queue,
    /// RUNNING jobs are polled once and watched until terminal.
    pub async fn recover(&self) -> ServingResult<RecoveredJobs> {
        let sender = self.sender()?;
        let registry = &self.runner.registry;
        let pending = registry.list_by_status(JobStatus::Pending).await?;
        for job in &pending {
            sender
                .send(job.id)
                .await
                .map_err(|_| ServingError::service_unavailable("Batch orchestrator is shut down"))?;
        }
        let running = registry.list_by_status(JobStatus::Running).await?;
        let mut watchers = vec![];
        for job in running.iter().cloned() {
            let runner = self.runner.clone();
            watchers.push(tokio::spawn(async move {
                let id = job.id;
                let job = match runner.refresh(job.clone()).await {
                    Ok(job) => job,
                    Err(err) => {
                        warn!(job_id = %id, "Cannot reconcile job, keep polling: {}", err);
                        job
                    }
                };
                runner.watch(job).await;
            }));
        }
        self.workers
            .lock()
            .map_err(|_| ServingError::internal("orchestrator lock poisoned"))?
            .extend(watchers);
        let recovered = RecoveredJobs {
            requeued: pending.len(),
            reconciled: running.len(),
        };
        info!(
            requeued = recovered.requeued,
            reconciled = recovered.reconciled,
            "Recovered unfinished batch jobs"
        );
        Ok(recovered)
    }

    async fn enqueue(&self, spec: JobSpec) -> ServingResult<BatchJob> {
        let sender = self.sender()?;
        let permit = sender.try_reserve_owned().map_err(|err| match err {
            TrySendError::Full(_) => {
                ServingError::resource_exhausted("Batch job queue is full, retry later")
            }
            TrySendError::Closed(_) => {
                ServingError::service_unavailable("Batch orchestrator is shut down")
            }
        })?;
        let job_type = spec.job_type;
        let job = self.runner.registry.create(spec).await?;
        permit.send(job.id);
        info!(job_id = %job.id, job_type = job_type.as_str(), "Job created");
        Ok(job)
    }

    fn validate_sources(source_uris: &[String]) -> ServingResult<()> {
        if source_uris.is_empty() {
            return Err(ServingError::invalid_argument(
                "At least one source URI is required",
            ));
        }
        if source_uris.iter().any(|uri| uri.trim().is_empty()) {
            return Err(ServingError::invalid_argument("Source URIs must not be blank"));
        }
        Ok(())
    }

    /// Submits a DOWNLOAD job extracting `features` for the entity rows in `entity_source`.
    pub async fn submit(
        &self,
        entity_source: Vec<String>,
        features: Vec<FeatureReference>,
    ) -> ServingResult<BatchJob> {
        Self::validate_sources(&entity_source)?;
        if features.is_empty() {
            return Err(ServingError::invalid_argument(
                "At least one feature reference is required",
            ));
        }
        let resolved = self.features.resolve_features(&features).await?;
        self.enqueue(JobSpec {
            job_type: JobType::Download,
            features: resolved.into_iter().map(|f| f.reference).collect(),
            source_uris: entity_source,
        })
        .await
    }

    /// Submits a LOAD job consolidating the datasets uploaded to `source_uris`.
    pub async fn load(&self, source_uris: Vec<String>) -> ServingResult<BatchJob> {
        Self::validate_sources(&source_uris)?;
        self.enqueue(JobSpec {
            job_type: JobType::Load,
            features: vec![],
            source_uris,
        })
        .await
    }

    /// Current state of a job. Terminal jobs are returned as stored; running jobs are
    /// re-polled first.
    #[instrument(skip_all, fields(job_id = %id))]
    pub async fn reload_status(&self, id: JobId) -> ServingResult<BatchJob> {
        let job = self.runner.registry.get(id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        self.runner.refresh(job).await
    }

    pub async fn completed_job(&self, id: JobId) -> ServingResult<StagingLocation> {
        let job = self.runner.registry.get(id).await?;
        match job.status {
            JobStatus::Done => job.output.ok_or_else(|| {
                ServingError::internal(format!("Job {} is DONE without an output location", id))
            }),
            JobStatus::Error => Err(ServingError::failed_precondition(format!(
                "Job {} failed: {}",
                id,
                job.error.unwrap_or_default()
            ))),
            status => Err(ServingError::failed_precondition(format!(
                "Job {} is not complete, current status is {}",
                id, status
            ))),
        }
    }

    /// Stops accepting jobs and waits for the workers to drain the queue.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().map(|mut s| s.take()).unwrap_or(None);
        drop(sender);
        let workers = self
            .workers
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        for worker in workers {
            if let Err(err) = worker.await {
                warn!("Batch worker ended abnormally: {}", err);
            }
        }
        info!("Batch job orchestrator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{MemoryJobRegistry, SqliteJobRegistry};
    use crate::registry::FeatureSetSchema;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Backend whose submissions block until released and whose jobs stay RUNNING until
    /// `finish` is set.
    struct GatedBackend {
        submit_gate: Semaphore,
        entered: AtomicUsize,
        finish: AtomicBool,
        fail_with: Option<String>,
    }

    impl GatedBackend {
        fn new(open_submits: usize) -> Self {
            Self {
                submit_gate: Semaphore::new(open_submits),
                entered: AtomicUsize::new(0),
                finish: AtomicBool::new(false),
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl BatchComputeBackend for GatedBackend {
        async fn submit(&self, task: BatchTask) -> ServingResult<String> {
            self.entered.fetch_add(1, Ordering::SeqCst);
            self.submit_gate
                .acquire()
                .await
                .map_err(|e| ServingError::internal(e.to_string()))?
                .forget();
            Ok(format!("gated-{}", task.job_id))
        }

        async fn poll(&self, handle: &str) -> ServingResult<BackendJobState> {
            if !self.finish.load(Ordering::SeqCst) {
                return Ok(BackendJobState::Running);
            }
            Ok(match &self.fail_with {
                Some(message) => BackendJobState::Failed(message.clone()),
                None => BackendJobState::Done(StagingLocation {
                    uri: format!("file:///staging/output/{}", handle),
                    expires_at: Utc::now() + chrono::Duration::hours(1),
                }),
            })
        }
    }

    struct RejectingBackend;

    #[async_trait]
    impl BatchComputeBackend for RejectingBackend {
        async fn submit(&self, _task: BatchTask) -> ServingResult<String> {
            Err(ServingError::service_unavailable("compute cluster unreachable"))
        }

        async fn poll(&self, handle: &str) -> ServingResult<BackendJobState> {
            Err(ServingError::not_found(handle))
        }
    }

    /// Finishes every job it submitted and has no record of any other handle.
    struct FreshBackend;

    #[async_trait]
    impl BatchComputeBackend for FreshBackend {
        async fn submit(&self, task: BatchTask) -> ServingResult<String> {
            Ok(format!("fresh-{}", task.job_id))
        }

        async fn poll(&self, handle: &str) -> ServingResult<BackendJobState> {
            if !handle.starts_with("fresh-") {
                return Err(ServingError::not_found(handle));
            }
            Ok(BackendJobState::Done(StagingLocation {
                uri: format!("file:///staging/output/{}", handle),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            }))
        }
    }

    /// Job store whose writes into `failing` fail `failures` times before going through.
    struct FlakyRegistry {
        inner: MemoryJobRegistry,
        failing: JobStatus,
        failures: AtomicUsize,
    }

    impl FlakyRegistry {
        fn new(failing: JobStatus, failures: usize) -> Self {
            Self {
                inner: MemoryJobRegistry::default(),
                failing,
                failures: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl JobRegistry for FlakyRegistry {
        async fn create(&self, spec: JobSpec) -> ServingResult<BatchJob> {
            self.inner.create(spec).await
        }

        async fn get(&self, id: JobId) -> ServingResult<BatchJob> {
            self.inner.get(id).await
        }

        async fn list_by_status(&self, status: JobStatus) -> ServingResult<Vec<BatchJob>> {
            self.inner.list_by_status(status).await
        }

        async fn transition(
            &self,
            id: JobId,
            next: JobStatus,
            fields: TransitionFields,
        ) -> ServingResult<BatchJob> {
            let fail = next == self.failing
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if fail {
                return Err(ServingError::internal("Job store error: database is locked"));
            }
            self.inner.transition(id, next, fields).await
        }

        async fn purge_terminal(&self, older_than: DateTime<Utc>) -> ServingResult<usize> {
            self.inner.purge_terminal(older_than).await
        }
    }

    fn feature_registry() -> Result<Arc<dyn FeatureSetRegistry>> {
        let path = format!("{}/test_data/feature_sets.yaml", env!("CARGO_MANIFEST_DIR"));
        Ok(Arc::new(FeatureSetSchema::from_path(Path::new(&path))?))
    }

    fn orchestrator(
        backend: Arc<dyn BatchComputeBackend>,
        workers: usize,
        queue_capacity: usize,
    ) -> Result<BatchJobOrchestrator> {
        orchestrator_with(Arc::new(MemoryJobRegistry::default()), backend, workers, queue_capacity)
    }

    fn orchestrator_with(
        registry: Arc<dyn JobRegistry>,
        backend: Arc<dyn BatchComputeBackend>,
        workers: usize,
        queue_capacity: usize,
    ) -> Result<BatchJobOrchestrator> {
        Ok(BatchJobOrchestrator::start(
            feature_registry()?,
            registry,
            backend,
            OrchestratorOptions {
                workers,
                queue_capacity,
                poll_interval: Duration::from_millis(5),
            },
        ))
    }

    fn features() -> Vec<FeatureReference> {
        vec![
            FeatureReference::new("driver", 1, "rating"),
            FeatureReference::new("driver", 1, "trips_today"),
        ]
    }

    fn sources() -> Vec<String> {
        vec!["file:///staging/uploads/entities".to_string()]
    }

    async fn wait_for(
        orchestrator: &BatchJobOrchestrator,
        id: JobId,
        status: JobStatus,
        observed: &mut Vec<JobStatus>,
    ) -> Result<BatchJob> {
        for _ in 0..1000 {
            let job = orchestrator.reload_status(id).await?;
            if observed.last() != Some(&job.status) {
                observed.push(job.status);
            }
            if job.status == status {
                return Ok(job);
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Err(anyhow!("job {} never reached {}", id, status))
    }

    async fn wait_until_entered(backend: &GatedBackend, count: usize) -> Result<()> {
        for _ in 0..1000 {
            if backend.entered.load(Ordering::SeqCst) >= count {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Err(anyhow!("backend submit was never called"))
    }

    #[tokio::test]
    async fn job_moves_pending_running_done() -> Result<()> {
        let backend = Arc::new(GatedBackend::new(0));
        let orchestrator = orchestrator(backend.clone(), 2, 8)?;
        let mut observed = vec![];

        let submitted = orchestrator.submit(sources(), features()).await?;
        assert_eq!(submitted.status, JobStatus::Pending);
        let id = submitted.id;
        let pending = orchestrator.reload_status(id).await?;
        assert_eq!(pending.status, JobStatus::Pending);
        observed.push(pending.status);
        assert_eq!(
            orchestrator.completed_job(id).await.unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );

        backend.submit_gate.add_permits(1);
        let running = wait_for(&orchestrator, id, JobStatus::Running, &mut observed).await?;
        assert_eq!(running.backend_handle, Some(format!("gated-{}", id)));
        assert_eq!(
            orchestrator.completed_job(id).await.unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );

        backend.finish.store(true, Ordering::SeqCst);
        let done = wait_for(&orchestrator, id, JobStatus::Done, &mut observed).await?;
        let location = orchestrator.completed_job(id).await?;
        assert_eq!(Some(&location), done.output.as_ref());
        assert!(location.uri.ends_with(&format!("gated-{}", id)));

        assert_eq!(observed, vec![JobStatus::Pending, JobStatus::Running, JobStatus::Done]);
        let again = orchestrator.reload_status(id).await?;
        assert_eq!(again, orchestrator.reload_status(id).await?);
        assert_eq!(again, done);

        orchestrator.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn backend_failure_is_recorded_not_thrown() -> Result<()> {
        let backend = Arc::new(GatedBackend {
            fail_with: Some("out of memory".to_string()),
            ..GatedBackend::new(1)
        });
        backend.finish.store(true, Ordering::SeqCst);
        let orchestrator = orchestrator(backend, 1, 8)?;
        let id = orchestrator.submit(sources(), features()).await?.id;
        let failed = wait_for(&orchestrator, id, JobStatus::Error, &mut vec![]).await?;
        assert_eq!(failed.error.as_deref(), Some("out of memory"));
        assert_eq!(
            orchestrator.completed_job(id).await.unwrap_err().kind(),
            ErrorKind::FailedPrecondition
        );
        Ok(())
    }

    #[tokio::test]
    async fn rejected_submission_moves_pending_to_error() -> Result<()> {
        let orchestrator = orchestrator(Arc::new(RejectingBackend), 1, 8)?;
        let id = orchestrator.load(sources()).await?.id;
        let failed = wait_for(&orchestrator, id, JobStatus::Error, &mut vec![]).await?;
        assert!(failed.backend_handle.is_none());
        assert!(failed
            .error
            .as_deref()
            .is_some_and(|e| e.contains("compute cluster unreachable")));
        assert_eq!(failed.job_type, JobType::Load);
        Ok(())
    }

    #[tokio::test]
    async fn full_queue_is_resource_exhausted() -> Result<()> {
        let backend = Arc::new(GatedBackend::new(0));
        let orchestrator = orchestrator(backend.clone(), 1, 1)?;
        orchestrator.submit(sources(), features()).await?;
        wait_until_entered(&backend, 1).await?;
        let queued = orchestrator.submit(sources(), features()).await?.id;
        let err = orchestrator
            .submit(sources(), features())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(
            orchestrator.reload_status(queued).await?.status,
            JobStatus::Pending
        );
        Ok(())
    }

    #[tokio::test]
    async fn invalid_submissions_fail_synchronously() -> Result<()> {
        let orchestrator = orchestrator(Arc::new(GatedBackend::new(0)), 1, 8)?;
        let unknown = vec![FeatureReference::new("driver", 1, "speed")];
        for (sources, features) in [
            (sources(), unknown),
            (vec![], features()),
            (vec!["  ".to_string()], features()),
            (sources(), vec![]),
        ] {
            let err = orchestrator.submit(sources, features).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        assert_eq!(
            orchestrator.load(vec![]).await.unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        Ok(())
    }

    #[tokio::test]
    async fn latest_version_is_pinned_at_submission() -> Result<()> {
        let orchestrator = orchestrator(Arc::new(GatedBackend::new(0)), 1, 8)?;
        let submitted = orchestrator
            .submit(sources(), vec!["driver:rating".parse()?])
            .await?;
        assert_eq!(submitted.features, vec![FeatureReference::new("driver", 2, "rating")]);
        let job = orchestrator.reload_status(submitted.id).await?;
        assert_eq!(job.features, submitted.features);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() -> Result<()> {
        let orchestrator = orchestrator(Arc::new(GatedBackend::new(0)), 1, 8)?;
        let id = JobId::new_v4();
        assert_eq!(
            orchestrator.reload_status(id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            orchestrator.completed_job(id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        Ok(())
    }

    #[tokio::test]
    async fn late_terminal_transition_returns_stored_job() -> Result<()> {
        let registry: Arc<dyn JobRegistry> = Arc::new(MemoryJobRegistry::default());
        let runner = JobRunner {
            registry: registry.clone(),
            backend: Arc::new(RejectingBackend),
            poll_interval: Duration::from_millis(5),
        };
        let id = registry
            .create(JobSpec {
                job_type: JobType::Load,
                features: vec![],
                source_uris: sources(),
            })
            .await?
            .id;
        registry
            .transition(id, JobStatus::Running, TransitionFields::backend_handle("h"))
            .await?;
        let done = registry
            .transition(
                id,
                JobStatus::Done,
                TransitionFields::output(StagingLocation {
                    uri: "file:///staging/load/x".to_string(),
                    expires_at: Utc::now(),
                }),
            )
            .await?;
        let raced = runner
            .apply(id, JobStatus::Error, TransitionFields::error("late"))
            .await?;
        assert_eq!(raced, done);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_stops_accepting_jobs() -> Result<()> {
        let orchestrator = orchestrator(Arc::new(GatedBackend::new(8)), 2, 8)?;
        orchestrator.shutdown().await;
        let err = orchestrator.load(sources()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        Ok(())
    }

    #[tokio::test]
    async fn submission_returns_the_created_pending_job() -> Result<()> {
        let orchestrator = orchestrator(Arc::new(FreshBackend), 4, 32)?;
        let mut ids = vec![];
        for _ in 0..16 {
            let job = orchestrator.submit(sources(), features()).await?;
            assert_eq!(job.status, JobStatus::Pending);
            assert!(job.backend_handle.is_none());
            ids.push(job.id);
        }
        for id in ids {
            wait_for(&orchestrator, id, JobStatus::Done, &mut vec![]).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn pickup_write_is_retried() -> Result<()> {
        let registry = Arc::new(FlakyRegistry::new(JobStatus::Running, 1));
        let orchestrator = orchestrator_with(registry.clone(), Arc::new(FreshBackend), 1, 8)?;
        let id = orchestrator.load(sources()).await?.id;
        let done = wait_for(&orchestrator, id, JobStatus::Done, &mut vec![]).await?;
        assert_eq!(done.backend_handle, Some(format!("fresh-{}", id)));
        assert_eq!(registry.failures.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn unrecordable_pickup_moves_job_to_error() -> Result<()> {
        let registry = Arc::new(FlakyRegistry::new(JobStatus::Running, usize::MAX));
        let orchestrator = orchestrator_with(registry, Arc::new(FreshBackend), 1, 8)?;
        let id = orchestrator.load(sources()).await?.id;
        let failed = wait_for(&orchestrator, id, JobStatus::Error, &mut vec![]).await?;
        assert!(failed
            .error
            .as_deref()
            .is_some_and(|e| e.contains(&format!("Cannot record backend handle 'fresh-{}'", id))));
        Ok(())
    }

    #[tokio::test]
    async fn rejection_write_is_retried() -> Result<()> {
        let registry = Arc::new(FlakyRegistry::new(JobStatus::Error, 2));
        let orchestrator = orchestrator_with(registry, Arc::new(RejectingBackend), 1, 8)?;
        let id = orchestrator.load(sources()).await?.id;
        let failed = wait_for(&orchestrator, id, JobStatus::Error, &mut vec![]).await?;
        assert!(failed
            .error
            .as_deref()
            .is_some_and(|e| e.contains("compute cluster unreachable")));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn busy_workers_on_sqlite_finish_every_job() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let registry = Arc::new(SqliteJobRegistry::connect(&dir.path().join("jobs.db")).await?);
        let orchestrator = orchestrator_with(registry, Arc::new(FreshBackend), 8, 64)?;
        let mut ids = vec![];
        for _ in 0..48 {
            ids.push(orchestrator.load(sources()).await?.id);
        }
        for id in ids {
            wait_for(&orchestrator, id, JobStatus::Done, &mut vec![]).await?;
        }
        orchestrator.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn recover_resumes_jobs_left_by_previous_process() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("jobs.db");
        let load = |uri: &str| JobSpec {
            job_type: JobType::Load,
            features: vec![],
            source_uris: vec![uri.to_string()],
        };
        let (pending_id, running_id) = {
            let registry = SqliteJobRegistry::connect(&path).await?;
            let pending = registry.create(load("file:///staging/a")).await?;
            let running = registry.create(load("file:///staging/b")).await?;
            registry
                .transition(running.id, JobStatus::Running, TransitionFields::backend_handle("gone"))
                .await?;
            (pending.id, running.id)
        };

        let registry = Arc::new(SqliteJobRegistry::connect(&path).await?);
        let orchestrator = orchestrator_with(registry, Arc::new(FreshBackend), 1, 1)?;
        let recovered = orchestrator.recover().await?;
        assert_eq!(
            recovered,
            RecoveredJobs {
                requeued: 1,
                reconciled: 1
            }
        );

        let done = wait_for(&orchestrator, pending_id, JobStatus::Done, &mut vec![]).await?;
        assert_eq!(done.backend_handle, Some(format!("fresh-{}", pending_id)));
        let lost = wait_for(&orchestrator, running_id, JobStatus::Error, &mut vec![]).await?;
        assert_eq!(lost.error.as_deref(), Some("Backend lost job handle 'gone'"));

        orchestrator.shutdown().await;
        let again = orchestrator_with(
            Arc::new(SqliteJobRegistry::connect(&path).await?),
            Arc::new(FreshBackend),
            1,
            1,
        )?;
        assert_eq!(again.recover().await?, RecoveredJobs::default());
        Ok(())
    }

    #[tokio::test]
    async fn recover_after_shutdown_is_unavailable() -> Result<()> {
        let orchestrator = orchestrator(Arc::new(FreshBackend), 1, 8)?;
        orchestrator.shutdown().await;
        assert_eq!(
            orchestrator.recover().await.unwrap_err().kind(),
            ErrorKind::ServiceUnavailable
        );
        Ok(())
    }
}
