use crate::error::{ServingError, ServingResult};
use crate::jobs::{
    job_not_found, BatchJob, JobId, JobRegistry, JobSpec, JobStatus, TransitionFields,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap as HashMap;
use std::sync::{Arc, Mutex, RwLock};

type JobCell = Arc<Mutex<BatchJob>>;

/// Job registry kept in process memory. Each job sits behind its own mutex so transitions
/// of one job are serialized without blocking the others.
#[derive(Default)]
pub struct MemoryJobRegistry {
    jobs: RwLock<HashMap<JobId, JobCell>>,
}

fn poisoned() -> ServingError {
    ServingError::internal("job registry lock poisoned")
}

impl MemoryJobRegistry {
    fn cell(&self, id: JobId) -> ServingResult<JobCell> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        jobs.get(&id).cloned().ok_or_else(|| job_not_found(id))
    }
}

#[async_trait]
impl JobRegistry for MemoryJobRegistry {
    async fn create(&self, spec: JobSpec) -> ServingResult<BatchJob> {
        let id = JobId::new_v4();
        let job = BatchJob::new(id, spec, Utc::now());
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        jobs.insert(id, Arc::new(Mutex::new(job.clone())));
        Ok(job)
    }

    async fn get(&self, id: JobId) -> ServingResult<BatchJob> {
        let cell = self.cell(id)?;
        let job = cell.lock().map_err(|_| poisoned())?;
        Ok(job.clone())
    }

    async fn list_by_status(&self, status: JobStatus) -> ServingResult<Vec<BatchJob>> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut matching = vec![];
        for cell in jobs.values() {
            let job = cell.lock().map_err(|_| poisoned())?;
            if job.status == status {
                matching.push(job.clone());
            }
        }
        matching.sort_by_key(|job| job.created_at);
        Ok(matching)
    }

    async fn transition(
        &self,
        id: JobId,
        next: JobStatus,
        fields: TransitionFields,
    ) -> ServingResult<BatchJob> {
        let cell = self.cell(id)?;
        let mut job = cell.lock().map_err(|_| poisoned())?;
        job.apply(next, fields, Utc::now())?;
        Ok(job.clone())
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> ServingResult<usize> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let before = jobs.len();
        jobs.retain(|_, cell| match cell.lock() {
            Ok(job) => !(job.status.is_terminal() && job.updated_at < older_than),
            Err(_) => true,
        });
        Ok(before - jobs.len())
    }
}
