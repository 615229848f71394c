use crate::error::ServingResult;
use crate::registry::{FeatureSetRegistry, FeatureSetSchema, FeatureSetSpec};
use anyhow::Result;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Feature set registry that re-reads its source file every `ttl` seconds.
/// A failed refresh keeps serving the previous snapshot.
pub struct CachedRegistry {
    inner: Arc<ArcSwap<FeatureSetSchema>>,
    refresh_task: JoinHandle<()>,
}

impl CachedRegistry {
    pub async fn new_local(path: PathBuf, ttl: u64) -> Result<Self> {
        let schema = FeatureSetSchema::from_path(&path)?;
        let inner = Arc::new(ArcSwap::from_pointee(schema));
        let refresh_task = Self::start_refresh_task(inner.clone(), path, ttl);
        Ok(Self {
            inner,
            refresh_task,
        })
    }

    fn start_refresh_task(
        inner: Arc<ArcSwap<FeatureSetSchema>>,
        path: PathBuf,
        ttl: u64,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(ttl));
            // first tick completes immediately, the initial snapshot is already loaded
            interval.tick().await;
            loop {
                interval.tick().await;
                match FeatureSetSchema::from_path(&path) {
                    Ok(schema) => {
                        debug!(feature_sets = schema.len(), "Refreshed feature set registry");
                        inner.store(Arc::new(schema));
                    }
                    Err(err) => {
                        warn!(error = ?err, "Failed to refresh feature set registry, keeping previous");
                    }
                }
            }
        })
    }
}

impl Drop for CachedRegistry {
    fn drop(&mut self) {
        self.refresh_task.abort();
    }
}

#[async_trait]
impl FeatureSetRegistry for CachedRegistry {
    async fn feature_set(&self, name: &str, version: u32) -> ServingResult<Arc<FeatureSetSpec>> {
        self.inner.load().lookup(name, version)
    }
}
