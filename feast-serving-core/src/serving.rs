//! The serving API. ONLINE and BATCH deployments are two implementations of one trait,
//! selected by the configured serving type.

use crate::batch::LocalBatchBackend;
use crate::config::ServingConfig;
use crate::error::{ServingError, ServingResult};
use crate::jobs::{get_job_registry, BatchJob, JobId};
use crate::key_codec::FeatureKeyCodec;
use crate::model::{
    GetBatchFeaturesRequest, GetFeastServingInfoResponse, GetOnlineFeaturesRequest,
    GetOnlineFeaturesResponse, GetStagingLocationRequest, LoadBatchFeaturesRequest,
    OnlineFeatureRow, ServingType, StagingLocation,
};
use crate::onlinestore::get_online_store;
use crate::orchestrator::{BatchJobOrchestrator, OrchestratorOptions};
use crate::registry::{get_registry, FeatureSetRegistry};
use crate::resolver::OnlineFeatureResolver;
use crate::staging::{get_staging_client, StagingClient};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub const SERVING_VERSION: &str = env!("CARGO_PKG_VERSION");

#[async_trait]
pub trait ServingService: Send + Sync {
    async fn get_feast_serving_info(&self) -> ServingResult<GetFeastServingInfoResponse>;

    async fn get_online_features(
        &self,
        request: GetOnlineFeaturesRequest,
    ) -> ServingResult<GetOnlineFeaturesResponse>;

    async fn get_batch_features(&self, request: GetBatchFeaturesRequest)
        -> ServingResult<BatchJob>;

    async fn reload_job_status(&self, job_id: JobId) -> ServingResult<BatchJob>;

    async fn get_batch_features_from_completed_job(
        &self,
        job_id: JobId,
    ) -> ServingResult<StagingLocation>;

    async fn get_staging_location(
        &self,
        request: GetStagingLocationRequest,
    ) -> ServingResult<StagingLocation>;

    async fn load_batch_features(
        &self,
        request: LoadBatchFeaturesRequest,
    ) -> ServingResult<BatchJob>;

    /// Releases background resources. Called once when the server stops.
    async fn shutdown(&self) {}
}

fn unsupported(operation: &str, serving_type: ServingType) -> ServingError {
    ServingError::unimplemented(format!(
        "{} is not supported by {} serving",
        operation, serving_type
    ))
}

async fn resolve_online(
    resolver: &OnlineFeatureResolver,
    request: GetOnlineFeaturesRequest,
) -> ServingResult<GetOnlineFeaturesResponse> {
    let GetOnlineFeaturesRequest {
        entity_rows,
        features,
        omit_entities_in_response,
    } = request;
    let resolved = resolver.resolve(&entity_rows, &features).await?;
    let field_names = resolved.field_names();
    let rows = entity_rows
        .into_iter()
        .zip(resolved.rows)
        .map(|(row, values)| OnlineFeatureRow {
            entities: (!omit_entities_in_response).then_some(row.fields),
            values,
        })
        .collect();
    Ok(GetOnlineFeaturesResponse { field_names, rows })
}

pub struct OnlineServingService {
    resolver: Arc<OnlineFeatureResolver>,
}

impl OnlineServingService {
    pub fn new(resolver: Arc<OnlineFeatureResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl ServingService for OnlineServingService {
    async fn get_feast_serving_info(&self) -> ServingResult<GetFeastServingInfoResponse> {
        Ok(GetFeastServingInfoResponse {
            version: SERVING_VERSION.to_string(),
            serving_type: ServingType::Online,
            job_staging_location: None,
        })
    }

    async fn get_online_features(
        &self,
        request: GetOnlineFeaturesRequest,
    ) -> ServingResult<GetOnlineFeaturesResponse> {
        resolve_online(&self.resolver, request).await
    }

    async fn get_batch_features(&self, _: GetBatchFeaturesRequest) -> ServingResult<BatchJob> {
        Err(unsupported("getBatchFeatures", ServingType::Online))
    }

    async fn reload_job_status(&self, _: JobId) -> ServingResult<BatchJob> {
        Err(unsupported("reloadJobStatus", ServingType::Online))
    }

    async fn get_batch_features_from_completed_job(
        &self,
        _: JobId,
    ) -> ServingResult<StagingLocation> {
        Err(unsupported(
            "getBatchFeaturesFromCompletedJob",
            ServingType::Online,
        ))
    }

    async fn get_staging_location(
        &self,
        _: GetStagingLocationRequest,
    ) -> ServingResult<StagingLocation> {
        Err(unsupported("getStagingLocation", ServingType::Online))
    }

    async fn load_batch_features(&self, _: LoadBatchFeaturesRequest) -> ServingResult<BatchJob> {
        Err(unsupported("loadBatchFeatures", ServingType::Online))
    }
}

pub struct BatchServingService {
    orchestrator: Arc<BatchJobOrchestrator>,
    staging: Arc<dyn StagingClient>,
}

impl BatchServingService {
    pub fn new(orchestrator: Arc<BatchJobOrchestrator>, staging: Arc<dyn StagingClient>) -> Self {
        Self {
            orchestrator,
            staging,
        }
    }
}

#[async_trait]
impl ServingService for BatchServingService {
    async fn get_feast_serving_info(&self) -> ServingResult<GetFeastServingInfoResponse> {
        Ok(GetFeastServingInfoResponse {
            version: SERVING_VERSION.to_string(),
            serving_type: ServingType::Batch,
            job_staging_location: Some(self.staging.root().to_string()),
        })
    }

    async fn get_online_features(
        &self,
        _: GetOnlineFeaturesRequest,
    ) -> ServingResult<GetOnlineFeaturesResponse> {
        Err(unsupported("getOnlineFeatures", ServingType::Batch))
    }

    async fn get_batch_features(
        &self,
        request: GetBatchFeaturesRequest,
    ) -> ServingResult<BatchJob> {
        self.orchestrator
            .submit(request.entity_source, request.features)
            .await
    }

    async fn reload_job_status(&self, job_id: JobId) -> ServingResult<BatchJob> {
        self.orchestrator.reload_status(job_id).await
    }

    async fn get_batch_features_from_completed_job(
        &self,
        job_id: JobId,
    ) -> ServingResult<StagingLocation> {
        self.orchestrator.completed_job(job_id).await
    }

    async fn get_staging_location(
        &self,
        request: GetStagingLocationRequest,
    ) -> ServingResult<StagingLocation> {
        self.staging.location(request.prefix.as_deref())
    }

    async fn load_batch_features(
        &self,
        request: LoadBatchFeaturesRequest,
    ) -> ServingResult<BatchJob> {
        self.orchestrator.load(request.source_uris).await
    }

    async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }
}

async fn build_resolver(
    config: &ServingConfig,
    registry: Arc<dyn FeatureSetRegistry>,
    cwd: Option<&str>,
) -> Result<Arc<OnlineFeatureResolver>> {
    let codec = FeatureKeyCodec::new(config.project.clone());
    let store = get_online_store(&config.online_store, &codec, registry.as_ref(), cwd).await?;
    Ok(Arc::new(OnlineFeatureResolver::new(
        registry,
        store,
        codec,
        config.resolver.clone(),
    )))
}

/// Wires the serving implementation selected by `config.serving_type`.
pub async fn build_serving_service(
    config: &ServingConfig,
    cwd: Option<&str>,
) -> Result<Arc<dyn ServingService>> {
    let registry = get_registry(&config.feature_sets, cwd).await?;
    let resolver = build_resolver(config, registry.clone(), cwd).await?;
    match config.serving_type {
        ServingType::Online => {
            info!(project = %config.project, "Starting ONLINE serving");
            Ok(Arc::new(OnlineServingService::new(resolver)))
        }
        ServingType::Batch => {
            let batch = config
                .batch
                .as_ref()
                .ok_or_else(|| anyhow!("BATCH serving requires a 'batch' configuration section"))?;
            let staging = get_staging_client(batch, cwd).await?;
            let jobs = get_job_registry(&batch.job_store, cwd).await?;
            let backend = Arc::new(LocalBatchBackend::new(
                Some(resolver),
                staging.clone(),
                batch.chunk_size,
            ));
            let orchestrator = BatchJobOrchestrator::start(
                registry,
                jobs,
                backend,
                OrchestratorOptions::from(batch),
            );
            orchestrator
                .recover()
                .await
                .context("Failed to recover unfinished batch jobs")?;
            info!(project = %config.project, staging = staging.root(), "Starting BATCH serving");
            Ok(Arc::new(BatchServingService::new(
                Arc::new(orchestrator),
                staging,
            )))
        }
    }
}
