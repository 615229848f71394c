//! Staging storage: where batch inputs are uploaded and batch outputs are written.

mod local;
mod s3;

use crate::config::{BatchConfig, StagingConfig};
use crate::error::{ServingError, ServingResult};
use crate::model::StagingLocation;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub use local::LocalStagingClient;
pub use s3::S3StagingClient;

fn validate_prefix(prefix: &str) -> ServingResult<&str> {
    let prefix = prefix.trim_matches('/');
    let valid = prefix.split('/').all(|segment| {
        !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    });
    if !valid {
        return Err(ServingError::invalid_argument(format!(
            "Invalid staging prefix '{}'",
            prefix
        )));
    }
    Ok(prefix)
}

#[async_trait]
pub trait StagingClient: Send + Sync {
    /// URI every staging location lives under, without a trailing slash.
    fn root(&self) -> &str;

    /// How long a freshly issued location stays valid.
    fn ttl(&self) -> Duration;

    async fn put(&self, uri: &str, data: Vec<u8>) -> Result<()>;

    async fn get(&self, uri: &str) -> Result<Vec<u8>>;

    /// A fresh, unique location under the staging root.
    fn location(&self, prefix: Option<&str>) -> ServingResult<StagingLocation> {
        let name = Uuid::new_v4().simple().to_string();
        let uri = match prefix.filter(|p| !p.trim_matches('/').is_empty()) {
            Some(prefix) => format!("{}/{}/{}", self.root(), validate_prefix(prefix)?, name),
            None => format!("{}/{}", self.root(), name),
        };
        Ok(StagingLocation {
            uri,
            expires_at: Utc::now() + self.ttl(),
        })
    }
}

pub async fn get_staging_client(
    config: &BatchConfig,
    cwd: Option<&str>,
) -> Result<Arc<dyn StagingClient>> {
    let ttl = Duration::from_std(config.staging_ttl()).context("Invalid staging TTL")?;
    match &config.staging {
        StagingConfig::Local { root } => {
            debug!("Create local staging client under {}", root);
            Ok(Arc::new(LocalStagingClient::new(root, cwd, ttl)?))
        }
        StagingConfig::S3 { root } => {
            debug!("Create S3 staging client under {}", root);
            Ok(Arc::new(S3StagingClient::from_env(root, ttl).await?))
        }
    }
}
