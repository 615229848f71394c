//! Registry of known feature sets: names, versions, entities, features and freshness bounds.

use crate::config::FeatureSetsConfig;
use crate::error::{ServingError, ServingResult};
use crate::model::{FeatureReference, FeatureSetRef};
use crate::types::ValueType;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

mod cached_registry;
mod feature_set_schema;

pub use cached_registry::CachedRegistry;
pub use feature_set_schema::FeatureSetSchema;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    pub value_type: ValueType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSetSpec {
    pub name: String,
    pub version: u32,
    /// Entity names every lookup into this feature set is keyed by.
    pub entities: Vec<String>,
    pub features: Vec<FeatureSpec>,
    #[serde(default)]
    pub max_age_seconds: Option<u64>,
}

impl FeatureSetSpec {
    pub fn reference(&self) -> FeatureSetRef {
        FeatureSetRef::new(self.name.clone(), self.version)
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureSpec> {
        self.features.iter().find(|f| f.name == name)
    }

    pub fn max_age(&self) -> Option<chrono::Duration> {
        self.max_age_seconds
            .filter(|seconds| *seconds > 0)
            .and_then(|seconds| chrono::Duration::try_seconds(seconds as i64))
    }
}

/// A requested feature bound to a concrete feature set version.
#[derive(Debug, Clone)]
pub struct ResolvedFeature {
    pub reference: FeatureReference,
    pub feature_set: Arc<FeatureSetSpec>,
    pub value_type: ValueType,
}

#[async_trait]
pub trait FeatureSetRegistry: Send + Sync {
    /// Look up a feature set. `version` 0 selects the latest registered version.
    async fn feature_set(&self, name: &str, version: u32) -> ServingResult<Arc<FeatureSetSpec>>;

    /// Bind every reference to its feature set, failing with `InvalidArgument` listing
    /// all references that are unknown.
    async fn resolve_features(
        &self,
        features: &[FeatureReference],
    ) -> ServingResult<Vec<ResolvedFeature>> {
        let mut resolved = Vec::with_capacity(features.len());
        let mut bad_requests = vec![];
        for reference in features {
            let feature_set = match self
                .feature_set(&reference.feature_set, reference.version)
                .await
            {
                Ok(feature_set) => feature_set,
                Err(err) if err.is_not_found() => {
                    bad_requests.push(format!("{}: {}", reference, err.message()));
                    continue;
                }
                Err(err) => return Err(err),
            };
            match feature_set.feature(&reference.name) {
                Some(spec) => resolved.push(ResolvedFeature {
                    reference: reference.with_version(feature_set.version),
                    value_type: spec.value_type,
                    feature_set: feature_set.clone(),
                }),
                None => bad_requests.push(format!(
                    "{}: feature '{}' not found in feature set '{}'",
                    reference,
                    reference.name,
                    feature_set.reference()
                )),
            }
        }
        if !bad_requests.is_empty() {
            return Err(ServingError::invalid_argument(format!(
                "Unknown feature references: [{}]",
                bad_requests.join(", ")
            )));
        }
        Ok(resolved)
    }
}

pub async fn get_registry(
    conf: &FeatureSetsConfig,
    cwd: Option<&str>,
) -> Result<Arc<dyn FeatureSetRegistry>> {
    let mut path_buf = PathBuf::new();
    path_buf.push(cwd.unwrap_or(""));
    path_buf.push(conf.path.as_str());
    match conf.cache_ttl_seconds {
        Some(ttl) if ttl > 0 => {
            debug!("Create cached feature set registry from {:?}", path_buf);
            let registry = CachedRegistry::new_local(path_buf, ttl).await?;
            Ok(Arc::new(registry))
        }
        _ => {
            debug!("Create feature set registry from {:?}", path_buf);
            let schema = FeatureSetSchema::from_path(&path_buf)?;
            Ok(Arc::new(schema))
        }
    }
}
