use crate::error::{ServingError, ServingResult};
use crate::model::{FeatureSetRef, LATEST_VERSION};
use crate::registry::{FeatureSetRegistry, FeatureSetSpec};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct FeatureSetsFile {
    feature_sets: Vec<FeatureSetSpec>,
}

/// Immutable snapshot of the registered feature sets.
#[derive(Debug, Default)]
pub struct FeatureSetSchema {
    feature_sets: HashMap<FeatureSetRef, Arc<FeatureSetSpec>>,
    latest_versions: HashMap<String, u32>,
}

impl FeatureSetSchema {
    pub fn from_specs(specs: Vec<FeatureSetSpec>) -> Result<Self> {
        let mut schema = FeatureSetSchema::default();
        for spec in specs {
            if spec.version == LATEST_VERSION {
                return Err(anyhow!(
                    "Feature set '{}' must have a version greater than {}",
                    spec.name,
                    LATEST_VERSION
                ));
            }
            if spec.entities.is_empty() {
                return Err(anyhow!(
                    "Feature set '{}' must declare at least one entity",
                    spec.reference()
                ));
            }
            {
                let mut seen = HashSet::new();
                if let Some(duplicate) = spec.features.iter().find(|f| !seen.insert(&f.name)) {
                    return Err(anyhow!(
                        "Feature '{}' declared twice in feature set '{}'",
                        duplicate.name,
                        spec.reference()
                    ));
                }
            }
            let latest = schema
                .latest_versions
                .entry(spec.name.clone())
                .or_insert(spec.version);
            *latest = (*latest).max(spec.version);
            let reference = spec.reference();
            if schema
                .feature_sets
                .insert(reference.clone(), Arc::new(spec))
                .is_some()
            {
                return Err(anyhow!("Feature set '{}' declared twice", reference));
            }
        }
        Ok(schema)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: FeatureSetsFile = serde_saphyr::from_str(yaml).map_err(|err| anyhow!(err))?;
        Self::from_specs(file.feature_sets)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("Failed to read feature sets from {:?}", path))?;
        Self::from_yaml_str(&yaml).with_context(|| format!("Invalid feature sets file {:?}", path))
    }

    pub fn len(&self) -> usize {
        self.feature_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feature_sets.is_empty()
    }

    pub(crate) fn lookup(&self, name: &str, version: u32) -> ServingResult<Arc<FeatureSetSpec>> {
        let version = if version == LATEST_VERSION {
            *self.latest_versions.get(name).ok_or_else(|| {
                ServingError::not_found(format!("Feature set '{}' not found", name))
            })?
        } else {
            version
        };
        self.feature_sets
            .get(&FeatureSetRef::new(name, version))
            .cloned()
            .ok_or_else(|| {
                ServingError::not_found(format!("Feature set '{}:{}' not found", name, version))
            })
    }
}

#[async_trait]
impl FeatureSetRegistry for FeatureSetSchema {
    async fn feature_set(&self, name: &str, version: u32) -> ServingResult<Arc<FeatureSetSpec>> {
        self.lookup(name, version)
    }
}
