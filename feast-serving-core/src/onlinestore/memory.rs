use crate::error::{ServingError, ServingResult};
use crate::key_codec::{FeatureKeyCodec, LookupKey};
use crate::model::{EntityRow, EntityValue, FeatureReference, FeatureSetRef};
use crate::onlinestore::{LookupError, LookupResult, OnlineStore};
use crate::registry::{FeatureSetRegistry, FeatureSetSpec};
use crate::types::{StoredFeature, Value};
use crate::util::datetime_to_prost_timestamp;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap as HashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Online store kept in process memory. Used for local serving and tests.
#[derive(Default)]
pub struct MemoryOnlineStore {
    data: RwLock<HashMap<LookupKey, StoredFeature>>,
}

#[derive(Debug, Deserialize)]
struct SeedRecord {
    feature_set: String,
    entities: BTreeMap<String, EntityValue>,
    event_timestamp: DateTime<Utc>,
    features: BTreeMap<String, serde_json::Value>,
}

fn poisoned() -> LookupError {
    LookupError::Failed("memory store lock poisoned".to_string())
}

impl MemoryOnlineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().map(|data| data.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn put(&self, key: LookupKey, feature: StoredFeature) -> ServingResult<()> {
        let mut data = self
            .data
            .write()
            .map_err(|_| ServingError::internal("memory store lock poisoned"))?;
        data.insert(key, feature);
        Ok(())
    }

    /// Writes the values of one entity row of `feature_set`, all observed at `event_timestamp`.
    pub fn write_row(
        &self,
        codec: &FeatureKeyCodec,
        feature_set: &FeatureSetSpec,
        row: &EntityRow,
        values: Vec<(String, Value)>,
        event_timestamp: DateTime<Utc>,
    ) -> ServingResult<()> {
        let entity_key = codec.entity_key(row, feature_set)?;
        for (feature_name, value) in values {
            if feature_set.feature(&feature_name).is_none() {
                return Err(ServingError::invalid_argument(format!(
                    "Feature '{}' is not part of feature set '{}'",
                    feature_name,
                    feature_set.reference()
                )));
            }
            let reference =
                FeatureReference::new(feature_set.name.clone(), feature_set.version, feature_name);
            let key = LookupKey {
                entity_key: entity_key.clone(),
                field: codec.feature_field(&reference)?,
            };
            self.put(
                key,
                StoredFeature {
                    value: Some(value),
                    event_timestamp: Some(datetime_to_prost_timestamp(event_timestamp)),
                },
            )?;
        }
        Ok(())
    }

    /// Loads JSON lines of the form
    /// `{"feature_set": "driver:1", "entities": {...}, "event_timestamp": "...", "features": {...}}`.
    pub async fn load_json_lines(
        &self,
        codec: &FeatureKeyCodec,
        registry: &dyn FeatureSetRegistry,
        text: &str,
    ) -> Result<usize> {
        let mut loaded = 0;
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: SeedRecord = serde_json::from_str(line)
                .with_context(|| format!("Invalid seed record at line {}", line_no + 1))?;
            let reference: FeatureSetRef = record.feature_set.parse()?;
            let feature_set = registry
                .feature_set(&reference.name, reference.version)
                .await?;
            let values = record
                .features
                .iter()
                .map(|(name, json)| {
                    let spec = feature_set.feature(name).ok_or_else(|| {
                        ServingError::invalid_argument(format!(
                            "Feature '{}' is not part of feature set '{}' (line {})",
                            name,
                            feature_set.reference(),
                            line_no + 1
                        ))
                    })?;
                    let value = Value::from_json(spec.value_type, json).with_context(|| {
                        format!("Invalid value for feature '{}' at line {}", name, line_no + 1)
                    })?;
                    Ok((name.clone(), value))
                })
                .collect::<Result<Vec<_>>>()?;
            let row = EntityRow {
                fields: record.entities,
                entity_timestamp: None,
            };
            self.write_row(codec, &feature_set, &row, values, record.event_timestamp)?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

#[async_trait]
impl OnlineStore for MemoryOnlineStore {
    async fn get(&self, key: &LookupKey) -> LookupResult {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(data.get(key).cloned())
    }

    async fn multi_get(
        &self,
        keys: &[LookupKey],
    ) -> std::result::Result<Vec<LookupResult>, LookupError> {
        let data = self.data.read().map_err(|_| poisoned())?;
        Ok(keys.iter().map(|key| Ok(data.get(key).cloned())).collect())
    }

    fn supports_multi_get(&self) -> bool {
        true
    }
}
