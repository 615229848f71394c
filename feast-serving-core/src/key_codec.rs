//! Online store key layout.
//!
//! A feature lives in the hash addressed by its serialized entity key (suffixed with the
//! project), under a field derived from `feature_set:version:feature`.

use crate::error::{ServingError, ServingResult};
use crate::model::{EntityRow, EntityValue, FeatureReference};
use crate::registry::{FeatureSetSpec, ResolvedFeature};
use crate::types::ValueType;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    pub entity_key: Vec<u8>,
    pub field: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct FeatureKeyCodec {
    project: String,
}

fn serialize_entity_value(
    entity: &str,
    value: &EntityValue,
    bytes: &mut Vec<u8>,
) -> ServingResult<()> {
    bytes.extend(value.value_type().tag().to_le_bytes());
    match value {
        EntityValue::Int(v) => {
            bytes.extend(8u32.to_le_bytes());
            bytes.extend(v.to_le_bytes());
        }
        EntityValue::String(v) => {
            bytes.extend((v.len() as u32).to_le_bytes());
            bytes.extend(v.as_bytes());
        }
        EntityValue::Bytes(v) => {
            bytes.extend((v.len() as u32).to_le_bytes());
            bytes.extend(v);
        }
        EntityValue::Bool(v) => {
            bytes.extend(1u32.to_le_bytes());
            bytes.push(u8::from(*v));
        }
        EntityValue::Float(v) => {
            return Err(ServingError::invalid_argument(format!(
                "Entity '{}' has floating point value {}, which cannot be used as a join key",
                entity, v
            )));
        }
    }
    Ok(())
}

impl FeatureKeyCodec {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Serializes the entity values `feature_set` is keyed by. Join keys are sorted, so the
    /// result does not depend on the order entities were declared in.
    pub fn entity_key(
        &self,
        row: &EntityRow,
        feature_set: &FeatureSetSpec,
    ) -> ServingResult<Vec<u8>> {
        let mut join_keys: Vec<(&str, &EntityValue)> = feature_set
            .entities
            .iter()
            .map(|name| {
                row.fields
                    .get(name)
                    .map(|value| (name.as_str(), value))
                    .ok_or_else(|| {
                        ServingError::invalid_argument(format!(
                            "Entity row is missing entity '{}' required by feature set '{}'",
                            name,
                            feature_set.reference()
                        ))
                    })
            })
            .collect::<ServingResult<_>>()?;
        join_keys.sort_by(|a, b| a.0.cmp(b.0));

        let mut bytes: Vec<u8> = vec![];
        bytes.extend((join_keys.len() as u32).to_le_bytes());
        for (key, _) in &join_keys {
            bytes.extend(ValueType::String.tag().to_le_bytes());
            bytes.extend((key.len() as u32).to_le_bytes());
            bytes.extend(key.bytes());
        }
        for (key, value) in &join_keys {
            serialize_entity_value(key, value, &mut bytes)?;
        }
        bytes.extend(self.project.as_bytes());
        Ok(bytes)
    }

    pub fn feature_field(&self, reference: &FeatureReference) -> ServingResult<Vec<u8>> {
        let key = format!(
            "{}:{}:{}",
            reference.feature_set, reference.version, reference.name
        );
        let hashed = murmur3::murmur3_32(&mut std::io::Cursor::new(key.as_bytes()), 0)
            .map_err(|e| ServingError::internal(format!("Failed to hash feature key: {}", e)))?;
        Ok(hashed.to_le_bytes().to_vec())
    }

    pub fn lookup_key(
        &self,
        row: &EntityRow,
        feature: &ResolvedFeature,
    ) -> ServingResult<LookupKey> {
        Ok(LookupKey {
            entity_key: self.entity_key(row, &feature.feature_set)?,
            field: self.feature_field(&feature.reference)?,
        })
    }
}
