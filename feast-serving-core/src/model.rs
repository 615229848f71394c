use crate::error::{ServingError, ServingResult};
use crate::types::value::Val;
use crate::types::{Value, ValueType};
use chrono::{DateTime, Utc};
use serde::de::Deserializer;
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Version value used in a parsed reference that did not name a version.
/// The registry resolves it to the latest registered version of the feature set.
pub const LATEST_VERSION: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeatureSetRef {
    pub name: String,
    pub version: u32,
}

impl FeatureSetRef {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl Display for FeatureSetRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

impl FromStr for FeatureSetRef {
    type Err = ServingError;

    fn from_str(s: &str) -> ServingResult<Self> {
        match s.split_once(':') {
            Some((name, version)) if !name.is_empty() => {
                Ok(Self::new(name, parse_version(version, s)?))
            }
            None if !s.is_empty() => Ok(Self::new(s, LATEST_VERSION)),
            _ => Err(ServingError::invalid_argument(format!(
                "Invalid feature set reference '{}'",
                s
            ))),
        }
    }
}

fn parse_version(version: &str, reference: &str) -> ServingResult<u32> {
    version.parse::<u32>().map_err(|_| {
        ServingError::invalid_argument(format!(
            "Invalid version '{}' in reference '{}'",
            version, reference
        ))
    })
}

/// Identifier of a single feature: `feature_set:version:feature`, or `feature_set:feature`
/// for the latest version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeatureReference {
    pub feature_set: String,
    pub version: u32,
    pub name: String,
}

impl FeatureReference {
    pub fn new(feature_set: impl Into<String>, version: u32, name: impl Into<String>) -> Self {
        Self {
            feature_set: feature_set.into(),
            version,
            name: name.into(),
        }
    }

    pub fn feature_set_ref(&self) -> FeatureSetRef {
        FeatureSetRef::new(self.feature_set.clone(), self.version)
    }

    pub fn with_version(&self, version: u32) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }
}

impl Display for FeatureReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.version == LATEST_VERSION {
            write!(f, "{}:{}", self.feature_set, self.name)
        } else {
            write!(f, "{}:{}:{}", self.feature_set, self.version, self.name)
        }
    }
}

impl FromStr for FeatureReference {
    type Err = ServingError;

    fn from_str(s: &str) -> ServingResult<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let reference = match parts.as_slice() {
            [feature_set, name] => Self::new(*feature_set, LATEST_VERSION, *name),
            [feature_set, version, name] => {
                Self::new(*feature_set, parse_version(version, s)?, *name)
            }
            _ => {
                return Err(ServingError::invalid_argument(format!(
                    "Invalid feature reference '{}', expected 'feature_set:version:feature'",
                    s
                )));
            }
        };
        if reference.feature_set.is_empty() || reference.name.is_empty() {
            return Err(ServingError::invalid_argument(format!(
                "Invalid feature reference '{}'",
                s
            )));
        }
        Ok(reference)
    }
}

impl TryFrom<String> for FeatureReference {
    type Error = ServingError;

    fn try_from(value: String) -> ServingResult<Self> {
        value.parse()
    }
}

impl From<FeatureReference> for String {
    fn from(value: FeatureReference) -> Self {
        value.to_string()
    }
}

/// Value of one entity in a row. In JSON, bytes are an array of integers in `0..=255`.
/// Floats are accepted on input but cannot key a feature lookup.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EntityValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl EntityValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            EntityValue::Bool(_) => ValueType::Bool,
            EntityValue::Int(_) => ValueType::Int64,
            EntityValue::Float(_) => ValueType::Double,
            EntityValue::String(_) => ValueType::String,
            EntityValue::Bytes(_) => ValueType::Bytes,
        }
    }

    pub fn to_proto_value(&self) -> Value {
        let val = match self {
            EntityValue::Bool(b) => Val::BoolVal(*b),
            EntityValue::Int(i) => Val::Int64Val(*i),
            EntityValue::Float(f) => Val::DoubleVal(*f),
            EntityValue::String(s) => Val::StringVal(s.clone()),
            EntityValue::Bytes(b) => Val::BytesVal(b.clone()),
        };
        Value { val: Some(val) }
    }
}

impl From<i64> for EntityValue {
    fn from(value: i64) -> Self {
        EntityValue::Int(value)
    }
}

impl From<i32> for EntityValue {
    fn from(value: i32) -> Self {
        EntityValue::Int(i64::from(value))
    }
}

impl From<&str> for EntityValue {
    fn from(value: &str) -> Self {
        EntityValue::String(value.to_string())
    }
}

impl From<Vec<u8>> for EntityValue {
    fn from(value: Vec<u8>) -> Self {
        EntityValue::Bytes(value)
    }
}

impl From<bool> for EntityValue {
    fn from(value: bool) -> Self {
        EntityValue::Bool(value)
    }
}

/// One subject of a feature request. Fields are kept ordered by entity name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
    pub fields: BTreeMap<String, EntityValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_timestamp: Option<DateTime<Utc>>,
}

impl EntityRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, entity: impl Into<String>, value: impl Into<EntityValue>) -> Self {
        self.fields.insert(entity.into(), value.into());
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.entity_timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureStatus {
    Present,
    NotFound,
    Outdated,
    Error,
}

#[derive(PartialEq, Clone, Default)]
pub struct ValueWrapper(pub Value);

fn serialize_list<S, T: Serialize>(serializer: S, values: &[T]) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut seq = serializer.serialize_seq(Some(values.len()))?;
    for value in values {
        seq.serialize_element(value)?;
    }
    seq.end()
}

impl Serialize for ValueWrapper {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match &self.0.val {
            None => serializer.serialize_none(),
            Some(v) => match v {
                Val::Int32Val(i) => serializer.serialize_i32(*i),
                Val::Int64Val(i) => serializer.serialize_i64(*i),
                Val::FloatVal(f) => serializer.serialize_f32(*f),
                Val::DoubleVal(d) => serializer.serialize_f64(*d),
                Val::StringVal(s) => serializer.serialize_str(s),
                Val::BytesVal(b) => serializer.serialize_bytes(b),
                Val::BoolVal(b) => serializer.serialize_bool(*b),
                Val::UnixTimestampVal(ts) => serializer.serialize_i64(*ts),
                Val::BytesListVal(l) => serialize_list(serializer, &l.val),
                Val::StringListVal(l) => serialize_list(serializer, &l.val),
                Val::Int32ListVal(l) => serialize_list(serializer, &l.val),
                Val::Int64ListVal(l) => serialize_list(serializer, &l.val),
                Val::DoubleListVal(l) => serialize_list(serializer, &l.val),
                Val::FloatListVal(l) => serialize_list(serializer, &l.val),
                Val::BoolListVal(l) => serialize_list(serializer, &l.val),
                Val::NullVal(_) => serializer.serialize_none(),
            },
        }
    }
}

impl fmt::Debug for ValueWrapper {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Value> for ValueWrapper {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureValue {
    pub value: ValueWrapper,
    pub status: FeatureStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_timestamp: Option<DateTime<Utc>>,
}

impl FeatureValue {
    pub fn present(value: Value, event_timestamp: DateTime<Utc>) -> Self {
        Self {
            value: ValueWrapper(value),
            status: FeatureStatus::Present,
            event_timestamp: Some(event_timestamp),
        }
    }

    pub fn outdated(value: Value, event_timestamp: DateTime<Utc>) -> Self {
        Self {
            value: ValueWrapper(value),
            status: FeatureStatus::Outdated,
            event_timestamp: Some(event_timestamp),
        }
    }

    pub fn not_found() -> Self {
        Self::empty(FeatureStatus::NotFound)
    }

    pub fn error() -> Self {
        Self::empty(FeatureStatus::Error)
    }

    fn empty(status: FeatureStatus) -> Self {
        Self {
            value: ValueWrapper::default(),
            status,
            event_timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingType {
    Online,
    Batch,
}

impl Display for ServingType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ServingType::Online => f.write_str("ONLINE"),
            ServingType::Batch => f.write_str("BATCH"),
        }
    }
}

impl Serialize for ServingType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ServingType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        match value.to_ascii_lowercase().as_str() {
            "online" => Ok(ServingType::Online),
            "batch" => Ok(ServingType::Batch),
            other => Err(serde::de::Error::custom(format!(
                "unsupported serving type '{}', expected 'online' or 'batch'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingLocation {
    pub uri: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GetFeastServingInfoResponse {
    pub version: String,
    pub serving_type: ServingType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_staging_location: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetOnlineFeaturesRequest {
    pub entity_rows: Vec<EntityRow>,
    pub features: Vec<FeatureReference>,
    #[serde(default)]
    pub omit_entities_in_response: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OnlineFeatureRow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<BTreeMap<String, EntityValue>>,
    pub values: Vec<FeatureValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GetOnlineFeaturesResponse {
    pub field_names: Vec<String>,
    pub rows: Vec<OnlineFeatureRow>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetBatchFeaturesRequest {
    /// URIs of JSON-lines files with one entity row per line.
    pub entity_source: Vec<String>,
    pub features: Vec<FeatureReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadBatchFeaturesRequest {
    pub source_uris: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetStagingLocationRequest {
    #[serde(default)]
    pub prefix: Option<String>,
}
