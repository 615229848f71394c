//! Protobuf messages stored in the online store.
//!
//! Field tags follow feast `types/Value.proto`, so values written by other feast components
//! decode unchanged.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Value {
    #[prost(
        oneof = "value::Val",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 11, 12, 13, 14, 15, 16, 17, 19"
    )]
    pub val: ::core::option::Option<value::Val>,
}

pub mod value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Val {
        #[prost(bytes, tag = "1")]
        BytesVal(::prost::alloc::vec::Vec<u8>),
        #[prost(string, tag = "2")]
        StringVal(::prost::alloc::string::String),
        #[prost(int32, tag = "3")]
        Int32Val(i32),
        #[prost(int64, tag = "4")]
        Int64Val(i64),
        #[prost(double, tag = "5")]
        DoubleVal(f64),
        #[prost(float, tag = "6")]
        FloatVal(f32),
        #[prost(bool, tag = "7")]
        BoolVal(bool),
        #[prost(int64, tag = "8")]
        UnixTimestampVal(i64),
        #[prost(message, tag = "11")]
        BytesListVal(super::BytesList),
        #[prost(message, tag = "12")]
        StringListVal(super::StringList),
        #[prost(message, tag = "13")]
        Int32ListVal(super::Int32List),
        #[prost(message, tag = "14")]
        Int64ListVal(super::Int64List),
        #[prost(message, tag = "15")]
        DoubleListVal(super::DoubleList),
        #[prost(message, tag = "16")]
        FloatListVal(super::FloatList),
        #[prost(message, tag = "17")]
        BoolListVal(super::BoolList),
        #[prost(enumeration = "super::Null", tag = "19")]
        NullVal(i32),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Null {
    Null = 0,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BytesList {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringList {
    #[prost(string, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Int32List {
    #[prost(int32, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<i32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Int64List {
    #[prost(int64, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DoubleList {
    #[prost(double, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<f64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FloatList {
    #[prost(float, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<f32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BoolList {
    #[prost(bool, repeated, tag = "1")]
    pub val: ::prost::alloc::vec::Vec<bool>,
}

/// Payload of one online store field: the feature value and the event time it was observed at.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoredFeature {
    #[prost(message, optional, tag = "1")]
    pub value: ::core::option::Option<Value>,
    #[prost(message, optional, tag = "2")]
    pub event_timestamp: ::core::option::Option<::prost_types::Timestamp>,
}

/// Feast value type enum. Discriminants are the wire tags used by the entity key codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueType {
    Bytes = 1,
    String = 2,
    Int32 = 3,
    Int64 = 4,
    Double = 5,
    Float = 6,
    Bool = 7,
    UnixTimestamp = 8,
    BytesList = 11,
    StringList = 12,
    Int32List = 13,
    Int64List = 14,
    DoubleList = 15,
    FloatList = 16,
    BoolList = 17,
}

impl ValueType {
    pub fn tag(self) -> u32 {
        self as u32
    }
}

fn json_array<'a>(json: &'a serde_json::Value) -> Result<&'a Vec<serde_json::Value>> {
    json.as_array()
        .ok_or_else(|| anyhow!("expected a JSON array, got {}", json))
}

fn json_i64(json: &serde_json::Value) -> Result<i64> {
    json.as_i64()
        .ok_or_else(|| anyhow!("expected an integer, got {}", json))
}

fn json_f64(json: &serde_json::Value) -> Result<f64> {
    json.as_f64()
        .ok_or_else(|| anyhow!("expected a number, got {}", json))
}

fn json_str(json: &serde_json::Value) -> Result<String> {
    json.as_str()
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("expected a string, got {}", json))
}

fn json_bool(json: &serde_json::Value) -> Result<bool> {
    json.as_bool()
        .ok_or_else(|| anyhow!("expected a boolean, got {}", json))
}

fn json_list<T>(
    json: &serde_json::Value,
    convert: impl Fn(&serde_json::Value) -> Result<T>,
) -> Result<Vec<T>> {
    json_array(json)?.iter().map(convert).collect()
}

impl Value {
    /// Builds a typed value from its JSON representation. Bytes are given as UTF-8 strings.
    pub fn from_json(value_type: ValueType, json: &serde_json::Value) -> Result<Self> {
        use value::Val;
        if json.is_null() {
            return Ok(Value {
                val: Some(Val::NullVal(Null::Null as i32)),
            });
        }
        let val = match value_type {
            ValueType::Bytes => Val::BytesVal(json_str(json)?.into_bytes()),
            ValueType::String => Val::StringVal(json_str(json)?),
            ValueType::Int32 => Val::Int32Val(i32::try_from(json_i64(json)?)?),
            ValueType::Int64 => Val::Int64Val(json_i64(json)?),
            ValueType::Double => Val::DoubleVal(json_f64(json)?),
            ValueType::Float => Val::FloatVal(json_f64(json)? as f32),
            ValueType::Bool => Val::BoolVal(json_bool(json)?),
            ValueType::UnixTimestamp => Val::UnixTimestampVal(json_i64(json)?),
            ValueType::BytesList => Val::BytesListVal(BytesList {
                val: json_list(json, |v| json_str(v).map(String::into_bytes))?,
            }),
            ValueType::StringList => Val::StringListVal(StringList {
                val: json_list(json, json_str)?,
            }),
            ValueType::Int32List => Val::Int32ListVal(Int32List {
                val: json_list(json, |v| Ok(i32::try_from(json_i64(v)?)?))?,
            }),
            ValueType::Int64List => Val::Int64ListVal(Int64List {
                val: json_list(json, json_i64)?,
            }),
            ValueType::DoubleList => Val::DoubleListVal(DoubleList {
                val: json_list(json, json_f64)?,
            }),
            ValueType::FloatList => Val::FloatListVal(FloatList {
                val: json_list(json, |v| json_f64(v).map(|f| f as f32))?,
            }),
            ValueType::BoolList => Val::BoolListVal(BoolList {
                val: json_list(json, json_bool)?,
            }),
        };
        Ok(Value { val: Some(val) })
    }
}

#[cfg(test)]
mod tests {
    use super::value::Val;
    use super::*;
    use prost::Message;
    use serde_json::json;

    #[test]
    fn stored_feature_survives_encoding() -> Result<()> {
        let stored = StoredFeature {
            value: Some(Value {
                val: Some(Val::DoubleListVal(DoubleList {
                    val: vec![0.5, 1.5],
                })),
            }),
            event_timestamp: Some(prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
        };
        let decoded = StoredFeature::decode(stored.encode_to_vec().as_slice())?;
        assert_eq!(decoded, stored);
        Ok(())
    }

    #[test]
    fn value_from_json_respects_declared_type() -> Result<()> {
        let int32 = Value::from_json(ValueType::Int32, &json!(7))?;
        assert_eq!(int32.val, Some(Val::Int32Val(7)));
        let list = Value::from_json(ValueType::StringList, &json!(["a", "b"]))?;
        assert_eq!(
            list.val,
            Some(Val::StringListVal(StringList {
                val: vec!["a".to_string(), "b".to_string()]
            }))
        );
        let null = Value::from_json(ValueType::Double, &json!(null))?;
        assert_eq!(null.val, Some(Val::NullVal(0)));
        assert!(Value::from_json(ValueType::Int64, &json!("seven")).is_err());
        assert!(Value::from_json(ValueType::Int32, &json!(i64::MAX)).is_err());
        Ok(())
    }
}
