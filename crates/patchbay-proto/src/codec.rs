//! The two interchangeable wire formats.
//!
//! Binary mode is CBOR via `ciborium`; text mode is JSON via `serde_json`.
//! Byte arrays survive both: CBOR carries them as native byte strings, JSON
//! wraps them in a `{"__bytes": <base64>}` object that the decoder
//! recognises.

use crate::value::Value;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::BTreeMap;

/// JSON object key marking a base64-wrapped byte array.
pub const BYTES_KEY: &str = "__bytes";

/// Wire format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    /// Compact binary object notation (CBOR).
    #[default]
    Cbor,
    /// Text JSON.
    Json,
}

impl Codec {
    /// Encode a value into its wire form.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the value has no representation in the
    /// selected format (non-finite floats and tagged values in JSON mode)
    /// or serialization fails.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Cbor => {
                let raw = to_cbor(value);
                let mut bytes = Vec::new();
                ciborium::into_writer(&raw, &mut bytes)
                    .map_err(|e| CodecError::Encode(e.to_string()))?;
                Ok(bytes)
            }
            Codec::Json => {
                let raw = to_json(value)?;
                serde_json::to_vec(&raw).map_err(|e| CodecError::Encode(e.to_string()))
            }
        }
    }

    /// Decode a wire payload into a value.
    ///
    /// JSON mode first checks that the payload is valid UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the payload does not match the declared
    /// format.
    pub fn decode(&self, payload: &[u8]) -> Result<Value, CodecError> {
        match self {
            Codec::Cbor => {
                let raw: ciborium::value::Value = ciborium::from_reader(payload)
                    .map_err(|e| CodecError::Decode(e.to_string()))?;
                from_cbor(raw)
            }
            Codec::Json => {
                let text = std::str::from_utf8(payload).map_err(|_| CodecError::Utf8)?;
                let raw: serde_json::Value =
                    serde_json::from_str(text).map_err(|e| CodecError::Decode(e.to_string()))?;
                from_json(raw)
            }
        }
    }
}

fn to_cbor(value: &Value) -> ciborium::value::Value {
    use ciborium::value::Value as Cbor;
    match value {
        Value::Null => Cbor::Null,
        Value::Bool(b) => Cbor::Bool(*b),
        Value::Int(i) => Cbor::Integer((*i).into()),
        Value::Float(f) => Cbor::Float(*f),
        Value::Text(s) => Cbor::Text(s.clone()),
        Value::Bytes(b) => Cbor::Bytes(b.clone()),
        Value::Array(items) => Cbor::Array(items.iter().map(to_cbor).collect()),
        Value::Map(entries) => Cbor::Map(
            entries
                .iter()
                .map(|(k, v)| (Cbor::Text(k.clone()), to_cbor(v)))
                .collect(),
        ),
        Value::Tagged(tag, inner) => Cbor::Tag(*tag, Box::new(to_cbor(inner))),
    }
}

fn from_cbor(raw: ciborium::value::Value) -> Result<Value, CodecError> {
    use ciborium::value::Value as Cbor;
    match raw {
        Cbor::Null => Ok(Value::Null),
        Cbor::Bool(b) => Ok(Value::Bool(b)),
        Cbor::Integer(i) => {
            let wide = i128::from(i);
            i64::try_from(wide)
                .map(Value::Int)
                .map_err(|_| CodecError::IntegerRange(wide))
        }
        Cbor::Float(f) => Ok(Value::Float(f)),
        Cbor::Text(s) => Ok(Value::Text(s)),
        Cbor::Bytes(b) => Ok(Value::Bytes(b)),
        Cbor::Array(items) => items
            .into_iter()
            .map(from_cbor)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Cbor::Map(entries) => {
            let mut map = BTreeMap::new();
            for (key, val) in entries {
                let Cbor::Text(key) = key else {
                    return Err(CodecError::MapKey);
                };
                map.insert(key, from_cbor(val)?);
            }
            Ok(Value::Map(map))
        }
        Cbor::Tag(tag, inner) => Ok(Value::Tagged(tag, Box::new(from_cbor(*inner)?))),
        other => Err(CodecError::Decode(format!(
            "unsupported CBOR value: {other:?}"
        ))),
    }
}

fn to_json(value: &Value) -> Result<serde_json::Value, CodecError> {
    use serde_json::Value as Json;
    match value {
        Value::Null => Ok(Json::Null),
        Value::Bool(b) => Ok(Json::Bool(*b)),
        Value::Int(i) => Ok(Json::Number((*i).into())),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .ok_or_else(|| CodecError::Encode("non-finite float has no JSON form".to_string())),
        Value::Text(s) => Ok(Json::String(s.clone())),
        Value::Bytes(b) => {
            let mut wrapper = serde_json::Map::with_capacity(1);
            wrapper.insert(BYTES_KEY.to_string(), Json::String(BASE64.encode(b)));
            Ok(Json::Object(wrapper))
        }
        Value::Array(items) => items
            .iter()
            .map(to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Json::Array),
        Value::Map(entries) => {
            let mut object = serde_json::Map::with_capacity(entries.len());
            for (k, v) in entries {
                object.insert(k.clone(), to_json(v)?);
            }
            Ok(Json::Object(object))
        }
        Value::Tagged(tag, _) => Err(CodecError::Encode(format!(
            "tagged value {tag} has no JSON form"
        ))),
    }
}

fn from_json(raw: serde_json::Value) -> Result<Value, CodecError> {
    use serde_json::Value as Json;
    match raw {
        Json::Null => Ok(Value::Null),
        Json::Bool(b) => Ok(Value::Bool(b)),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(u) = n.as_u64() {
                Err(CodecError::IntegerRange(i128::from(u)))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(CodecError::Decode(format!("unrepresentable number: {n}")))
            }
        }
        Json::String(s) => Ok(Value::Text(s)),
        Json::Array(items) => items
            .into_iter()
            .map(from_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Json::Object(object) => {
            if object.len() == 1 {
                if let Some(Json::String(encoded)) = object.get(BYTES_KEY) {
                    let bytes = BASE64
                        .decode(encoded)
                        .map_err(|e| CodecError::Base64(e.to_string()))?;
                    return Ok(Value::Bytes(bytes));
                }
            }
            let mut map = BTreeMap::new();
            for (key, val) in object {
                map.insert(key, from_json(val)?);
            }
            Ok(Value::Map(map))
        }
    }
}

/// Errors raised while encoding or decoding wire payloads.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// Encoding failed
    #[error("encode error: {0}")]
    Encode(String),
    /// Decoding failed
    #[error("decode error: {0}")]
    Decode(String),
    /// Text-mode payload is not UTF-8
    #[error("payload is not valid UTF-8")]
    Utf8,
    /// Integer outside the supported range
    #[error("integer out of range: {0}")]
    IntegerRange(i128),
    /// Map key is not a string
    #[error("map key is not a string")]
    MapKey,
    /// Byte wrapper carried invalid base64
    #[error("invalid base64 in byte wrapper: {0}")]
    Base64(String),
}
