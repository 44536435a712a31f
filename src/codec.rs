//! Binary frame codec for the notebook duplex channel.
//!
//! Frames are self-describing CBOR. The codec layer knows nothing about
//! actions or topics — it maps between a dynamic [`Value`] model and bytes,
//! and the transport interprets the resulting maps. Validation of frame
//! shape lives in the transport, not here.
//!
//! Supported model: null, booleans, integers (i64 range), floats, UTF-8
//! text, byte strings, arrays, and string-keyed maps. Encoding followed by
//! decoding is an identity on this model. Indefinite-length items, tags,
//! and non-string map keys are rejected on decode.

use std::collections::BTreeMap;

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};

use crate::error::SdkError;

/// Maximum nesting depth accepted by the decoder.
const MAX_DEPTH: usize = 64;

/// A dynamic wire value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// CBOR null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer. The wire may carry unsigned values; anything outside the
    /// `i64` range is rejected on decode.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw byte string.
    Bytes(Vec<u8>),
    /// Sequence of values.
    Array(Vec<Value>),
    /// String-keyed map with deterministic (sorted) encoding order.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Build a map value from key/value pairs.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Look up a key in a map value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Text content, if this is a text value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer value.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean value.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Byte content, if this is a byte string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Array content, if this is a sequence.
    #[must_use]
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Map content, if this is a map.
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Bytes of a value that is either a byte string or UTF-8 text.
    ///
    /// Stream payloads (terminal output, download chunks) are
    /// server-defined as either form; this normalises both.
    #[must_use]
    pub fn as_chunk(&self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(b) => Some(b.clone()),
            Self::Text(s) => Some(s.as_bytes().to_vec()),
            _ => None,
        }
    }

    /// Convert a JSON value into the wire model.
    ///
    /// Numbers outside the `i64` range fall back to floats.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::Text(s.clone()),
            serde_json::Value::Array(items) => {
                Self::Array(items.iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert into a JSON value.
    ///
    /// Returns `None` if the value contains byte strings or non-finite
    /// floats anywhere — those have no JSON image and must be extracted
    /// before bridging.
    #[must_use]
    pub fn into_json(self) -> Option<serde_json::Value> {
        match self {
            Self::Null => Some(serde_json::Value::Null),
            Self::Bool(b) => Some(serde_json::Value::Bool(b)),
            Self::Int(n) => Some(serde_json::Value::Number(n.into())),
            Self::Float(f) => serde_json::Number::from_f64(f).map(serde_json::Value::Number),
            Self::Text(s) => Some(serde_json::Value::String(s)),
            Self::Bytes(_) => None,
            Self::Array(items) => items
                .into_iter()
                .map(Self::into_json)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Self::Map(map) => map
                .into_iter()
                .map(|(k, v)| v.into_json().map(|j| (k, j)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(serde_json::Value::Object),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Int(n.into())
    }
}

impl From<u16> for Value {
    fn from(n: u16) -> Self {
        Self::Int(n.into())
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Self::Int(n.into())
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

/// Encode a value into a CBOR byte buffer.
#[must_use]
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_value(&mut enc, value).expect("CBOR encoding into a Vec cannot fail");
    buf
}

fn encode_value(
    enc: &mut Encoder<&mut Vec<u8>>,
    value: &Value,
) -> Result<(), minicbor::encode::Error<std::convert::Infallible>> {
    match value {
        Value::Null => {
            enc.null()?;
        }
        Value::Bool(b) => {
            enc.bool(*b)?;
        }
        Value::Int(n) => {
            enc.i64(*n)?;
        }
        Value::Float(f) => {
            enc.f64(*f)?;
        }
        Value::Text(s) => {
            enc.str(s)?;
        }
        Value::Bytes(b) => {
            enc.bytes(b)?;
        }
        Value::Array(items) => {
            enc.array(items.len() as u64)?;
            for item in items {
                encode_value(enc, item)?;
            }
        }
        Value::Map(map) => {
            enc.map(map.len() as u64)?;
            for (key, val) in map {
                enc.str(key)?;
                encode_value(enc, val)?;
            }
        }
    }
    Ok(())
}

/// Decode a CBOR byte buffer into a value.
///
/// # Errors
///
/// Returns [`SdkError::InvalidMessage`] on malformed CBOR, unsupported
/// forms (tags, indefinite lengths, non-string map keys, out-of-range
/// integers), excessive nesting, or trailing bytes.
pub fn decode(bytes: &[u8]) -> Result<Value, SdkError> {
    if bytes.is_empty() {
        return Err(SdkError::InvalidMessage("empty frame".into()));
    }
    let mut dec = Decoder::new(bytes);
    let value = decode_value(&mut dec, 0)?;
    if dec.position() != bytes.len() {
        return Err(SdkError::InvalidMessage(format!(
            "trailing bytes after frame: {} of {}",
            dec.position(),
            bytes.len()
        )));
    }
    Ok(value)
}

/// Deserialize a wire value into a typed payload via the JSON bridge.
///
/// # Errors
///
/// Returns [`SdkError::InvalidMessage`] when the value contains bytes (no
/// JSON image) or does not match the target shape.
pub fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, SdkError> {
    let json = value
        .into_json()
        .ok_or_else(|| SdkError::InvalidMessage("binary payload in structured position".into()))?;
    serde_json::from_value(json).map_err(|e| SdkError::InvalidMessage(e.to_string()))
}

fn bad(e: impl std::fmt::Display) -> SdkError {
    SdkError::InvalidMessage(e.to_string())
}

fn decode_value(dec: &mut Decoder<'_>, depth: usize) -> Result<Value, SdkError> {
    if depth > MAX_DEPTH {
        return Err(SdkError::InvalidMessage("frame nesting too deep".into()));
    }
    let ty = dec.datatype().map_err(bad)?;
    match ty {
        Type::Null => {
            dec.null().map_err(bad)?;
            Ok(Value::Null)
        }
        Type::Bool => Ok(Value::Bool(dec.bool().map_err(bad)?)),
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
            let n = dec.u64().map_err(bad)?;
            i64::try_from(n)
                .map(Value::Int)
                .map_err(|_| SdkError::InvalidMessage("integer out of range".into()))
        }
        Type::I8 | Type::I16 | Type::I32 | Type::I64 => Ok(Value::Int(dec.i64().map_err(bad)?)),
        Type::F32 => Ok(Value::Float(f64::from(dec.f32().map_err(bad)?))),
        Type::F64 => Ok(Value::Float(dec.f64().map_err(bad)?)),
        Type::String => Ok(Value::Text(dec.str().map_err(bad)?.to_string())),
        Type::Bytes => Ok(Value::Bytes(dec.bytes().map_err(bad)?.to_vec())),
        Type::Array => {
            let len = dec
                .array()
                .map_err(bad)?
                .ok_or_else(|| SdkError::InvalidMessage("indefinite-length array".into()))?;
            let mut items = Vec::with_capacity(usize::try_from(len).unwrap_or(0).min(1024));
            for _ in 0..len {
                items.push(decode_value(dec, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        Type::Map => {
            let len = dec
                .map()
                .map_err(bad)?
                .ok_or_else(|| SdkError::InvalidMessage("indefinite-length map".into()))?;
            let mut map = BTreeMap::new();
            for _ in 0..len {
                if dec.datatype().map_err(bad)? != Type::String {
                    return Err(SdkError::InvalidMessage("non-string map key".into()));
                }
                let key = dec.str().map_err(bad)?.to_string();
                let val = decode_value(dec, depth + 1)?;
                map.insert(key, val);
            }
            Ok(Value::Map(map))
        }
        other => Err(SdkError::InvalidMessage(format!(
            "unsupported CBOR type: {other:?}"
        ))),
    }
}
