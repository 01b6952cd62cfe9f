// Copyright 2025 Lagoon Contributors (https://github.com/lagoondb/lagoon)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Wire serialization
//!
//! Converts between [`Value`] and the server's exact JSON encoding. JSON has
//! no literal for NaN, infinities, negative zero, byte buffers, or integers
//! beyond the double-safe range, so those travel as single-key tagged
//! objects:
//!
//! - `{"$integer": "<base64, 8 bytes little-endian two's complement>"}`
//! - `{"$float":   "<base64, 8 bytes little-endian IEEE-754>"}`
//! - `{"$bytes":   "<base64>"}`
//!
//! Serialization is deterministic: object keys are emitted in sorted order,
//! which is what makes the output usable for cache-key canonicalization.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use byteorder::{ByteOrder, LittleEndian};
use serde_json::json;

use crate::error::{LagoonError, Result};
use crate::value::Value;

const TAG_INTEGER: &str = "$integer";
const TAG_FLOAT: &str = "$float";
const TAG_BYTES: &str = "$bytes";

/// Serialize a value to the server's JSON text. Deterministic: equal values
/// yield byte-identical output.
pub fn serialize(value: &Value) -> String {
    encode(value).to_string()
}

/// Deserialize the server's JSON text back into a [`Value`].
///
/// Tagged forms are decoded to the exact bit pattern they carry; malformed
/// tags fail with [`LagoonError::MalformedWireValue`] naming the offending
/// field path.
pub fn deserialize(text: &str) -> Result<Value> {
    let json: serde_json::Value =
        serde_json::from_str(text).map_err(|e| LagoonError::MalformedWireValue {
            path: "$".into(),
            reason: format!("invalid JSON: {e}"),
        })?;
    decode(&json).map_err(|e| e.prepend_path("$"))
}

/// Decode an already-parsed JSON tree. Used by the response envelope parser,
/// which has to peel framing fields off before reaching the payload.
pub fn decode_json(json: &serde_json::Value) -> Result<Value> {
    decode(json).map_err(|e| e.prepend_path("$"))
}

/// Encode to a JSON tree rather than text, for embedding in a request
/// envelope.
pub fn encode_json(value: &Value) -> serde_json::Value {
    encode(value)
}

fn encode(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => json!(b),
        Value::Int64(n) => {
            let mut buf = [0u8; 8];
            LittleEndian::write_i64(&mut buf, *n);
            json!({ TAG_INTEGER: BASE64.encode(buf) })
        }
        Value::Float64(f) => {
            if f.is_finite() && !(*f == 0.0 && f.is_sign_negative()) {
                // from_f64 only fails for non-finite inputs
                serde_json::Number::from_f64(*f)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            } else {
                let mut buf = [0u8; 8];
                LittleEndian::write_u64(&mut buf, f.to_bits());
                json!({ TAG_FLOAT: BASE64.encode(buf) })
            }
        }
        Value::String(s) => json!(s),
        Value::Bytes(bytes) => json!({ TAG_BYTES: BASE64.encode(bytes) }),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(encode).collect()),
        Value::Object(fields) => {
            let mut map = serde_json::Map::with_capacity(fields.len());
            for (k, v) in fields {
                map.insert(k.clone(), encode(v));
            }
            serde_json::Value::Object(map)
        }
    }
}

fn decode(json: &serde_json::Value) -> Result<Value> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => decode_number(n),
        serde_json::Value::String(s) => Ok(Value::String(s.clone())),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(decode(item).map_err(|e| e.prepend_path(&format!("[{i}]")))?);
            }
            Ok(Value::Array(out))
        }
        serde_json::Value::Object(map) => decode_object(map),
    }
}

fn decode_number(n: &serde_json::Number) -> Result<Value> {
    if let Some(i) = n.as_i64() {
        return Ok(Value::Int64(i));
    }
    // A u64 beyond i64::MAX is a whole number outside the int64 range, not
    // a float in disguise.
    if n.as_u64().is_some() {
        return Err(malformed(format!("number {n} outside int64 range")));
    }
    match n.as_f64() {
        Some(f) => Ok(Value::Float64(f)),
        None => Err(malformed(format!("unrepresentable number {n}"))),
    }
}

fn decode_object(map: &serde_json::Map<String, serde_json::Value>) -> Result<Value> {
    if let (1, Some((key, payload))) = (map.len(), map.iter().next()) {
        match key.as_str() {
            TAG_INTEGER => {
                let bytes = tag_payload(key, payload, Some(8))?;
                return Ok(Value::Int64(LittleEndian::read_i64(&bytes)));
            }
            TAG_FLOAT => {
                let bytes = tag_payload(key, payload, Some(8))?;
                return Ok(Value::Float64(f64::from_bits(LittleEndian::read_u64(
                    &bytes,
                ))));
            }
            TAG_BYTES => {
                let bytes = tag_payload(key, payload, None)?;
                return Ok(Value::Bytes(bytes));
            }
            _ => {}
        }
    }
    let mut fields = std::collections::BTreeMap::new();
    for (key, field) in map {
        if key.starts_with('$') {
            return Err(malformed(format!("unknown wire tag \"{key}\""))
                .prepend_path(&format!(".{key}")));
        }
        fields.insert(
            key.clone(),
            decode(field).map_err(|e| e.prepend_path(&format!(".{key}")))?,
        );
    }
    Ok(Value::Object(fields))
}

/// Decode a tag's base64 payload, enforcing an exact byte length when the
/// tag has one.
fn tag_payload(
    tag: &str,
    payload: &serde_json::Value,
    expected_len: Option<usize>,
) -> Result<Vec<u8>> {
    let text = payload.as_str().ok_or_else(|| {
        malformed(format!("{tag} payload must be a base64 string"))
            .prepend_path(&format!(".{tag}"))
    })?;
    let bytes = BASE64.decode(text).map_err(|e| {
        malformed(format!("invalid base64 in {tag}: {e}")).prepend_path(&format!(".{tag}"))
    })?;
    if let Some(expected) = expected_len {
        if bytes.len() != expected {
            return Err(malformed(format!(
                "{tag} payload must be {expected} bytes, got {}",
                bytes.len()
            ))
            .prepend_path(&format!(".{tag}")));
        }
    }
    Ok(bytes)
}

fn malformed(reason: String) -> LagoonError {
    LagoonError::MalformedWireValue {
        path: String::new(),
        reason,
    }
}
