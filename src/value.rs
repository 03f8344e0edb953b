use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Typed union of column values, per the wire data model.
///
/// `Instant` and `Blob` are given schema-preserving encodings on the wire
/// (ISO-8601 and `\xHH` hex respectively) rather than falling back to raw
/// JSON strings/numbers, so a `Row` round-trips through `_sync_changes`
/// without losing type information.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Integer(i64),
    Real(f64),
    Bool(bool),
    Null,
    Instant(DateTime<Utc>),
    Blob(Vec<u8>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical serialized form used for structural equality comparisons
    /// by the conflict detector (spec §4.4: "all other values compare by
    /// their canonical serialized form").
    pub fn canonical(&self) -> String {
        match self {
            Value::Text(s) => format!("t:{s}"),
            Value::Integer(i) => format!("i:{i}"),
            Value::Real(f) => format!("r:{f}"),
            Value::Bool(b) => format!("b:{b}"),
            Value::Null => "n".to_string(),
            Value::Instant(t) => format!("@:{}", t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Value::Blob(b) => format!("x:{}", hex_encode(b)),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for chunk in bytes.chunks(2) {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out.push((hi * 16 + lo) as u8);
    }
    Some(out)
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Text(s) => serializer.serialize_str(s),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Real(f) => serializer.serialize_f64(*f),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Null => serializer.serialize_none(),
            Value::Instant(t) => {
                serializer.serialize_str(&t.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Value::Blob(b) => serializer.serialize_str(&format!("\\x{}", hex_encode(b))),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a text, integer, real, bool, null, instant, or blob value")
    }

    fn visit_str<E>(self, v: &str) -> Result<Value, E>
    where
        E: de::Error,
    {
        if let Some(hex) = v.strip_prefix("\\x") {
            if let Some(bytes) = hex_decode(hex) {
                return Ok(Value::Blob(bytes));
            }
        }
        if let Ok(t) = DateTime::parse_from_rfc3339(v) {
            return Ok(Value::Instant(t.with_timezone(&Utc)));
        }
        Ok(Value::Text(v.to_string()))
    }

    fn visit_string<E>(self, v: String) -> Result<Value, E>
    where
        E: de::Error,
    {
        self.visit_str(&v)
    }

    fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Integer(v))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Value, E> {
        Ok(Value::Integer(v as i64))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Real(v))
    }

    fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_none<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_unit<E>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Ordered mapping from column name to [`Value`]. Key order is not
/// semantically significant, but a `BTreeMap` gives a stable JSON
/// serialization, which the wire schema requires (spec §6).
pub type Row = BTreeMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trips_through_json() {
        let v = Value::Blob(vec![0xde, 0xad, 0xbe, 0xef]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"\\\\xdeadbeef\"");
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn instant_round_trips_through_json() {
        let t = Utc::now();
        let v = Value::Instant(t);
        let json = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        match back {
            Value::Instant(t2) => {
                assert_eq!(t.timestamp_millis(), t2.timestamp_millis());
            }
            _ => panic!("expected Instant"),
        }
    }

    #[test]
    fn canonical_distinguishes_types() {
        assert_ne!(Value::Text("1".into()).canonical(), Value::Integer(1).canonical());
    }
}
