use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A dynamically-typed scalar (or shallow container) as it flows from an
/// ingester body through the transformer chain and into a storage adapter.
///
/// Untagged so that snapshots serialize as plain self-describing maps on
/// the wire (JSON for the API, MessagePack on pub/sub). Variant order
/// matters for deserialization: timestamps must win over strings, and
/// lists over raw byte arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Timestamp(_) => "timestamp",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Numeric view used by arithmetic transformers and series aggregation.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Bool(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Python-like truthiness, used by the `bool` transformer and the
    /// expression evaluator.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(v) => *v,
            Value::Int(v) => *v != 0,
            Value::UInt(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Timestamp(_) => true,
            Value::String(s) => !s.is_empty(),
            Value::List(v) => !v.is_empty(),
            Value::Map(m) => !m.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
        }
    }

    pub fn from_json(v: serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for Value {
    /// Stringification used when substituting `{...}` placeholders into a
    /// transformer expression. Strings render bare (no quotes) so that
    /// numeric-looking payloads stay evaluable.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            // Debug formatting keeps a decimal point on integral floats
            // ("30.0"), so substituted expressions stay float-typed.
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Timestamp(ts) => {
                write!(f, "{}", ts.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Value::String(s) => write!(f, "{s}"),
            Value::List(_) | Value::Map(_) => {
                write!(f, "{}", serde_json::to_string(self).unwrap_or_default())
            }
            Value::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_placeholder_friendly() {
        assert_eq!(Value::Float(30.0).to_string(), "30.0");
        assert_eq!(Value::Float(0.25).to_string(), "0.25");
        assert_eq!(Value::Int(-3).to_string(), "-3");
        assert_eq!(Value::String("BTC".into()).to_string(), "BTC");
        assert_eq!(Value::Null.to_string(), "null");
    }

    #[test]
    fn truthiness_matches_source_semantics() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(!Value::String(String::new()).is_truthy());
        assert!(Value::Float(0.1).is_truthy());
        assert!(Value::List(vec![Value::Null]).is_truthy());
    }

    #[test]
    fn json_round_trip_preserves_numbers() {
        let v = Value::from_json(serde_json::json!({"a": 1, "b": 2.5, "c": [true, null]}));
        let Value::Map(m) = &v else {
            panic!("expected map")
        };
        assert_eq!(m["a"], Value::Int(1));
        assert_eq!(m["b"], Value::Float(2.5));
        assert_eq!(
            m["c"],
            Value::List(vec![Value::Bool(true), Value::Null])
        );
    }

    #[test]
    fn msgpack_round_trip() {
        let mut m = BTreeMap::new();
        m.insert("price".to_string(), Value::Float(40000.0));
        m.insert("sym".to_string(), Value::String("BTCUSD".into()));
        let v = Value::Map(m);
        let bytes = rmp_serde::to_vec(&v).expect("encode");
        let back: Value = rmp_serde::from_slice(&bytes).expect("decode");
        assert_eq!(v, back);
    }
}
