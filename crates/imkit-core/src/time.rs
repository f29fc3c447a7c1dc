//! Timestamp encoding shared by messages and conversations.
//!
//! The backend sends instants as epoch milliseconds, RFC 3339 strings, or
//! `{"__type": "Date", "iso": "..."}` objects; all three decode to
//! `DateTime<Utc>`. Encoding always produces epoch milliseconds.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serializer};
use serde_json::Value;

/// Decode any of the accepted instant encodings.
pub fn from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Object(map) => map.get("iso").and_then(from_value),
        _ => None,
    }
}

pub fn to_millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub fn to_rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// The query/filter encoding of a date.
pub fn to_date_object(dt: &DateTime<Utc>) -> Value {
    serde_json::json!({ "__type": "Date", "iso": to_rfc3339(dt) })
}

/// `#[serde(with = "imkit_core::time::millis_opt")]` for `Option<DateTime<Utc>>`.
pub mod millis_opt {
    use super::*;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_some(&dt.timestamp_millis()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<Value>::deserialize(deserializer)?;
        Ok(raw.as_ref().and_then(from_value))
    }
}
