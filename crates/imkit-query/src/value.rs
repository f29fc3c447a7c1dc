use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use imkit_core::time;

/// A point on the sphere, encoded as `{"__type": "GeoPoint", ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.latitude) && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Trait for converting Rust types into filter operands.
pub trait IntoQueryValue {
    fn into_query_value(self) -> Value;
}

impl IntoQueryValue for Value {
    fn into_query_value(self) -> Value {
        self
    }
}

impl IntoQueryValue for bool {
    fn into_query_value(self) -> Value {
        Value::Bool(self)
    }
}

impl IntoQueryValue for i32 {
    fn into_query_value(self) -> Value {
        Value::from(self)
    }
}

impl IntoQueryValue for i64 {
    fn into_query_value(self) -> Value {
        Value::from(self)
    }
}

impl IntoQueryValue for u32 {
    fn into_query_value(self) -> Value {
        Value::from(self)
    }
}

impl IntoQueryValue for f64 {
    fn into_query_value(self) -> Value {
        Value::from(self)
    }
}

impl IntoQueryValue for String {
    fn into_query_value(self) -> Value {
        Value::String(self)
    }
}

impl IntoQueryValue for &str {
    fn into_query_value(self) -> Value {
        Value::String(self.to_string())
    }
}

impl IntoQueryValue for &String {
    fn into_query_value(self) -> Value {
        Value::String(self.clone())
    }
}

impl IntoQueryValue for DateTime<Utc> {
    fn into_query_value(self) -> Value {
        time::to_date_object(&self)
    }
}

impl IntoQueryValue for GeoPoint {
    fn into_query_value(self) -> Value {
        serde_json::json!({
            "__type": "GeoPoint",
            "latitude": self.latitude,
            "longitude": self.longitude,
        })
    }
}

impl<T: IntoQueryValue> IntoQueryValue for Vec<T> {
    fn into_query_value(self) -> Value {
        Value::Array(self.into_iter().map(IntoQueryValue::into_query_value).collect())
    }
}

impl<T: IntoQueryValue> IntoQueryValue for Option<T> {
    fn into_query_value(self) -> Value {
        match self {
            Some(value) => value.into_query_value(),
            None => Value::Null,
        }
    }
}
