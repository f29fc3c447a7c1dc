use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use imkit_core::{ImError, ImResult};

/// Discriminant of the built-in text message class.
pub const TEXT_MESSAGE_TYPE: i32 = -1;
/// Discriminant of the recall tombstone class.
pub const RECALLED_MESSAGE_TYPE: i32 = -127;

/// Envelope key holding the [`PayloadKind`] of a persisted message.
pub(crate) const PAYLOAD_KIND_KEY: &str = "payloadKind";

/// Keys of the typed sub-envelope that are not user fields.
pub(crate) const RESERVED_TYPED_KEYS: [&str; 4] = ["type", "text", "title", "attributes"];

/// What `Message::payload` returns.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(Value),
    Binary(Vec<u8>),
}

impl Payload {
    /// JSON encoding used in message envelopes. Binary becomes base64.
    pub fn to_json_value(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Json(value) => value.clone(),
            Self::Binary(bytes) => Value::String(encode_binary(bytes)),
        }
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Text(_) => PayloadKind::Text,
            Self::Json(_) => PayloadKind::Json,
            Self::Binary(_) => PayloadKind::Binary,
        }
    }
}

/// How `data` of a persisted envelope is to be read back.
///
/// Wire envelopes carry no marker and are classified by their `data.type`
/// discriminant; persisted ones record the shape they were written from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Text,
    Json,
    Binary,
    Typed,
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

/// Content of a typed message: `{type, text?, title?, attributes?, ..fields}`.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedContent {
    pub(crate) kind: i32,
    pub(crate) text: Option<String>,
    pub(crate) title: Option<String>,
    pub(crate) attributes: Map<String, Value>,
    pub(crate) fields: Map<String, Value>,
    pub(crate) extras: Map<String, Value>,
    pub(crate) declared: Arc<Vec<String>>,
}

impl TypedContent {
    pub fn new(kind: i32) -> Self {
        Self::with_declared(kind, Arc::new(Vec::new()))
    }

    pub(crate) fn with_declared(kind: i32, declared: Arc<Vec<String>>) -> Self {
        Self {
            kind,
            text: None,
            title: None,
            attributes: Map::new(),
            fields: Map::new(),
            extras: Map::new(),
            declared,
        }
    }

    pub fn kind(&self) -> i32 {
        self.kind
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn declared_fields(&self) -> &[String] {
        &self.declared
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = Some(text.into());
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(title.into());
    }

    pub fn set_attributes(&mut self, attributes: Map<String, Value>) {
        self.attributes = attributes;
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Inbound keys the class does not declare. They are written back
    /// unchanged so a parsed message re-serializes to what was received.
    pub fn extras(&self) -> &Map<String, Value> {
        &self.extras
    }

    /// Set a class-declared field. Undeclared keys are refused rather than
    /// silently dropped at serialization time.
    pub fn set_field(&mut self, key: &str, value: Value) -> ImResult<()> {
        if !self.declared.iter().any(|k| k == key) {
            return Err(ImError::validation(format!(
                "field `{}` is not declared for message type {}",
                key, self.kind
            )));
        }
        self.fields.insert(key.to_string(), value);
        Ok(())
    }

    pub fn to_json_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::from(self.kind));
        if let Some(text) = &self.text {
            map.insert("text".to_string(), Value::String(text.clone()));
        }
        if let Some(title) = &self.title {
            map.insert("title".to_string(), Value::String(title.clone()));
        }
        if !self.attributes.is_empty() {
            map.insert(
                "attributes".to_string(),
                Value::Object(self.attributes.clone()),
            );
        }
        for (key, value) in &self.extras {
            map.insert(key.clone(), value.clone());
        }
        for key in self.declared.iter() {
            if let Some(value) = self.fields.get(key) {
                map.insert(key.clone(), value.clone());
            }
        }
        Value::Object(map)
    }

    /// Populate from a typed sub-envelope. Keys that are neither reserved nor
    /// declared go to `extras`.
    pub(crate) fn from_map(kind: i32, declared: Arc<Vec<String>>, map: &Map<String, Value>) -> Self {
        let mut content = Self::with_declared(kind, declared);
        content.text = map.get("text").and_then(Value::as_str).map(str::to_string);
        content.title = map.get("title").and_then(Value::as_str).map(str::to_string);
        if let Some(Value::Object(attrs)) = map.get("attributes") {
            content.attributes = attrs.clone();
        }
        for (key, value) in map {
            if RESERVED_TYPED_KEYS.contains(&key.as_str()) {
                continue;
            }
            if content.declared.iter().any(|k| k == key) {
                content.fields.insert(key.clone(), value.clone());
            } else {
                tracing::trace!(message_type = kind, field = %key, "Keeping undeclared field");
                content.extras.insert(key.clone(), value.clone());
            }
        }
        content
    }
}

pub(crate) fn encode_binary(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub(crate) fn decode_binary(text: &str) -> ImResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| ImError::validation(format!("invalid binary payload: {}", e)))
}
