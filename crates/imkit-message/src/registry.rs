use std::collections::BTreeMap;
use std::sync::Arc;

use imkit_core::{ImError, ImResult};

use crate::message::Message;
use crate::payload::{
    TypedContent, RECALLED_MESSAGE_TYPE, RESERVED_TYPED_KEYS, TEXT_MESSAGE_TYPE,
};

/// A registered typed message class: a stable discriminant plus the extra
/// payload fields that take part in serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageClass {
    kind: i32,
    name: String,
    pub(crate) fields: Arc<Vec<String>>,
}

impl MessageClass {
    /// Declare a typed class for the given discriminant.
    pub fn typed(kind: i32, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            fields: Arc::new(Vec::new()),
        }
    }

    /// Declare the payload fields of this class.
    pub fn fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut declared: Vec<String> = self.fields.as_ref().clone();
        for field in fields {
            let field = field.into();
            if !declared.contains(&field) {
                declared.push(field);
            }
        }
        self.fields = Arc::new(declared);
        self
    }

    pub fn text_message() -> Self {
        Self::typed(TEXT_MESSAGE_TYPE, "TextMessage")
    }

    pub fn recalled_message() -> Self {
        Self::typed(RECALLED_MESSAGE_TYPE, "RecalledMessage")
    }

    pub fn kind(&self) -> i32 {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_fields(&self) -> &[String] {
        &self.fields
    }

    /// A fresh, unsent message of this class.
    pub fn new_message(&self) -> Message {
        Message::from_typed(self.content())
    }

    pub(crate) fn content(&self) -> TypedContent {
        TypedContent::with_declared(self.kind, Arc::clone(&self.fields))
    }

    fn validate(&self) -> ImResult<()> {
        if self.name.trim().is_empty() {
            return Err(ImError::validation("message class name must not be empty"));
        }
        for field in self.fields.iter() {
            if RESERVED_TYPED_KEYS.contains(&field.as_str()) {
                return Err(ImError::validation(format!(
                    "`{}` is reserved and cannot be declared as a field of {}",
                    field, self.name
                )));
            }
        }
        Ok(())
    }
}

/// Discriminant → class mapping consulted when parsing inbound payloads.
///
/// Append-only: a discriminant can be registered once; re-registering the
/// identical class is a no-op.
#[derive(Debug, Clone)]
pub struct MessageRegistry {
    classes: BTreeMap<i32, MessageClass>,
}

impl MessageRegistry {
    /// A registry holding the built-in `TextMessage` and `RecalledMessage`.
    pub fn new() -> Self {
        let mut classes = BTreeMap::new();
        for class in [MessageClass::text_message(), MessageClass::recalled_message()] {
            classes.insert(class.kind, class);
        }
        Self { classes }
    }

    pub fn register(&mut self, class: MessageClass) -> ImResult<()> {
        class.validate()?;
        if let Some(existing) = self.classes.get(&class.kind) {
            if *existing == class {
                return Ok(());
            }
            return Err(ImError::validation(format!(
                "message type {} is already registered as {}",
                class.kind, existing.name
            )));
        }
        tracing::debug!(message_type = class.kind, class = %class.name, "Registered message class");
        self.classes.insert(class.kind, class);
        Ok(())
    }

    pub fn resolve(&self, kind: i32) -> Option<&MessageClass> {
        self.classes.get(&kind)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl Default for MessageRegistry {
    fn default() -> Self {
        Self::new()
    }
}
