use std::sync::Arc;

use serde_json::{Map, Value};

use imkit_core::time;
use imkit_core::{Flow, ImError, ImResult, Pipeline};

use crate::message::{Content, Message};
use crate::payload::{decode_binary, Payload, PayloadKind, TypedContent, PAYLOAD_KIND_KEY};
use crate::registry::MessageRegistry;
use crate::status::{Delivery, MessageStatus};

/// Turns inbound message envelopes into [`Message`]s.
///
/// Order of work: `before` hooks on the raw envelope, classification by the
/// `data.type` discriminant, field population, then `after` hooks on the
/// constructed message. Either hook chain may reject, in which case the
/// caller gets `Flow::Reject` and must drop the message.
pub struct MessageParser<'a> {
    registry: &'a MessageRegistry,
    before: Option<&'a Pipeline<Value>>,
    after: Option<&'a Pipeline<Message>>,
}

impl<'a> MessageParser<'a> {
    pub fn new(registry: &'a MessageRegistry) -> Self {
        Self {
            registry,
            before: None,
            after: None,
        }
    }

    pub fn with_hooks(
        mut self,
        before: &'a Pipeline<Value>,
        after: &'a Pipeline<Message>,
    ) -> Self {
        self.before = Some(before);
        self.after = Some(after);
        self
    }

    pub fn parse(&self, raw: Value) -> ImResult<Flow<Message>> {
        let raw = match self.before {
            Some(before) => match before.run(raw) {
                Flow::Continue(raw) => raw,
                Flow::Reject(rejection) => {
                    tracing::debug!(%rejection, "Message dropped before parse");
                    return Ok(Flow::Reject(rejection));
                }
            },
            None => raw,
        };

        let message = self.decode(&raw)?;
        tracing::trace!(
            message_id = ?message.id(),
            message_type = ?message.kind(),
            "Parsed message"
        );

        match self.after {
            Some(after) => {
                let flow = after.run(message);
                if let Flow::Reject(rejection) = &flow {
                    tracing::debug!(%rejection, "Message dropped after parse");
                }
                Ok(flow)
            }
            None => Ok(Flow::Continue(message)),
        }
    }

    /// Build a message from an envelope without running any hooks.
    pub fn decode(&self, raw: &Value) -> ImResult<Message> {
        let map = raw
            .as_object()
            .ok_or_else(|| ImError::validation("message envelope must be a JSON object"))?;
        let data = map
            .get("data")
            .ok_or_else(|| ImError::validation("message envelope has no `data`"))?;

        let kind = match map.get(PAYLOAD_KIND_KEY) {
            Some(kind) => Some(serde_json::from_value::<PayloadKind>(kind.clone())?),
            None if map.get("binary").and_then(Value::as_bool).unwrap_or(false) => {
                Some(PayloadKind::Binary)
            }
            None => None,
        };
        let content = match kind {
            Some(PayloadKind::Binary) => {
                let encoded = data
                    .as_str()
                    .ok_or_else(|| ImError::validation("binary payload must be a base64 string"))?;
                Content::Plain(Payload::Binary(decode_binary(encoded)?))
            }
            Some(PayloadKind::Text) => {
                let text = data
                    .as_str()
                    .ok_or_else(|| ImError::validation("text payload must be a string"))?;
                Content::Plain(Payload::Text(text.to_string()))
            }
            Some(PayloadKind::Json) => Content::Plain(Payload::Json(data.clone())),
            Some(PayloadKind::Typed) | None => self.classify(data),
        };

        let mut message = Message::with_content(content);
        message.id = string_field(map, "id");
        message.cid = string_field(map, "cid");
        message.from = string_field(map, "from");
        message.conversation_id = string_field(map, "conversationId");
        message.timestamp = map.get("timestamp").and_then(time::from_value);
        message.updated_at = map.get("updatedAt").and_then(time::from_value);
        message.mention_list = map
            .get("mentionList")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        message.mentioned_all = map
            .get("mentionedAll")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        message.transient = map.get("transient").and_then(Value::as_bool).unwrap_or(false);

        let status = match map.get("status") {
            Some(status) => serde_json::from_value::<MessageStatus>(status.clone())?,
            None if message.id.is_some() => MessageStatus::Sent,
            None => MessageStatus::None,
        };
        message.delivery = Delivery::with_status(status);
        message
            .delivery
            .restore_delivered_at(map.get("deliveredAt").and_then(time::from_value));

        Ok(message)
    }

    fn classify(&self, data: &Value) -> Content {
        match data {
            Value::String(text) => Content::Plain(Payload::Text(text.clone())),
            Value::Object(fields) => {
                let kind = fields
                    .get("type")
                    .and_then(Value::as_i64)
                    .and_then(|k| i32::try_from(k).ok());
                match kind.and_then(|k| self.registry.resolve(k).map(|class| (k, class))) {
                    Some((kind, class)) => Content::Typed(TypedContent::from_map(
                        kind,
                        Arc::clone(&class.fields),
                        fields,
                    )),
                    None => Content::Plain(Payload::Json(data.clone())),
                }
            }
            other => Content::Plain(Payload::Json(other.clone())),
        }
    }
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key).and_then(Value::as_str).map(str::to_string)
}
