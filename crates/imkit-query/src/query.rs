use futures_util::future::BoxFuture;
use serde_json::{Map, Value};

use imkit_core::{ImError, ImResult};

use crate::constraint::{compile_where, Clause, Operator};
use crate::filter::{FilterCollector, Filterable};
use crate::modifier::{Modifiable, QueryModifiers, SortDirection, SortKey};

/// Everything `find` sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryDescriptor {
    pub filter: Value,
    pub order: Vec<SortKey>,
    pub limit: Option<u32>,
    pub skip: Option<u32>,
    pub compact: bool,
    pub with_last_message_refreshed: bool,
}

impl QueryDescriptor {
    /// `"a,-b"` form of the sort keys.
    pub fn sort(&self) -> Option<String> {
        if self.order.is_empty() {
            return None;
        }
        Some(
            self.order
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Sort keys with their directions, in call order.
    pub fn sort_keys(&self) -> Vec<(&str, SortDirection)> {
        self.order
            .iter()
            .map(|k| (k.key.as_str(), k.direction))
            .collect()
    }

    /// Request body of the conversation query command.
    pub fn to_json(&self) -> Value {
        let mut body = Map::new();
        let is_empty_filter = self.filter.as_object().map_or(true, Map::is_empty);
        if !is_empty_filter {
            body.insert("where".to_string(), self.filter.clone());
        }
        if let Some(sort) = self.sort() {
            body.insert("sort".to_string(), Value::String(sort));
        }
        if let Some(limit) = self.limit {
            body.insert("limit".to_string(), Value::from(limit));
        }
        if let Some(skip) = self.skip {
            body.insert("skip".to_string(), Value::from(skip));
        }
        if self.compact {
            body.insert("compact".to_string(), Value::Bool(true));
        }
        if self.with_last_message_refreshed {
            body.insert("lastMessageRefreshed".to_string(), Value::Bool(true));
        }
        Value::Object(body)
    }
}

/// Executes compiled conversation queries.
pub trait QueryBackend: Send + Sync {
    type Output: Send;

    /// Id of the querying client, used by `with_members(.., true)`.
    fn client_id(&self) -> &str;

    fn run_query(&self, descriptor: QueryDescriptor) -> BoxFuture<'_, ImResult<Vec<Self::Output>>>;
}

/// Builder for conversation queries.
///
/// Chain filters and modifiers, then `find()`. Invalid arguments are kept
/// as the first recorded error and reported by `compile()`/`find()` before
/// anything is sent.
pub struct ConversationQuery<B: QueryBackend> {
    backend: B,
    filter: FilterCollector,
    modifiers: QueryModifiers,
    modifier_error: Option<String>,
}

impl<B: QueryBackend> ConversationQuery<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            filter: FilterCollector::default(),
            modifiers: QueryModifiers::default(),
            modifier_error: None,
        }
    }

    /// Conversations whose member set is exactly `peer_ids`, plus the
    /// querying client when `include_self` is set.
    pub fn with_members<I, S>(self, peer_ids: I, include_self: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut members: Vec<String> = Vec::new();
        let own = include_self.then(|| self.backend.client_id().to_string());
        for id in peer_ids.into_iter().map(Into::into).chain(own) {
            if !members.contains(&id) {
                members.push(id);
            }
        }
        let size = members.len();
        let clause = Clause::new(
            "members",
            Operator::All,
            Value::Array(members.into_iter().map(Value::String).collect()),
        )
        .with_extra("$size", Value::from(size));
        self.push_clause(clause, "with_members")
    }

    /// Conversations whose member set includes every one of `peer_ids`.
    pub fn contains_members<I, S>(self, peer_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: Vec<String> = peer_ids.into_iter().map(Into::into).collect();
        self.contains_all("members", members)
    }

    pub fn compile(&self) -> ImResult<QueryDescriptor> {
        if let Some(message) = self.filter.error.as_ref().or(self.modifier_error.as_ref()) {
            return Err(ImError::validation(message.clone()));
        }
        Ok(QueryDescriptor {
            filter: compile_where(&self.filter.clauses),
            order: self.modifiers.order.clone(),
            limit: self.modifiers.limit,
            skip: self.modifiers.skip,
            compact: self.modifiers.compact,
            with_last_message_refreshed: self.modifiers.with_last_message_refreshed,
        })
    }

    /// Run the query.
    pub async fn find(&self) -> ImResult<Vec<B::Output>> {
        let descriptor = self.compile()?;
        tracing::debug!(
            client_id = %self.backend.client_id(),
            filter = %descriptor.filter,
            sort = ?descriptor.sort(),
            "Finding conversations"
        );
        self.backend.run_query(descriptor).await
    }
}

impl<B: QueryBackend> Filterable for ConversationQuery<B> {
    fn clauses_mut(&mut self) -> &mut Vec<Clause> {
        self.filter.clauses_mut()
    }

    fn record_error(&mut self, message: String) {
        self.filter.record_error(message);
    }
}

impl<B: QueryBackend> Modifiable for ConversationQuery<B> {
    fn modifiers_mut(&mut self) -> &mut QueryModifiers {
        &mut self.modifiers
    }

    fn record_modifier_error(&mut self, message: String) {
        self.modifier_error.get_or_insert(message);
    }
}
