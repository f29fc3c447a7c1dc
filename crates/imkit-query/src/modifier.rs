use std::fmt;

use crate::constraint::{validate_key, wire_key};

pub const MAX_LIMIT: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One sort key, stored under its wire name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub key: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn ascending(key: &str) -> Self {
        Self {
            key: wire_key(key).to_string(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(key: &str) -> Self {
        Self {
            key: wire_key(key).to_string(),
            direction: SortDirection::Descending,
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            SortDirection::Ascending => write!(f, "{}", self.key),
            SortDirection::Descending => write!(f, "-{}", self.key),
        }
    }
}

/// Sort, pagination and result-shape settings of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryModifiers {
    pub order: Vec<SortKey>,
    pub limit: Option<u32>,
    pub skip: Option<u32>,
    pub compact: bool,
    pub with_last_message_refreshed: bool,
}

/// Trait providing modifier methods (sort, limit, skip, result shape).
pub trait Modifiable: Sized {
    /// Get a mutable reference to the modifiers.
    fn modifiers_mut(&mut self) -> &mut QueryModifiers;
    /// Record a local validation failure. Only the first one is kept.
    fn record_modifier_error(&mut self, message: String);

    /// Sort ascending by key. Sort calls append; earlier keys stay primary.
    fn ascending(self, key: &str) -> Self {
        self.push_sort(SortKey::ascending(key), "ascending")
    }

    /// Sort descending by key.
    fn descending(self, key: &str) -> Self {
        self.push_sort(SortKey::descending(key), "descending")
    }

    /// Add an ascending tie-break key.
    fn add_ascending(self, key: &str) -> Self {
        self.push_sort(SortKey::ascending(key), "add_ascending")
    }

    /// Add a descending tie-break key.
    fn add_descending(self, key: &str) -> Self {
        self.push_sort(SortKey::descending(key), "add_descending")
    }

    fn push_sort(mut self, sort: SortKey, method: &str) -> Self {
        if let Err(e) = validate_key(&sort.key) {
            tracing::error!("Invalid key in {method}: {e}");
            self.record_modifier_error(e.to_string());
            return self;
        }
        self.modifiers_mut().order.push(sort);
        self
    }

    /// Limit the number of results (1..=1000).
    fn limit(mut self, count: u32) -> Self {
        if count == 0 || count > MAX_LIMIT {
            tracing::error!("Invalid limit: {count}");
            self.record_modifier_error(format!("limit must be within 1..={MAX_LIMIT}, got {count}"));
            return self;
        }
        self.modifiers_mut().limit = Some(count);
        self
    }

    /// Skip the first `count` results.
    fn skip(mut self, count: u32) -> Self {
        self.modifiers_mut().skip = Some(count);
        self
    }

    /// Return conversations without member lists.
    fn compact(mut self, enabled: bool) -> Self {
        self.modifiers_mut().compact = enabled;
        self
    }

    /// Ask the server to refresh each result's last message.
    fn with_last_messages_refreshed(mut self, enabled: bool) -> Self {
        self.modifiers_mut().with_last_message_refreshed = enabled;
        self
    }
}
