use serde_json::{Map, Value};

use imkit_core::{ImError, ImResult};

/// Filter operators understood by the conversation query endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    All,
    Exists,
    Regex,
    Size,
    NearSphere,
}

impl Operator {
    /// Wire name, `None` for plain equality which is encoded without one.
    pub fn wire_name(self) -> Option<&'static str> {
        match self {
            Self::Eq => None,
            Self::Ne => Some("$ne"),
            Self::Gt => Some("$gt"),
            Self::Gte => Some("$gte"),
            Self::Lt => Some("$lt"),
            Self::Lte => Some("$lte"),
            Self::In => Some("$in"),
            Self::Nin => Some("$nin"),
            Self::All => Some("$all"),
            Self::Exists => Some("$exists"),
            Self::Regex => Some("$regex"),
            Self::Size => Some("$size"),
            Self::NearSphere => Some("$nearSphere"),
        }
    }
}

/// One appended predicate. `extra` holds companion operands that travel in
/// the same operator object (`$options` for regexes, `$maxDistance...` for
/// radius searches, `$size` for exact member sets).
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub key: String,
    pub operator: Operator,
    pub value: Value,
    pub extra: Vec<(&'static str, Value)>,
}

impl Clause {
    pub fn new(key: &str, operator: Operator, value: Value) -> Self {
        Self {
            key: wire_key(key).to_string(),
            operator,
            value,
            extra: Vec::new(),
        }
    }

    pub fn with_extra(mut self, name: &'static str, value: Value) -> Self {
        self.extra.push((name, value));
        self
    }

    /// The value placed under `key` when this clause stands alone.
    fn fragment(&self) -> Value {
        match self.operator.wire_name() {
            None => self.value.clone(),
            Some(name) => {
                let mut ops = Map::new();
                ops.insert(name.to_string(), self.value.clone());
                for (extra, value) in &self.extra {
                    ops.insert((*extra).to_string(), value.clone());
                }
                Value::Object(ops)
            }
        }
    }
}

/// Friendly attribute names mapped to their stored names.
pub fn wire_key(key: &str) -> &str {
    match key {
        "members" => "m",
        "creator" => "c",
        "mutedMembers" => "mu",
        "transient" => "tr",
        "system" => "sys",
        "lastMessageAt" => "lm",
        "lastMessage" => "msg",
        "id" => "objectId",
        other => other,
    }
}

pub fn validate_key(key: &str) -> ImResult<()> {
    if key.is_empty() {
        return Err(ImError::validation("query key cannot be empty"));
    }
    if key.starts_with('$') {
        return Err(ImError::validation(format!(
            "invalid query key {key:?} (keys cannot start with `$`)"
        )));
    }
    Ok(())
}

/// Quote a literal for use inside a `$regex`.
pub fn quote_regex(literal: &str) -> String {
    format!("\\Q{}\\E", literal.replace("\\E", "\\E\\\\E\\Q"))
}

/// Compile an ordered clause list into a `where` object.
///
/// Clauses on the same key merge into one operator object. If any two
/// clauses collide (equality mixed with an operator, or the same operator
/// twice on a key) the whole filter becomes `{"$and": [...]}` with one
/// entry per clause, in call order.
pub fn compile_where(clauses: &[Clause]) -> Value {
    let mut merged: Map<String, Value> = Map::new();
    for clause in clauses {
        let fragment = clause.fragment();
        match merged.get_mut(&clause.key) {
            None => {
                merged.insert(clause.key.clone(), fragment);
            }
            Some(existing) => {
                if !merge_fragment(existing, fragment) {
                    return Value::Object(and_of(clauses));
                }
            }
        }
    }
    Value::Object(merged)
}

fn merge_fragment(existing: &mut Value, fragment: Value) -> bool {
    match (existing, fragment) {
        (Value::Object(ops), Value::Object(new_ops))
            if is_operator_object(ops) && is_operator_object(&new_ops) =>
        {
            if new_ops.keys().any(|k| ops.contains_key(k)) {
                return false;
            }
            ops.extend(new_ops);
            true
        }
        _ => false,
    }
}

fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

fn and_of(clauses: &[Clause]) -> Map<String, Value> {
    let parts = clauses
        .iter()
        .map(|clause| {
            let mut single = Map::new();
            single.insert(clause.key.clone(), clause.fragment());
            Value::Object(single)
        })
        .collect();
    let mut map = Map::new();
    map.insert("$and".to_string(), Value::Array(parts));
    map
}
