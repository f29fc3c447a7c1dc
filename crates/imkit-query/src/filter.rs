use serde_json::Value;

use crate::constraint::{quote_regex, validate_key, Clause, Operator};
use crate::value::{GeoPoint, IntoQueryValue};

const REGEX_MODIFIERS: &str = "imxs";

/// Trait providing all filter methods for query builders.
///
/// Every method appends one clause and returns the builder. An invalid
/// argument is logged and recorded; the builder then fails at compile time
/// without issuing any remote call.
pub trait Filterable: Sized {
    /// Get a mutable reference to the clause list.
    fn clauses_mut(&mut self) -> &mut Vec<Clause>;
    /// Record a local validation failure. Only the first one is kept.
    fn record_error(&mut self, message: String);

    /// Append a clause after validating its key.
    fn push_clause(mut self, clause: Clause, method: &str) -> Self {
        if let Err(e) = validate_key(&clause.key) {
            tracing::error!("Invalid key in {method} filter: {e}");
            self.record_error(e.to_string());
            return self;
        }
        self.clauses_mut().push(clause);
        self
    }

    /// Filter: key == value
    fn equal_to(self, key: &str, value: impl IntoQueryValue) -> Self {
        self.push_clause(Clause::new(key, Operator::Eq, value.into_query_value()), "equal_to")
    }

    /// Filter: key != value
    fn not_equal_to(self, key: &str, value: impl IntoQueryValue) -> Self {
        self.push_clause(
            Clause::new(key, Operator::Ne, value.into_query_value()),
            "not_equal_to",
        )
    }

    /// Filter: key > value
    fn greater_than(self, key: &str, value: impl IntoQueryValue) -> Self {
        self.push_clause(
            Clause::new(key, Operator::Gt, value.into_query_value()),
            "greater_than",
        )
    }

    /// Filter: key >= value
    fn greater_than_or_equal_to(self, key: &str, value: impl IntoQueryValue) -> Self {
        self.push_clause(
            Clause::new(key, Operator::Gte, value.into_query_value()),
            "greater_than_or_equal_to",
        )
    }

    /// Filter: key < value
    fn less_than(self, key: &str, value: impl IntoQueryValue) -> Self {
        self.push_clause(
            Clause::new(key, Operator::Lt, value.into_query_value()),
            "less_than",
        )
    }

    /// Filter: key <= value
    fn less_than_or_equal_to(self, key: &str, value: impl IntoQueryValue) -> Self {
        self.push_clause(
            Clause::new(key, Operator::Lte, value.into_query_value()),
            "less_than_or_equal_to",
        )
    }

    /// Filter: key is one of `values`
    fn contained_in<I, V>(self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: IntoQueryValue,
    {
        let values = collect_values(values);
        self.push_clause(Clause::new(key, Operator::In, values), "contained_in")
    }

    /// Filter: key is none of `values`
    fn not_contained_in<I, V>(self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: IntoQueryValue,
    {
        let values = collect_values(values);
        self.push_clause(Clause::new(key, Operator::Nin, values), "not_contained_in")
    }

    /// Filter: the array at key contains every one of `values`
    fn contains_all<I, V>(self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: IntoQueryValue,
    {
        let values = collect_values(values);
        self.push_clause(Clause::new(key, Operator::All, values), "contains_all")
    }

    /// Filter: the string at key contains `substring`
    fn contains(self, key: &str, substring: &str) -> Self {
        let pattern = quote_regex(substring);
        self.push_clause(Clause::new(key, Operator::Regex, Value::String(pattern)), "contains")
    }

    /// Filter: the string at key starts with `prefix`
    fn starts_with(self, key: &str, prefix: &str) -> Self {
        let pattern = format!("^{}", quote_regex(prefix));
        self.push_clause(
            Clause::new(key, Operator::Regex, Value::String(pattern)),
            "starts_with",
        )
    }

    /// Filter: the string at key ends with `suffix`
    fn ends_with(self, key: &str, suffix: &str) -> Self {
        let pattern = format!("{}$", quote_regex(suffix));
        self.push_clause(
            Clause::new(key, Operator::Regex, Value::String(pattern)),
            "ends_with",
        )
    }

    /// Filter: the string at key matches `regex`. `modifiers` is a subset of
    /// `imxs`.
    fn matches(mut self, key: &str, regex: &str, modifiers: &str) -> Self {
        if let Some(bad) = modifiers.chars().find(|c| !REGEX_MODIFIERS.contains(*c)) {
            tracing::error!("Invalid regex modifier {bad:?} in matches filter");
            self.record_error(format!("unsupported regex modifier {bad:?}"));
            return self;
        }
        let mut clause = Clause::new(key, Operator::Regex, Value::String(regex.to_string()));
        if !modifiers.is_empty() {
            clause = clause.with_extra("$options", Value::String(modifiers.to_string()));
        }
        self.push_clause(clause, "matches")
    }

    /// Filter: key is set
    fn exists(self, key: &str) -> Self {
        self.push_clause(Clause::new(key, Operator::Exists, Value::Bool(true)), "exists")
    }

    /// Filter: key is not set
    fn does_not_exist(self, key: &str) -> Self {
        self.push_clause(
            Clause::new(key, Operator::Exists, Value::Bool(false)),
            "does_not_exist",
        )
    }

    /// Filter: the array at key has exactly `size` elements
    fn size_equal_to(self, key: &str, size: u32) -> Self {
        self.push_clause(Clause::new(key, Operator::Size, Value::from(size)), "size_equal_to")
    }

    /// Filter: the point at key, ordered by distance from `point`
    fn near(mut self, key: &str, point: GeoPoint) -> Self {
        if !point.is_valid() {
            tracing::error!("Invalid geo point in near filter: {point:?}");
            self.record_error(format!("geo point out of range: {point:?}"));
            return self;
        }
        self.push_clause(
            Clause::new(key, Operator::NearSphere, point.into_query_value()),
            "near",
        )
    }

    /// Filter: the point at key lies within `max_km` of `point`
    fn within_kilometers(mut self, key: &str, point: GeoPoint, max_km: f64) -> Self {
        if !point.is_valid() || max_km.is_nan() || max_km <= 0.0 {
            tracing::error!("Invalid arguments in within_kilometers filter: {point:?}, {max_km}");
            self.record_error(format!(
                "within_kilometers needs a valid point and a positive distance, got {point:?} and {max_km}"
            ));
            return self;
        }
        let clause = Clause::new(key, Operator::NearSphere, point.into_query_value())
            .with_extra("$maxDistanceInKilometers", Value::from(max_km));
        self.push_clause(clause, "within_kilometers")
    }
}

fn collect_values<I, V>(values: I) -> Value
where
    I: IntoIterator<Item = V>,
    V: IntoQueryValue,
{
    Value::Array(values.into_iter().map(IntoQueryValue::into_query_value).collect())
}

/// Clause accumulator backing every query builder.
#[derive(Debug, Default, Clone)]
pub struct FilterCollector {
    pub clauses: Vec<Clause>,
    pub error: Option<String>,
}

impl Filterable for FilterCollector {
    fn clauses_mut(&mut self) -> &mut Vec<Clause> {
        &mut self.clauses
    }

    fn record_error(&mut self, message: String) {
        self.error.get_or_insert(message);
    }
}
