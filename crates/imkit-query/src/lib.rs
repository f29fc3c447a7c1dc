//! Conversation query builder: chained predicates compiled into a filter,
//! sort and pagination descriptor.

pub mod constraint;
pub mod filter;
pub mod modifier;
pub mod query;
pub mod value;

pub use constraint::{Clause, Operator};
pub use filter::{FilterCollector, Filterable};
pub use modifier::{Modifiable, QueryModifiers, SortDirection, SortKey, MAX_LIMIT};
pub use query::{ConversationQuery, QueryBackend, QueryDescriptor};
pub use value::{GeoPoint, IntoQueryValue};
