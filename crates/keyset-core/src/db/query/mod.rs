//! Module: db::query
//! Responsibility: turn keyword predicates into set-algebra plans and run
//! them against a backend, behind a lazy memoized `QuerySet`.
//! Does not own: index maintenance (see `db::commit`).
//! Boundary: compile errors surface before any backend I/O.

mod compile;
mod plan;
mod set;

#[cfg(test)]
mod tests;

pub use compile::{CompiledLookup, FilterClause, LookupCompiler, LookupOp, UniqueTarget};
pub use plan::{QueryPlan, ResultHandle};
pub use set::QuerySet;

pub(crate) use plan::fetch_rows;

use crate::{error::ErrorClass, value::LookupValue};
use std::collections::BTreeMap;
use thiserror::Error as ThisError;

/// Keyword predicates: lookup name (`field` or `field__suffix`) to value.
pub type Predicates = BTreeMap<String, LookupValue>;

/// Build [`Predicates`] from `name = value` pairs.
///
/// ```ignore
/// let preds = lookup! { pv__gt = 1, name = "ann" };
/// ```
#[macro_export]
macro_rules! lookup {
    ($($name:ident = $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut predicates = $crate::db::Predicates::new();
        $(
            predicates.insert(
                stringify!($name).to_string(),
                $crate::value::LookupValue::from($value),
            );
        )*
        predicates
    }};
}

///
/// QueryError
///
/// Predicate compilation failures. All of these are raised before the
/// backend is touched.
///

#[derive(Debug, ThisError)]
pub enum QueryError {
    #[error("unknown field '{field}' on {entity}")]
    UnknownField { entity: &'static str, field: String },

    #[error("field '{field}' on {entity} is not indexed")]
    NotQueryable { entity: &'static str, field: String },

    #[error("unsupported lookup '{lookup}'")]
    UnsupportedLookup { lookup: String },

    #[error("field '{field}' on {entity} has no range index")]
    NotOrdered { entity: &'static str, field: String },

    #[error("invalid value for lookup '{lookup}': {reason}")]
    InvalidValue { lookup: String, reason: String },

    #[error("more than one unique predicate: {}", .fields.join(", "))]
    MultipleUniquePredicates { fields: Vec<String> },
}

impl QueryError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::MultipleUniquePredicates { .. } => ErrorClass::Conflict,
            Self::UnknownField { .. }
            | Self::NotQueryable { .. }
            | Self::UnsupportedLookup { .. }
            | Self::NotOrdered { .. }
            | Self::InvalidValue { .. } => ErrorClass::Unsupported,
        }
    }
}
