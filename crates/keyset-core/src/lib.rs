//! Core runtime for keyset: runtime schema, values, the query compiler and
//! planner, the transactional index-maintenance protocol, and the dependent
//! index consumers (search words, relation link sets).
#![warn(unreachable_pub)]

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod obs;
pub mod serialize;
pub mod traits;
pub mod value;

// test
#[cfg(test)]
pub(crate) mod test_support;

pub use error::Error;

///
/// CONSTANTS
///

/// Separator between a field name and a lookup suffix (`pv__gt`).
pub const LOOKUP_SEPARATOR: &str = "__";

/// Name of the primary-key field on every entity.
pub const PRIMARY_KEY: &str = "id";

///
/// Prelude
///
/// Prelude contains only domain vocabulary.
/// No errors, executors, stores, serializers, or helpers are re-exported here.
///

pub mod prelude {
    pub use crate::{
        db::{Manager, QuerySet, Session, Transaction},
        model::{
            entity::EntityModel,
            field::{FieldKind, FieldModel, ScalarKind},
        },
        traits::EntityKind,
        value::{Id, LookupValue, Row, Value},
    };
}
