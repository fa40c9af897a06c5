//! Module: db::store
//! Responsibility: the key-value backend contract and the write-batch model.
//! Does not own: key naming (see `db::keyspace`) or index semantics.
//! Boundary: everything above this module talks to storage through `Backend`.

mod batch;
mod guard;
mod memory;

pub use batch::{ClaimGuard, SnapshotGuard, StoreOp, WriteBatch};
pub use memory::MemoryStore;

pub(crate) use guard::apply_compensating;

use crate::error::ErrorClass;
use std::{collections::BTreeSet, ops::Bound};
use thiserror::Error as ThisError;

///
/// StoreError
///
/// Failures surfaced by a backend. Any of these aborts the operation in
/// progress; none is swallowed.
///

#[derive(Debug, ThisError)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend timed out during {op}")]
    Timeout { op: &'static str },

    #[error("claim on '{key}' is held by '{holder}'")]
    ClaimConflict { key: String, holder: String },

    #[error("'{key}' changed since it was read")]
    StaleSnapshot { key: String },

    #[error("key '{key}' not found")]
    NotFound { key: String },

    #[error("corrupt value at '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("backend does not support {0}")]
    Unsupported(&'static str),
}

impl StoreError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable(_) | Self::Timeout { .. } => ErrorClass::Internal,
            Self::ClaimConflict { .. } | Self::StaleSnapshot { .. } => ErrorClass::Conflict,
            Self::NotFound { .. } => ErrorClass::NotFound,
            Self::Corrupt { .. } => ErrorClass::Corruption,
            Self::Unsupported(_) => ErrorClass::Unsupported,
        }
    }
}

///
/// Capabilities
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// `atomic_apply` checks every guard and applies every op as one unit.
    pub atomic_apply: bool,
}

///
/// Backend
///
/// Key-value store with string values, unordered sets and score-ordered
/// sets. Implementations must be usable from several threads at once; the
/// engine never holds a lock across calls.
///
/// Set members are plain strings (instance ids or search words). Missing
/// keys read as empty; empty sets disappear.
///

pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Remove `key` whatever it holds. Returns whether anything was removed.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    fn exists(&self, key: &str) -> Result<bool, StoreError>;

    // ------------------------------------------------------------------
    // Sets
    // ------------------------------------------------------------------

    fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    fn members(&self, key: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Members of several sets, one result per key in order.
    fn members_many(&self, keys: &[String]) -> Result<Vec<BTreeSet<String>>, StoreError> {
        keys.iter().map(|key| self.members(key)).collect()
    }

    fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.members(key)?.contains(member))
    }

    fn intersect(&self, keys: &[String]) -> Result<BTreeSet<String>, StoreError>;

    fn union(&self, keys: &[String]) -> Result<BTreeSet<String>, StoreError>;

    /// Members of `key` absent from every set in `minus`.
    fn difference(&self, key: &str, minus: &[String]) -> Result<BTreeSet<String>, StoreError>;

    /// Cardinality of a set or score-ordered set.
    fn size(&self, key: &str) -> Result<usize, StoreError>;

    // ------------------------------------------------------------------
    // Score-ordered sets
    // ------------------------------------------------------------------

    /// Insert or re-score `member`.
    fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    fn remove_scored(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    fn score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError>;

    fn range_by_score(
        &self,
        key: &str,
        min: Bound<f64>,
        max: Bound<f64>,
    ) -> Result<BTreeSet<String>, StoreError>;

    // ------------------------------------------------------------------
    // Batches and maintenance
    // ------------------------------------------------------------------

    /// Check every guard, then apply every op, as one indivisible unit.
    ///
    /// Only called when `capabilities().atomic_apply` is set.
    fn atomic_apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let _ = batch;
        Err(StoreError::Unsupported("atomic batch apply"))
    }

    /// Remove every key starting with `prefix`. Returns the number removed.
    fn flush(&self, prefix: &str) -> Result<usize, StoreError>;
}

/// Whether `score` falls within the given bounds.
#[must_use]
pub fn score_in_bounds(score: f64, min: Bound<f64>, max: Bound<f64>) -> bool {
    let above = match min {
        Bound::Included(min) => score >= min,
        Bound::Excluded(min) => score > min,
        Bound::Unbounded => true,
    };
    let below = match max {
        Bound::Included(max) => score <= max,
        Bound::Excluded(max) => score < max,
        Bound::Unbounded => true,
    };

    above && below
}
