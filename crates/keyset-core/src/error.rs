use crate::{
    config::ConfigError,
    db::{
        CommitError, HookError, QueryError, RegistryError, RelationError, SearchError,
        StoreError, UniqueViolation,
    },
    model::validate::ValidationError,
    serialize::SerializeError,
};
use std::fmt;
use thiserror::Error as ThisError;

///
/// Error
///
/// Caller-facing error. Each subsystem contributes one transparent variant;
/// `class()` and `origin()` give a stable classification for all of them.
///

#[derive(Debug, ThisError)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("get query yielded non unique results ({count} matches)")]
    NonUnique { count: usize },

    #[error(transparent)]
    UniqueViolation(#[from] UniqueViolation),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error(transparent)]
    Relation(#[from] RelationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error(transparent)]
    Hook(#[from] HookError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) | Self::Relation(_) | Self::Config(_) => ErrorClass::Unsupported,
            Self::Query(err) => err.class(),
            Self::NonUnique { count: 0 } => ErrorClass::NotFound,
            Self::NonUnique { .. } | Self::UniqueViolation(_) => ErrorClass::Conflict,
            Self::Commit(err) => err.class(),
            Self::Hook(_) => ErrorClass::Internal,
            Self::Store(err) => err.class(),
            Self::Serialize(_) => ErrorClass::Corruption,
            Self::Registry(err) => err.class(),
            Self::Search(err) => err.class(),
        }
    }

    #[must_use]
    pub const fn origin(&self) -> ErrorOrigin {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::Registry(_) => ErrorOrigin::Interface,
            Self::Query(_) | Self::NonUnique { .. } => ErrorOrigin::Query,
            Self::UniqueViolation(_) => ErrorOrigin::Index,
            Self::Commit(_) => ErrorOrigin::Commit,
            Self::Relation(_) => ErrorOrigin::Relation,
            Self::Store(_) => ErrorOrigin::Store,
            Self::Serialize(_) => ErrorOrigin::Serialize,
            Self::Search(_) => ErrorOrigin::Search,
            Self::Hook(err) => err.origin(),
        }
    }

    /// True when no instance matched a `get`.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NonUnique { count: 0 })
    }

    #[must_use]
    pub fn display_with_class(&self) -> String {
        format!("{}:{}: {self}", self.origin(), self.class())
    }
}

///
/// ErrorClass
/// Error taxonomy for runtime classification.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    Corruption,
    NotFound,
    Internal,
    Conflict,
    Unsupported,
    InvariantViolation,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Corruption => "corruption",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
            Self::Conflict => "conflict",
            Self::Unsupported => "unsupported",
            Self::InvariantViolation => "invariant_violation",
        };
        write!(f, "{label}")
    }
}

///
/// ErrorOrigin
/// Origin taxonomy for runtime classification.
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorOrigin {
    Serialize,
    Store,
    Index,
    Query,
    Commit,
    Relation,
    Search,
    Interface,
}

impl fmt::Display for ErrorOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Serialize => "serialize",
            Self::Store => "store",
            Self::Index => "index",
            Self::Query => "query",
            Self::Commit => "commit",
            Self::Relation => "relation",
            Self::Search => "search",
            Self::Interface => "interface",
        };
        write!(f, "{label}")
    }
}

///
/// TESTS
///
