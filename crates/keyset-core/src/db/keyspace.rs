//! Module: db::keyspace
//! Responsibility: map (model, field, value) to canonical backend key names.
//! Does not own: value tokenization (see `Value::index_token`) or storage.
//! Boundary: every backend key the engine reads or writes is built here.

use crate::{model::entity::EntityModel, value::Id};

///
/// KeySpace
///
/// Pure key naming. All keys live under the configured prefix, then the
/// model's stable name.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefix shared by every key of one model.
    #[must_use]
    pub fn model(&self, model: &EntityModel) -> String {
        format!("{}{}:", self.prefix, model.name)
    }

    /// Set of every instance id of `model`; its size is the model cardinality.
    #[must_use]
    pub fn all(&self, model: &EntityModel) -> String {
        format!("{}{}:all", self.prefix, model.name)
    }

    /// Serialized row of one instance.
    #[must_use]
    pub fn object(&self, model: &EntityModel, id: &Id) -> String {
        format!("{}{}:obj:{id}", self.prefix, model.name)
    }

    /// Equality index set: ids whose `field` currently holds `token`.
    #[must_use]
    pub fn index(&self, model: &EntityModel, field: &str, token: &str) -> String {
        format!("{}{}:idx:{field}:{token}", self.prefix, model.name)
    }

    /// Uniqueness claim: holds the id owning `token` for `field`.
    #[must_use]
    pub fn unique(&self, model: &EntityModel, field: &str, token: &str) -> String {
        format!("{}{}:uni:{field}:{token}", self.prefix, model.name)
    }

    /// Score-ordered index over a numeric field.
    #[must_use]
    pub fn range(&self, model: &EntityModel, field: &str) -> String {
        format!("{}{}:rng:{field}", self.prefix, model.name)
    }

    /// One side of a many-to-many relation owned by instance `id`.
    #[must_use]
    pub fn link(&self, model: &EntityModel, field: &str, id: &Id) -> String {
        format!("{}{}:lnk:{field}:{id}", self.prefix, model.name)
    }

    /// Prefix shared by every search key of one model.
    #[must_use]
    pub fn search(&self, model: &EntityModel) -> String {
        format!("{}{}:se:", self.prefix, model.name)
    }

    /// Word → ids of `model` containing it.
    #[must_use]
    pub fn search_word(&self, model: &EntityModel, word: &str) -> String {
        format!("{}{}:se:w:{word}", self.prefix, model.name)
    }

    /// Id → words it was indexed under.
    #[must_use]
    pub fn search_item(&self, model: &EntityModel, id: &Id) -> String {
        format!("{}{}:se:i:{id}", self.prefix, model.name)
    }

    /// Last time an instance was indexed for search.
    #[must_use]
    pub fn search_marker(&self, model: &EntityModel, id: &Id) -> String {
        format!("{}{}:se:m:{id}", self.prefix, model.name)
    }

    /// Generic key-value facade namespace. Model names never start with
    /// `__`, so these keys cannot meet model keys.
    #[must_use]
    pub fn kv(&self, key: &str) -> String {
        format!("{}__kv:{key}", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("ks.")
    }
}
