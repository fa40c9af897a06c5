//! Module: db::kv
//! Responsibility: plain key-value access to the backend, outside any model,
//! namespaced under the session prefix.
//! Does not own: atomicity. `incr`/`decr` read and then write.

use crate::{
    Error,
    db::{Session, store::StoreError},
    serialize::{deserialize, serialize},
};
use serde::{Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;

///
/// KvFacade
///
/// Cache-style access to arbitrary serializable values. Keys are given
/// without the session prefix.
///

#[derive(Clone, Debug)]
pub struct KvFacade {
    session: Session,
}

impl KvFacade {
    pub(crate) const fn new(session: Session) -> Self {
        Self { session }
    }

    fn key(&self, key: &str) -> String {
        self.session.keys().kv(key)
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        match self.session.backend().get(&self.key(key))? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
        let bytes = serialize(value)?;
        self.session.backend().set(&self.key(key), bytes)?;

        Ok(())
    }

    pub fn set_many<'a, T, I>(&self, values: I) -> Result<(), Error>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = (&'a str, &'a T)>,
    {
        for (key, value) in values {
            self.set(key, value)?;
        }

        Ok(())
    }

    /// Values of every present key in `keys`, in one batch read. Missing
    /// keys are absent from the result.
    pub fn get_many<T: DeserializeOwned>(
        &self,
        keys: &[&str],
    ) -> Result<BTreeMap<String, T>, Error> {
        let full: Vec<String> = keys.iter().map(|key| self.key(key)).collect();
        let values = self.session.backend().mget(&full)?;

        let mut out = BTreeMap::new();
        for (key, value) in keys.iter().zip(values) {
            if let Some(bytes) = value {
                out.insert((*key).to_string(), deserialize(&bytes)?);
            }
        }

        Ok(out)
    }

    pub fn has_key(&self, key: &str) -> Result<bool, Error> {
        Ok(self.session.backend().exists(&self.key(key))?)
    }

    pub fn delete(&self, key: &str) -> Result<bool, Error> {
        Ok(self.session.backend().delete(&self.key(key))?)
    }

    /// Returns the number of keys that existed.
    pub fn delete_many(&self, keys: &[&str]) -> Result<usize, Error> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key)? {
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Add `delta` to the integer at `key` and return the new value.
    ///
    /// The key must already exist. Not atomic: concurrent increments of the
    /// same key can be lost.
    pub fn incr(&self, key: &str, delta: i64) -> Result<i64, Error> {
        let Some(current) = self.get::<i64>(key)? else {
            return Err(StoreError::NotFound {
                key: self.key(key),
            }
            .into());
        };

        let next = current.saturating_add(delta);
        self.set(key, &next)?;

        Ok(next)
    }

    /// Subtract `delta`; see [`Self::incr`].
    pub fn decr(&self, key: &str, delta: i64) -> Result<i64, Error> {
        self.incr(key, delta.saturating_neg())
    }
}
