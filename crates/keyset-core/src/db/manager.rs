use crate::{
    Error,
    db::{Session, query::QuerySet},
    traits::EntityKind,
    value::LookupValue,
};
use std::{fmt, marker::PhantomData};
use tracing::debug;

///
/// Manager
///
/// Per-model entry point: starts query sets and wraps the common
/// fetch-or-create pattern.
///

pub struct Manager<E: EntityKind> {
    session: Session,
    _marker: PhantomData<fn() -> E>,
}

impl<E: EntityKind> Manager<E> {
    pub(crate) const fn new(session: Session) -> Self {
        Self {
            session,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn all(&self) -> QuerySet<E> {
        QuerySet::new(self.session.clone())
    }

    /// A set that matches nothing and never touches the backend.
    #[must_use]
    pub fn none(&self) -> QuerySet<E> {
        QuerySet::none(self.session.clone())
    }

    #[must_use]
    pub fn filter<I, K, V>(&self, predicates: I) -> QuerySet<E>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<LookupValue>,
    {
        self.all().filter(predicates)
    }

    #[must_use]
    pub fn exclude<I, K, V>(&self, predicates: I) -> QuerySet<E>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<LookupValue>,
    {
        self.all().exclude(predicates)
    }

    pub fn count(&self) -> Result<usize, Error> {
        self.all().count()
    }

    /// The single instance matching `predicates`.
    pub fn get<I, K, V>(&self, predicates: I) -> Result<E, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<LookupValue>,
    {
        self.filter(predicates).get()
    }

    /// Save `entity` and return it with its id assigned.
    pub fn create(&self, mut entity: E) -> Result<E, Error> {
        self.session.save(&mut entity)?;
        Ok(entity)
    }

    /// Fetch the single match, or save `make()` when there is none.
    ///
    /// A concurrent creator can win the race on a unique field; the
    /// resulting violation is resolved by fetching again.
    pub fn get_or_create<K, V>(
        &self,
        predicates: impl IntoIterator<Item = (K, V)>,
        make: impl FnOnce() -> E,
    ) -> Result<(E, bool), Error>
    where
        K: Into<String>,
        V: Into<LookupValue>,
    {
        let set = self.filter(predicates);
        match set.get() {
            Ok(found) => Ok((found, false)),
            Err(err) if err.is_not_found() => match self.create(make()) {
                Ok(created) => Ok((created, true)),
                Err(Error::UniqueViolation(violation)) => {
                    debug!(%violation, "get_or_create lost a creation race, refetching");
                    Ok((set.clone().get()?, false))
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

impl<E: EntityKind> fmt::Debug for Manager<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("model", &E::MODEL.name)
            .field("session", &self.session)
            .finish()
    }
}

impl<E: EntityKind> Clone for Manager<E> {
    fn clone(&self) -> Self {
        Self::new(self.session.clone())
    }
}
