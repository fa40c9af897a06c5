//! Module: db::relation
//! Responsibility: relation navigation. Reverse foreign keys reuse the
//! foreign-key index set; many-to-many relations keep a link set on each
//! side, updated together in one commit.

use crate::{
    Error,
    db::{
        Session,
        commit::LinkChange,
        query::{QueryError, QuerySet, fetch_rows},
    },
    model::{
        entity::EntityModel,
        field::{FieldKind, FieldModel},
    },
    traits::EntityKind,
    value::{Id, LookupValue, Row, Value},
};
use std::{
    collections::{BTreeSet, HashMap},
    marker::PhantomData,
};
use thiserror::Error as ThisError;

///
/// RelationError
///

#[derive(Debug, ThisError)]
pub enum RelationError {
    #[error("{entity}.{field} is not a relation field")]
    NotARelation { entity: &'static str, field: String },

    #[error("{entity}.{field} relates to {expected}, not {actual}")]
    TypeMismatch {
        entity: &'static str,
        field: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{entity} instance has not been saved")]
    NotPersisted { entity: &'static str },
}

fn relation_field(
    model: &'static EntityModel,
    field: &str,
) -> Result<&'static FieldModel, Error> {
    model.field(field).ok_or_else(|| {
        QueryError::UnknownField {
            entity: model.name,
            field: field.to_string(),
        }
        .into()
    })
}

fn persisted_id<E: EntityKind>(entity: &E) -> Result<Id, RelationError> {
    entity.id().cloned().ok_or(RelationError::NotPersisted {
        entity: E::MODEL.name,
    })
}

fn check_target(
    model: &'static EntityModel,
    field: &str,
    target: &'static EntityModel,
    actual: &'static EntityModel,
) -> Result<(), RelationError> {
    if target.same_as(actual) {
        Ok(())
    } else {
        Err(RelationError::TypeMismatch {
            entity: model.name,
            field: field.to_string(),
            expected: target.name,
            actual: actual.name,
        })
    }
}

///
/// RelatedRows
///
/// Related instances loaded for a batch of source instances: which target
/// ids each source points at, and the target rows themselves.
///

#[derive(Debug)]
pub(crate) struct RelatedRows {
    target: &'static EntityModel,
    links: HashMap<Id, Vec<Id>>,
    rows: HashMap<Id, Row>,
}

impl RelatedRows {
    pub(crate) fn instances<T: EntityKind>(
        &self,
        source: &'static EntityModel,
        field: &str,
        id: &Id,
    ) -> Result<Vec<T>, Error> {
        check_target(source, field, self.target, T::MODEL)?;

        let Some(targets) = self.links.get(id) else {
            return Ok(Vec::new());
        };
        targets
            .iter()
            .filter_map(|target| {
                self.rows
                    .get(target)
                    .map(|row| T::from_row(target.clone(), row.clone()))
            })
            .collect()
    }
}

/// Load `field`'s related rows for every instance in `items` with one
/// link read per instance and one batched row read overall.
pub(crate) fn load_relation<E: EntityKind>(
    session: &Session,
    field: &str,
    items: &[E],
) -> Result<RelatedRows, Error> {
    let model = E::MODEL;
    let field = relation_field(model, field)?;

    let (target, links) = match field.kind {
        FieldKind::ForeignKey(target) => {
            let links = items
                .iter()
                .filter_map(|item| {
                    let id = item.id()?.clone();
                    let fk = item.to_row().get(field.name)?.as_id()?.clone();
                    Some((id, vec![fk]))
                })
                .collect::<HashMap<_, _>>();
            (target, links)
        }
        FieldKind::ManyToMany { target, .. } => {
            let ids: Vec<Id> = items.iter().filter_map(E::id).cloned().collect();
            let keys: Vec<String> = ids
                .iter()
                .map(|id| session.keys().link(model, field.name, id))
                .collect();
            let sets = session.backend().members_many(&keys)?;
            let links = ids
                .into_iter()
                .zip(sets)
                .map(|(id, members)| (id, members.into_iter().map(Id::new).collect::<Vec<_>>()))
                .collect::<HashMap<_, _>>();
            (target, links)
        }
        FieldKind::Scalar(_) | FieldKind::Text => {
            return Err(RelationError::NotARelation {
                entity: model.name,
                field: field.name.to_string(),
            }
            .into());
        }
    };

    let wanted: Vec<Id> = links
        .values()
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let rows = fetch_rows(session, target, &wanted)?.into_iter().collect();

    Ok(RelatedRows {
        target,
        links,
        rows,
    })
}

///
/// RelatedManager
///
/// Reverse side of a foreign key: the `C` instances pointing at one
/// parent. Queries are restricted to the foreign-key index set.
///

pub struct RelatedManager<C: EntityKind> {
    session: Session,
    key: String,
    _marker: PhantomData<fn() -> C>,
}

impl<C: EntityKind> RelatedManager<C> {
    pub(crate) fn new<P: EntityKind>(
        session: Session,
        parent: &P,
        field: &str,
    ) -> Result<Self, Error> {
        let fk = relation_field(C::MODEL, field)?;
        let FieldKind::ForeignKey(target) = fk.kind else {
            return Err(RelationError::NotARelation {
                entity: C::MODEL.name,
                field: field.to_string(),
            }
            .into());
        };
        check_target(C::MODEL, field, target, P::MODEL)?;

        let id = persisted_id(parent)?;
        let token = Value::from(&id).index_token().unwrap_or_default();
        let key = session.keys().index(C::MODEL, fk.name, &token);

        Ok(Self {
            session,
            key,
            _marker: PhantomData,
        })
    }

    #[must_use]
    pub fn all(&self) -> QuerySet<C> {
        QuerySet::restricted(self.session.clone(), vec![self.key.clone()])
    }

    #[must_use]
    pub fn filter<I, K, V>(&self, predicates: I) -> QuerySet<C>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<LookupValue>,
    {
        self.all().filter(predicates)
    }

    #[must_use]
    pub fn exclude<I, K, V>(&self, predicates: I) -> QuerySet<C>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<LookupValue>,
    {
        self.all().exclude(predicates)
    }

    pub fn count(&self) -> Result<usize, Error> {
        Ok(self.session.backend().size(&self.key)?)
    }
}

///
/// ManyToManyManager
///
/// One instance's side of a symmetric many-to-many relation with targets
/// of type `T`. Every change updates both sides in one commit.
///

pub struct ManyToManyManager<T: EntityKind> {
    session: Session,
    source: &'static EntityModel,
    field: &'static str,
    related_name: &'static str,
    source_id: Id,
    key: String,
    _marker: PhantomData<fn() -> T>,
}

impl<T: EntityKind> ManyToManyManager<T> {
    pub(crate) fn new<S: EntityKind>(
        session: Session,
        source: &S,
        field: &str,
    ) -> Result<Self, Error> {
        let link = relation_field(S::MODEL, field)?;
        let FieldKind::ManyToMany {
            target,
            related_name,
        } = link.kind
        else {
            return Err(RelationError::NotARelation {
                entity: S::MODEL.name,
                field: field.to_string(),
            }
            .into());
        };
        check_target(S::MODEL, field, target, T::MODEL)?;

        let source_id = persisted_id(source)?;
        let key = session.keys().link(S::MODEL, link.name, &source_id);

        Ok(Self {
            session,
            source: S::MODEL,
            field: link.name,
            related_name,
            source_id,
            key,
            _marker: PhantomData,
        })
    }

    fn change(&self, value: &T, add: bool) -> Result<bool, Error> {
        let target_id = persisted_id(value)?;
        if self.source.same_as(T::MODEL) && target_id == self.source_id {
            return Ok(false);
        }

        let mut txn = self
            .session
            .begin_named(format!("link:{}.{}", self.source.name, self.field));
        txn.link(LinkChange {
            add,
            source: self.source,
            field: self.field,
            source_id: self.source_id.clone(),
            target: T::MODEL,
            related_name: self.related_name,
            target_id,
        })?;
        txn.commit()?;

        Ok(true)
    }

    /// Link `value` on both sides. Linking an instance to itself is a
    /// no-op and returns `false`.
    pub fn add(&self, value: &T) -> Result<bool, Error> {
        self.change(value, true)
    }

    /// Unlink `value` on both sides.
    pub fn remove(&self, value: &T) -> Result<bool, Error> {
        self.change(value, false)
    }

    /// Unlink every current member, in one commit.
    pub fn clear(&self) -> Result<usize, Error> {
        let members = self.session.backend().members(&self.key)?;
        let mut txn = self
            .session
            .begin_named(format!("unlink:{}.{}", self.source.name, self.field));
        for member in &members {
            txn.link(LinkChange {
                add: false,
                source: self.source,
                field: self.field,
                source_id: self.source_id.clone(),
                target: T::MODEL,
                related_name: self.related_name,
                target_id: Id::new(member.clone()),
            })?;
        }
        txn.commit()?;

        Ok(members.len())
    }

    pub fn contains(&self, value: &T) -> Result<bool, Error> {
        let id = persisted_id(value)?;
        Ok(self.session.backend().is_member(&self.key, id.as_str())?)
    }

    #[must_use]
    pub fn all(&self) -> QuerySet<T> {
        QuerySet::restricted(self.session.clone(), vec![self.key.clone()])
    }

    #[must_use]
    pub fn filter<I, K, V>(&self, predicates: I) -> QuerySet<T>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<LookupValue>,
    {
        self.all().filter(predicates)
    }

    #[must_use]
    pub fn exclude<I, K, V>(&self, predicates: I) -> QuerySet<T>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<LookupValue>,
    {
        self.all().exclude(predicates)
    }

    pub fn count(&self) -> Result<usize, Error> {
        Ok(self.session.backend().size(&self.key)?)
    }
}
