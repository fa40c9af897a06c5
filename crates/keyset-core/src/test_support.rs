//! Shared fixtures for unit tests: a handful of models, a backend that fails
//! on demand, and a capturing metrics sink.

use crate::{
    Error,
    db::{
        Session,
        store::{Backend, Capabilities, MemoryStore, StoreError},
    },
    model::{
        entity::EntityModel,
        field::{FieldModel, ScalarKind},
    },
    obs::sink::{MetricsEvent, MetricsSink},
    traits::EntityKind,
    value::{Id, Row, Value},
};
use parking_lot::Mutex;
use std::{collections::BTreeSet, ops::Bound, sync::Arc};

///
/// MODELS
///

static PERSON_FIELDS: [FieldModel; 5] = [
    FieldModel::scalar("name", ScalarKind::Str).unique(),
    FieldModel::scalar("age", ScalarKind::Int).indexed(),
    FieldModel::scalar("city", ScalarKind::Str).indexed(),
    FieldModel::many_to_many("friends", &PERSON_MODEL, "friends"),
    FieldModel::many_to_many("groups", &GROUP_MODEL, "members"),
];
pub(crate) static PERSON_MODEL: EntityModel =
    EntityModel::new("test_support::Person", "person", &PERSON_FIELDS);

static GROUP_FIELDS: [FieldModel; 2] = [
    FieldModel::scalar("name", ScalarKind::Str).unique(),
    FieldModel::many_to_many("members", &PERSON_MODEL, "groups"),
];
pub(crate) static GROUP_MODEL: EntityModel =
    EntityModel::new("test_support::Group", "group", &GROUP_FIELDS);

static NUMERIC_FIELDS: [FieldModel; 2] = [
    FieldModel::scalar("pv", ScalarKind::Float).indexed(),
    FieldModel::scalar("label", ScalarKind::Str),
];
pub(crate) static NUMERIC_MODEL: EntityModel =
    EntityModel::new("test_support::NumericData", "numeric", &NUMERIC_FIELDS);

static AUTHOR_FIELDS: [FieldModel; 2] = [
    FieldModel::scalar("name", ScalarKind::Str).unique(),
    FieldModel::text("bio"),
];
pub(crate) static AUTHOR_MODEL: EntityModel =
    EntityModel::new("test_support::Author", "author", &AUTHOR_FIELDS);

static BOOK_FIELDS: [FieldModel; 4] = [
    FieldModel::text("title").required(),
    FieldModel::foreign_key("author", &AUTHOR_MODEL),
    FieldModel::scalar("year", ScalarKind::Int).indexed(),
    FieldModel::scalar("genre", ScalarKind::Str).indexed(),
];
pub(crate) static BOOK_MODEL: EntityModel =
    EntityModel::new("test_support::Book", "book", &BOOK_FIELDS);

fn text(row: &Row, field: &str) -> Option<String> {
    row.get(field).and_then(Value::as_text).map(str::to_string)
}

///
/// Person
///

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Person {
    pub(crate) id: Option<Id>,
    pub(crate) name: Option<String>,
    pub(crate) age: i64,
    pub(crate) city: Option<String>,
}

impl Person {
    pub(crate) fn new(name: &str, age: i64) -> Self {
        Self {
            id: None,
            name: Some(name.to_string()),
            age,
            city: None,
        }
    }

    pub(crate) fn in_city(mut self, city: &str) -> Self {
        self.city = Some(city.to_string());
        self
    }

    pub(crate) fn without_name(mut self) -> Self {
        self.name = None;
        self
    }

    pub(crate) fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }
}

impl EntityKind for Person {
    const MODEL: &'static EntityModel = &PERSON_MODEL;

    fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: Id) {
        self.id = Some(id);
    }

    fn to_row(&self) -> Row {
        Row::from([
            ("name".to_string(), Value::from(self.name.clone())),
            ("age".to_string(), Value::from(self.age)),
            ("city".to_string(), Value::from(self.city.clone())),
        ])
    }

    fn from_row(id: Id, row: Row) -> Result<Self, Error> {
        Ok(Self {
            id: Some(id),
            name: text(&row, "name"),
            age: row.get("age").and_then(Value::as_int).unwrap_or_default(),
            city: text(&row, "city"),
        })
    }
}

///
/// Group
///

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Group {
    pub(crate) id: Option<Id>,
    pub(crate) name: String,
}

impl Group {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
        }
    }
}

impl EntityKind for Group {
    const MODEL: &'static EntityModel = &GROUP_MODEL;

    fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: Id) {
        self.id = Some(id);
    }

    fn to_row(&self) -> Row {
        Row::from([("name".to_string(), Value::from(self.name.as_str()))])
    }

    fn from_row(id: Id, row: Row) -> Result<Self, Error> {
        Ok(Self {
            id: Some(id),
            name: text(&row, "name").unwrap_or_default(),
        })
    }
}

///
/// NumericData
///

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct NumericData {
    pub(crate) id: Option<Id>,
    pub(crate) pv: f64,
    pub(crate) label: Option<String>,
}

impl NumericData {
    pub(crate) const fn new(pv: f64) -> Self {
        Self {
            id: None,
            pv,
            label: None,
        }
    }
}

impl EntityKind for NumericData {
    const MODEL: &'static EntityModel = &NUMERIC_MODEL;

    fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: Id) {
        self.id = Some(id);
    }

    fn to_row(&self) -> Row {
        Row::from([
            ("pv".to_string(), Value::from(self.pv)),
            ("label".to_string(), Value::from(self.label.clone())),
        ])
    }

    fn from_row(id: Id, row: Row) -> Result<Self, Error> {
        Ok(Self {
            id: Some(id),
            pv: row.get("pv").and_then(Value::as_float).unwrap_or_default(),
            label: text(&row, "label"),
        })
    }
}

///
/// Author
///

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Author {
    pub(crate) id: Option<Id>,
    pub(crate) name: String,
    pub(crate) bio: Option<String>,
}

impl Author {
    pub(crate) fn new(name: &str, bio: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            bio: Some(bio.to_string()),
        }
    }
}

impl EntityKind for Author {
    const MODEL: &'static EntityModel = &AUTHOR_MODEL;

    fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: Id) {
        self.id = Some(id);
    }

    fn to_row(&self) -> Row {
        Row::from([
            ("name".to_string(), Value::from(self.name.as_str())),
            ("bio".to_string(), Value::from(self.bio.clone())),
        ])
    }

    fn from_row(id: Id, row: Row) -> Result<Self, Error> {
        Ok(Self {
            id: Some(id),
            name: text(&row, "name").unwrap_or_default(),
            bio: text(&row, "bio"),
        })
    }
}

///
/// Book
///

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Book {
    pub(crate) id: Option<Id>,
    pub(crate) title: String,
    pub(crate) author: Option<Id>,
    pub(crate) year: i64,
    pub(crate) genre: Option<String>,
}

impl Book {
    pub(crate) fn new(title: &str, year: i64) -> Self {
        Self {
            id: None,
            title: title.to_string(),
            author: None,
            year,
            genre: None,
        }
    }

    pub(crate) fn by(mut self, author: &Author) -> Self {
        self.author = author.id.clone();
        self
    }

    pub(crate) fn genre(mut self, genre: &str) -> Self {
        self.genre = Some(genre.to_string());
        self
    }
}

impl EntityKind for Book {
    const MODEL: &'static EntityModel = &BOOK_MODEL;

    fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    fn set_id(&mut self, id: Id) {
        self.id = Some(id);
    }

    fn to_row(&self) -> Row {
        Row::from([
            ("title".to_string(), Value::from(self.title.as_str())),
            ("author".to_string(), Value::from(self.author.clone())),
            ("year".to_string(), Value::from(self.year)),
            ("genre".to_string(), Value::from(self.genre.clone())),
        ])
    }

    fn from_row(id: Id, row: Row) -> Result<Self, Error> {
        Ok(Self {
            id: Some(id),
            title: text(&row, "title").unwrap_or_default(),
            author: row.get("author").and_then(Value::as_id).cloned(),
            year: row.get("year").and_then(Value::as_int).unwrap_or_default(),
            genre: text(&row, "genre"),
        })
    }
}

///
/// SESSIONS
///

pub(crate) fn memory_session() -> (Session, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let session = Session::new(store.clone());

    (session, store)
}

pub(crate) fn flaky_session() -> (Session, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::new(MemoryStore::new()));
    let session = Session::new(store.clone());

    (session, store)
}

///
/// FlakyStore
///
/// Memory store that fails one write on request: after `fail_after_writes(n)`
/// the next `n` writes succeed, the one after fails, and the store heals.
/// Never advertises atomic apply, so commits take the compensating path.
///

pub(crate) struct FlakyStore {
    inner: MemoryStore,
    remaining: Mutex<Option<usize>>,
}

impl FlakyStore {
    pub(crate) fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            remaining: Mutex::new(None),
        }
    }

    pub(crate) const fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub(crate) fn fail_after_writes(&self, writes: usize) {
        *self.remaining.lock() = Some(writes);
    }

    pub(crate) fn heal(&self) {
        *self.remaining.lock() = None;
    }

    fn write(&self, op: &'static str) -> Result<(), StoreError> {
        let mut remaining = self.remaining.lock();
        match *remaining {
            Some(0) => {
                *remaining = None;
                Err(StoreError::Unavailable(format!("injected failure on {op}")))
            }
            Some(n) => {
                *remaining = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Backend for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.write("set")?;
        self.inner.set(key, value)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.write("delete")?;
        self.inner.delete(key)
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key)
    }

    fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.write("add_to_set")?;
        self.inner.add_to_set(key, member)
    }

    fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.write("remove_from_set")?;
        self.inner.remove_from_set(key, member)
    }

    fn members(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        self.inner.members(key)
    }

    fn intersect(&self, keys: &[String]) -> Result<BTreeSet<String>, StoreError> {
        self.inner.intersect(keys)
    }

    fn union(&self, keys: &[String]) -> Result<BTreeSet<String>, StoreError> {
        self.inner.union(keys)
    }

    fn difference(&self, key: &str, minus: &[String]) -> Result<BTreeSet<String>, StoreError> {
        self.inner.difference(key, minus)
    }

    fn size(&self, key: &str) -> Result<usize, StoreError> {
        self.inner.size(key)
    }

    fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.write("add_scored")?;
        self.inner.add_scored(key, member, score)
    }

    fn remove_scored(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.write("remove_scored")?;
        self.inner.remove_scored(key, member)
    }

    fn score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        self.inner.score(key, member)
    }

    fn range_by_score(
        &self,
        key: &str,
        min: Bound<f64>,
        max: Bound<f64>,
    ) -> Result<BTreeSet<String>, StoreError> {
        self.inner.range_by_score(key, min, max)
    }

    fn flush(&self, prefix: &str) -> Result<usize, StoreError> {
        self.inner.flush(prefix)
    }
}

///
/// CaptureSink
///

#[derive(Default)]
pub(crate) struct CaptureSink {
    events: Mutex<Vec<MetricsEvent>>,
}

impl CaptureSink {
    pub(crate) fn events(&self) -> Vec<MetricsEvent> {
        self.events.lock().clone()
    }
}

impl MetricsSink for CaptureSink {
    fn record(&self, event: MetricsEvent) {
        self.events.lock().push(event);
    }
}
