//! Module: db::search
//! Responsibility: keep a word → instance index for registered models in
//! step with their commits, and answer word queries as query sets.
//! Does not own: ranking or relevance. A search matches instances indexed
//! under every query word.
//! Boundary: index writes go through hook transactions like any other
//! write; the primary commit never waits on them.

mod words;


pub use words::{Lowercase, MinLength, StopWords, WordMiddleware};

use crate::{
    Error,
    db::{
        Session,
        commit::Transaction,
        event::{CommitEvent, IndexHook},
        query::{QueryError, QuerySet, fetch_rows},
        relation::RelationError,
        store::StoreOp,
    },
    error::ErrorClass,
    model::{
        entity::EntityModel,
        field::{FieldKind, FieldModel},
        validate::validate_row,
    },
    obs::sink::{self, MetricsEvent},
    serialize::{deserialize, serialize},
    traits::{EntityKind, require_id},
    value::{Id, Row, Value},
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{Arc, Weak},
};
use thiserror::Error as ThisError;
use tracing::{debug, info};

///
/// CONSTANTS
///

const HOOK_NAME: &str = "search";

///
/// SearchError
///

#[derive(Debug, ThisError)]
pub enum SearchError {
    #[error("{entity} is not registered for search")]
    NotRegistered { entity: &'static str },
}

impl SearchError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::NotRegistered { .. } => ErrorClass::Unsupported,
        }
    }
}

struct Stage {
    middleware: Arc<dyn WordMiddleware>,
    for_search: bool,
}

#[derive(Clone)]
struct Registration {
    model: &'static EntityModel,
    related: Vec<&'static FieldModel>,
}

#[derive(Clone, Copy, Debug, Default)]
struct WordDelta {
    inserts: u64,
    removes: u64,
    words: usize,
}

impl WordDelta {
    fn merge(&mut self, other: Self) {
        self.inserts += other.inserts;
        self.removes += other.removes;
        self.words += other.words;
    }

    fn record(self, model: &'static EntityModel) {
        if self.inserts > 0 || self.removes > 0 {
            sink::record(MetricsEvent::SearchDelta {
                entity_path: model.path,
                inserts: self.inserts,
                removes: self.removes,
            });
        }
    }
}

///
/// SearchEngine
///
/// Word index over the text fields of registered models. Each indexed
/// instance has a word set (`word → ids`) entry per word, an item set
/// (`id → words`) used to diff and remove its entries, and a marker with
/// the time it was last indexed.
///
/// Text passes through the word pipeline: split on non-alphanumerics, then
/// every middleware in order. The configured case folding, minimum length
/// and stop words are installed first and apply to indexing and searching.
///

pub struct SearchEngine {
    session: Session,
    this: Weak<Self>,
    middleware: RwLock<Vec<Stage>>,
    registered: RwLock<HashMap<&'static str, Registration>>,
}

impl SearchEngine {
    #[must_use]
    pub fn new(session: Session) -> Arc<Self> {
        let config = session.config().search.clone();

        let mut stages = Vec::new();
        if !config.case_sensitive {
            stages.push(Stage {
                middleware: Arc::new(Lowercase),
                for_search: true,
            });
        }
        if config.min_word_length > 1 {
            stages.push(Stage {
                middleware: Arc::new(MinLength(config.min_word_length)),
                for_search: true,
            });
        }
        let stop = StopWords::new(config.stop_words.iter().map(|word| {
            if config.case_sensitive {
                word.clone()
            } else {
                word.to_lowercase()
            }
        }));
        if !stop.is_empty() {
            stages.push(Stage {
                middleware: Arc::new(stop),
                for_search: true,
            });
        }

        Arc::new_cyclic(|this| Self {
            session,
            this: this.clone(),
            middleware: RwLock::new(stages),
            registered: RwLock::new(HashMap::new()),
        })
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Index `E` on every commit from now on. Text fields of the instances
    /// behind each `related` relation field are indexed with it.
    pub fn register<E: EntityKind>(&self, related: &[&str]) -> Result<(), Error> {
        let model = E::MODEL;

        let mut fields = Vec::with_capacity(related.len());
        for name in related {
            let field = model.field(name).ok_or_else(|| QueryError::UnknownField {
                entity: model.name,
                field: (*name).to_string(),
            })?;
            if field.relation_target().is_none() {
                return Err(RelationError::NotARelation {
                    entity: model.name,
                    field: (*name).to_string(),
                }
                .into());
            }
            fields.push(field);
        }

        self.registered.write().insert(
            model.path,
            Registration {
                model,
                related: fields,
            },
        );
        self.session.events().subscribe(
            model,
            Arc::new(SearchHook {
                engine: self.this.clone(),
            }),
        );
        debug!(entity = model.name, ?related, "model registered for search");

        Ok(())
    }

    /// Stop indexing `E`. Existing index entries are kept.
    pub fn unregister<E: EntityKind>(&self) -> bool {
        let removed = self.registered.write().remove(E::MODEL.path).is_some();
        if removed {
            self.session.events().unsubscribe(E::MODEL, HOOK_NAME);
        }

        removed
    }

    #[must_use]
    pub fn is_registered<E: EntityKind>(&self) -> bool {
        self.registered.read().contains_key(E::MODEL.path)
    }

    fn registration(&self, model: &'static EntityModel) -> Option<Registration> {
        self.registered.read().get(model.path).cloned()
    }

    fn require(&self, model: &'static EntityModel) -> Result<Registration, SearchError> {
        self.registration(model)
            .ok_or(SearchError::NotRegistered { entity: model.name })
    }

    // ------------------------------------------------------------------
    // Words
    // ------------------------------------------------------------------

    /// Append a middleware to the pipeline. With `for_search` unset it only
    /// runs when indexing, never on query text.
    pub fn add_word_middleware(&self, middleware: impl WordMiddleware + 'static, for_search: bool) {
        self.middleware.write().push(Stage {
            middleware: Arc::new(middleware),
            for_search,
        });
    }

    /// Indexable words in `text`, in order. Duplicates are kept.
    #[must_use]
    pub fn words_from_text(&self, text: &str, for_search: bool) -> Vec<String> {
        let mut words = words::split_text(text);
        if words.is_empty() {
            return words;
        }

        let stages: Vec<Arc<dyn WordMiddleware>> = self
            .middleware
            .read()
            .iter()
            .filter(|stage| stage.for_search || !for_search)
            .map(|stage| Arc::clone(&stage.middleware))
            .collect();
        for middleware in stages {
            words = middleware.process(words);
        }

        words
    }

    fn text_words(&self, model: &'static EntityModel, row: &Row, out: &mut BTreeSet<String>) {
        for field in model.text_fields() {
            if let Some(text) = row.get(field.name).and_then(Value::as_text) {
                out.extend(self.words_from_text(text, false));
            }
        }
    }

    // Own text fields plus the text fields of related instances, one level.
    fn item_words(
        &self,
        session: &Session,
        reg: &Registration,
        id: &Id,
        row: &Row,
    ) -> Result<BTreeSet<String>, Error> {
        let mut words = BTreeSet::new();
        self.text_words(reg.model, row, &mut words);

        for field in &reg.related {
            let (target, ids) = match field.kind {
                FieldKind::ForeignKey(target) => {
                    let Some(fk) = row.get(field.name).and_then(Value::as_id) else {
                        continue;
                    };
                    (target, vec![fk.clone()])
                }
                FieldKind::ManyToMany { target, .. } => {
                    let key = session.keys().link(reg.model, field.name, id);
                    let ids = session.backend().members(&key)?;
                    (target, ids.into_iter().map(Id::new).collect())
                }
                FieldKind::Scalar(_) | FieldKind::Text => continue,
            };

            for (_, related) in fetch_rows(session, target, &ids)? {
                self.text_words(target, &related, &mut words);
            }
        }

        Ok(words)
    }

    // ------------------------------------------------------------------
    // Index maintenance
    // ------------------------------------------------------------------

    // Buffer the writes that make the index match `row`: only words that
    // changed are touched, and the marker is refreshed.
    fn stage_index(
        &self,
        txn: &mut Transaction,
        reg: &Registration,
        id: &Id,
        row: &Row,
    ) -> Result<WordDelta, Error> {
        let session = txn.session().clone();
        let keys = session.keys();
        let model = reg.model;
        let member = id.as_str().to_string();

        let words = self.item_words(&session, reg, id, row)?;
        let item_key = keys.search_item(model, id);
        let current = session.backend().members(&item_key)?;

        let mut delta = WordDelta {
            words: words.len(),
            ..WordDelta::default()
        };
        for word in current.difference(&words) {
            txn.push_raw(StoreOp::RemoveFromSet {
                key: keys.search_word(model, word),
                member: member.clone(),
            })?;
            txn.push_raw(StoreOp::RemoveFromSet {
                key: item_key.clone(),
                member: word.clone(),
            })?;
            delta.removes += 1;
        }
        for word in words.difference(&current) {
            txn.push_raw(StoreOp::AddToSet {
                key: keys.search_word(model, word),
                member: member.clone(),
            })?;
            txn.push_raw(StoreOp::AddToSet {
                key: item_key.clone(),
                member: word.clone(),
            })?;
            delta.inserts += 1;
        }
        txn.push_raw(StoreOp::Set {
            key: keys.search_marker(model, id),
            value: serialize(&Utc::now())?,
        })?;

        Ok(delta)
    }

    fn stage_remove(
        txn: &mut Transaction,
        model: &'static EntityModel,
        id: &Id,
    ) -> Result<WordDelta, Error> {
        let session = txn.session().clone();
        let keys = session.keys();
        let item_key = keys.search_item(model, id);
        let words = session.backend().members(&item_key)?;

        for word in &words {
            txn.push_raw(StoreOp::RemoveFromSet {
                key: keys.search_word(model, word),
                member: id.as_str().to_string(),
            })?;
        }
        txn.push_raw(StoreOp::Delete { key: item_key })?;
        txn.push_raw(StoreOp::Delete {
            key: keys.search_marker(model, id),
        })?;

        Ok(WordDelta {
            removes: words.len() as u64,
            words: words.len(),
            ..WordDelta::default()
        })
    }

    /// Index one instance now, replacing whatever it was indexed under.
    /// Returns the number of words it is indexed under.
    pub fn index_item<E: EntityKind>(&self, item: &E) -> Result<usize, Error> {
        let reg = self.require(E::MODEL)?;
        let id = require_id(item)?.clone();
        let row = validate_row(E::MODEL, &item.to_row())?;

        self.session.with_metrics(|| -> Result<usize, Error> {
            let mut txn = self
                .session
                .begin_nested(format!("search:index:{}", E::MODEL.name));
            let delta = self.stage_index(&mut txn, &reg, &id, &row)?;
            txn.commit()?;
            delta.record(E::MODEL);

            Ok(delta.words)
        })
    }

    /// Remove every index entry of one instance. Returns the number of
    /// words it was indexed under.
    pub fn remove_item<E: EntityKind>(&self, item: &E) -> Result<usize, Error> {
        let id = require_id(item)?.clone();

        self.session.with_metrics(|| -> Result<usize, Error> {
            let mut txn = self
                .session
                .begin_nested(format!("search:remove:{}", E::MODEL.name));
            let delta = Self::stage_remove(&mut txn, E::MODEL, &id)?;
            txn.commit()?;
            delta.record(E::MODEL);

            Ok(delta.words)
        })
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Instances of `E` indexed under every word of `text`. Text with no
    /// indexable words matches nothing.
    pub fn search<E: EntityKind>(&self, text: &str) -> Result<QuerySet<E>, Error> {
        self.require(E::MODEL)?;

        let words: BTreeSet<String> = self.words_from_text(text, true).into_iter().collect();
        if words.is_empty() {
            return Ok(QuerySet::none(self.session.clone()));
        }
        debug!(entity = E::MODEL.name, ?words, "search");

        let keys = words
            .iter()
            .map(|word| self.session.keys().search_word(E::MODEL, word))
            .collect();

        Ok(QuerySet::restricted(self.session.clone(), keys))
    }

    /// When `id` was last indexed, if it is indexed at all.
    pub fn last_indexed<E: EntityKind>(&self, id: &Id) -> Result<Option<DateTime<Utc>>, Error> {
        let key = self.session.keys().search_marker(E::MODEL, id);

        match self.session.backend().get(&key)? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Bulk maintenance
    // ------------------------------------------------------------------

    /// Drop and rebuild the index of `E`. Returns the number of instances
    /// indexed.
    pub fn reindex<E: EntityKind>(&self) -> Result<usize, Error> {
        let reg = self.require(E::MODEL)?;
        self.session.with_metrics(|| self.reindex_model(&reg))
    }

    /// Rebuild the index of every registered model.
    pub fn reindex_all(&self) -> Result<usize, Error> {
        let regs: Vec<Registration> = self.registered.read().values().cloned().collect();

        self.session.with_metrics(|| -> Result<usize, Error> {
            let mut total = 0;
            for reg in &regs {
                total += self.reindex_model(reg)?;
            }
            Ok(total)
        })
    }

    fn reindex_model(&self, reg: &Registration) -> Result<usize, Error> {
        let model = reg.model;
        self.flush_model(model)?;

        let ids: Vec<Id> = self
            .session
            .backend()
            .members(&self.session.keys().all(model))?
            .into_iter()
            .map(Id::new)
            .collect();
        let rows = fetch_rows(&self.session, model, &ids)?;

        let mut txn = self
            .session
            .begin_nested(format!("search:reindex:{}", model.name));
        let mut delta = WordDelta::default();
        for (id, row) in &rows {
            delta.merge(self.stage_index(&mut txn, reg, id, row)?);
        }
        txn.commit()?;
        delta.record(model);
        info!(entity = model.name, instances = rows.len(), "search index rebuilt");

        Ok(rows.len())
    }

    /// Remove every search key of `E`. Returns the number of keys removed.
    pub fn flush<E: EntityKind>(&self) -> Result<usize, Error> {
        self.flush_model(E::MODEL)
    }

    /// Remove every search key of every registered model.
    pub fn flush_all(&self) -> Result<usize, Error> {
        let models: Vec<&'static EntityModel> = self
            .registered
            .read()
            .values()
            .map(|reg| reg.model)
            .collect();

        let mut total = 0;
        for model in models {
            total += self.flush_model(model)?;
        }

        Ok(total)
    }

    fn flush_model(&self, model: &'static EntityModel) -> Result<usize, Error> {
        let prefix = self.session.keys().search(model);
        let removed = self.session.backend().flush(&prefix)?;
        debug!(entity = model.name, removed, "search index flushed");

        Ok(removed)
    }
}

impl fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut models: Vec<&str> = self.registered.read().values().map(|r| r.model.name).collect();
        models.sort_unstable();

        f.debug_struct("SearchEngine")
            .field("models", &models)
            .field("middleware", &self.middleware.read().len())
            .finish_non_exhaustive()
    }
}

///
/// SearchHook
///
/// Commit hook for one engine. Holds the engine weakly: the engine owns
/// the session that owns the hook.
///

struct SearchHook {
    engine: Weak<SearchEngine>,
}

impl IndexHook for SearchHook {
    fn name(&self) -> &'static str {
        HOOK_NAME
    }

    fn on_commit(&self, event: &CommitEvent<'_>, txn: &mut Transaction) -> Result<(), Error> {
        let Some(engine) = self.engine.upgrade() else {
            return Ok(());
        };
        let Some(reg) = engine.registration(event.model) else {
            return Ok(());
        };

        let mut delta = WordDelta::default();
        for (id, row) in event.instances {
            delta.merge(engine.stage_index(txn, &reg, id, row)?);
        }
        delta.record(event.model);

        Ok(())
    }

    fn on_delete(&self, event: &CommitEvent<'_>, txn: &mut Transaction) -> Result<(), Error> {
        let mut delta = WordDelta::default();
        for (id, _) in event.instances {
            delta.merge(SearchEngine::stage_remove(txn, event.model, id)?);
        }
        delta.record(event.model);

        Ok(())
    }
}
