use crate::{
    Error,
    config::DbConfig,
    db::{
        commit::Transaction,
        event::EventBus,
        keyspace::KeySpace,
        kv::KvFacade,
        manager::Manager,
        relation::{ManyToManyManager, RelatedManager},
        store::Backend,
    },
    obs::sink::{MetricsSink, with_metrics_sink},
    traits::EntityKind,
    value::Id,
};
use std::{fmt, sync::Arc};

///
/// Session
///
/// Handle to one backend plus everything needed to query and maintain it.
/// Cheap to clone; clones share the backend and hook registry.
///

#[derive(Clone)]
pub struct Session {
    backend: Arc<dyn Backend>,
    keys: KeySpace,
    config: Arc<DbConfig>,
    events: Arc<EventBus>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl Session {
    /// Session over `backend` with the default configuration.
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let config = DbConfig::default();

        Self {
            backend,
            keys: KeySpace::new(config.key_prefix.clone()),
            config: Arc::new(config),
            events: Arc::new(EventBus::default()),
            metrics: None,
        }
    }

    pub fn with_config(backend: Arc<dyn Backend>, config: DbConfig) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self {
            backend,
            keys: KeySpace::new(config.key_prefix.clone()),
            config: Arc::new(config),
            events: Arc::new(EventBus::default()),
            metrics: None,
        })
    }

    /// Route this session's metrics events to `sink` instead of the global
    /// counters.
    #[must_use]
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    #[must_use]
    pub const fn keys(&self) -> &KeySpace {
        &self.keys
    }

    #[must_use]
    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) fn with_metrics<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.metrics {
            Some(sink) => with_metrics_sink(Arc::clone(sink), f),
            None => f(),
        }
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Open a transaction that fires index hooks after it commits.
    #[must_use]
    pub fn begin(&self) -> Transaction {
        Transaction::new(self.clone(), "txn", true)
    }

    #[must_use]
    pub fn begin_named(&self, name: impl Into<String>) -> Transaction {
        Transaction::new(self.clone(), name, true)
    }

    // Hook transactions never re-fire hooks.
    pub(crate) fn begin_nested(&self, name: impl Into<String>) -> Transaction {
        Transaction::new(self.clone(), name, false)
    }

    /// Manager for model `E`.
    #[must_use]
    pub fn query<E: EntityKind>(&self) -> Manager<E> {
        Manager::new(self.clone())
    }

    /// Save one instance in its own transaction.
    pub fn save<E: EntityKind>(&self, entity: &mut E) -> Result<Id, Error> {
        let mut txn = self.begin();
        let id = txn.save(entity)?;
        txn.commit()?;

        Ok(id)
    }

    /// Delete one instance in its own transaction. Returns `false` if it
    /// was already gone.
    pub fn delete<E: EntityKind>(&self, entity: &E) -> Result<bool, Error> {
        let mut txn = self.begin();
        let deleted = txn.delete(entity)?;
        txn.commit()?;

        Ok(deleted)
    }

    /// Reverse foreign-key manager: instances of `C` whose `field` points
    /// at `parent`.
    pub fn related<C: EntityKind, P: EntityKind>(
        &self,
        parent: &P,
        field: &str,
    ) -> Result<RelatedManager<C>, Error> {
        RelatedManager::new(self.clone(), parent, field)
    }

    /// Many-to-many manager for `source.field`, whose targets are `T`.
    pub fn many_to_many<T: EntityKind, S: EntityKind>(
        &self,
        source: &S,
        field: &str,
    ) -> Result<ManyToManyManager<T>, Error> {
        ManyToManyManager::new(self.clone(), source, field)
    }

    #[must_use]
    pub fn kv(&self) -> KvFacade {
        KvFacade::new(self.clone())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("backend", &self.backend.name())
            .field("prefix", &self.keys.prefix())
            .finish_non_exhaustive()
    }
}
