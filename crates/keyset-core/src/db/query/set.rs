use crate::{
    Error,
    db::{
        Session,
        query::{
            Predicates,
            plan::{QueryPlan, ResultHandle, fetch_rows},
        },
        relation::{RelatedRows, load_relation},
    },
    obs::sink::{ExecKind, Span},
    traits::{EntityKind, require_id},
    value::{Id, LookupValue},
};
use std::{collections::BTreeMap, fmt, sync::OnceLock};

///
/// QuerySet
///
/// Lazy, immutable query over one model. Chaining returns a new set; the
/// plan is compiled at most once, executed at most once, and instances are
/// materialized at most once per set.
///

pub struct QuerySet<E: EntityKind> {
    session: Session,
    filters: Predicates,
    excludes: Predicates,
    restrict: Vec<String>,
    related: Vec<String>,
    empty: bool,

    plan: OnceLock<QueryPlan>,
    handle: OnceLock<ResultHandle>,
    loaded: OnceLock<Loaded<E>>,
}

struct Loaded<E> {
    items: Vec<E>,
    related: BTreeMap<String, RelatedRows>,
}

impl<E: EntityKind> QuerySet<E> {
    pub(crate) fn new(session: Session) -> Self {
        Self::restricted(session, Vec::new())
    }

    /// Query further limited to ids present in every one of `keys`
    /// (relation and search sets).
    pub(crate) const fn restricted(session: Session, keys: Vec<String>) -> Self {
        Self {
            session,
            filters: Predicates::new(),
            excludes: Predicates::new(),
            restrict: keys,
            related: Vec::new(),
            empty: false,
            plan: OnceLock::new(),
            handle: OnceLock::new(),
            loaded: OnceLock::new(),
        }
    }

    pub(crate) fn none(session: Session) -> Self {
        let mut set = Self::new(session);
        set.empty = true;
        set
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    // Same query, fresh caches.
    fn derive(&self) -> Self {
        Self {
            session: self.session.clone(),
            filters: self.filters.clone(),
            excludes: self.excludes.clone(),
            restrict: self.restrict.clone(),
            related: self.related.clone(),
            empty: self.empty,
            plan: OnceLock::new(),
            handle: OnceLock::new(),
            loaded: OnceLock::new(),
        }
    }

    // ------------------------------------------------------------------
    // Chaining
    // ------------------------------------------------------------------

    /// Narrow by positive predicates. Keys already present on this set keep
    /// their existing value.
    #[must_use]
    pub fn filter<I, K, V>(&self, predicates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<LookupValue>,
    {
        let mut next = self.derive();
        next.filters = merge(predicates, &self.filters);
        next
    }

    /// Remove instances matching any of `predicates`. Keys already present
    /// keep their existing value.
    #[must_use]
    pub fn exclude<I, K, V>(&self, predicates: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<LookupValue>,
    {
        let mut next = self.derive();
        next.excludes = merge(predicates, &self.excludes);
        next
    }

    /// Load `field`'s related instances alongside the results, one batch
    /// per field.
    #[must_use]
    pub fn select_related(&self, field: &str) -> Self {
        let mut next = self.derive();
        if !next.related.iter().any(|name| name == field) {
            next.related.push(field.to_string());
        }
        next
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// The compiled plan. Compilation errors surface here, before I/O.
    pub fn plan(&self) -> Result<&QueryPlan, Error> {
        if let Some(plan) = self.plan.get() {
            return Ok(plan);
        }

        let plan = if self.empty {
            QueryPlan::empty(E::MODEL, self.session.keys())
        } else {
            QueryPlan::build(
                E::MODEL,
                self.session.keys(),
                &self.filters,
                &self.excludes,
                &self.restrict,
            )?
        };

        Ok(self.plan.get_or_init(|| plan))
    }

    /// Compile without executing.
    pub fn prepare(&self) -> Result<(), Error> {
        self.plan().map(|_| ())
    }

    fn handle(&self) -> Result<&ResultHandle, Error> {
        if let Some(handle) = self.handle.get() {
            return Ok(handle);
        }

        let plan = self.plan()?;
        let handle = self
            .session
            .with_metrics(|| plan.execute(self.session.backend().as_ref()))?;

        Ok(self.handle.get_or_init(|| handle))
    }

    fn loaded(&self) -> Result<&Loaded<E>, Error> {
        if let Some(loaded) = self.loaded.get() {
            return Ok(loaded);
        }

        let loaded = self.session.with_metrics(|| self.load())?;

        Ok(self.loaded.get_or_init(|| loaded))
    }

    fn load(&self) -> Result<Loaded<E>, Error> {
        let mut span = Span::new(ExecKind::Load, E::MODEL);

        let ids = self.handle()?.ids(self.session.backend().as_ref())?;
        let items = fetch_rows(&self.session, E::MODEL, &ids)?
            .into_iter()
            .map(|(id, row)| E::from_row(id, row))
            .collect::<Result<Vec<_>, _>>()?;

        let mut related = BTreeMap::new();
        for field in &self.related {
            related.insert(
                field.clone(),
                load_relation(&self.session, field, &items)?,
            );
        }

        span.set_rows(items.len() as u64);

        Ok(Loaded { items, related })
    }

    // ------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------

    /// Number of matches. The unrestricted query is one cardinality read.
    pub fn count(&self) -> Result<usize, Error> {
        if let Some(loaded) = self.loaded.get() {
            return Ok(loaded.items.len());
        }

        Ok(self.handle()?.count(self.session.backend().as_ref())?)
    }

    pub fn exists(&self) -> Result<bool, Error> {
        Ok(self.count()? > 0)
    }

    /// Matching ids without loading rows.
    pub fn ids(&self) -> Result<Vec<Id>, Error> {
        if let Some(loaded) = self.loaded.get() {
            return Ok(loaded.items.iter().filter_map(E::id).cloned().collect());
        }

        Ok(self.handle()?.ids(self.session.backend().as_ref())?)
    }

    /// Materialized instances, in id order.
    pub fn items(&self) -> Result<&[E], Error> {
        Ok(&self.loaded()?.items)
    }

    pub fn iter(&self) -> Result<std::slice::Iter<'_, E>, Error> {
        Ok(self.items()?.iter())
    }

    pub fn nth(&self, index: usize) -> Result<Option<&E>, Error> {
        Ok(self.items()?.get(index))
    }

    pub fn first(&self) -> Result<Option<&E>, Error> {
        self.nth(0)
    }

    pub fn to_vec(&self) -> Result<Vec<E>, Error> {
        Ok(self.items()?.to_vec())
    }

    /// The single match. Zero or several matches is `NonUnique`.
    pub fn get(&self) -> Result<E, Error> {
        match self.items()? {
            [item] => Ok(item.clone()),
            items => Err(Error::NonUnique { count: items.len() }),
        }
    }

    /// Delete every match in one transaction. Returns the number deleted.
    pub fn delete(&self) -> Result<usize, Error> {
        let items = self.items()?;
        let mut txn = self.session.begin_named(format!("delete:{}", E::MODEL.name));

        let mut deleted = 0;
        for item in items {
            if txn.delete(item)? {
                deleted += 1;
            }
        }
        txn.commit()?;

        Ok(deleted)
    }

    /// Instances related to `item` through `field`.
    ///
    /// Served from the `select_related` cache when the field was selected,
    /// otherwise fetched now.
    pub fn related<T: EntityKind>(&self, item: &E, field: &str) -> Result<Vec<T>, Error> {
        let id = require_id(item)?;
        let loaded = self.loaded()?;

        match loaded.related.get(field) {
            Some(rows) => rows.instances::<T>(E::MODEL, field, id),
            None => load_relation(&self.session, field, std::slice::from_ref(item))?
                .instances::<T>(E::MODEL, field, id),
        }
    }
}

fn merge<I, K, V>(predicates: I, existing: &Predicates) -> Predicates
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<LookupValue>,
{
    let mut merged: Predicates = predicates
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect();
    merged.extend(existing.iter().map(|(k, v)| (k.clone(), v.clone())));

    merged
}

impl<E: EntityKind> Clone for QuerySet<E> {
    fn clone(&self) -> Self {
        self.derive()
    }
}

impl<E: EntityKind> fmt::Debug for QuerySet<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &E::MODEL.name)
            .field("filters", &self.filters)
            .field("excludes", &self.excludes)
            .field("restrict", &self.restrict)
            .field("loaded", &self.loaded.get().is_some())
            .finish()
    }
}

impl<E: EntityKind> fmt::Display for QuerySet<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn predicates(f: &mut fmt::Formatter<'_>, label: &str, preds: &Predicates) -> fmt::Result {
            if preds.is_empty() {
                return Ok(());
            }
            write!(f, ".{label}(")?;
            for (i, (key, value)) in preds.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key}={value}")?;
            }
            write!(f, ")")
        }

        if let Some(loaded) = self.loaded.get() {
            write!(f, "[")?;
            for (i, item) in loaded.items.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                match item.id() {
                    Some(id) => write!(f, "{} {id}", E::MODEL.name)?,
                    None => write!(f, "{} (unsaved)", E::MODEL.name)?,
                }
            }
            return write!(f, "]");
        }

        write!(f, "{}", E::MODEL.name)?;
        if self.empty {
            return write!(f, ".none()");
        }
        predicates(f, "filter", &self.filters)?;
        predicates(f, "exclude", &self.excludes)
    }
}
