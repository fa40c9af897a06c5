use crate::{
    Error,
    db::{
        Session,
        keyspace::KeySpace,
        query::{
            Predicates, QueryError,
            compile::{FilterClause, LookupCompiler, UniqueTarget},
        },
        store::{Backend, StoreError, score_in_bounds},
    },
    model::entity::EntityModel,
    obs::sink::{self, MetricsEvent, PlanKind},
    serialize::deserialize,
    value::{Id, Row},
};
use sha2::{Digest, Sha256};
use std::{collections::BTreeSet, fmt};
use tracing::debug;

///
/// QueryPlan
///
/// Executable description of one query: either a direct unique fetch or
/// set algebra over index sets. Built once per `QuerySet`.
///

#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    model: &'static EntityModel,
    all_key: String,
    shape: PlanShape,
}

#[derive(Clone, Debug, PartialEq)]
enum PlanShape {
    Empty,
    Unique {
        target: UniqueTarget,
        exclude: Vec<FilterClause>,
        restrict: Vec<String>,
    },
    Sets {
        include: Vec<FilterClause>,
        exclude: Vec<FilterClause>,
        restrict: Vec<String>,
    },
}

///
/// ResultHandle
///
/// Executed plan. The unrestricted case stays lazy so counting it is a
/// single cardinality read.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResultHandle {
    All { key: String },
    Ids(Vec<Id>),
}

impl ResultHandle {
    pub fn count(&self, backend: &dyn Backend) -> Result<usize, StoreError> {
        match self {
            Self::All { key } => backend.size(key),
            Self::Ids(ids) => Ok(ids.len()),
        }
    }

    pub fn ids(&self, backend: &dyn Backend) -> Result<Vec<Id>, StoreError> {
        match self {
            Self::All { key } => Ok(backend.members(key)?.into_iter().map(Id::new).collect()),
            Self::Ids(ids) => Ok(ids.clone()),
        }
    }
}

impl QueryPlan {
    /// Compile `filters` and `excludes` into a plan. Fails before any I/O.
    pub fn build(
        model: &'static EntityModel,
        keys: &KeySpace,
        filters: &Predicates,
        excludes: &Predicates,
        restrict: &[String],
    ) -> Result<Self, QueryError> {
        let compiler = LookupCompiler::new(model, keys);
        let compiled = compiler.compile(filters)?;
        let exclude = compiler.compile_exclusions(excludes)?;
        let restrict = restrict.to_vec();

        let shape = match compiled.unique {
            Some(target) => PlanShape::Unique {
                target,
                exclude,
                restrict,
            },
            None => PlanShape::Sets {
                include: compiled.clauses,
                exclude,
                restrict,
            },
        };

        Ok(Self {
            model,
            all_key: keys.all(model),
            shape,
        })
    }

    /// A plan known to match nothing.
    #[must_use]
    pub fn empty(model: &'static EntityModel, keys: &KeySpace) -> Self {
        Self {
            model,
            all_key: keys.all(model),
            shape: PlanShape::Empty,
        }
    }

    #[must_use]
    pub const fn model(&self) -> &'static EntityModel {
        self.model
    }

    #[must_use]
    pub fn kind(&self) -> PlanKind {
        match &self.shape {
            PlanShape::Empty => PlanKind::Empty,
            PlanShape::Unique { .. } => PlanKind::Unique,
            PlanShape::Sets {
                include,
                exclude,
                restrict,
            } if include.is_empty() && exclude.is_empty() && restrict.is_empty() => PlanKind::All,
            PlanShape::Sets { .. } => PlanKind::Index,
        }
    }

    /// Stable hex digest of the plan, for logs.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.to_string().as_bytes());
        digest[..8].iter().map(|byte| format!("{byte:02x}")).collect()
    }

    /// Run the plan. Unique plans read one claim; set plans combine sets
    /// server-side where possible.
    pub fn execute(&self, backend: &dyn Backend) -> Result<ResultHandle, StoreError> {
        let kind = self.kind();
        sink::record(MetricsEvent::Plan { kind });
        debug!(
            entity = self.model.name,
            plan = ?kind,
            fingerprint = %self.fingerprint(),
            "executing query plan"
        );

        match &self.shape {
            PlanShape::Empty => Ok(ResultHandle::Ids(Vec::new())),
            PlanShape::Unique {
                target,
                exclude,
                restrict,
            } => self.execute_unique(backend, target, exclude, restrict),
            PlanShape::Sets {
                include,
                exclude,
                restrict,
            } => self.execute_sets(backend, include, exclude, restrict),
        }
    }

    fn execute_unique(
        &self,
        backend: &dyn Backend,
        target: &UniqueTarget,
        exclude: &[FilterClause],
        restrict: &[String],
    ) -> Result<ResultHandle, StoreError> {
        let id = match target {
            UniqueTarget::PrimaryKey(id) => backend
                .is_member(&self.all_key, id.as_str())?
                .then(|| id.clone()),
            UniqueTarget::Field { key, .. } => match backend.get(key)? {
                Some(bytes) => Some(Id::new(String::from_utf8(bytes).map_err(|err| {
                    StoreError::Corrupt {
                        key: key.clone(),
                        message: err.to_string(),
                    }
                })?)),
                None => None,
            },
        };

        let Some(id) = id else {
            return Ok(ResultHandle::Ids(Vec::new()));
        };
        for key in restrict {
            if !backend.is_member(key, id.as_str())? {
                return Ok(ResultHandle::Ids(Vec::new()));
            }
        }
        for clause in exclude {
            if clause_contains(backend, clause, &id)? {
                return Ok(ResultHandle::Ids(Vec::new()));
            }
        }

        Ok(ResultHandle::Ids(vec![id]))
    }

    fn execute_sets(
        &self,
        backend: &dyn Backend,
        include: &[FilterClause],
        exclude: &[FilterClause],
        restrict: &[String],
    ) -> Result<ResultHandle, StoreError> {
        let mut plain: Vec<String> = restrict.to_vec();
        let mut others = Vec::new();
        for clause in include {
            match clause.plain_key() {
                Some(key) => plain.push(key.to_string()),
                None => others.push(clause),
            }
        }

        let (plain_excludes, other_excludes): (Vec<_>, Vec<_>) =
            exclude.iter().partition(|clause| clause.plain_key().is_some());
        let plain_excludes: Vec<String> = plain_excludes
            .iter()
            .filter_map(|clause| clause.plain_key().map(str::to_string))
            .collect();

        if plain.is_empty() && others.is_empty() {
            if exclude.is_empty() {
                return Ok(ResultHandle::All {
                    key: self.all_key.clone(),
                });
            }
            if other_excludes.is_empty() {
                let ids = backend.difference(&self.all_key, &plain_excludes)?;
                return Ok(ResultHandle::Ids(ids.into_iter().map(Id::new).collect()));
            }
        }

        let (mut candidates, rest) = if !plain.is_empty() {
            (backend.intersect(&plain)?, others.as_slice())
        } else if let Some((first, rest)) = others.split_first() {
            (self.seed(backend, first)?, rest)
        } else {
            (backend.members(&self.all_key)?, &[][..])
        };

        for clause in rest {
            if candidates.is_empty() {
                break;
            }
            let set = clause_members(backend, clause)?;
            candidates.retain(|member| set.contains(member));
        }

        if !candidates.is_empty() && !exclude.is_empty() {
            let mut excluded = if plain_excludes.is_empty() {
                BTreeSet::new()
            } else {
                backend.union(&plain_excludes)?
            };
            for clause in other_excludes {
                excluded.extend(clause_members(backend, clause)?);
            }
            candidates.retain(|member| !excluded.contains(member));
        }

        Ok(ResultHandle::Ids(
            candidates.into_iter().map(Id::new).collect(),
        ))
    }

    // Starting set when no plain index set is available. Explicit ids are
    // checked against the model's all-set.
    fn seed(
        &self,
        backend: &dyn Backend,
        clause: &FilterClause,
    ) -> Result<BTreeSet<String>, StoreError> {
        match clause {
            FilterClause::Ids { ids } => {
                let mut out = BTreeSet::new();
                for id in ids {
                    if backend.is_member(&self.all_key, id.as_str())? {
                        out.insert(id.as_str().to_string());
                    }
                }
                Ok(out)
            }
            other => clause_members(backend, other),
        }
    }
}

impl fmt::Display for QueryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, label: &str, clauses: &[FilterClause]) -> fmt::Result {
            for clause in clauses {
                write!(f, " {label}{clause}")?;
            }
            Ok(())
        }

        write!(f, "{}", self.model.name)?;
        match &self.shape {
            PlanShape::Empty => write!(f, " empty"),
            PlanShape::Unique {
                target,
                exclude,
                restrict,
            } => {
                match target {
                    UniqueTarget::PrimaryKey(id) => write!(f, " pk({id})")?,
                    UniqueTarget::Field { key, .. } => write!(f, " unique({key})")?,
                }
                list(f, "-", exclude)?;
                for key in restrict {
                    write!(f, " &{key}")?;
                }
                Ok(())
            }
            PlanShape::Sets {
                include,
                exclude,
                restrict,
            } => {
                list(f, "+", include)?;
                list(f, "-", exclude)?;
                for key in restrict {
                    write!(f, " &{key}")?;
                }
                Ok(())
            }
        }
    }
}

fn clause_members(
    backend: &dyn Backend,
    clause: &FilterClause,
) -> Result<BTreeSet<String>, StoreError> {
    match clause {
        FilterClause::Eq { key, .. } => backend.members(key),
        FilterClause::In { keys, .. } if keys.is_empty() => Ok(BTreeSet::new()),
        FilterClause::In { keys, .. } => backend.union(keys),
        FilterClause::Range { key, min, max, .. } => backend.range_by_score(key, *min, *max),
        FilterClause::Ids { ids } => Ok(ids.iter().map(|id| id.as_str().to_string()).collect()),
    }
}

fn clause_contains(
    backend: &dyn Backend,
    clause: &FilterClause,
    id: &Id,
) -> Result<bool, StoreError> {
    match clause {
        FilterClause::Eq { key, .. } => backend.is_member(key, id.as_str()),
        FilterClause::In { keys, .. } => {
            for key in keys {
                if backend.is_member(key, id.as_str())? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        FilterClause::Range { key, min, max, .. } => Ok(backend
            .score(key, id.as_str())?
            .is_some_and(|score| score_in_bounds(score, *min, *max))),
        FilterClause::Ids { ids } => Ok(ids.contains(id)),
    }
}

/// Fetch and decode the rows for `ids`, in order, skipping ids whose row
/// has disappeared. At or above the configured threshold one batch read
/// is used instead of per-id reads.
pub(crate) fn fetch_rows(
    session: &Session,
    model: &'static EntityModel,
    ids: &[Id],
) -> Result<Vec<(Id, Row)>, Error> {
    let backend = session.backend();
    let keys: Vec<String> = ids
        .iter()
        .map(|id| session.keys().object(model, id))
        .collect();

    let values = if ids.len() >= session.config().query.batch_fetch_threshold {
        backend.mget(&keys)?
    } else {
        keys.iter()
            .map(|key| backend.get(key))
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut rows = Vec::with_capacity(ids.len());
    for (id, value) in ids.iter().zip(values) {
        if let Some(bytes) = value {
            rows.push((id.clone(), deserialize::<Row>(&bytes)?));
        }
    }

    Ok(rows)
}
