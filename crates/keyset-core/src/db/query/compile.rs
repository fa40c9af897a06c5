use crate::{
    LOOKUP_SEPARATOR, PRIMARY_KEY,
    db::{
        keyspace::KeySpace,
        query::{Predicates, QueryError},
    },
    model::{entity::EntityModel, field::FieldModel},
    value::{Id, LookupValue, Value},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    ops::Bound,
};

///
/// LookupOp
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LookupOp {
    Eq,
    In,
    Gt,
    Ge,
    Lt,
    Le,
}

impl LookupOp {
    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "in" => Some(Self::In),
            "gt" => Some(Self::Gt),
            "ge" | "gte" => Some(Self::Ge),
            "lt" => Some(Self::Lt),
            "le" | "lte" => Some(Self::Le),
            _ => None,
        }
    }

    const fn is_range(self) -> bool {
        matches!(self, Self::Gt | Self::Ge | Self::Lt | Self::Le)
    }
}

///
/// FilterClause
///
/// One compiled predicate, resolved to the backend set(s) that answer it.
///

#[derive(Clone, Debug, PartialEq)]
pub enum FilterClause {
    /// Ids whose field equals one value: a single index set.
    Eq { field: &'static str, key: String },

    /// Union of several index sets. An empty key list matches nothing.
    In {
        field: &'static str,
        keys: Vec<String>,
    },

    /// Score window over a range index.
    Range {
        field: &'static str,
        key: String,
        min: Bound<f64>,
        max: Bound<f64>,
    },

    /// Explicit primary keys (`id__in`).
    Ids { ids: BTreeSet<Id> },
}

impl FilterClause {
    /// Plain single-set clauses can be combined server-side.
    #[must_use]
    pub fn plain_key(&self) -> Option<&str> {
        match self {
            Self::Eq { key, .. } => Some(key),
            Self::In { .. } | Self::Range { .. } | Self::Ids { .. } => None,
        }
    }
}

impl fmt::Display for FilterClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eq { key, .. } => write!(f, "eq({key})"),
            Self::In { keys, .. } => write!(f, "in({})", keys.join("|")),
            Self::Range { key, min, max, .. } => write!(f, "range({key},{min:?},{max:?})"),
            Self::Ids { ids } => {
                let ids: Vec<&str> = ids.iter().map(Id::as_str).collect();
                write!(f, "ids({})", ids.join("|"))
            }
        }
    }
}

///
/// UniqueTarget
///
/// A predicate that identifies at most one instance.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UniqueTarget {
    PrimaryKey(Id),
    /// Claim key of a unique field; its value is the owning id.
    Field { field: &'static str, key: String },
}

impl UniqueTarget {
    #[must_use]
    pub fn field(&self) -> &'static str {
        match self {
            Self::PrimaryKey(_) => PRIMARY_KEY,
            Self::Field { field, .. } => field,
        }
    }
}

///
/// CompiledLookup
///

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompiledLookup {
    /// Set when exactly one unique predicate is present; the planner then
    /// short-circuits and ignores `clauses`.
    pub unique: Option<UniqueTarget>,
    pub clauses: Vec<FilterClause>,
}

// Compiled form of one predicate before unique short-circuit selection.
enum Compiled {
    Unique {
        target: UniqueTarget,
        clause: FilterClause,
    },
    Clause(FilterClause),
}

// One parsed predicate; range bounds still need folding per field.
enum Parsed {
    Compiled(Compiled),
    Range {
        field: &'static FieldModel,
        min: Bound<f64>,
        max: Bound<f64>,
    },
}

///
/// LookupCompiler
///
/// Pure translation from keyword predicates to filter clauses for one model.
/// Never touches the backend.
///

pub struct LookupCompiler<'a> {
    model: &'static EntityModel,
    keys: &'a KeySpace,
}

impl<'a> LookupCompiler<'a> {
    #[must_use]
    pub const fn new(model: &'static EntityModel, keys: &'a KeySpace) -> Self {
        Self { model, keys }
    }

    /// Compile positive predicates.
    ///
    /// More than one unique predicate is an error. Exactly one makes the
    /// result a unique lookup.
    pub fn compile(&self, predicates: &Predicates) -> Result<CompiledLookup, QueryError> {
        let mut unique = Vec::new();
        let mut clauses = Vec::new();

        for compiled in self.compile_all(predicates)? {
            match compiled {
                Compiled::Unique { target, clause } => unique.push((target, clause)),
                Compiled::Clause(clause) => clauses.push(clause),
            }
        }

        match unique.len() {
            0 => Ok(CompiledLookup {
                unique: None,
                clauses,
            }),
            1 => {
                let (target, clause) = unique.remove(0);
                clauses.insert(0, clause);
                Ok(CompiledLookup {
                    unique: Some(target),
                    clauses,
                })
            }
            _ => Err(QueryError::MultipleUniquePredicates {
                fields: unique
                    .iter()
                    .map(|(target, _)| target.field().to_string())
                    .collect(),
            }),
        }
    }

    /// Compile exclusion predicates. Unique fields compile to their plain
    /// index sets; exclusions never short-circuit.
    pub fn compile_exclusions(
        &self,
        predicates: &Predicates,
    ) -> Result<Vec<FilterClause>, QueryError> {
        Ok(self
            .compile_all(predicates)?
            .into_iter()
            .map(|compiled| match compiled {
                Compiled::Unique { clause, .. } | Compiled::Clause(clause) => clause,
            })
            .collect())
    }

    // Compile every predicate, then fold range bounds per field into one
    // clause each.
    fn compile_all(&self, predicates: &Predicates) -> Result<Vec<Compiled>, QueryError> {
        let mut out = Vec::new();
        let mut ranges: BTreeMap<&'static str, (&'static FieldModel, Bound<f64>, Bound<f64>)> =
            BTreeMap::new();

        for (lookup, value) in predicates {
            match self.compile_one(lookup, value)? {
                Parsed::Range { field, min, max } => {
                    let entry = ranges
                        .entry(field.name)
                        .or_insert((field, Bound::Unbounded, Bound::Unbounded));
                    entry.1 = tighten_lower(entry.1, min);
                    entry.2 = tighten_upper(entry.2, max);
                }
                Parsed::Compiled(compiled) => out.push(compiled),
            }
        }

        for (name, (_, min, max)) in ranges {
            out.push(Compiled::Clause(FilterClause::Range {
                field: name,
                key: self.keys.range(self.model, name),
                min,
                max,
            }));
        }

        Ok(out)
    }

    fn compile_one(&self, lookup: &str, value: &LookupValue) -> Result<Parsed, QueryError> {
        let mut parts = lookup.split(LOOKUP_SEPARATOR);
        let name = parts.next().unwrap_or_default();
        let op = match (parts.next(), parts.next()) {
            (None, _) => LookupOp::Eq,
            (Some(suffix), None) => {
                LookupOp::from_suffix(suffix).ok_or_else(|| unsupported(lookup))?
            }
            (Some(_), Some(_)) => return Err(unsupported(lookup)),
        };

        if name == PRIMARY_KEY {
            return Self::compile_primary_key(lookup, op, value).map(Parsed::Compiled);
        }

        let field = self
            .model
            .field(name)
            .ok_or_else(|| QueryError::UnknownField {
                entity: self.model.name,
                field: name.to_string(),
            })?;
        if !field.is_queryable() {
            return Err(QueryError::NotQueryable {
                entity: self.model.name,
                field: name.to_string(),
            });
        }

        match op {
            LookupOp::Eq => {
                let token = token(lookup, field, single(lookup, value)?)?;
                let clause = FilterClause::Eq {
                    field: field.name,
                    key: self.keys.index(self.model, field.name, &token),
                };

                if field.unique {
                    Ok(Parsed::Compiled(Compiled::Unique {
                        target: UniqueTarget::Field {
                            field: field.name,
                            key: self.keys.unique(self.model, field.name, &token),
                        },
                        clause,
                    }))
                } else {
                    Ok(Parsed::Compiled(Compiled::Clause(clause)))
                }
            }

            LookupOp::In => {
                let mut keys = BTreeSet::new();
                for value in many(lookup, value)? {
                    let token = token(lookup, field, value)?;
                    keys.insert(self.keys.index(self.model, field.name, &token));
                }

                Ok(Parsed::Compiled(Compiled::Clause(FilterClause::In {
                    field: field.name,
                    keys: keys.into_iter().collect(),
                })))
            }

            op => {
                debug_assert!(op.is_range());
                if !field.is_ranged() {
                    return Err(QueryError::NotOrdered {
                        entity: self.model.name,
                        field: name.to_string(),
                    });
                }

                // Range sets hold f64 scores; any numeric bound applies.
                let score = single(lookup, value)?
                    .score()
                    .ok_or_else(|| invalid(lookup, "range bound must be a number"))?;
                if score.is_nan() {
                    return Err(invalid(lookup, "range bound must not be NaN"));
                }
                let (min, max) = match op {
                    LookupOp::Gt => (Bound::Excluded(score), Bound::Unbounded),
                    LookupOp::Ge => (Bound::Included(score), Bound::Unbounded),
                    LookupOp::Lt => (Bound::Unbounded, Bound::Excluded(score)),
                    _ => (Bound::Unbounded, Bound::Included(score)),
                };

                Ok(Parsed::Range { field, min, max })
            }
        }
    }

    fn compile_primary_key(
        lookup: &str,
        op: LookupOp,
        value: &LookupValue,
    ) -> Result<Compiled, QueryError> {
        match op {
            LookupOp::Eq => {
                let id = id_of(lookup, single(lookup, value)?)?;
                Ok(Compiled::Unique {
                    target: UniqueTarget::PrimaryKey(id.clone()),
                    clause: FilterClause::Ids {
                        ids: BTreeSet::from([id]),
                    },
                })
            }
            LookupOp::In => {
                let ids = many(lookup, value)?
                    .iter()
                    .map(|value| id_of(lookup, value))
                    .collect::<Result<BTreeSet<_>, _>>()?;

                Ok(Compiled::Clause(FilterClause::Ids { ids }))
            }
            _ => Err(unsupported(lookup)),
        }
    }
}

fn unsupported(lookup: &str) -> QueryError {
    QueryError::UnsupportedLookup {
        lookup: lookup.to_string(),
    }
}

fn invalid(lookup: &str, reason: impl Into<String>) -> QueryError {
    QueryError::InvalidValue {
        lookup: lookup.to_string(),
        reason: reason.into(),
    }
}

fn single<'v>(lookup: &str, value: &'v LookupValue) -> Result<&'v Value, QueryError> {
    match value {
        LookupValue::One(value) => Ok(value),
        LookupValue::Many(_) => Err(invalid(lookup, "expected a single value")),
    }
}

fn many<'v>(lookup: &str, value: &'v LookupValue) -> Result<&'v [Value], QueryError> {
    match value {
        LookupValue::Many(values) => Ok(values),
        LookupValue::One(_) => Err(invalid(lookup, "expected a list of values")),
    }
}

fn token(lookup: &str, field: &FieldModel, value: &Value) -> Result<String, QueryError> {
    field
        .index_token(value)
        .map_err(|reason| invalid(lookup, reason))?
        .ok_or_else(|| invalid(lookup, "null values are not indexed"))
}

fn id_of(lookup: &str, value: &Value) -> Result<Id, QueryError> {
    match value {
        Value::Ref(id) => Ok(id.clone()),
        Value::Text(text) => Ok(Id::new(text.clone())),
        Value::Int(n) => Ok(Id::new(n.to_string())),
        other => Err(invalid(lookup, format!("{other} is not an id"))),
    }
}

const fn bound_value(bound: Bound<f64>) -> Option<f64> {
    match bound {
        Bound::Included(v) | Bound::Excluded(v) => Some(v),
        Bound::Unbounded => None,
    }
}

// Keep the stricter of two lower bounds.
fn tighten_lower(current: Bound<f64>, next: Bound<f64>) -> Bound<f64> {
    match (bound_value(current), bound_value(next)) {
        (None, _) => next,
        (_, None) => current,
        (Some(a), Some(b)) if b > a => next,
        (Some(a), Some(b)) if a > b => current,
        _ if matches!(next, Bound::Excluded(_)) => next,
        _ => current,
    }
}

// Keep the stricter of two upper bounds.
fn tighten_upper(current: Bound<f64>, next: Bound<f64>) -> Bound<f64> {
    match (bound_value(current), bound_value(next)) {
        (None, _) => next,
        (_, None) => current,
        (Some(a), Some(b)) if b < a => next,
        (Some(a), Some(b)) if a < b => current,
        _ if matches!(next, Bound::Excluded(_)) => next,
        _ => current,
    }
}
