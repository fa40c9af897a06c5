//! Translate buffered transaction ops into one guarded write batch.
//!
//! Per instance the order is fixed: stale entries are removed, the row is
//! written, new entries are added. Deletes remove every entry the instance
//! owns. Unique claims become batch guards so a conflicting claim fails the
//! whole batch before any write lands.

use crate::{
    Error,
    db::{
        commit::{LinkChange, PendingOp, UniqueViolation},
        keyspace::KeySpace,
        store::{ClaimGuard, StoreOp, WriteBatch},
    },
    model::entity::EntityModel,
    obs::sink::{self, MetricsEvent},
    serialize::serialize,
    value::{Id, Row},
};
use std::collections::{BTreeMap, BTreeSet, HashMap};

///
/// IndexEntries
///
/// Every index entry one row contributes.
///

#[derive(Debug, Default, PartialEq)]
pub(crate) struct IndexEntries {
    pub(crate) sets: BTreeSet<String>,
    /// Claim key → (field, displayed value).
    pub(crate) uniques: BTreeMap<String, (&'static str, String)>,
    /// Range key → score.
    pub(crate) scores: BTreeMap<String, f64>,
}

impl IndexEntries {
    pub(crate) fn of(keys: &KeySpace, model: &'static EntityModel, row: &Row) -> Self {
        let mut out = Self::default();

        for field in model.queryable_fields() {
            let Some(value) = row.get(field.name) else {
                continue;
            };
            let Some(token) = value.index_token() else {
                continue;
            };

            out.sets.insert(keys.index(model, field.name, &token));
            if field.unique {
                out.uniques.insert(
                    keys.unique(model, field.name, &token),
                    (field.name, value.to_string()),
                );
            }
            if field.is_ranged()
                && let Some(score) = value.score()
            {
                out.scores.insert(keys.range(model, field.name), score);
            }
        }

        out
    }
}

///
/// IndexDelta
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct IndexDelta {
    pub(crate) inserts: u64,
    pub(crate) removes: u64,
}

///
/// ClaimOwner
/// Who a guarded claim key was being claimed for, to report violations.
///

#[derive(Clone, Debug)]
pub(crate) struct ClaimOwner {
    pub(crate) model: &'static EntityModel,
    pub(crate) field: &'static str,
    pub(crate) value: String,
}

impl ClaimOwner {
    pub(crate) fn violation(&self) -> UniqueViolation {
        UniqueViolation {
            entity: self.model.name,
            field: self.field,
            value: self.value.clone(),
        }
    }
}

///
/// PreparedCommit
///

#[derive(Debug, Default)]
pub(crate) struct PreparedCommit {
    pub(crate) batch: WriteBatch,
    pub(crate) claims: HashMap<String, ClaimOwner>,
    pub(crate) index: BTreeMap<&'static str, IndexDelta>,
    pub(crate) links: IndexDelta,
}

// Tracks claim keys as the batch would leave them, op by op.
#[derive(Default)]
struct ClaimLedger {
    held: HashMap<String, Id>,
    released: HashMap<String, Vec<String>>,
}

impl ClaimLedger {
    fn claim(
        &mut self,
        key: &str,
        id: &Id,
        owner: &ClaimOwner,
    ) -> Result<ClaimGuard, UniqueViolation> {
        if let Some(holder) = self.held.get(key)
            && holder != id
        {
            sink::record(MetricsEvent::UniqueViolation {
                entity_path: owner.model.path,
            });
            return Err(owner.violation());
        }
        self.held.insert(key.to_string(), id.clone());

        let mut allowed = vec![id.as_str().to_string()];
        if let Some(released) = self.released.get(key) {
            allowed.extend(released.iter().cloned());
        }

        Ok(ClaimGuard {
            key: key.to_string(),
            allowed,
        })
    }

    fn release(&mut self, key: &str, id: &Id) {
        if self.held.get(key) == Some(id) {
            self.held.remove(key);
        }
        self.released
            .entry(key.to_string())
            .or_default()
            .push(id.as_str().to_string());
    }
}

/// Build the batch for `ops`. Conflicting claims within the batch are
/// rejected here; conflicts with stored claims are left to the guards.
pub(crate) fn prepare(keys: &KeySpace, ops: &[PendingOp]) -> Result<PreparedCommit, Error> {
    let mut out = PreparedCommit::default();
    let mut ledger = ClaimLedger::default();

    for op in ops {
        match op {
            PendingOp::Save {
                model,
                id,
                row,
                prior,
            } => prepare_save(keys, &mut out, &mut ledger, *model, id, row, prior.as_ref())?,

            PendingOp::Delete {
                model,
                id,
                prior,
                links,
            } => {
                prepare_delete(keys, &mut out, &mut ledger, *model, id, prior);
                for link in links {
                    out.batch.push(StoreOp::Delete {
                        key: keys.link(model, link.field, id),
                    });
                    for member in &link.members {
                        let owner = Id::new(member.clone());
                        out.batch.push(StoreOp::RemoveFromSet {
                            key: keys.link(link.target, link.related_name, &owner),
                            member: id.as_str().to_string(),
                        });
                    }
                    out.links.removes += link.members.len() as u64 * 2;
                }
            }

            PendingOp::Link(change) => prepare_link(keys, &mut out, change),

            PendingOp::Raw(op) => out.batch.push(op.clone()),
        }
    }

    Ok(out)
}

fn prepare_save(
    keys: &KeySpace,
    out: &mut PreparedCommit,
    ledger: &mut ClaimLedger,
    model: &'static EntityModel,
    id: &Id,
    row: &Row,
    prior: Option<&Row>,
) -> Result<(), Error> {
    let old = prior.map_or_else(IndexEntries::default, |prior| {
        IndexEntries::of(keys, model, prior)
    });
    let new = IndexEntries::of(keys, model, row);
    let member = id.as_str().to_string();
    let delta = out.index.entry(model.path).or_default();

    // stale entries
    for key in old.sets.difference(&new.sets) {
        out.batch.push(StoreOp::RemoveFromSet {
            key: key.clone(),
            member: member.clone(),
        });
        delta.removes += 1;
    }
    for key in old.uniques.keys().filter(|key| !new.uniques.contains_key(*key)) {
        ledger.release(key, id);
        out.batch.push(StoreOp::Delete { key: key.clone() });
        delta.removes += 1;
    }
    for key in old.scores.keys().filter(|key| !new.scores.contains_key(*key)) {
        out.batch.push(StoreOp::RemoveScored {
            key: key.clone(),
            member: member.clone(),
        });
        delta.removes += 1;
    }

    // data
    out.batch.push(StoreOp::Set {
        key: keys.object(model, id),
        value: serialize(row)?,
    });
    if prior.is_none() {
        out.batch.push(StoreOp::AddToSet {
            key: keys.all(model),
            member: member.clone(),
        });
    }

    // new entries
    for (key, (field, value)) in &new.uniques {
        if old.uniques.contains_key(key) {
            continue;
        }
        let owner = ClaimOwner {
            model,
            field: *field,
            value: value.clone(),
        };
        let guard = ledger.claim(key, id, &owner)?;
        out.batch.guard(guard);
        out.claims.insert(key.clone(), owner);
        out.batch.push(StoreOp::Set {
            key: key.clone(),
            value: member.as_bytes().to_vec(),
        });
        delta.inserts += 1;
    }
    for key in new.sets.difference(&old.sets) {
        out.batch.push(StoreOp::AddToSet {
            key: key.clone(),
            member: member.clone(),
        });
        delta.inserts += 1;
    }
    for (key, score) in &new.scores {
        if old.scores.get(key) == Some(score) {
            continue;
        }
        out.batch.push(StoreOp::AddScored {
            key: key.clone(),
            member: member.clone(),
            score: *score,
        });
        delta.inserts += 1;
    }

    Ok(())
}

fn prepare_delete(
    keys: &KeySpace,
    out: &mut PreparedCommit,
    ledger: &mut ClaimLedger,
    model: &'static EntityModel,
    id: &Id,
    prior: &Row,
) {
    let entries = IndexEntries::of(keys, model, prior);
    let member = id.as_str().to_string();
    let delta = out.index.entry(model.path).or_default();

    for key in &entries.sets {
        out.batch.push(StoreOp::RemoveFromSet {
            key: key.clone(),
            member: member.clone(),
        });
    }
    for key in entries.uniques.keys() {
        ledger.release(key, id);
        out.batch.push(StoreOp::Delete { key: key.clone() });
    }
    for key in entries.scores.keys() {
        out.batch.push(StoreOp::RemoveScored {
            key: key.clone(),
            member: member.clone(),
        });
    }
    delta.removes += (entries.sets.len() + entries.uniques.len() + entries.scores.len()) as u64;

    out.batch.push(StoreOp::Delete {
        key: keys.object(model, id),
    });
    out.batch.push(StoreOp::RemoveFromSet {
        key: keys.all(model),
        member,
    });
}

fn prepare_link(keys: &KeySpace, out: &mut PreparedCommit, change: &LinkChange) {
    for (model, field, owner, member) in change.sides() {
        let key = keys.link(model, field, owner);
        let member = member.as_str().to_string();
        if change.add {
            out.batch.push(StoreOp::AddToSet { key, member });
            out.links.inserts += 1;
        } else {
            out.batch.push(StoreOp::RemoveFromSet { key, member });
            out.links.removes += 1;
        }
    }
}
