//! Module: db::commit
//! Responsibility: buffer instance writes and apply them, with every index
//! change they imply, as one atomic backend batch.
//! Does not own: dependent index consumers (see `db::event`).
//! Boundary: data and index entries are never written outside a commit.

mod delta;


pub(crate) use delta::IndexEntries;

use crate::{
    Error,
    db::{
        Session, event,
        store::{self, SnapshotGuard, StoreError, StoreOp, WriteBatch},
    },
    error::ErrorClass,
    model::{entity::EntityModel, validate::validate_row},
    obs::sink::{self, ExecKind, MetricsEvent, Span},
    serialize::deserialize,
    traits::{EntityKind, require_id},
    value::{Id, Row},
};
use std::{
    collections::{BTreeSet, HashMap},
    fmt, mem,
};
use thiserror::Error as ThisError;
use tracing::{debug, warn};

///
/// CommitError
///

#[derive(Debug, ThisError)]
pub enum CommitError {
    #[error("transaction '{name}' is {state}")]
    NotOpen { name: String, state: TxnState },

    #[error("transaction '{name}' was rolled back: {source}")]
    Apply {
        name: String,
        #[source]
        source: StoreError,
    },

    /// Something this transaction read changed before it committed.
    #[error("transaction '{name}' conflicted on '{key}'")]
    Conflict { name: String, key: String },
}

impl CommitError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::NotOpen { .. } | Self::Apply { .. } => ErrorClass::Internal,
        }
    }
}

///
/// UniqueViolation
///
/// A save would give a unique field a value another instance already
/// holds. Nothing from the offending commit was written.
///

#[derive(Clone, Debug, Eq, PartialEq, ThisError)]
#[error("unique constraint violated: {entity}.{field} = {value}")]
pub struct UniqueViolation {
    pub entity: &'static str,
    pub field: &'static str,
    pub value: String,
}

///
/// TxnState
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxnState {
    Open,
    Committing,
    Committed,
    RolledBack,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Open => "open",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        };
        write!(f, "{label}")
    }
}

///
/// CommitReport
///

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CommitReport {
    pub saved: usize,
    pub deleted: usize,
    pub linked: usize,
    /// Backend writes in the applied batch.
    pub writes: usize,
}

// One side of every many-to-many field of an instance being deleted.
#[derive(Clone, Debug)]
pub(crate) struct LinkSnapshot {
    pub(crate) field: &'static str,
    pub(crate) target: &'static EntityModel,
    pub(crate) related_name: &'static str,
    pub(crate) members: BTreeSet<String>,
}

///
/// LinkChange
/// Add or remove one symmetric many-to-many pair.
///

#[derive(Clone, Debug)]
pub(crate) struct LinkChange {
    pub(crate) add: bool,
    pub(crate) source: &'static EntityModel,
    pub(crate) field: &'static str,
    pub(crate) source_id: Id,
    pub(crate) target: &'static EntityModel,
    pub(crate) related_name: &'static str,
    pub(crate) target_id: Id,
}

impl LinkChange {
    /// Both link sets touched: (owning model, field, owner id, member id).
    pub(crate) fn sides(&self) -> [(&'static EntityModel, &'static str, &Id, &Id); 2] {
        [
            (self.source, self.field, &self.source_id, &self.target_id),
            (self.target, self.related_name, &self.target_id, &self.source_id),
        ]
    }
}

#[derive(Clone, Debug)]
pub(crate) enum PendingOp {
    Save {
        model: &'static EntityModel,
        id: Id,
        row: Row,
        prior: Option<Row>,
    },
    Delete {
        model: &'static EntityModel,
        id: Id,
        prior: Row,
        links: Vec<LinkSnapshot>,
    },
    Link(LinkChange),
    Raw(StoreOp),
}

///
/// Transaction
///
/// Ordered buffer of writes, applied by `commit` as one batch. Every op
/// snapshots its row when it is buffered, so later changes to the caller's
/// instance have no effect on what gets written.
///
/// Open → Committing → Committed | RolledBack. A transaction is single use.
///

pub struct Transaction {
    session: Session,
    name: String,
    ops: Vec<PendingOp>,
    // Rows as this transaction will leave them; `None` once deleted.
    staged: HashMap<(&'static str, Id), Option<Row>>,
    // Backend state the buffered ops were derived from.
    snapshots: Vec<SnapshotGuard>,
    state: TxnState,
    fire_events: bool,
}

impl Transaction {
    pub(crate) fn new(session: Session, name: impl Into<String>, fire_events: bool) -> Self {
        Self {
            session,
            name: name.into(),
            ops: Vec::new(),
            staged: HashMap::new(),
            snapshots: Vec::new(),
            state: TxnState::Open,
            fire_events,
        }
    }

    #[must_use]
    pub const fn state(&self) -> TxnState {
        self.state
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Number of buffered ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn ensure_open(&self) -> Result<(), CommitError> {
        if self.state == TxnState::Open {
            Ok(())
        } else {
            Err(CommitError::NotOpen {
                name: self.name.clone(),
                state: self.state,
            })
        }
    }

    // Row as of this point in the transaction: staged first, then stored.
    // A stored read is snapshotted so commit can tell if it went stale.
    fn prior_row(&mut self, model: &'static EntityModel, id: &Id) -> Result<Option<Row>, Error> {
        if let Some(staged) = self.staged.get(&(model.path, id.clone())) {
            return Ok(staged.clone());
        }

        let key = self.session.keys().object(model, id);
        let stored = self.session.backend().get(&key)?;
        let row = stored.as_deref().map(deserialize::<Row>).transpose()?;
        self.snapshot(SnapshotGuard::Value {
            key,
            expected: stored,
        });

        Ok(row)
    }

    fn snapshot(&mut self, snapshot: SnapshotGuard) {
        if !self.snapshots.iter().any(|seen| seen.key() == snapshot.key()) {
            self.snapshots.push(snapshot);
        }
    }

    // ------------------------------------------------------------------
    // Buffering
    // ------------------------------------------------------------------

    /// Validate and buffer a save. An instance without an id is assigned a
    /// fresh one immediately.
    pub fn save<E: EntityKind>(&mut self, entity: &mut E) -> Result<Id, Error> {
        self.ensure_open()?;
        let row = validate_row(E::MODEL, &entity.to_row())?;

        let (id, prior) = match entity.id() {
            Some(id) => {
                let id = id.clone();
                let prior = self.prior_row(E::MODEL, &id)?;
                (id, prior)
            }
            None => {
                let id = Id::generate();
                entity.set_id(id.clone());
                (id, None)
            }
        };

        self.session.with_metrics(|| {
            let mut span = Span::new(ExecKind::Save, E::MODEL);
            span.set_rows(1);
        });

        self.staged
            .insert((E::MODEL.path, id.clone()), Some(row.clone()));
        self.ops.push(PendingOp::Save {
            model: E::MODEL,
            id: id.clone(),
            row,
            prior,
        });

        Ok(id)
    }

    /// Buffer a delete. Returns `false` when the instance does not exist.
    pub fn delete<E: EntityKind>(&mut self, entity: &E) -> Result<bool, Error> {
        let id = require_id(entity)?.clone();
        self.delete_id(E::MODEL, &id)
    }

    /// Buffer a delete by model and id.
    pub fn delete_id(&mut self, model: &'static EntityModel, id: &Id) -> Result<bool, Error> {
        self.ensure_open()?;
        let Some(prior) = self.prior_row(model, id)? else {
            return Ok(false);
        };

        let mut links = Vec::new();
        for (field, target, related_name) in model.link_fields() {
            let key = self.session.keys().link(model, field.name, id);
            let mut members = self.session.backend().members(&key)?;
            self.snapshot(SnapshotGuard::Members {
                key,
                expected: members.clone(),
            });
            self.overlay_links(model, field.name, id, &mut members);

            links.push(LinkSnapshot {
                field: field.name,
                target,
                related_name,
                members,
            });
        }

        self.session.with_metrics(|| {
            let mut span = Span::new(ExecKind::Delete, model);
            span.set_rows(1);
        });

        self.staged.insert((model.path, id.clone()), None);
        self.ops.push(PendingOp::Delete {
            model,
            id: id.clone(),
            prior,
            links,
        });

        Ok(true)
    }

    // Apply link changes already buffered in this transaction.
    fn overlay_links(
        &self,
        model: &'static EntityModel,
        field: &str,
        id: &Id,
        members: &mut BTreeSet<String>,
    ) {
        for op in &self.ops {
            let PendingOp::Link(change) = op else {
                continue;
            };
            for (side_model, side_field, owner, member) in change.sides() {
                if side_model.same_as(model) && side_field == field && owner == id {
                    if change.add {
                        members.insert(member.as_str().to_string());
                    } else {
                        members.remove(member.as_str());
                    }
                }
            }
        }
    }

    pub(crate) fn link(&mut self, change: LinkChange) -> Result<(), Error> {
        self.ensure_open()?;
        self.ops.push(PendingOp::Link(change));

        Ok(())
    }

    /// Buffer a raw backend write, applied in order with everything else.
    /// Used by index hooks maintaining their own keys.
    pub fn push_raw(&mut self, op: StoreOp) -> Result<(), Error> {
        self.ensure_open()?;
        self.ops.push(PendingOp::Raw(op));

        Ok(())
    }

    /// Drop every buffered op without writing anything.
    pub fn discard(&mut self) -> Result<(), Error> {
        self.ensure_open()?;
        self.ops.clear();
        self.staged.clear();
        self.snapshots.clear();
        self.state = TxnState::RolledBack;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Apply every buffered op atomically, then notify index hooks.
    ///
    /// A hook failure is reported after the primary batch has committed;
    /// the transaction stays `Committed`.
    pub fn commit(&mut self) -> Result<CommitReport, Error> {
        self.ensure_open()?;
        self.state = TxnState::Committing;
        self.staged.clear();
        let ops = mem::take(&mut self.ops);
        let snapshots = mem::take(&mut self.snapshots);
        let session = self.session.clone();

        let report = match session.with_metrics(|| self.apply(&ops, snapshots)) {
            Ok(report) => report,
            Err(err) => {
                self.state = TxnState::RolledBack;
                return Err(err);
            }
        };
        self.state = TxnState::Committed;

        if self.fire_events {
            session.with_metrics(|| event::dispatch(&session, &ops))?;
        }

        Ok(report)
    }

    fn apply(
        &self,
        ops: &[PendingOp],
        snapshots: Vec<SnapshotGuard>,
    ) -> Result<CommitReport, Error> {
        let mut report = CommitReport::default();
        for op in ops {
            match op {
                PendingOp::Save { .. } => report.saved += 1,
                PendingOp::Delete { .. } => report.deleted += 1,
                PendingOp::Link(_) => report.linked += 1,
                PendingOp::Raw(_) => {}
            }
        }
        if ops.is_empty() {
            return Ok(report);
        }

        let mut prepared = delta::prepare(self.session.keys(), ops)?;
        prepared.batch.snapshots = snapshots;
        if let Err(err) = self.apply_batch(&prepared.batch) {
            if let StoreError::ClaimConflict { key, .. } = &err
                && let Some(owner) = prepared.claims.get(key)
            {
                let violation = owner.violation();
                sink::record(MetricsEvent::UniqueViolation {
                    entity_path: owner.model.path,
                });
                warn!(txn = %self.name, %violation, "commit rejected");
                return Err(violation.into());
            }
            if let StoreError::StaleSnapshot { key } = &err {
                warn!(txn = %self.name, %key, "commit rejected, read state went stale");
                return Err(CommitError::Conflict {
                    name: self.name.clone(),
                    key: key.clone(),
                }
                .into());
            }

            sink::record(MetricsEvent::CommitRollback {
                ops: prepared.batch.len() as u64,
            });
            warn!(txn = %self.name, error = %err, "commit failed, rolled back");
            return Err(CommitError::Apply {
                name: self.name.clone(),
                source: err,
            }
            .into());
        }

        for (entity_path, delta) in &prepared.index {
            sink::record(MetricsEvent::IndexDelta {
                entity_path,
                inserts: delta.inserts,
                removes: delta.removes,
            });
        }
        if prepared.links != delta::IndexDelta::default() {
            sink::record(MetricsEvent::LinkDelta {
                inserts: prepared.links.inserts,
                removes: prepared.links.removes,
            });
        }

        report.writes = prepared.batch.len();
        debug!(
            txn = %self.name,
            saved = report.saved,
            deleted = report.deleted,
            writes = report.writes,
            "transaction committed"
        );

        Ok(report)
    }

    fn apply_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let backend = self.session.backend();
        if backend.capabilities().atomic_apply {
            backend.atomic_apply(batch)
        } else {
            store::apply_compensating(backend.as_ref(), batch)
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Open && !self.ops.is_empty() {
            debug!(
                txn = %self.name,
                ops = self.ops.len(),
                "transaction dropped without commit"
            );
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("ops", &self.ops.len())
            .finish_non_exhaustive()
    }
}
