//! Module: db::event
//! Responsibility: post-commit notification of dependent index consumers.
//! Does not own: what consumers index (search, or anything else).
//! Boundary: hooks run after the primary batch is durable, each in its own
//! transaction that never re-fires hooks.

use crate::{
    Error,
    db::{
        Session,
        commit::{PendingOp, Transaction},
    },
    error::ErrorOrigin,
    model::entity::EntityModel,
    obs::sink::{self, MetricsEvent},
    value::{Id, Row},
};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error as ThisError;
use tracing::warn;

///
/// HookError
///
/// A dependent index failed to update. The primary commit that triggered
/// it has already been applied.
///

#[derive(Debug, ThisError)]
#[error("index hook '{hook}' failed for {entity}: {source}")]
pub struct HookError {
    pub hook: &'static str,
    pub entity: &'static str,
    #[source]
    pub source: Box<Error>,
}

impl HookError {
    #[must_use]
    pub const fn origin(&self) -> ErrorOrigin {
        ErrorOrigin::Index
    }
}

///
/// CommitEvent
///
/// Instances of one model touched by one commit, each listed once with the
/// row it was last saved with (or, for deletes, the row it had).
///

#[derive(Debug)]
pub struct CommitEvent<'a> {
    pub model: &'static EntityModel,
    pub instances: &'a [(Id, Row)],
}

///
/// IndexHook
///
/// Dependent index consumer. Writes go into the supplied transaction,
/// which the engine commits right after the hook returns.
///

pub trait IndexHook: Send + Sync {
    fn name(&self) -> &'static str;

    fn on_commit(&self, event: &CommitEvent<'_>, txn: &mut Transaction) -> Result<(), Error>;

    fn on_delete(&self, event: &CommitEvent<'_>, txn: &mut Transaction) -> Result<(), Error>;
}

///
/// EventBus
///
/// Hooks keyed by model path.
///

#[derive(Default)]
pub struct EventBus {
    hooks: RwLock<HashMap<&'static str, Vec<Arc<dyn IndexHook>>>>,
}

impl EventBus {
    /// Subscribe `hook` to commits of `model`. A hook with the same name
    /// is replaced.
    pub fn subscribe(&self, model: &'static EntityModel, hook: Arc<dyn IndexHook>) {
        let mut hooks = self.hooks.write();
        let list = hooks.entry(model.path).or_default();
        list.retain(|existing| existing.name() != hook.name());
        list.push(hook);
    }

    pub fn unsubscribe(&self, model: &'static EntityModel, name: &str) -> bool {
        let mut hooks = self.hooks.write();
        let Some(list) = hooks.get_mut(model.path) else {
            return false;
        };
        let before = list.len();
        list.retain(|hook| hook.name() != name);

        list.len() != before
    }

    #[must_use]
    pub fn hooks_for(&self, model: &'static EntityModel) -> Vec<Arc<dyn IndexHook>> {
        self.hooks
            .read()
            .get(model.path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        self.hooks.write().clear();
    }
}

// Group instances by model, in order of first appearance.
type Groups = Vec<(&'static EntityModel, Vec<(Id, Row)>)>;

fn push(groups: &mut Groups, model: &'static EntityModel, id: &Id, row: &Row) {
    match groups.iter_mut().find(|(m, _)| m.same_as(model)) {
        Some((_, rows)) => rows.push((id.clone(), row.clone())),
        None => groups.push((model, vec![(id.clone(), row.clone())])),
    }
}

/// Last save or delete of each instance, in order of first appearance.
/// An instance touched several times in one batch is reported once.
fn final_ops(ops: &[PendingOp]) -> Vec<&PendingOp> {
    let mut slots: Vec<(&'static str, &Id)> = Vec::new();
    let mut finals: Vec<&PendingOp> = Vec::new();
    for op in ops {
        let (model, id) = match op {
            PendingOp::Save { model, id, .. } | PendingOp::Delete { model, id, .. } => {
                (*model, id)
            }
            PendingOp::Link(_) | PendingOp::Raw(_) => continue,
        };
        match slots
            .iter()
            .position(|(path, seen)| *path == model.path && *seen == id)
        {
            Some(at) => finals[at] = op,
            None => {
                slots.push((model.path, id));
                finals.push(op);
            }
        }
    }

    finals
}

/// Notify hooks of a committed batch. Every hook runs even if an earlier
/// one fails; the first failure is returned.
pub(crate) fn dispatch(session: &Session, ops: &[PendingOp]) -> Result<(), Error> {
    let mut saved = Groups::new();
    let mut deleted = Groups::new();
    for op in final_ops(ops) {
        match op {
            PendingOp::Save { model, id, row, .. } => push(&mut saved, *model, id, row),
            PendingOp::Delete {
                model, id, prior, ..
            } => push(&mut deleted, *model, id, prior),
            PendingOp::Link(_) | PendingOp::Raw(_) => {}
        }
    }

    let mut first_error = None;
    for (groups, is_delete) in [(&saved, false), (&deleted, true)] {
        for (model, instances) in groups {
            let model = *model;
            let event = CommitEvent { model, instances };
            for hook in session.events().hooks_for(model) {
                if let Err(err) = run_hook(session, hook.as_ref(), &event, is_delete) {
                    sink::record(MetricsEvent::HookFailure {
                        entity_path: model.path,
                    });
                    warn!(
                        hook = hook.name(),
                        entity = model.name,
                        error = %err,
                        "index hook failed"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
    }

    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn run_hook(
    session: &Session,
    hook: &dyn IndexHook,
    event: &CommitEvent<'_>,
    is_delete: bool,
) -> Result<(), HookError> {
    let wrap = |source: Error| HookError {
        hook: hook.name(),
        entity: event.model.name,
        source: Box::new(source),
    };

    let mut txn = session.begin_nested(format!("{}:{}", hook.name(), event.model.name));
    if is_delete {
        hook.on_delete(event, &mut txn).map_err(wrap)?;
    } else {
        hook.on_commit(event, &mut txn).map_err(wrap)?;
    }
    txn.commit().map_err(wrap)?;

    Ok(())
}
