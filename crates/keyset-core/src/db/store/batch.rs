use crate::db::store::{Backend, StoreError};
use std::collections::BTreeSet;

///
/// StoreOp
///
/// One mechanical write. Ops carry no index semantics; a batch is applied
/// strictly in order.
///

#[derive(Clone, Debug, PartialEq)]
pub enum StoreOp {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
    AddToSet { key: String, member: String },
    RemoveFromSet { key: String, member: String },
    AddScored { key: String, member: String, score: f64 },
    RemoveScored { key: String, member: String },
}

impl StoreOp {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Delete { key }
            | Self::AddToSet { key, .. }
            | Self::RemoveFromSet { key, .. }
            | Self::AddScored { key, .. }
            | Self::RemoveScored { key, .. } => key,
        }
    }

    /// Apply this op through the non-batched backend surface.
    pub fn apply_to(&self, backend: &dyn Backend) -> Result<(), StoreError> {
        match self {
            Self::Set { key, value } => backend.set(key, value.clone()),
            Self::Delete { key } => backend.delete(key).map(|_| ()),
            Self::AddToSet { key, member } => backend.add_to_set(key, member).map(|_| ()),
            Self::RemoveFromSet { key, member } => {
                backend.remove_from_set(key, member).map(|_| ())
            }
            Self::AddScored { key, member, score } => backend.add_scored(key, member, *score),
            Self::RemoveScored { key, member } => backend.remove_scored(key, member).map(|_| ()),
        }
    }

    /// Ops that restore the current backend state of whatever this op is
    /// about to change. Must be read before the op is applied.
    pub(crate) fn undo_ops(&self, backend: &dyn Backend) -> Result<Vec<Self>, StoreError> {
        let undo = match self {
            Self::Set { key, .. } => vec![restore_value(key, backend.get(key)?)],

            Self::Delete { key } => {
                let mut undo = Vec::new();
                if let Some(value) = backend.get(key)? {
                    undo.push(Self::Set {
                        key: key.clone(),
                        value,
                    });
                }
                undo.extend(backend.members(key)?.into_iter().map(|member| {
                    Self::AddToSet {
                        key: key.clone(),
                        member,
                    }
                }));
                undo
            }

            Self::AddToSet { key, member } => {
                if backend.is_member(key, member)? {
                    Vec::new()
                } else {
                    vec![Self::RemoveFromSet {
                        key: key.clone(),
                        member: member.clone(),
                    }]
                }
            }

            Self::RemoveFromSet { key, member } => {
                if backend.is_member(key, member)? {
                    vec![Self::AddToSet {
                        key: key.clone(),
                        member: member.clone(),
                    }]
                } else {
                    Vec::new()
                }
            }

            Self::AddScored { key, member, .. } | Self::RemoveScored { key, member } => {
                match backend.score(key, member)? {
                    Some(score) => vec![Self::AddScored {
                        key: key.clone(),
                        member: member.clone(),
                        score,
                    }],
                    None if matches!(self, Self::AddScored { .. }) => vec![Self::RemoveScored {
                        key: key.clone(),
                        member: member.clone(),
                    }],
                    None => Vec::new(),
                }
            }
        };

        Ok(undo)
    }
}

fn restore_value(key: &str, prior: Option<Vec<u8>>) -> StoreOp {
    match prior {
        Some(value) => StoreOp::Set {
            key: key.to_string(),
            value,
        },
        None => StoreOp::Delete {
            key: key.to_string(),
        },
    }
}

///
/// ClaimGuard
///
/// Precondition on a uniqueness key: it must be absent, or currently held
/// by one of `allowed` (the claimant itself, or a holder this same batch
/// releases first).
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClaimGuard {
    pub key: String,
    pub allowed: Vec<String>,
}

impl ClaimGuard {
    /// Check the guard against the key's current value.
    pub fn check(&self, current: Option<&[u8]>) -> Result<(), StoreError> {
        let Some(current) = current else {
            return Ok(());
        };

        if self
            .allowed
            .iter()
            .any(|holder| holder.as_bytes() == current)
        {
            Ok(())
        } else {
            Err(StoreError::ClaimConflict {
                key: self.key.clone(),
                holder: String::from_utf8_lossy(current).into_owned(),
            })
        }
    }
}

///
/// SnapshotGuard
///
/// Precondition on state a transaction read while buffering: the key must
/// still hold what was read, or the ops derived from it are stale.
///

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SnapshotGuard {
    Value {
        key: String,
        expected: Option<Vec<u8>>,
    },
    Members {
        key: String,
        expected: BTreeSet<String>,
    },
}

impl SnapshotGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Value { key, .. } | Self::Members { key, .. } => key,
        }
    }

    /// Check a value snapshot against the key's current value.
    pub fn check_value(&self, current: Option<&[u8]>) -> Result<(), StoreError> {
        match self {
            Self::Value { expected, .. } if expected.as_deref() == current => Ok(()),
            _ => Err(self.stale()),
        }
    }

    /// Check a members snapshot against the key's current set. A missing
    /// set reads as empty.
    pub fn check_members(&self, current: Option<&BTreeSet<String>>) -> Result<(), StoreError> {
        let unchanged = match (self, current) {
            (Self::Members { expected, .. }, Some(current)) => expected == current,
            (Self::Members { expected, .. }, None) => expected.is_empty(),
            (Self::Value { .. }, _) => false,
        };

        if unchanged { Ok(()) } else { Err(self.stale()) }
    }

    /// Check this guard by reading the backend.
    pub fn check_against(&self, backend: &dyn Backend) -> Result<(), StoreError> {
        match self {
            Self::Value { key, .. } => self.check_value(backend.get(key)?.as_deref()),
            Self::Members { key, .. } => self.check_members(Some(&backend.members(key)?)),
        }
    }

    fn stale(&self) -> StoreError {
        StoreError::StaleSnapshot {
            key: self.key().to_string(),
        }
    }
}

///
/// WriteBatch
///
/// Guards plus ordered ops: the unit a commit hands to the backend.
///

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    pub guards: Vec<ClaimGuard>,
    pub snapshots: Vec<SnapshotGuard>,
    pub ops: Vec<StoreOp>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard(&mut self, guard: ClaimGuard) {
        self.guards.push(guard);
    }

    pub fn snapshot(&mut self, snapshot: SnapshotGuard) {
        self.snapshots.push(snapshot);
    }

    pub fn push(&mut self, op: StoreOp) {
        self.ops.push(op);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.guards.is_empty() && self.snapshots.is_empty() && self.ops.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_guard_allows_absent_and_listed_holders() {
        let guard = ClaimGuard {
            key: "u".to_string(),
            allowed: vec!["a".to_string(), "b".to_string()],
        };

        assert!(guard.check(None).is_ok());
        assert!(guard.check(Some(b"a")).is_ok());
        assert!(guard.check(Some(b"b")).is_ok());

        let err = guard.check(Some(b"c")).expect_err("foreign holder should fail");
        assert!(matches!(err, StoreError::ClaimConflict { holder, .. } if holder == "c"));
    }

    #[test]
    fn snapshot_guards_reject_any_change() {
        let value = SnapshotGuard::Value {
            key: "o".to_string(),
            expected: Some(b"v1".to_vec()),
        };
        assert!(value.check_value(Some(b"v1")).is_ok());
        assert!(matches!(
            value.check_value(Some(b"v2")),
            Err(StoreError::StaleSnapshot { key }) if key == "o"
        ));
        assert!(value.check_value(None).is_err());

        let members = SnapshotGuard::Members {
            key: "l".to_string(),
            expected: BTreeSet::new(),
        };
        assert!(members.check_members(None).is_ok());
        let grown = BTreeSet::from(["x".to_string()]);
        assert!(members.check_members(Some(&grown)).is_err());
    }
}
