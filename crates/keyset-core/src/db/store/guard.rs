use crate::db::store::{Backend, StoreError, StoreOp, WriteBatch};
use tracing::warn;

///
/// ApplyGuard
///
/// Op-by-op apply for backends without atomic batches. Each applied op
/// records the ops that undo it; if the guard is dropped before `finish`,
/// every recorded undo runs in reverse order.
///
/// Compensation is in-process and best-effort. A crash mid-apply can still
/// leave a partial batch behind, which is why atomic backends are preferred.
///

pub(crate) struct ApplyGuard<'a> {
    backend: &'a dyn Backend,
    finished: bool,
    undo: Vec<StoreOp>,
}

impl<'a> ApplyGuard<'a> {
    pub(crate) const fn new(backend: &'a dyn Backend) -> Self {
        Self {
            backend,
            finished: false,
            undo: Vec::new(),
        }
    }

    pub(crate) fn apply(&mut self, op: &StoreOp) -> Result<(), StoreError> {
        let undo = op.undo_ops(self.backend)?;
        op.apply_to(self.backend)?;
        self.undo.extend(undo);

        Ok(())
    }

    pub(crate) fn finish(mut self) {
        self.finished = true;
        self.undo.clear();
    }

    fn rollback_best_effort(&mut self) {
        while let Some(op) = self.undo.pop() {
            if let Err(err) = op.apply_to(self.backend) {
                warn!(
                    backend = self.backend.name(),
                    key = op.key(),
                    error = %err,
                    "compensating write failed"
                );
            }
        }
    }
}

impl Drop for ApplyGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback_best_effort();
        }
    }
}

/// Apply `batch` on a backend without atomic batches.
///
/// Guards are checked up front by reading each claim and snapshot key. Any op failure
/// drops the guard, which reverts everything applied so far.
pub(crate) fn apply_compensating(
    backend: &dyn Backend,
    batch: &WriteBatch,
) -> Result<(), StoreError> {
    for guard in &batch.guards {
        let current = backend.get(&guard.key)?;
        guard.check(current.as_deref())?;
    }
    for snapshot in &batch.snapshots {
        snapshot.check_against(backend)?;
    }

    let mut guard = ApplyGuard::new(backend);
    for op in &batch.ops {
        guard.apply(op)?;
    }
    guard.finish();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::store::{MemoryStore, SnapshotGuard},
        test_support::FlakyStore,
    };
    use std::collections::BTreeSet;

    fn op_set(key: &str, value: &str) -> StoreOp {
        StoreOp::Set {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
        }
    }

    fn op_sadd(key: &str, member: &str) -> StoreOp {
        StoreOp::AddToSet {
            key: key.to_string(),
            member: member.to_string(),
        }
    }

    #[test]
    fn failed_op_reverts_earlier_ops() {
        let store = FlakyStore::new(MemoryStore::new());
        store
            .inner()
            .set("a", b"old".to_vec())
            .expect("seed should succeed");

        let mut batch = WriteBatch::new();
        batch.push(op_set("a", "new"));
        batch.push(op_sadd("s", "x"));
        batch.push(op_set("b", "1"));

        store.fail_after_writes(2);
        let err = apply_compensating(&store, &batch).expect_err("third write should fail");
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.heal();
        assert_eq!(store.get("a").expect("get"), Some(b"old".to_vec()));
        assert!(store.members("s").expect("members").is_empty());
        assert_eq!(store.get("b").expect("get"), None);
    }

    #[test]
    fn finished_guard_keeps_writes() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.push(op_set("a", "1"));
        batch.push(op_sadd("s", "x"));

        apply_compensating(&store, &batch).expect("apply should succeed");

        assert_eq!(store.get("a").expect("get"), Some(b"1".to_vec()));
        assert!(store.is_member("s", "x").expect("is_member"));
    }

    #[test]
    fn stale_snapshot_blocks_every_op() {
        let store = FlakyStore::new(MemoryStore::new());
        store
            .inner()
            .add_to_set("l", "late")
            .expect("seed should succeed");

        let mut batch = WriteBatch::new();
        batch.snapshot(SnapshotGuard::Members {
            key: "l".to_string(),
            expected: BTreeSet::new(),
        });
        batch.push(op_set("a", "1"));

        let err = apply_compensating(&store, &batch).expect_err("link set changed");
        assert!(matches!(err, StoreError::StaleSnapshot { .. }));
        assert_eq!(store.get("a").expect("get"), None);
    }
}
