use crate::db::store::{
    Backend, Capabilities, SnapshotGuard, StoreError, StoreOp, WriteBatch, score_in_bounds,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap},
    ops::Bound,
};

///
/// MemoryStore
///
/// Process-local backend. One mutex guards all state, so `atomic_apply`
/// checks guards and applies ops with no interleaving writer.
///

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<String, Vec<u8>>,
    sets: HashMap<String, BTreeSet<String>>,
    scored: HashMap<String, HashMap<String, f64>>,
}

impl MemoryState {
    fn delete(&mut self, key: &str) -> bool {
        let value = self.values.remove(key).is_some();
        let set = self.sets.remove(key).is_some();
        let scored = self.scored.remove(key).is_some();

        value || set || scored
    }

    fn add_to_set(&mut self, key: &str, member: &str) -> bool {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string())
    }

    fn remove_from_set(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sets.get_mut(key) else {
            return false;
        };
        let removed = set.remove(member);
        if set.is_empty() {
            self.sets.remove(key);
        }

        removed
    }

    fn add_scored(&mut self, key: &str, member: &str, score: f64) {
        self.scored
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
    }

    fn remove_scored(&mut self, key: &str, member: &str) -> bool {
        let Some(scores) = self.scored.get_mut(key) else {
            return false;
        };
        let removed = scores.remove(member).is_some();
        if scores.is_empty() {
            self.scored.remove(key);
        }

        removed
    }

    fn members(&self, key: &str) -> BTreeSet<String> {
        self.sets.get(key).cloned().unwrap_or_default()
    }

    fn apply(&mut self, op: &StoreOp) {
        match op {
            StoreOp::Set { key, value } => {
                self.values.insert(key.clone(), value.clone());
            }
            StoreOp::Delete { key } => {
                self.delete(key);
            }
            StoreOp::AddToSet { key, member } => {
                self.add_to_set(key, member);
            }
            StoreOp::RemoveFromSet { key, member } => {
                self.remove_from_set(key, member);
            }
            StoreOp::AddScored { key, member, score } => self.add_scored(key, member, *score),
            StoreOp::RemoveScored { key, member } => {
                self.remove_scored(key, member);
            }
        }
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of live keys of any kind.
    #[must_use]
    pub fn key_count(&self) -> usize {
        let state = self.state.lock();
        state.values.len() + state.sets.len() + state.scored.len()
    }

    /// Every live key starting with `prefix`, sorted.
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut keys: Vec<String> = state
            .values
            .keys()
            .chain(state.sets.keys())
            .chain(state.scored.keys())
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();

        keys
    }
}

impl Backend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { atomic_apply: true }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.state.lock().values.get(key).cloned())
    }

    fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        let state = self.state.lock();
        Ok(keys.iter().map(|key| state.values.get(key).cloned()).collect())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.state.lock().values.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().delete(key))
    }

    fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let state = self.state.lock();
        Ok(state.values.contains_key(key)
            || state.sets.contains_key(key)
            || state.scored.contains_key(key))
    }

    fn add_to_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().add_to_set(key, member))
    }

    fn remove_from_set(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().remove_from_set(key, member))
    }

    fn members(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.state.lock().members(key))
    }

    fn members_many(&self, keys: &[String]) -> Result<Vec<BTreeSet<String>>, StoreError> {
        let state = self.state.lock();
        Ok(keys.iter().map(|key| state.members(key)).collect())
    }

    fn is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .sets
            .get(key)
            .is_some_and(|set| set.contains(member)))
    }

    fn intersect(&self, keys: &[String]) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.lock();
        let Some((first, rest)) = keys.split_first() else {
            return Ok(BTreeSet::new());
        };

        let mut out = state.members(first);
        for key in rest {
            if out.is_empty() {
                break;
            }
            match state.sets.get(key) {
                Some(set) => out.retain(|member| set.contains(member)),
                None => out.clear(),
            }
        }

        Ok(out)
    }

    fn union(&self, keys: &[String]) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.lock();
        Ok(keys
            .iter()
            .filter_map(|key| state.sets.get(key))
            .flatten()
            .cloned()
            .collect())
    }

    fn difference(&self, key: &str, minus: &[String]) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.lock();
        let mut out = state.members(key);
        for other in minus.iter().filter_map(|key| state.sets.get(key)) {
            out.retain(|member| !other.contains(member));
        }

        Ok(out)
    }

    fn size(&self, key: &str) -> Result<usize, StoreError> {
        let state = self.state.lock();
        Ok(state
            .sets
            .get(key)
            .map(BTreeSet::len)
            .or_else(|| state.scored.get(key).map(HashMap::len))
            .unwrap_or(0))
    }

    fn add_scored(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.state.lock().add_scored(key, member, score);
        Ok(())
    }

    fn remove_scored(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().remove_scored(key, member))
    }

    fn score(&self, key: &str, member: &str) -> Result<Option<f64>, StoreError> {
        Ok(self
            .state
            .lock()
            .scored
            .get(key)
            .and_then(|scores| scores.get(member).copied()))
    }

    fn range_by_score(
        &self,
        key: &str,
        min: Bound<f64>,
        max: Bound<f64>,
    ) -> Result<BTreeSet<String>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .scored
            .get(key)
            .map(|scores| {
                scores
                    .iter()
                    .filter(|(_, score)| score_in_bounds(**score, min, max))
                    .map(|(member, _)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn atomic_apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut state = self.state.lock();

        for guard in &batch.guards {
            guard.check(state.values.get(&guard.key).map(Vec::as_slice))?;
        }
        for snapshot in &batch.snapshots {
            match snapshot {
                SnapshotGuard::Value { key, .. } => {
                    snapshot.check_value(state.values.get(key).map(Vec::as_slice))?;
                }
                SnapshotGuard::Members { key, .. } => {
                    snapshot.check_members(state.sets.get(key))?;
                }
            }
        }
        for op in &batch.ops {
            state.apply(op);
        }

        Ok(())
    }

    fn flush(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut state = self.state.lock();
        let before = state.values.len() + state.sets.len() + state.scored.len();

        state.values.retain(|key, _| !key.starts_with(prefix));
        state.sets.retain(|key, _| !key.starts_with(prefix));
        state.scored.retain(|key, _| !key.starts_with(prefix));

        let after = state.values.len() + state.sets.len() + state.scored.len();
        Ok(before - after)
    }
}

///
/// TESTS
///

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::ClaimGuard;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| (*name).to_string()).collect()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for (key, member) in [("a", "1"), ("a", "2"), ("a", "3"), ("b", "2"), ("b", "3")] {
            store.add_to_set(key, member).expect("sadd should succeed");
        }
        store.add_to_set("c", "3").expect("sadd should succeed");

        store
    }

    #[test]
    fn set_algebra() {
        let store = seeded();

        let both = store.intersect(&keys(&["a", "b"])).expect("intersect");
        assert_eq!(both, BTreeSet::from(["2".to_string(), "3".to_string()]));

        let none = store.intersect(&keys(&["a", "missing"])).expect("intersect");
        assert!(none.is_empty());

        let all = store.union(&keys(&["b", "c"])).expect("union");
        assert_eq!(all.len(), 2);

        let rest = store.difference("a", &keys(&["c"])).expect("difference");
        assert_eq!(rest, BTreeSet::from(["1".to_string(), "2".to_string()]));
    }

    #[test]
    fn empty_sets_disappear() {
        let store = MemoryStore::new();
        store.add_to_set("s", "x").expect("sadd");
        assert!(store.exists("s").expect("exists"));

        store.remove_from_set("s", "x").expect("srem");
        assert!(!store.exists("s").expect("exists"));
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn range_by_score_respects_bounds() {
        let store = MemoryStore::new();
        for (member, score) in [("a", -3.0), ("b", -1.0), ("c", 0.0), ("d", 2.0), ("e", 4.0)] {
            store.add_scored("r", member, score).expect("zadd");
        }

        let gt = store
            .range_by_score("r", Bound::Excluded(1.0), Bound::Unbounded)
            .expect("range");
        assert_eq!(gt, BTreeSet::from(["d".to_string(), "e".to_string()]));

        let window = store
            .range_by_score("r", Bound::Included(-2.0), Bound::Excluded(3.0))
            .expect("range");
        assert_eq!(window.len(), 3);
        assert_eq!(store.size("r").expect("size"), 5);
    }

    #[test]
    fn atomic_apply_checks_guards_before_any_write() {
        let store = MemoryStore::new();
        store.set("u", b"owner".to_vec()).expect("set");

        let mut batch = WriteBatch::new();
        batch.push(StoreOp::AddToSet {
            key: "s".to_string(),
            member: "x".to_string(),
        });
        batch.guard(ClaimGuard {
            key: "u".to_string(),
            allowed: vec!["other".to_string()],
        });

        let err = store.atomic_apply(&batch).expect_err("guard should fail");
        assert!(matches!(err, StoreError::ClaimConflict { .. }));
        assert!(!store.exists("s").expect("exists"));
    }

    #[test]
    fn atomic_apply_rejects_stale_snapshots() {
        let store = MemoryStore::new();
        store.set("o", b"v2".to_vec()).expect("set");
        store.add_to_set("l", "peer").expect("sadd");

        let mut batch = WriteBatch::new();
        batch.push(StoreOp::Set {
            key: "o".to_string(),
            value: b"v3".to_vec(),
        });
        batch.snapshot(SnapshotGuard::Value {
            key: "o".to_string(),
            expected: Some(b"v1".to_vec()),
        });
        let err = store.atomic_apply(&batch).expect_err("value moved on");
        assert!(matches!(err, StoreError::StaleSnapshot { ref key } if key == "o"));
        assert_eq!(store.get("o").expect("get"), Some(b"v2".to_vec()));

        batch.snapshots = vec![
            SnapshotGuard::Value {
                key: "o".to_string(),
                expected: Some(b"v2".to_vec()),
            },
            SnapshotGuard::Members {
                key: "l".to_string(),
                expected: BTreeSet::from(["peer".to_string()]),
            },
        ];
        store.atomic_apply(&batch).expect("fresh snapshots should apply");
        assert_eq!(store.get("o").expect("get"), Some(b"v3".to_vec()));
    }

    #[test]
    fn flush_removes_only_prefixed_keys() {
        let store = seeded();
        store.set("p:x", vec![1]).expect("set");
        store.add_scored("p:r", "m", 1.0).expect("zadd");

        assert_eq!(store.flush("p:").expect("flush"), 2);
        assert_eq!(store.keys_with_prefix(""), keys(&["a", "b", "c"]));
    }
}
