use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::LazyLock};

///
/// EventState
/// Ephemeral, in-memory counters for engine operations.
///

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EventState {
    pub ops: EventOps,
    pub entities: BTreeMap<String, EntityCounters>,
    pub since_ms: i64,
}

impl Default for EventState {
    fn default() -> Self {
        Self {
            ops: EventOps::default(),
            entities: BTreeMap::new(),
            since_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

///
/// EventOps
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventOps {
    // Entrypoints
    pub load_calls: u64,
    pub save_calls: u64,
    pub delete_calls: u64,

    // Planner kinds
    pub plan_unique: u64,
    pub plan_index: u64,
    pub plan_all: u64,
    pub plan_empty: u64,

    // Rows touched
    pub rows_loaded: u64,
    pub rows_deleted: u64,

    // Index maintenance
    pub index_inserts: u64,
    pub index_removes: u64,
    pub link_inserts: u64,
    pub link_removes: u64,
    pub search_inserts: u64,
    pub search_removes: u64,
    pub unique_violations: u64,

    // Failures
    pub commit_rollbacks: u64,
    pub hook_failures: u64,
}

///
/// EntityCounters
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EntityCounters {
    pub load_calls: u64,
    pub save_calls: u64,
    pub delete_calls: u64,
    pub rows_loaded: u64,
    pub rows_deleted: u64,
    pub index_inserts: u64,
    pub index_removes: u64,
    pub unique_violations: u64,
}

///
/// EventReport
/// Point-in-time copy of the counters.
///

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct EventReport {
    /// `None` when the window started before the requested start.
    pub counters: Option<EventState>,
}

static EVENT_STATE: LazyLock<Mutex<EventState>> =
    LazyLock::new(|| Mutex::new(EventState::default()));

/// Borrow metrics mutably.
pub(crate) fn with_state_mut<R>(f: impl FnOnce(&mut EventState) -> R) -> R {
    f(&mut EVENT_STATE.lock())
}

/// Reset all counters and restart the window.
pub fn reset_all() {
    *EVENT_STATE.lock() = EventState::default();
}

/// Report the counters, optionally only if the window began at or after
/// `window_start_ms`.
#[must_use]
pub fn report_window_start(window_start_ms: Option<i64>) -> EventReport {
    let state = EVENT_STATE.lock().clone();
    let counters = match window_start_ms {
        Some(start) if state.since_ms < start => None,
        _ => Some(state),
    };

    EventReport { counters }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_window_start_yields_no_counters() {
        let future = chrono::Utc::now().timestamp_millis() + 60_000;
        assert!(report_window_start(Some(future)).counters.is_none());
        assert!(report_window_start(None).counters.is_some());
    }

    #[test]
    fn report_serializes_with_stable_field_names() {
        let json = serde_json::to_value(report_window_start(None))
            .expect("report should serialize");

        let ops = &json["counters"]["ops"];
        for field in ["save_calls", "plan_unique", "index_inserts", "search_removes"] {
            assert!(ops[field].is_u64(), "missing counter {field}");
        }
        assert!(json["counters"]["entities"].is_object());
    }
}
