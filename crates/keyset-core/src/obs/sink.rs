//! Metrics sink boundary.
//!
//! Engine code never touches `obs::metrics` directly. All instrumentation
//! flows through `MetricsEvent` and `MetricsSink`.
use crate::{model::entity::EntityModel, obs::metrics};
use std::{cell::RefCell, sync::Arc};

thread_local! {
    static SINK_OVERRIDE: RefCell<Option<Arc<dyn MetricsSink>>> = const { RefCell::new(None) };
}

///
/// ExecKind
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecKind {
    Load,
    Save,
    Delete,
}

///
/// PlanKind
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlanKind {
    /// Unique-predicate short circuit: one direct fetch.
    Unique,
    /// Set algebra over index, range, link or search sets.
    Index,
    /// Every instance of the model.
    All,
    /// Known to match nothing without touching the backend.
    Empty,
}

///
/// MetricsEvent
///

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MetricsEvent {
    ExecStart {
        kind: ExecKind,
        entity_path: &'static str,
    },
    ExecFinish {
        kind: ExecKind,
        entity_path: &'static str,
        rows_touched: u64,
    },
    Plan {
        kind: PlanKind,
    },
    UniqueViolation {
        entity_path: &'static str,
    },
    IndexDelta {
        entity_path: &'static str,
        inserts: u64,
        removes: u64,
    },
    LinkDelta {
        inserts: u64,
        removes: u64,
    },
    SearchDelta {
        entity_path: &'static str,
        inserts: u64,
        removes: u64,
    },
    CommitRollback {
        ops: u64,
    },
    HookFailure {
        entity_path: &'static str,
    },
}

///
/// MetricsSink
///

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricsEvent);
}

///
/// GlobalMetricsSink
/// Default sink that writes into the process-wide counters.
///

pub(crate) struct GlobalMetricsSink;

impl MetricsSink for GlobalMetricsSink {
    fn record(&self, event: MetricsEvent) {
        match event {
            MetricsEvent::ExecStart { kind, entity_path } => {
                metrics::with_state_mut(|m| {
                    let entry = m.entities.entry(entity_path.to_string()).or_default();
                    match kind {
                        ExecKind::Load => {
                            m.ops.load_calls = m.ops.load_calls.saturating_add(1);
                            entry.load_calls = entry.load_calls.saturating_add(1);
                        }
                        ExecKind::Save => {
                            m.ops.save_calls = m.ops.save_calls.saturating_add(1);
                            entry.save_calls = entry.save_calls.saturating_add(1);
                        }
                        ExecKind::Delete => {
                            m.ops.delete_calls = m.ops.delete_calls.saturating_add(1);
                            entry.delete_calls = entry.delete_calls.saturating_add(1);
                        }
                    }
                });
            }

            MetricsEvent::ExecFinish {
                kind,
                entity_path,
                rows_touched,
            } => {
                metrics::with_state_mut(|m| {
                    let entry = m.entities.entry(entity_path.to_string()).or_default();
                    match kind {
                        ExecKind::Load => {
                            m.ops.rows_loaded = m.ops.rows_loaded.saturating_add(rows_touched);
                            entry.rows_loaded = entry.rows_loaded.saturating_add(rows_touched);
                        }
                        ExecKind::Delete => {
                            m.ops.rows_deleted = m.ops.rows_deleted.saturating_add(rows_touched);
                            entry.rows_deleted = entry.rows_deleted.saturating_add(rows_touched);
                        }
                        ExecKind::Save => {}
                    }
                });
            }

            MetricsEvent::Plan { kind } => {
                metrics::with_state_mut(|m| match kind {
                    PlanKind::Unique => m.ops.plan_unique = m.ops.plan_unique.saturating_add(1),
                    PlanKind::Index => m.ops.plan_index = m.ops.plan_index.saturating_add(1),
                    PlanKind::All => m.ops.plan_all = m.ops.plan_all.saturating_add(1),
                    PlanKind::Empty => m.ops.plan_empty = m.ops.plan_empty.saturating_add(1),
                });
            }

            MetricsEvent::UniqueViolation { entity_path } => {
                metrics::with_state_mut(|m| {
                    m.ops.unique_violations = m.ops.unique_violations.saturating_add(1);
                    let entry = m.entities.entry(entity_path.to_string()).or_default();
                    entry.unique_violations = entry.unique_violations.saturating_add(1);
                });
            }

            MetricsEvent::IndexDelta {
                entity_path,
                inserts,
                removes,
            } => {
                metrics::with_state_mut(|m| {
                    m.ops.index_inserts = m.ops.index_inserts.saturating_add(inserts);
                    m.ops.index_removes = m.ops.index_removes.saturating_add(removes);
                    let entry = m.entities.entry(entity_path.to_string()).or_default();
                    entry.index_inserts = entry.index_inserts.saturating_add(inserts);
                    entry.index_removes = entry.index_removes.saturating_add(removes);
                });
            }

            MetricsEvent::LinkDelta { inserts, removes } => {
                metrics::with_state_mut(|m| {
                    m.ops.link_inserts = m.ops.link_inserts.saturating_add(inserts);
                    m.ops.link_removes = m.ops.link_removes.saturating_add(removes);
                });
            }

            MetricsEvent::SearchDelta {
                inserts, removes, ..
            } => {
                metrics::with_state_mut(|m| {
                    m.ops.search_inserts = m.ops.search_inserts.saturating_add(inserts);
                    m.ops.search_removes = m.ops.search_removes.saturating_add(removes);
                });
            }

            MetricsEvent::CommitRollback { .. } => {
                metrics::with_state_mut(|m| {
                    m.ops.commit_rollbacks = m.ops.commit_rollbacks.saturating_add(1);
                });
            }

            MetricsEvent::HookFailure { .. } => {
                metrics::with_state_mut(|m| {
                    m.ops.hook_failures = m.ops.hook_failures.saturating_add(1);
                });
            }
        }
    }
}

pub(crate) const GLOBAL_METRICS_SINK: GlobalMetricsSink = GlobalMetricsSink;

pub(crate) fn record(event: MetricsEvent) {
    let sink = SINK_OVERRIDE.with(|cell| cell.borrow().clone());
    match sink {
        Some(sink) => sink.record(event),
        None => GLOBAL_METRICS_SINK.record(event),
    }
}

/// Snapshot the current metrics state.
///
/// `window_start_ms` filters by window start, not by per-event timestamps.
#[must_use]
pub fn metrics_report(window_start_ms: Option<i64>) -> metrics::EventReport {
    metrics::report_window_start(window_start_ms)
}

/// Reset all metrics state.
pub fn metrics_reset_all() {
    metrics::reset_all();
}

/// Run a closure with a temporary metrics sink override on this thread.
pub fn with_metrics_sink<T>(sink: Arc<dyn MetricsSink>, f: impl FnOnce() -> T) -> T {
    struct Guard(Option<Arc<dyn MetricsSink>>);

    impl Drop for Guard {
        fn drop(&mut self) {
            let prev = self.0.take();
            SINK_OVERRIDE.with(|cell| {
                *cell.borrow_mut() = prev;
            });
        }
    }

    let prev = SINK_OVERRIDE.with(|cell| cell.borrow_mut().replace(sink));
    let _guard = Guard(prev);

    f()
}

///
/// Span
/// RAII guard that emits start/finish events for one engine call.
/// Finish accounting happens even on unwind.
///

pub(crate) struct Span {
    kind: ExecKind,
    entity_path: &'static str,
    rows: u64,
}

impl Span {
    #[must_use]
    pub(crate) fn new(kind: ExecKind, model: &'static EntityModel) -> Self {
        record(MetricsEvent::ExecStart {
            kind,
            entity_path: model.path,
        });

        Self {
            kind,
            entity_path: model.path,
            rows: 0,
        }
    }

    pub(crate) const fn set_rows(&mut self, rows: u64) {
        self.rows = rows;
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        record(MetricsEvent::ExecFinish {
            kind: self.kind,
            entity_path: self.entity_path,
            rows_touched: self.rows,
        });
    }
}

///
/// TESTS
///
