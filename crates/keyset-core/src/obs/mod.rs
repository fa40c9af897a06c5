//! Observability: runtime counters and the sink abstraction that feeds them.
//!
//! This module does not access storage. Engine code reports through
//! `sink::record`; structured logs go through `tracing` directly.

pub(crate) mod metrics;
pub(crate) mod sink;

// re-exports
pub use metrics::{EntityCounters, EventOps, EventReport, EventState};
pub use sink::{
    ExecKind, MetricsEvent, MetricsSink, PlanKind, metrics_report, metrics_reset_all,
    with_metrics_sink,
};
