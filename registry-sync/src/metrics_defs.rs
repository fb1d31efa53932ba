//! Metrics definitions for the registry synchronizer.

use shared::metrics_defs::{MetricDef, MetricType};

pub const INGRESS_EVENTS: MetricDef = MetricDef {
    name: "ingress.events",
    metric_type: MetricType::Counter,
    description: "Add/delete notifications received from the local registry, tagged by kind and outcome",
};

pub const FEED_EVENTS_APPLIED: MetricDef = MetricDef {
    name: "feed.events.applied",
    metric_type: MetricType::Counter,
    description: "Change feed events applied to the local registry",
};

pub const FEED_EVENTS_SKIPPED: MetricDef = MetricDef {
    name: "feed.events.skipped",
    metric_type: MetricType::Counter,
    description: "Change feed events ignored, tagged by reason",
};

pub const FEED_RECONNECTS: MetricDef = MetricDef {
    name: "feed.reconnects",
    metric_type: MetricType::Counter,
    description: "Number of times the change feed was re-opened after closing",
};

pub const RETRY_ATTEMPTS: MetricDef = MetricDef {
    name: "retry.attempts",
    metric_type: MetricType::Counter,
    description: "Failed attempts of retried operations, tagged by operation",
};

pub const RECONCILE_UPSERTS: MetricDef = MetricDef {
    name: "reconcile.upserts",
    metric_type: MetricType::Counter,
    description: "Registry services missing from the directory and written back by reconciliation",
};

pub const RECONCILE_DELETES: MetricDef = MetricDef {
    name: "reconcile.deletes",
    metric_type: MetricType::Counter,
    description: "Stale directory records removed by reconciliation",
};

pub const RECONCILE_FAILURES: MetricDef = MetricDef {
    name: "reconcile.failures",
    metric_type: MetricType::Counter,
    description: "Reconciliation passes abandoned because a dependency could not be read",
};

pub const RECONCILE_DURATION: MetricDef = MetricDef {
    name: "reconcile.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a reconciliation pass in seconds",
};

pub const ALL_METRICS: &[MetricDef] = &[
    INGRESS_EVENTS,
    FEED_EVENTS_APPLIED,
    FEED_EVENTS_SKIPPED,
    FEED_RECONNECTS,
    RETRY_ATTEMPTS,
    RECONCILE_UPSERTS,
    RECONCILE_DELETES,
    RECONCILE_FAILURES,
    RECONCILE_DURATION,
];
