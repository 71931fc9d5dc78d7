use std::sync::LazyLock;

use prometheus::{Histogram, IntCounter, IntGauge, Registry};

/* ============================= REGISTRY ============================= */

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/* ============================= METRICS ============================= */

pub static EVENTS_PROCESSED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "coastguard_events_processed_total",
        "Total cluster events processed by the controller loop",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static PODS_TRACKED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "coastguard_remote_pods",
        "Remote pods currently tracked across all clusters",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub static POLICIES_TRACKED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "coastguard_remote_network_policies",
        "Original NetworkPolicies currently tracked across all clusters",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub static GENERATED_OBSERVED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "coastguard_generated_policies_observed",
        "Generated NetworkPolicies observed back from the clusters",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub static CLUSTERS_SYNCED: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new(
        "coastguard_clusters_synced",
        "Clusters whose caches have finished their initial sync",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(g.clone()))
        .expect("metric not yet registered");
    g
});

pub static POLICIES_DISTRIBUTED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "coastguard_policies_distributed_total",
        "Generated NetworkPolicies successfully distributed",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static POLICIES_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "coastguard_policies_deleted_total",
        "Stale generated NetworkPolicies successfully deleted",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static DISTRIBUTE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "coastguard_distribute_errors_total",
        "Failed or timed out distribute attempts",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static DELETE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new(
        "coastguard_delete_errors_total",
        "Failed or timed out delete attempts",
    )
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

pub static RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "coastguard_reconcile_duration_seconds",
        "Duration of each generated-policy reconcile pass in seconds",
    ))
    .expect("metric definition is valid");
    REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/// Force-init all metrics so they appear on /metrics before first use.
pub fn force_init() {
    LazyLock::force(&EVENTS_PROCESSED);
    LazyLock::force(&PODS_TRACKED);
    LazyLock::force(&POLICIES_TRACKED);
    LazyLock::force(&GENERATED_OBSERVED);
    LazyLock::force(&CLUSTERS_SYNCED);
    LazyLock::force(&POLICIES_DISTRIBUTED);
    LazyLock::force(&POLICIES_DELETED);
    LazyLock::force(&DISTRIBUTE_ERRORS);
    LazyLock::force(&DELETE_ERRORS);
    LazyLock::force(&RECONCILE_DURATION);
}

/* ============================= TESTS ============================= */
