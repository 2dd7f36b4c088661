//! # Metrics
//!
//! Prometheus metrics for monitoring the operator.
//!
//! ## Metrics Exposed
//!
//! - `keystone_operator_reconciliations_total` - Total number of reconciliations
//! - `keystone_operator_reconciliation_errors_total` - Total number of reconciliation errors
//! - `keystone_operator_reconciliation_duration_seconds` - Duration of reconciliations
//! - `keystone_operator_requeues_total` - Requeues by reason
//! - `keystone_operator_identity_operations_total` - Identity backend calls by operation and outcome
//! - `keystone_operator_identity_operation_duration_seconds` - Duration of identity backend calls
//! - `keystone_operator_fernet_rotations_total` - Fernet key rotations
//! - `keystone_operator_fernet_resizes_total` - Fernet key ring resizes

use anyhow::Result;
use prometheus::{Histogram, HistogramVec, IntCounter, IntCounterVec, Opts, Registry};
use std::sync::LazyLock;

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RECONCILIATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keystone_operator_reconciliations_total",
        "Total number of reconciliations",
    )
    .expect("Failed to create RECONCILIATIONS_TOTAL metric - this should never happen")
});

static RECONCILIATION_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keystone_operator_reconciliation_errors_total",
        "Total number of reconciliation errors",
    )
    .expect("Failed to create RECONCILIATION_ERRORS_TOTAL metric - this should never happen")
});

static RECONCILIATION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "keystone_operator_reconciliation_duration_seconds",
            "Duration of reconciliation in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create RECONCILIATION_DURATION metric - this should never happen")
});

static REQUEUES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keystone_operator_requeues_total",
            "Total number of requeues by reason",
        ),
        &["reason"],
    )
    .expect("Failed to create REQUEUES_TOTAL metric - this should never happen")
});

static IDENTITY_OPERATIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keystone_operator_identity_operations_total",
            "Total number of identity backend operations",
        ),
        &["operation", "outcome"],
    )
    .expect("Failed to create IDENTITY_OPERATIONS_TOTAL metric - this should never happen")
});

static IDENTITY_OPERATION_DURATION: LazyLock<HistogramVec> = LazyLock::new(|| {
    HistogramVec::new(
        prometheus::HistogramOpts::new(
            "keystone_operator_identity_operation_duration_seconds",
            "Duration of identity backend operations in seconds",
        )
        .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
        &["operation"],
    )
    .expect("Failed to create IDENTITY_OPERATION_DURATION metric - this should never happen")
});

static FERNET_ROTATIONS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keystone_operator_fernet_rotations_total",
        "Total number of fernet key rotations",
    )
    .expect("Failed to create FERNET_ROTATIONS_TOTAL metric - this should never happen")
});

static FERNET_RESIZES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "keystone_operator_fernet_resizes_total",
        "Total number of fernet key ring resizes",
    )
    .expect("Failed to create FERNET_RESIZES_TOTAL metric - this should never happen")
});

pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(RECONCILIATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RECONCILIATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(REQUEUES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(IDENTITY_OPERATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(IDENTITY_OPERATION_DURATION.clone()))?;
    REGISTRY.register(Box::new(FERNET_ROTATIONS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FERNET_RESIZES_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_reconciliations() {
    RECONCILIATIONS_TOTAL.inc();
}

pub fn increment_reconciliation_errors() {
    RECONCILIATION_ERRORS_TOTAL.inc();
}

pub fn observe_reconciliation_duration(duration: f64) {
    RECONCILIATION_DURATION.observe(duration);
}

pub fn increment_requeues_total(reason: &str) {
    REQUEUES_TOTAL.with_label_values(&[reason]).inc();
}

pub fn record_identity_operation(operation: &str, outcome: &str, duration: f64) {
    IDENTITY_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    IDENTITY_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(duration);
}

pub fn increment_fernet_rotations() {
    FERNET_ROTATIONS_TOTAL.inc();
}

pub fn increment_fernet_resizes() {
    FERNET_RESIZES_TOTAL.inc();
}
