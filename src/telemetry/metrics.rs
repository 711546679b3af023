//! Metric instrument factories for backwork.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"backwork"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for backwork instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("backwork")
}

/// Counter: work submissions.
/// Labels: `worker`, `result` ("created" | "kept" | "error").
pub fn work_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("backwork.work.enqueued")
        .with_description("Number of work submissions")
        .build()
}

/// Counter: work record state transitions.
/// Labels: `from`, `to`.
pub fn work_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("backwork.work.state_transitions")
        .with_description("Number of work record state transitions")
        .build()
}

/// Counter: backend arm decisions.
/// Labels: `backend` ("managed" | "self_managed" | "none"), `result` ("armed" | "deferred").
pub fn backend_arm_decisions() -> Counter<u64> {
    meter()
        .u64_counter("backwork.backend.arm_decisions")
        .with_description("Number of backend arm decisions")
        .build()
}

/// Counter: records handed to a worker.
/// Labels: `worker`.
pub fn work_dispatched() -> Counter<u64> {
    meter()
        .u64_counter("backwork.work.dispatched")
        .with_description("Number of records dispatched to workers")
        .build()
}

/// Counter: retries scheduled after a retry request, fault or timeout.
/// Labels: `worker`.
pub fn work_retries() -> Counter<u64> {
    meter()
        .u64_counter("backwork.work.retries")
        .with_description("Number of retries scheduled")
        .build()
}

/// Counter: transitions into the storage-unavailable state.
pub fn storage_unavailable() -> Counter<u64> {
    meter()
        .u64_counter("backwork.storage.unavailable")
        .with_description("Number of times scheduling paused on storage failure")
        .build()
}

/// Histogram: worker run duration in milliseconds.
/// Labels: `worker`.
pub fn run_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("backwork.work.run_duration_ms")
        .with_description("Worker run duration in milliseconds")
        .with_unit("ms")
        .build()
}
