//! Metric instruments
//!
//! Uses the OpenTelemetry meter API against the globally registered
//! `MeterProvider`. Without a registered provider the instruments are no-ops.

use opentelemetry::metrics::{Counter, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("taskrelay")
}

/// Counter: index reads by outcome.
/// Labels: `source` ("fresh" | "refreshed" | "stale" | "failed").
pub fn index_reads() -> Counter<u64> {
    meter()
        .u64_counter("taskrelay.index.reads")
        .with_description("Task index reads by outcome")
        .build()
}

/// Counter: store enumeration calls.
/// Labels: `namespace` ("task" | "lease").
pub fn list_calls() -> Counter<u64> {
    meter()
        .u64_counter("taskrelay.store.list_calls")
        .with_description("Store list calls issued")
        .build()
}

/// Counter: lease enumerations that failed and closed the claim path.
pub fn lease_enumeration_failures() -> Counter<u64> {
    meter()
        .u64_counter("taskrelay.lease.enumeration_failures")
        .with_description("Failed lease enumerations (fail-closed)")
        .build()
}

/// Counter: tasks durably enqueued.
/// Labels: `priority`.
pub fn tasks_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("taskrelay.tasks.enqueued")
        .with_description("Tasks written to the queue")
        .build()
}

/// Counter: tasks claimed by workers.
pub fn tasks_claimed() -> Counter<u64> {
    meter()
        .u64_counter("taskrelay.tasks.claimed")
        .with_description("Tasks claimed by workers")
        .build()
}

/// Counter: acquire attempts that found another worker's lease.
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("taskrelay.claim.conflicts")
        .with_description("Lease conflicts observed while claiming")
        .build()
}

/// Counter: push deliveries that fell back to the KV queue.
/// Labels: `mode`, `reason`.
pub fn delivery_degraded() -> Counter<u64> {
    meter()
        .u64_counter("taskrelay.delivery.degraded")
        .with_description("Deliveries accepted through the queue fallback")
        .build()
}
