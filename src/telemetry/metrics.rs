//! Metric instrument factories for shipwright.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"shipwright"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Returns the shared meter for shipwright instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("shipwright")
}

/// Counter: jobs enqueued.
/// Labels: `queue`, `result` ("ok" | "rejected").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("shipwright.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: job state transitions.
/// Labels: `queue`, `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("shipwright.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: queue-level operations (enqueue, dequeue, complete, fail, ...).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("shipwright.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: agent turns.
/// Labels: `outcome` ("tools" | "text" | "timeout" | "error").
pub fn agent_turns() -> Counter<u64> {
    meter()
        .u64_counter("shipwright.agent.turns")
        .with_description("Number of agent turns")
        .build()
}

/// Counter: tool calls executed by the agent.
/// Labels: `tool`, `result` ("ok" | "rejected" | "invalid").
pub fn tool_calls() -> Counter<u64> {
    meter()
        .u64_counter("shipwright.agent.tool_calls")
        .with_description("Number of agent tool calls")
        .build()
}

/// Counter: LLM token usage.
/// Labels: `model`, `provider`, `direction` ("input" | "output").
pub fn llm_tokens() -> Counter<u64> {
    meter()
        .u64_counter("shipwright.llm.tokens")
        .with_description("LLM token usage")
        .build()
}

/// Counter: progress events handed to subscribers.
/// Labels: `result` ("delivered" | "dropped").
pub fn progress_events() -> Counter<u64> {
    meter()
        .u64_counter("shipwright.progress.events")
        .with_description("Progress events published to live subscribers")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("shipwright.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
