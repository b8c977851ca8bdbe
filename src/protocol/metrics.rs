//! Process-wide dispatcher counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::Fault;

/// Process-wide dispatcher counters.
pub(crate) struct Metrics;

static MESSAGES_PARSED: AtomicU64 = AtomicU64::new(0);
static INVOCATIONS: AtomicU64 = AtomicU64::new(0);
static RESPONSES: AtomicU64 = AtomicU64::new(0);
static CANCELLATIONS: AtomicU64 = AtomicU64::new(0);
static BYTES_READ: AtomicU64 = AtomicU64::new(0);
static BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static INVOKE_LATENCY_TOTAL_NS: AtomicU64 = AtomicU64::new(0);
static INVOKE_LATENCY_MAX_NS: AtomicU64 = AtomicU64::new(0);

const NANOSECONDS_PER_MICROSECOND: u128 = 1_000;

struct FaultCounters {
    markup: AtomicU64,
    serialization: AtomicU64,
    conversion: AtomicU64,
    invalid_request: AtomicU64,
    missing_arguments: AtomicU64,
    method_not_found: AtomicU64,
    procedure: AtomicU64,
}

static FAULT_COUNTERS: FaultCounters = FaultCounters::new();

impl FaultCounters {
    const fn new() -> Self {
        Self {
            markup: AtomicU64::new(0),
            serialization: AtomicU64::new(0),
            conversion: AtomicU64::new(0),
            invalid_request: AtomicU64::new(0),
            missing_arguments: AtomicU64::new(0),
            method_not_found: AtomicU64::new(0),
            procedure: AtomicU64::new(0),
        }
    }

    fn increment(&self, code: i32) {
        let counter = match code {
            Fault::MARKUP_ERROR => &self.markup,
            Fault::SERIALIZATION_ERROR => &self.serialization,
            Fault::CONVERSION_ERROR => &self.conversion,
            Fault::INVALID_REQUEST => &self.invalid_request,
            Fault::MISSING_ARGUMENTS => &self.missing_arguments,
            Fault::METHOD_NOT_FOUND => &self.method_not_found,
            // Internal errors and codes chosen by procedures.
            _ => &self.procedure,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn total(&self) -> u64 {
        [
            &self.markup,
            &self.serialization,
            &self.conversion,
            &self.invalid_request,
            &self.missing_arguments,
            &self.method_not_found,
            &self.procedure,
        ]
        .iter()
        .map(|counter| counter.load(Ordering::Relaxed))
        .sum()
    }
}

impl Metrics {
    #[inline]
    pub(crate) fn record_parsed(bytes_read: usize) {
        MESSAGES_PARSED.fetch_add(1, Ordering::Relaxed);
        BYTES_READ.fetch_add(saturating_u64(bytes_read), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_invocation() {
        INVOCATIONS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_fault(code: i32) {
        FAULT_COUNTERS.increment(code);
    }

    #[inline]
    pub(crate) fn record_response(bytes_written: usize) {
        RESPONSES.fetch_add(1, Ordering::Relaxed);
        BYTES_WRITTEN.fetch_add(saturating_u64(bytes_written), Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_cancellation() {
        CANCELLATIONS.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_latency(duration: Duration) {
        let nanos = duration.as_nanos().try_into().unwrap_or(u64::MAX);
        INVOKE_LATENCY_TOTAL_NS.fetch_add(nanos, Ordering::Relaxed);
        update_max(&INVOKE_LATENCY_MAX_NS, nanos);
    }

    #[inline]
    pub(crate) fn totals() -> MetricsSnapshot {
        MetricsSnapshot {
            messages_parsed: MESSAGES_PARSED.load(Ordering::Relaxed),
            invocations: INVOCATIONS.load(Ordering::Relaxed),
            responses: RESPONSES.load(Ordering::Relaxed),
            cancellations: CANCELLATIONS.load(Ordering::Relaxed),
            bytes_read: BYTES_READ.load(Ordering::Relaxed),
            bytes_written: BYTES_WRITTEN.load(Ordering::Relaxed),
            total_faults: FAULT_COUNTERS.total(),
            markup_faults: FAULT_COUNTERS.markup.load(Ordering::Relaxed),
            serialization_faults: FAULT_COUNTERS.serialization.load(Ordering::Relaxed),
            conversion_faults: FAULT_COUNTERS.conversion.load(Ordering::Relaxed),
            invalid_request_faults: FAULT_COUNTERS.invalid_request.load(Ordering::Relaxed),
            missing_argument_faults: FAULT_COUNTERS.missing_arguments.load(Ordering::Relaxed),
            method_not_found_faults: FAULT_COUNTERS.method_not_found.load(Ordering::Relaxed),
            procedure_faults: FAULT_COUNTERS.procedure.load(Ordering::Relaxed),
            invoke_latency_total_ns: INVOKE_LATENCY_TOTAL_NS.load(Ordering::Relaxed),
            invoke_latency_max_ns: INVOKE_LATENCY_MAX_NS.load(Ordering::Relaxed),
        }
    }
}

fn saturating_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn update_max(target: &AtomicU64, candidate: u64) {
    let mut current = target.load(Ordering::Relaxed);
    while candidate > current {
        match target.compare_exchange_weak(
            current,
            candidate,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(old) => current = old,
        }
    }
}

/// Point-in-time copy of the dispatcher counters.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Requests parsed to completion (with or without a fault).
    pub messages_parsed: u64,
    /// Procedure invocations started.
    pub invocations: u64,
    /// Responses fully written.
    pub responses: u64,
    /// Messages abandoned through `cancel`.
    pub cancellations: u64,
    /// Request bytes consumed.
    pub bytes_read: u64,
    /// Response bytes written.
    pub bytes_written: u64,
    /// Faults of every kind.
    pub total_faults: u64,
    /// Code 1 faults.
    pub markup_faults: u64,
    /// Code 2 faults.
    pub serialization_faults: u64,
    /// Code 3 faults.
    pub conversion_faults: u64,
    /// Code 4 faults.
    pub invalid_request_faults: u64,
    /// Code 5 faults.
    pub missing_argument_faults: u64,
    /// Unknown-method faults.
    pub method_not_found_faults: u64,
    /// Faults raised by procedures, including internal errors.
    pub procedure_faults: u64,
    /// Sum of invocation latencies.
    pub invoke_latency_total_ns: u64,
    /// Longest invocation latency.
    pub invoke_latency_max_ns: u64,
}

impl MetricsSnapshot {
    /// Average invocation latency in microseconds.
    #[must_use]
    pub fn avg_invoke_latency_us(&self) -> Option<u64> {
        average_microseconds(self.invoke_latency_total_ns, self.invocations)
    }
}

/// Snapshot the process-wide dispatcher counters.
#[must_use]
pub fn snapshot() -> MetricsSnapshot {
    Metrics::totals()
}

fn average_microseconds(total_ns: u64, count: u64) -> Option<u64> {
    if count == 0 {
        return None;
    }

    let average = u128::from(total_ns) / (u128::from(count) * NANOSECONDS_PER_MICROSECOND);
    Some(u64::try_from(average).unwrap_or(u64::MAX))
}
