//! Per-call and aggregate counters.
//!
//! The hot paths (one increment per 20ms frame per direction per call)
//! touch only relaxed atomics. Housekeeping and shutdown read snapshots;
//! they may observe a slightly stale view, which is fine for telemetry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

/// Counters for a single call.
#[derive(Debug, Default)]
pub struct CallCounters {
    /// Live inbound frames read from the transport.
    pub frames_in: AtomicU64,
    /// Frames emitted to the caller.
    pub frames_out: AtomicU64,
    /// Inbound frames discarded because the gate was closed.
    pub gating_discarded: AtomicU64,
    /// Pacer schedule slips and silence substitutions while playing.
    pub underflows: AtomicU64,
    /// Fallback file activations after playback stalls.
    pub fallback_activations: AtomicU64,
    /// Caller barge-ins that cancelled an agent response.
    pub barge_ins: AtomicU64,
    /// Upstream commit boundaries sent to the provider.
    pub commits: AtomicU64,
    /// Frames dropped from the outbound-to-provider queue on overflow.
    pub upstream_overflow: AtomicU64,
    /// Provider chunks dropped because their stream was already cancelled.
    pub stale_chunks_dropped: AtomicU64,
    /// Truncated/odd-length payloads repaired by the codec kit.
    pub short_reads: AtomicU64,
    /// Completed conversational turns.
    pub turns: AtomicU64,
}

impl CallCounters {
    /// Captures a serializable snapshot of the counters.
    #[must_use]
    pub fn snapshot(&self) -> CallCountersSnapshot {
        CallCountersSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            gating_discarded: self.gating_discarded.load(Ordering::Relaxed),
            underflows: self.underflows.load(Ordering::Relaxed),
            fallback_activations: self.fallback_activations.load(Ordering::Relaxed),
            barge_ins: self.barge_ins.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            upstream_overflow: self.upstream_overflow.load(Ordering::Relaxed),
            stale_chunks_dropped: self.stale_chunks_dropped.load(Ordering::Relaxed),
            short_reads: self.short_reads.load(Ordering::Relaxed),
            turns: self.turns.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one call's counters.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CallCountersSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub gating_discarded: u64,
    pub underflows: u64,
    pub fallback_activations: u64,
    pub barge_ins: u64,
    pub commits: u64,
    pub upstream_overflow: u64,
    pub stale_chunks_dropped: u64,
    pub short_reads: u64,
    pub turns: u64,
}

/// Aggregate process-wide counters.
#[derive(Debug, Default)]
struct Aggregate {
    calls_started: AtomicU64,
    calls_closed: AtomicU64,
    handshakes: AtomicU64,
    handshake_failures: AtomicU64,
    call_duration_ms_total: AtomicU64,
}

/// Process-wide metrics registry.
///
/// Per-call counters are created on first touch and folded into nothing on
/// removal; the aggregate counters capture what must outlive the call.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    calls: DashMap<String, Arc<CallCounters>>,
    aggregate: Aggregate,
    teardown_reasons: DashMap<&'static str, AtomicU64>,
}

impl MetricsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counters for a call, creating them on first use.
    #[must_use]
    pub fn for_call(&self, call_id: &str) -> Arc<CallCounters> {
        let mut created = false;
        let counters = Arc::clone(
            self.calls
                .entry(call_id.to_string())
                .or_insert_with(|| {
                    created = true;
                    Arc::default()
                })
                .value(),
        );
        if created {
            self.aggregate
                .calls_started
                .fetch_add(1, Ordering::Relaxed);
        }
        counters
    }

    /// Records a provider handshake attempt.
    pub fn record_handshake(&self, success: bool) {
        self.aggregate.handshakes.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.aggregate
                .handshake_failures
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Removes a call's counters, folding its lifetime into the aggregates.
    pub fn close_call(&self, call_id: &str, reason: &'static str, duration_ms: u64) {
        self.calls.remove(call_id);
        self.aggregate.calls_closed.fetch_add(1, Ordering::Relaxed);
        self.aggregate
            .call_duration_ms_total
            .fetch_add(duration_ms, Ordering::Relaxed);
        self.teardown_reasons
            .entry(reason)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Captures a serializable process-wide snapshot.
    ///
    /// Iteration is copy-on-iterate over the live call map; concurrent calls
    /// may land in or fall out of the view.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let calls = self
            .calls
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect();
        let teardown_reasons = self
            .teardown_reasons
            .iter()
            .map(|entry| ((*entry.key()).to_string(), entry.value().load(Ordering::Relaxed)))
            .collect();
        MetricsSnapshot {
            calls_started: self.aggregate.calls_started.load(Ordering::Relaxed),
            calls_closed: self.aggregate.calls_closed.load(Ordering::Relaxed),
            handshakes: self.aggregate.handshakes.load(Ordering::Relaxed),
            handshake_failures: self.aggregate.handshake_failures.load(Ordering::Relaxed),
            call_duration_ms_total: self
                .aggregate
                .call_duration_ms_total
                .load(Ordering::Relaxed),
            teardown_reasons,
            calls,
        }
    }
}

/// Point-in-time view of the whole registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub calls_started: u64,
    pub calls_closed: u64,
    pub handshakes: u64,
    pub handshake_failures: u64,
    pub call_duration_ms_total: u64,
    pub teardown_reasons: std::collections::HashMap<String, u64>,
    pub calls: std::collections::HashMap<String, CallCountersSnapshot>,
}
