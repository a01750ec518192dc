// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-service counters and handler latency samples.
//!
//! A [`ServiceMetrics`] value is created by the application and handed to
//! each engine it wants to observe; engines never reach for process-wide
//! state. One instance may be shared by several engines.
//!
//! Counters use atomics (Relaxed ordering), latency samples a small ring
//! buffer behind a mutex.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const DEFAULT_MAX_SAMPLES: usize = 1_024;

/// Counters and handler latency histogram for one or more services.
#[derive(Debug)]
pub struct ServiceMetrics {
    label: String,

    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    responses_unmatched: AtomicU64,

    requests_received: AtomicU64,
    requests_dropped: AtomicU64,
    requests_failed: AtomicU64,
    replies_sent: AtomicU64,

    protocol_faults: AtomicU64,

    /// Handler execution times in microseconds (ring buffer)
    handler_latency_us: Mutex<VecDeque<u64>>,
    max_samples: usize,
}

impl ServiceMetrics {
    /// Create a collector; `label` identifies it in logs (usually the service name).
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_capacity(label, DEFAULT_MAX_SAMPLES)
    }

    /// Create a collector keeping at most `max_samples` latency samples.
    pub fn with_capacity(label: impl Into<String>, max_samples: usize) -> Self {
        Self {
            label: label.into(),
            requests_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            responses_unmatched: AtomicU64::new(0),
            requests_received: AtomicU64::new(0),
            requests_dropped: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            replies_sent: AtomicU64::new(0),
            protocol_faults: AtomicU64::new(0),
            handler_latency_us: Mutex::new(VecDeque::with_capacity(max_samples)),
            max_samples: max_samples.max(1),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn record_request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response_unmatched(&self) {
        self.responses_unmatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_dropped(&self) {
        self.requests_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reply_sent(&self) {
        self.replies_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol_fault(&self) {
        self.protocol_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a handler execution time sample. Oldest sample is dropped when full.
    pub(crate) fn record_handler_time(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let mut samples = self.handler_latency_us.lock();
        if samples.len() >= self.max_samples {
            samples.pop_front();
        }
        samples.push_back(micros);
    }

    /// Point-in-time copy of every counter plus latency percentiles.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let (p50, p99, max) = {
            let samples = self.handler_latency_us.lock();
            latency_percentiles(&samples)
        };

        MetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            responses_unmatched: self.responses_unmatched.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_dropped: self.requests_dropped.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            protocol_faults: self.protocol_faults.load(Ordering::Relaxed),
            handler_p50: Duration::from_micros(p50),
            handler_p99: Duration::from_micros(p99),
            handler_max: Duration::from_micros(max),
        }
    }
}

fn latency_percentiles(samples: &VecDeque<u64>) -> (u64, u64, u64) {
    if samples.is_empty() {
        return (0, 0, 0);
    }
    let mut sorted: Vec<u64> = samples.iter().copied().collect();
    sorted.sort_unstable();
    let at = |pct: usize| sorted[(sorted.len() * pct / 100).min(sorted.len() - 1)];
    (at(50), at(99), sorted[sorted.len() - 1])
}

/// Counters captured by [`ServiceMetrics::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Client: requests published
    pub requests_sent: u64,
    /// Client: responses matched to a pending request
    pub responses_received: u64,
    /// Client: responses with no pending request (stale or foreign)
    pub responses_unmatched: u64,
    /// Server: requests delivered by the transport
    pub requests_received: u64,
    /// Server: requests dropped before dispatch (no identity, no payload)
    pub requests_dropped: u64,
    /// Server: handler, codec or reply publication failures
    pub requests_failed: u64,
    /// Server: replies published
    pub replies_sent: u64,
    /// Both: messages whose legacy and standard identities disagree
    pub protocol_faults: u64,
    pub handler_p50: Duration,
    pub handler_p99: Duration,
    pub handler_max: Duration,
}
