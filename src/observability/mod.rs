//! In-process counters for gateway operations.
//!
//! Exporters are external collaborators; this module only accumulates and
//! snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics collector for gateway operations.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total requests presented to the gateway.
    requests_total: AtomicU64,
    /// Requests that completed successfully.
    requests_success: AtomicU64,
    /// Requests that failed downstream.
    requests_failed: AtomicU64,
    /// Requests rejected by the admission rate limiter.
    requests_rate_limited: AtomicU64,
    /// Requests rejected while the circuit was open.
    requests_circuit_broken: AtomicU64,
    /// Requests rejected because no strategy authenticated them.
    requests_unauthenticated: AtomicU64,
    /// Total request latency in microseconds.
    latency_total_us: AtomicU64,
    /// Request count for latency calculation.
    latency_count: AtomicU64,
}

impl Metrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request.
    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful request.
    pub fn record_success(&self) {
        self.requests_success.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a downstream failure.
    pub fn record_failure(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a rate-limited request.
    pub fn record_rate_limited(&self) {
        self.requests_rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a circuit-broken request.
    pub fn record_circuit_broken(&self) {
        self.requests_circuit_broken.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an authentication rejection.
    pub fn record_unauthenticated(&self) {
        self.requests_unauthenticated.fetch_add(1, Ordering::Relaxed);
    }

    /// Records request latency.
    pub fn record_latency(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.latency_total_us.fetch_add(us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Gets the average latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        let total = self.latency_total_us.load(Ordering::Relaxed);
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            0
        } else {
            total / count
        }
    }

    /// Gets a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_rate_limited: self.requests_rate_limited.load(Ordering::Relaxed),
            requests_circuit_broken: self.requests_circuit_broken.load(Ordering::Relaxed),
            requests_unauthenticated: self.requests_unauthenticated.load(Ordering::Relaxed),
            average_latency_us: self.average_latency_us(),
        }
    }
}

/// Point-in-time copy of the metrics counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Total requests presented to the gateway.
    pub requests_total: u64,
    /// Requests that completed successfully.
    pub requests_success: u64,
    /// Requests that failed downstream.
    pub requests_failed: u64,
    /// Requests rejected by the admission rate limiter.
    pub requests_rate_limited: u64,
    /// Requests rejected while the circuit was open.
    pub requests_circuit_broken: u64,
    /// Requests rejected because no strategy authenticated them.
    pub requests_unauthenticated: u64,
    /// Average request latency in microseconds.
    pub average_latency_us: u64,
}
