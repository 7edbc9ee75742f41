use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================
// Metrics: process-wide completion counters
// ============================================================

#[derive(Debug, Default)]
pub struct Metrics {
    in_flight: AtomicU64,
    completions_started: AtomicU64,
    completions_completed: AtomicU64,
    completions_failed: AtomicU64,
    deltas_relayed: AtomicU64,
    commit_failures: AtomicU64,
    latency_ms_total: AtomicU64,
    latency_ms_max: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub in_flight: u64,
    pub completions_started: u64,
    pub completions_completed: u64,
    pub completions_failed: u64,
    pub deltas_relayed: u64,
    pub commit_failures: u64,
    pub avg_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl Metrics {
    pub fn completion_started(&self) {
        self.completions_started.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completion_finished(&self, latency_ms: u64, ok: bool) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        if ok {
            self.completions_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.completions_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_ms_total.fetch_add(latency_ms, Ordering::Relaxed);
        self.latency_ms_max.fetch_max(latency_ms, Ordering::Relaxed);
    }

    pub fn delta_relayed(&self) {
        self.deltas_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.completions_completed.load(Ordering::Relaxed);
        let failed = self.completions_failed.load(Ordering::Relaxed);
        let finished = completed + failed;
        let total_latency = self.latency_ms_total.load(Ordering::Relaxed);
        MetricsSnapshot {
            in_flight: self.in_flight.load(Ordering::Relaxed),
            completions_started: self.completions_started.load(Ordering::Relaxed),
            completions_completed: completed,
            completions_failed: failed,
            deltas_relayed: self.deltas_relayed.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            avg_latency_ms: if finished > 0 { total_latency / finished } else { 0 },
            max_latency_ms: self.latency_ms_max.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_counts_balance() {
        let metrics = Metrics::default();
        metrics.completion_started();
        metrics.completion_started();
        assert_eq!(metrics.snapshot().in_flight, 2);

        metrics.delta_relayed();
        metrics.delta_relayed();
        metrics.delta_relayed();
        metrics.completion_finished(100, true);
        metrics.completion_finished(300, false);

        let snap = metrics.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.completions_completed, 1);
        assert_eq!(snap.completions_failed, 1);
        assert_eq!(snap.deltas_relayed, 3);
        assert_eq!(snap.avg_latency_ms, 200);
        assert_eq!(snap.max_latency_ms, 300);
    }
}
