//! Node counters with Prometheus text export.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Node metrics.
#[derive(Default)]
pub struct Metrics {
    /// Transfers posted to the ledger.
    pub transfers_total: AtomicU64,
    /// Transfers the ledger refused, for any reason.
    pub transfers_rejected: AtomicU64,
    /// Subset of rejections caused by an insufficient balance.
    pub insufficient_funds: AtomicU64,
    /// Transfers answered from an idempotency key.
    pub transfers_replayed: AtomicU64,
    pub batches_created: AtomicU64,
    pub batches_completed: AtomicU64,
    pub batches_failed: AtomicU64,
    /// Settlement sweeps run, including those that produced no batch.
    pub sweeps_run: AtomicU64,
    pub telex_sent: AtomicU64,
    pub telex_failed: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a posted transfer.
    pub fn transfer_posted(&self, replayed: bool) {
        if replayed {
            self.transfers_replayed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transfers_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a rejected transfer.
    pub fn transfer_rejected(&self, insufficient_funds: bool) {
        self.transfers_rejected.fetch_add(1, Ordering::Relaxed);
        if insufficient_funds {
            self.insufficient_funds.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a sweep and the number of batches it cut.
    pub fn sweep_completed(&self, batches: usize) {
        self.sweeps_run.fetch_add(1, Ordering::Relaxed);
        self.batches_created
            .fetch_add(batches as u64, Ordering::Relaxed);
    }

    pub fn batch_completed(&self) {
        self.batches_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a telex hand-off.
    pub fn telex_delivered(&self, delivered: bool) {
        if delivered {
            self.telex_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.telex_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_total: self.transfers_total.load(Ordering::Relaxed),
            transfers_rejected: self.transfers_rejected.load(Ordering::Relaxed),
            insufficient_funds: self.insufficient_funds.load(Ordering::Relaxed),
            transfers_replayed: self.transfers_replayed.load(Ordering::Relaxed),
            batches_created: self.batches_created.load(Ordering::Relaxed),
            batches_completed: self.batches_completed.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            sweeps_run: self.sweeps_run.load(Ordering::Relaxed),
            telex_sent: self.telex_sent.load(Ordering::Relaxed),
            telex_failed: self.telex_failed.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let series: [(&str, &str, u64); 10] = [
            ("transfers_total", "Transfers posted to the ledger", s.transfers_total),
            ("transfers_rejected", "Transfers rejected by the ledger", s.transfers_rejected),
            ("insufficient_funds", "Transfers rejected for insufficient funds", s.insufficient_funds),
            ("transfers_replayed", "Transfers answered from an idempotency key", s.transfers_replayed),
            ("settlement_batches_created", "Settlement batches cut", s.batches_created),
            ("settlement_batches_completed", "Settlement batches completed", s.batches_completed),
            ("settlement_batches_failed", "Settlement batches failed", s.batches_failed),
            ("settlement_sweeps", "Settlement sweeps run", s.sweeps_run),
            ("telex_sent", "Telex messages accepted by the transport", s.telex_sent),
            ("telex_failed", "Telex messages the transport refused", s.telex_failed),
        ];

        let mut out = String::new();
        for (name, help, value) in series {
            out.push_str(&format!(
                "# HELP closedloop_{name} {help}\n# TYPE closedloop_{name} counter\nclosedloop_{name} {value}\n\n"
            ));
        }
        out
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transfers_total: u64,
    pub transfers_rejected: u64,
    pub insufficient_funds: u64,
    pub transfers_replayed: u64,
    pub batches_created: u64,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub sweeps_run: u64,
    pub telex_sent: u64,
    pub telex_failed: u64,
}

/// Shared metrics handle.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_counters() {
        let metrics = Metrics::new();
        metrics.transfer_posted(false);
        metrics.transfer_posted(false);
        metrics.transfer_posted(true);
        metrics.transfer_rejected(true);
        metrics.transfer_rejected(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transfers_total, 2);
        assert_eq!(snapshot.transfers_replayed, 1);
        assert_eq!(snapshot.transfers_rejected, 2);
        assert_eq!(snapshot.insufficient_funds, 1);
    }

    #[test]
    fn test_sweep_counters() {
        let metrics = Metrics::new();
        metrics.sweep_completed(0);
        metrics.sweep_completed(3);
        metrics.batch_completed();
        metrics.batch_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sweeps_run, 2);
        assert_eq!(snapshot.batches_created, 3);
        assert_eq!(snapshot.batches_completed, 1);
        assert_eq!(snapshot.batches_failed, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.transfer_posted(false);
        metrics.telex_delivered(true);

        let output = metrics.to_prometheus();
        assert!(output.contains("# TYPE closedloop_transfers_total counter"));
        assert!(output.contains("closedloop_transfers_total 1"));
        assert!(output.contains("closedloop_telex_sent 1"));
        assert!(output.contains("closedloop_telex_failed 0"));
    }
}
