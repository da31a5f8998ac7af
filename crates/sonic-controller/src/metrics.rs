use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared controller metrics, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    /// Decision cycles run.
    pub decision_cycles_total: AtomicU64,
    /// Epoch of the most recent decision (gauge).
    pub decision_epoch: AtomicU64,
    /// Loads and unloads emitted by the planner.
    pub planned_loads_total: AtomicU64,
    pub planned_unloads_total: AtomicU64,
    /// Models reported unschedulable in the last cycle (gauge).
    pub unschedulable_models: AtomicU64,
    /// Reconciliation task outcomes.
    pub tasks_committed_total: AtomicU64,
    pub tasks_failed_total: AtomicU64,
    pub tasks_noop_total: AtomicU64,
    pub tasks_superseded_total: AtomicU64,
    /// Adapter calls retried after a transient failure.
    pub adapter_retries_total: AtomicU64,
    /// Servers in the last snapshot, and how many were fresh (gauges).
    pub servers_known: AtomicU64,
    pub servers_fresh: AtomicU64,
    pub observation_gaps_total: AtomicU64,
    pub pool_events_applied_total: AtomicU64,
    pub pool_events_stale_total: AtomicU64,
    pub pool_apply_errors_total: AtomicU64,
    pub pool_resyncs_total: AtomicU64,
    pub identity_collisions_total: AtomicU64,
}

impl SharedMetrics {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set(gauge: &AtomicU64, v: u64) {
        gauge.store(v, Ordering::Relaxed);
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let rows: [(&str, &str, &str, &AtomicU64); 18] = [
            ("decision_cycles_total", "counter", "Decision cycles run.", &self.decision_cycles_total),
            ("decision_epoch", "gauge", "Epoch of the most recent placement decision.", &self.decision_epoch),
            ("planned_loads_total", "counter", "Loads emitted by the planner.", &self.planned_loads_total),
            ("planned_unloads_total", "counter", "Unloads emitted by the planner.", &self.planned_unloads_total),
            ("unschedulable_models", "gauge", "Models below their minimum replica count.", &self.unschedulable_models),
            ("tasks_committed_total", "counter", "Reconciliation tasks committed.", &self.tasks_committed_total),
            ("tasks_failed_total", "counter", "Reconciliation tasks failed.", &self.tasks_failed_total),
            ("tasks_noop_total", "counter", "Reconciliation tasks already satisfied.", &self.tasks_noop_total),
            ("tasks_superseded_total", "counter", "Pending tasks dropped for a newer epoch.", &self.tasks_superseded_total),
            ("adapter_retries_total", "counter", "Adapter calls retried after a transient failure.", &self.adapter_retries_total),
            ("servers_known", "gauge", "Servers in the latest snapshot.", &self.servers_known),
            ("servers_fresh", "gauge", "Servers observed within the stale threshold.", &self.servers_fresh),
            ("observation_gaps_total", "counter", "Failed or timed out server samples.", &self.observation_gaps_total),
            ("pool_events_applied_total", "counter", "Pool events applied.", &self.pool_events_applied_total),
            ("pool_events_stale_total", "counter", "Pool events discarded as stale.", &self.pool_events_stale_total),
            ("pool_apply_errors_total", "counter", "Pool writes that failed and were requeued.", &self.pool_apply_errors_total),
            ("pool_resyncs_total", "counter", "Full pool resynchronisations.", &self.pool_resyncs_total),
            ("identity_collisions_total", "counter", "Model registrations refused for collisions.", &self.identity_collisions_total),
        ];

        let mut body = String::new();
        for (name, kind, help, value) in rows {
            let _ = writeln!(body, "# HELP sonic_controller_{name} {help}");
            let _ = writeln!(body, "# TYPE sonic_controller_{name} {kind}");
            let _ = writeln!(body, "sonic_controller_{name} {}", value.load(Ordering::Relaxed));
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_exposition() {
        let m = SharedMetrics::default();
        SharedMetrics::inc(&m.decision_cycles_total);
        SharedMetrics::set(&m.decision_epoch, 42);
        let body = m.render();
        assert!(body.contains("# TYPE sonic_controller_decision_cycles_total counter\n"));
        assert!(body.contains("sonic_controller_decision_cycles_total 1\n"));
        assert!(body.contains("sonic_controller_decision_epoch 42\n"));
        assert_eq!(body.lines().filter(|l| l.starts_with("# HELP")).count(), 18);
    }
}
