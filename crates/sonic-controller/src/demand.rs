use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use sonic_common::ModelTraffic;

/// Traffic of one model on one server.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ServerModelDemand {
    /// Completed inferences per second since the previous sample.
    pub request_rate: f64,
    pub queue_depth: u64,
    /// Last time traffic was seen; starts at the first observation.
    pub last_request_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelDemand {
    pub request_rate: f64,
    pub queue_depth: u64,
    pub last_request_ms: u64,
    /// server_id -> demand
    pub per_server: BTreeMap<String, ServerModelDemand>,
}

/// Per-model demand derived from server traffic counters, keyed by model id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DemandSignal {
    pub models: BTreeMap<String, ModelDemand>,
}

impl DemandSignal {
    pub fn model(&self, model_id: &str) -> Option<&ModelDemand> {
        self.models.get(model_id)
    }

    pub fn on_server(&self, model_id: &str, server_id: &str) -> Option<&ServerModelDemand> {
        self.models.get(model_id)?.per_server.get(server_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct CounterState {
    count: u64,
    at_ms: u64,
    demand: ServerModelDemand,
}

/// Turns monotonic inference counters into rates and idle clocks.
#[derive(Debug, Default)]
pub struct DemandTracker {
    /// (server_id, model_id) -> last reading
    counters: HashMap<(String, String), CounterState>,
}

impl DemandTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, server_id: &str, model_id: &str, traffic: ModelTraffic, at_ms: u64) {
        let key = (server_id.to_string(), model_id.to_string());
        let next = match self.counters.get(&key) {
            None => CounterState {
                count: traffic.inference_count,
                at_ms,
                demand: ServerModelDemand {
                    request_rate: 0.0,
                    queue_depth: traffic.pending_requests,
                    last_request_ms: at_ms,
                },
            },
            Some(prev) => {
                // a counter that went backwards means the server restarted
                let delta = if traffic.inference_count >= prev.count {
                    traffic.inference_count - prev.count
                } else {
                    traffic.inference_count
                };
                let elapsed_ms = at_ms.saturating_sub(prev.at_ms);
                let request_rate = if elapsed_ms == 0 {
                    prev.demand.request_rate
                } else {
                    delta as f64 * 1000.0 / elapsed_ms as f64
                };
                let active = delta > 0 || traffic.pending_requests > 0;
                CounterState {
                    count: traffic.inference_count,
                    at_ms,
                    demand: ServerModelDemand {
                        request_rate,
                        queue_depth: traffic.pending_requests,
                        last_request_ms: if active { at_ms } else { prev.demand.last_request_ms },
                    },
                }
            }
        };
        self.counters.insert(key, next);
    }

    /// Drop readings for models the server no longer reports.
    pub fn retain_server(&mut self, server_id: &str, model_ids: &[String]) {
        self.counters
            .retain(|(s, m), _| s != server_id || model_ids.iter().any(|id| id == m));
    }

    pub fn forget_server(&mut self, server_id: &str) {
        self.counters.retain(|(s, _), _| s != server_id);
    }

    pub fn signal(&self) -> DemandSignal {
        let mut models: BTreeMap<String, ModelDemand> = BTreeMap::new();
        for ((server_id, model_id), state) in &self.counters {
            let m = models.entry(model_id.clone()).or_default();
            m.request_rate += state.demand.request_rate;
            m.queue_depth += state.demand.queue_depth;
            m.last_request_ms = m.last_request_ms.max(state.demand.last_request_ms);
            m.per_server.insert(server_id.clone(), state.demand);
        }
        DemandSignal { models }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn traffic(count: u64, pending: u64) -> ModelTraffic {
        ModelTraffic {
            inference_count: count,
            pending_requests: pending,
        }
    }

    #[test]
    fn test_rate_from_counter_delta() {
        let mut t = DemandTracker::new();
        t.record("s0", "a", traffic(100, 0), 1_000);
        t.record("s0", "a", traffic(150, 2), 6_000);

        let d = *t.signal().on_server("a", "s0").unwrap();
        assert!((d.request_rate - 10.0).abs() < 1e-9);
        assert_eq!(d.queue_depth, 2);
        assert_eq!(d.last_request_ms, 6_000);
    }

    #[test]
    fn test_idle_clock_starts_at_first_observation() {
        let mut t = DemandTracker::new();
        t.record("s0", "a", traffic(500, 0), 1_000);
        t.record("s0", "a", traffic(500, 0), 2_000);
        t.record("s0", "a", traffic(500, 0), 3_000);

        let d = *t.signal().on_server("a", "s0").unwrap();
        assert_eq!(d.request_rate, 0.0);
        assert_eq!(d.last_request_ms, 1_000);
    }

    #[test]
    fn test_counter_reset_counts_as_traffic() {
        let mut t = DemandTracker::new();
        t.record("s0", "a", traffic(500, 0), 1_000);
        t.record("s0", "a", traffic(3, 0), 2_000);
        let d = *t.signal().on_server("a", "s0").unwrap();
        assert_eq!(d.last_request_ms, 2_000);
        assert!((d.request_rate - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_signal_aggregates_servers() {
        let mut t = DemandTracker::new();
        t.record("s0", "a", traffic(0, 1), 1_000);
        t.record("s1", "a", traffic(0, 4), 5_000);
        t.record("s1", "b", traffic(0, 0), 1_000);

        let signal = t.signal();
        let a = signal.model("a").unwrap();
        assert_eq!(a.queue_depth, 5);
        assert_eq!(a.last_request_ms, 5_000);
        assert_eq!(a.per_server.len(), 2);

        t.forget_server("s1");
        let signal = t.signal();
        assert!(signal.model("b").is_none());
        assert_eq!(signal.model("a").unwrap().per_server.len(), 1);
    }
}
