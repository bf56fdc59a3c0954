//! Metrics Aggregator: tracks per-operation and per-agent-per-operation
//! latency and error statistics, with percentiles computed by linear
//! interpolation between sorted samples (matching the reference
//! implementation's formula exactly so dashboards built against either
//! agree).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

/// Running statistics for one (operation) or (agent, operation) bucket.
#[derive(Debug, Clone, Default)]
struct OperationStats {
    count: u64,
    errors: u64,
    total_latency_ms: f64,
    latencies: Vec<f64>,
}

impl OperationStats {
    fn record(&mut self, latency_ms: f64, is_error: bool) {
        self.count += 1;
        if is_error {
            self.errors += 1;
        }
        self.total_latency_ms += latency_ms;
        self.latencies.push(latency_ms);
    }

    fn summary(&self) -> OperationSummary {
        if self.count == 0 {
            return OperationSummary::default();
        }

        let mut sorted = self.latencies.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());

        OperationSummary {
            count: self.count,
            avg_latency_ms: self.total_latency_ms / self.count as f64,
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            error_rate: self.errors as f64 / self.count as f64,
        }
    }
}

/// Linear-interpolation percentile of `sorted` (ascending) at `p` in `[0,100]`.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }

    let n = sorted.len();
    let k = (n - 1) as f64 * p / 100.0;
    let f = k.floor() as usize;
    let c = f + 1;

    if c >= n {
        return sorted[n - 1];
    }

    sorted[f] * (c as f64 - k) + sorted[c] * (k - f as f64)
}

/// Point-in-time snapshot of one bucket's statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OperationSummary {
    pub count: u64,
    pub avg_latency_ms: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub error_rate: f64,
}

#[derive(Default)]
struct Buckets {
    by_operation: HashMap<String, OperationStats>,
    by_agent_operation: HashMap<(String, String), OperationStats>,
}

/// Thread-safe latency/error tracker, serialized on a single mutex since
/// recording and snapshotting are both cheap relative to downstream I/O.
pub struct MetricsAggregator {
    buckets: Mutex<Buckets>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
        }
    }

    /// Record one completed operation for `agent` on `operation`.
    pub fn record(&self, agent: &str, operation: &str, latency_ms: f64, is_error: bool) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .by_operation
            .entry(operation.to_string())
            .or_default()
            .record(latency_ms, is_error);
        buckets
            .by_agent_operation
            .entry((agent.to_string(), operation.to_string()))
            .or_default()
            .record(latency_ms, is_error);
    }

    /// Snapshot of every tracked operation.
    pub fn get_summary(&self) -> HashMap<String, OperationSummary> {
        self.buckets
            .lock()
            .unwrap()
            .by_operation
            .iter()
            .map(|(op, stats)| (op.clone(), stats.summary()))
            .collect()
    }

    /// Snapshot of every operation tracked for `agent`.
    pub fn get_agent_summary(&self, agent: &str) -> HashMap<String, OperationSummary> {
        self.buckets
            .lock()
            .unwrap()
            .by_agent_operation
            .iter()
            .filter(|((a, _), _)| a == agent)
            .map(|((_, op), stats)| (op.clone(), stats.summary()))
            .collect()
    }

    /// Snapshot for a single operation across every agent combined.
    pub fn get_operation_summary(&self, operation: &str) -> OperationSummary {
        self.buckets
            .lock()
            .unwrap()
            .by_operation
            .get(operation)
            .map(|s| s.summary())
            .unwrap_or_default()
    }

    /// Every agent id that has recorded at least one operation.
    pub fn get_all_agents(&self) -> Vec<String> {
        let buckets = self.buckets.lock().unwrap();
        let mut agents: Vec<String> = buckets
            .by_agent_operation
            .keys()
            .map(|(agent, _)| agent.clone())
            .collect();
        agents.sort();
        agents.dedup();
        agents
    }

    /// Discard every recorded sample.
    pub fn reset(&self) {
        let mut buckets = self.buckets.lock().unwrap();
        buckets.by_operation.clear();
        buckets.by_agent_operation.clear();
    }
}
