// ABOUTME: Process-wide tool call counters with consistent snapshots
// ABOUTME: Renders the snapshot as OpenMetrics text for pull-based scraping

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ToolStats {
    pub calls: u64,
    pub total_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub up: bool,
    pub requests: u64,
    pub tools: BTreeMap<String, ToolStats>,
}

type ToolLabels = Vec<(String, String)>;

/// Counters behind one lock so a call and its duration land together
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<MetricSnapshot>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tool: &str, duration: Duration) {
        let mut snapshot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        snapshot.requests += 1;
        let stats = snapshot.tools.entry(tool.to_string()).or_default();
        stats.calls += 1;
        stats.total_seconds += duration.as_secs_f64();
    }

    pub fn set_up(&self, up: bool) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .up = up;
    }

    pub fn snapshot(&self) -> MetricSnapshot {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// OpenMetrics text for the current snapshot
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let snapshot = self.snapshot();
        let mut registry = Registry::default();

        let up: Gauge = Gauge::default();
        up.set(i64::from(snapshot.up));
        registry.register("shellbox_up", "Whether the sandbox engine is serving", up);

        let requests: Counter = Counter::default();
        requests.inc_by(snapshot.requests);
        registry.register("shellbox_requests", "Tool calls handled", requests);

        let calls = Family::<ToolLabels, Counter>::default();
        let durations = Family::<ToolLabels, Counter<f64, AtomicU64>>::default();
        for (tool, stats) in &snapshot.tools {
            let labels = vec![("tool".to_string(), tool.clone())];
            calls.get_or_create(&labels).inc_by(stats.calls);
            durations.get_or_create(&labels).inc_by(stats.total_seconds);
        }
        registry.register("shellbox_tool_calls", "Calls per tool", calls);
        registry.register(
            "shellbox_tool_duration_seconds",
            "Cumulative time spent per tool",
            durations,
        );

        let mut out = String::new();
        encode(&mut out, &registry)?;
        Ok(out)
    }
}
