// Execution metrics
//
// Lock-free counters, gauges and a latency histogram shared by every
// execution. Nothing here blocks, so recording never slows a request down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::config::types::ExecutionStatus;

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct HistogramBucket {
    le: f64, // upper bound in seconds
    count: AtomicU64,
}

/// Latency histogram with cumulative buckets
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new_latency() -> Self {
        let buckets = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();

        Self {
            buckets,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum_micros
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum_micros(&self) -> u64 {
        self.sum_micros.load(Ordering::Relaxed)
    }

    pub fn bucket_count(&self, le: f64) -> u64 {
        self.buckets
            .iter()
            .find(|b| (b.le - le).abs() < 0.0001)
            .map(|b| b.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

/// Point-in-time copy of every metric
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub executions_total: u64,
    pub completed: u64,
    pub errored: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub active_executions: u64,
    pub timeout_kills: u64,
    pub forced_kills: u64,
    pub cleanup_failures: u64,
    pub duration_count: u64,
    pub duration_sum_micros: u64,
}

/// Engine-wide metrics registry
#[derive(Debug)]
pub struct Metrics {
    pub executions_total: Counter,
    pub executions_completed: Counter,
    pub executions_error: Counter,
    pub executions_timeout: Counter,
    pub executions_rejected: Counter,
    pub executions_cancelled: Counter,

    pub active_executions: Gauge,

    pub timeout_kills: Counter,
    pub forced_kills: Counter,
    pub cleanup_failures: Counter,

    pub execution_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            executions_total: Counter::new(),
            executions_completed: Counter::new(),
            executions_error: Counter::new(),
            executions_timeout: Counter::new(),
            executions_rejected: Counter::new(),
            executions_cancelled: Counter::new(),
            active_executions: Gauge::new(),
            timeout_kills: Counter::new(),
            forced_kills: Counter::new(),
            cleanup_failures: Counter::new(),
            execution_duration: Histogram::new_latency(),
        }
    }

    /// Record a terminal status
    pub fn record_execution(&self, status: ExecutionStatus, duration: Duration) {
        self.executions_total.inc();
        self.execution_duration.observe(duration);

        match status {
            ExecutionStatus::Completed => self.executions_completed.inc(),
            ExecutionStatus::Error => self.executions_error.inc(),
            ExecutionStatus::Timeout => self.executions_timeout.inc(),
            ExecutionStatus::Rejected => self.executions_rejected.inc(),
            ExecutionStatus::Cancelled => self.executions_cancelled.inc(),
            // Not terminal; never recorded
            ExecutionStatus::Pending | ExecutionStatus::Running => {}
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions_total: self.executions_total.get(),
            completed: self.executions_completed.get(),
            errored: self.executions_error.get(),
            timed_out: self.executions_timeout.get(),
            rejected: self.executions_rejected.get(),
            cancelled: self.executions_cancelled.get(),
            active_executions: self.active_executions.get(),
            timeout_kills: self.timeout_kills.get(),
            forced_kills: self.forced_kills.get(),
            cleanup_failures: self.cleanup_failures.get(),
            duration_count: self.execution_duration.count(),
            duration_sum_micros: self.execution_duration.sum_micros(),
        }
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP execbox_executions_total Total number of executions\n");
        output.push_str("# TYPE execbox_executions_total counter\n");
        output.push_str(&format!(
            "execbox_executions_total {}\n",
            self.executions_total.get()
        ));

        output.push_str("# HELP execbox_executions_by_status Executions by terminal status\n");
        output.push_str("# TYPE execbox_executions_by_status counter\n");
        for (status, counter) in [
            ("completed", &self.executions_completed),
            ("error", &self.executions_error),
            ("timeout", &self.executions_timeout),
            ("rejected", &self.executions_rejected),
            ("cancelled", &self.executions_cancelled),
        ] {
            output.push_str(&format!(
                "execbox_executions_by_status{{status=\"{}\"}} {}\n",
                status,
                counter.get()
            ));
        }

        output.push_str("# HELP execbox_kills_total Process groups torn down by the engine\n");
        output.push_str("# TYPE execbox_kills_total counter\n");
        output.push_str(&format!(
            "execbox_kills_total{{reason=\"timeout\"}} {}\n",
            self.timeout_kills.get()
        ));
        output.push_str(&format!(
            "execbox_kills_total{{reason=\"forced\"}} {}\n",
            self.forced_kills.get()
        ));

        output.push_str("# HELP execbox_cleanup_failures_total Workspaces that failed to delete\n");
        output.push_str("# TYPE execbox_cleanup_failures_total counter\n");
        output.push_str(&format!(
            "execbox_cleanup_failures_total {}\n",
            self.cleanup_failures.get()
        ));

        output.push_str("# HELP execbox_active_executions Currently running executions\n");
        output.push_str("# TYPE execbox_active_executions gauge\n");
        output.push_str(&format!(
            "execbox_active_executions {}\n",
            self.active_executions.get()
        ));

        output.push_str("# HELP execbox_execution_duration_seconds Execution duration\n");
        output.push_str("# TYPE execbox_execution_duration_seconds histogram\n");
        for bucket in &self.execution_duration.buckets {
            output.push_str(&format!(
                "execbox_execution_duration_seconds_bucket{{le=\"{}\"}} {}\n",
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        output.push_str(&format!(
            "execbox_execution_duration_seconds_sum {}\n",
            self.execution_duration.sum_micros() as f64 / 1_000_000.0
        ));
        output.push_str(&format!(
            "execbox_execution_duration_seconds_count {}\n",
            self.execution_duration.count()
        ));

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
