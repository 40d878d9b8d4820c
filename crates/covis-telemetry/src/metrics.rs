//! Prometheus-backed counters for dispatch and task execution.
//!
//! # Design
//! - Collector registration stays private; callers get typed increment helpers.
//! - Label sets are small and bounded (task names, queue names, statuses).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use serde::Serialize;

/// Metrics registry shared by the dispatcher, worker, and dispatch pass.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("Metrics").finish_non_exhaustive()
    }
}

struct MetricsInner {
    registry: Registry,
    tasks_submitted_total: IntCounterVec,
    task_outcomes_total: IntCounterVec,
    route_decisions_total: IntCounterVec,
    task_redeliveries_total: IntCounter,
    submitted: AtomicU64,
    outcomes: AtomicU64,
    decisions: AtomicU64,
}

/// Totals for health reporting and tests.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Tasks published or run locally.
    pub tasks_submitted_total: u64,
    /// Task executions that reached a terminal status.
    pub task_outcomes_total: u64,
    /// Planner decisions emitted.
    pub route_decisions_total: u64,
    /// Messages requeued after a transient failure or lost worker.
    pub task_redeliveries_total: u64,
}

impl Metrics {
    /// Construct a registry with the standard collectors.
    ///
    /// # Errors
    ///
    /// Returns an error if a collector cannot be registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tasks_submitted_total = IntCounterVec::new(
            Opts::new("covis_tasks_submitted_total", "Tasks submitted by task and queue"),
            &["task", "queue"],
        )?;
        let task_outcomes_total = IntCounterVec::new(
            Opts::new("covis_task_outcomes_total", "Task executions by terminal status"),
            &["task", "status"],
        )?;
        let route_decisions_total = IntCounterVec::new(
            Opts::new("covis_route_decisions_total", "Relocation planner decisions"),
            &["decision"],
        )?;
        let task_redeliveries_total = IntCounter::with_opts(Opts::new(
            "covis_task_redeliveries_total",
            "Messages requeued for another delivery",
        ))?;

        registry.register(Box::new(tasks_submitted_total.clone()))?;
        registry.register(Box::new(task_outcomes_total.clone()))?;
        registry.register(Box::new(route_decisions_total.clone()))?;
        registry.register(Box::new(task_redeliveries_total.clone()))?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                tasks_submitted_total,
                task_outcomes_total,
                route_decisions_total,
                task_redeliveries_total,
                submitted: AtomicU64::new(0),
                outcomes: AtomicU64::new(0),
                decisions: AtomicU64::new(0),
            }),
        })
    }

    /// Count a submitted task.
    pub fn inc_task_submitted(&self, task: &str, queue: &str) {
        self.inner
            .tasks_submitted_total
            .with_label_values(&[task, queue])
            .inc();
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a terminal task outcome.
    pub fn inc_task_outcome(&self, task: &str, status: &str) {
        self.inner
            .task_outcomes_total
            .with_label_values(&[task, status])
            .inc();
        self.inner.outcomes.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a planner decision.
    pub fn inc_route_decision(&self, decision: &str) {
        self.inner
            .route_decisions_total
            .with_label_values(&[decision])
            .inc();
        self.inner.decisions.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a redelivery.
    pub fn inc_redelivery(&self) {
        self.inner.task_redeliveries_total.inc();
    }

    /// Render the registry in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the output is not UTF-8.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .context("failed to encode Prometheus metrics")?;
        String::from_utf8(buffer).context("metrics output was not valid UTF-8")
    }

    /// Totals across all labels.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_submitted_total: self.inner.submitted.load(Ordering::Relaxed),
            task_outcomes_total: self.inner.outcomes.load(Ordering::Relaxed),
            route_decisions_total: self.inner.decisions.load(Ordering::Relaxed),
            task_redeliveries_total: self.inner.task_redeliveries_total.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sums_labelled_counters() -> Result<()> {
        let metrics = Metrics::new()?;
        metrics.inc_task_submitted("relocation.relocate", "relocate");
        metrics.inc_task_submitted("postprocess.process", "process");
        metrics.inc_task_outcome("relocation.relocate", "succeeded");
        metrics.inc_route_decision("dispatch");
        metrics.inc_redelivery();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_submitted_total, 2);
        assert_eq!(snapshot.task_outcomes_total, 1);
        assert_eq!(snapshot.route_decisions_total, 1);
        assert_eq!(snapshot.task_redeliveries_total, 1);

        let rendered = metrics.render()?;
        assert!(rendered.contains("covis_tasks_submitted_total"));
        assert!(rendered.contains("queue=\"relocate\""));
        Ok(())
    }
}
