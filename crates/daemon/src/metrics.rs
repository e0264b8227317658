//! Metrics module for the stm daemon
//!
//! One Prometheus registry carrying the transcode counters, task gauges,
//! and the encode-duration histogram, text-encoded at /metrics.

use prometheus::{
    Counter, Gauge, Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use thiserror::Error;

use crate::store::Stats;

/// Error type for metrics construction and rendering
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics registration failed: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Shared metrics handle
pub type SharedMetrics = Arc<Metrics>;

/// Registry plus every instrument the daemon exports.
pub struct Metrics {
    registry: Registry,
    pub transcode_success: IntCounter,
    pub transcode_failed: IntCounter,
    pub files_soft_deleted: IntCounter,
    pub files_hard_deleted: IntCounter,
    pub space_saved_bytes: Counter,
    pub tasks_total: IntGaugeVec,
    pub tasks_processing: Gauge,
    pub workers_active: Gauge,
    pub disk_space_available_bytes: Gauge,
    pub transcode_duration_seconds: Histogram,
}

impl Metrics {
    pub fn new() -> Result<SharedMetrics, MetricsError> {
        let registry = Registry::new();

        let transcode_success = IntCounter::new(
            "stm_transcode_success_total",
            "Total number of successful transcodes",
        )?;
        let transcode_failed = IntCounter::new(
            "stm_transcode_failed_total",
            "Total number of failed transcodes",
        )?;
        let files_soft_deleted = IntCounter::new(
            "stm_files_soft_deleted_total",
            "Total number of files moved to trash",
        )?;
        let files_hard_deleted = IntCounter::new(
            "stm_files_hard_deleted_total",
            "Total number of files permanently deleted",
        )?;
        let space_saved_bytes = Counter::new(
            "stm_space_saved_bytes",
            "Total storage space saved in bytes",
        )?;
        let tasks_total = IntGaugeVec::new(
            Opts::new("stm_tasks_total", "Total number of tasks by status"),
            &["status"],
        )?;
        let tasks_processing = Gauge::new(
            "stm_tasks_processing",
            "Number of tasks currently being processed",
        )?;
        let workers_active = Gauge::new("stm_workers_active", "Number of active workers")?;
        let disk_space_available_bytes = Gauge::new(
            "stm_disk_space_available_bytes",
            "Available disk space in bytes",
        )?;
        let transcode_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "stm_transcode_duration_seconds",
                "Duration of video transcoding in seconds",
            )
            .buckets(prometheus::exponential_buckets(60.0, 2.0, 10)?),
        )?;

        registry.register(Box::new(transcode_success.clone()))?;
        registry.register(Box::new(transcode_failed.clone()))?;
        registry.register(Box::new(files_soft_deleted.clone()))?;
        registry.register(Box::new(files_hard_deleted.clone()))?;
        registry.register(Box::new(space_saved_bytes.clone()))?;
        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(tasks_processing.clone()))?;
        registry.register(Box::new(workers_active.clone()))?;
        registry.register(Box::new(disk_space_available_bytes.clone()))?;
        registry.register(Box::new(transcode_duration_seconds.clone()))?;

        Ok(Arc::new(Self {
            registry,
            transcode_success,
            transcode_failed,
            files_soft_deleted,
            files_hard_deleted,
            space_saved_bytes,
            tasks_total,
            tasks_processing,
            workers_active,
            disk_space_available_bytes,
            transcode_duration_seconds,
        }))
    }

    /// Refresh the per-status gauges from a stats snapshot.
    pub fn update_task_stats(&self, stats: &Stats) {
        self.tasks_total
            .with_label_values(&["pending"])
            .set(stats.pending);
        self.tasks_total
            .with_label_values(&["processing"])
            .set(stats.processing);
        self.tasks_total
            .with_label_values(&["completed"])
            .set(stats.completed);
        self.tasks_total
            .with_label_values(&["failed"])
            .set(stats.failed);
        self.tasks_total
            .with_label_values(&["irrecoverable"])
            .set(stats.irrecoverable);
        self.tasks_processing.set(stats.processing as f64);
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> Result<String, MetricsError> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        Ok(encoder.encode_to_string(&self.registry.gather())?)
    }
}
