// Queue metrics: rolling wait-time window and Prometheus export

use anyhow::{Context, Result};
use gauntlet_common::types::QueueMetrics;
use lazy_static::lazy_static;
use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Fixed-capacity sample of admission waits; the oldest sample is dropped
/// once capacity is reached. The maximum survives eviction and is only
/// cleared by `reset`.
#[derive(Debug, Clone)]
pub struct WaitTimeWindow {
    samples: VecDeque<u64>,
    capacity: usize,
    max_ms: u64,
}

impl WaitTimeWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            max_ms: 0,
        }
    }

    pub fn record(&mut self, wait_ms: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(wait_ms);
        self.max_ms = self.max_ms.max(wait_ms);
    }

    pub fn average_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.max_ms = 0;
    }
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::with_opts(Opts::new(name, help)).expect("metric can be created")
}

lazy_static! {
    // Gauges mirror a snapshot, so counters that can be reset are exported as gauges
    static ref QUEUE_DEPTH: IntGaugeVec = IntGaugeVec::new(
        Opts::new("gauntlet_queue_depth", "Jobs waiting for admission per priority"),
        &["priority"]
    )
    .expect("metric can be created");

    static ref RUNNING: IntGaugeVec = IntGaugeVec::new(
        Opts::new("gauntlet_running_jobs", "Jobs currently running per runtime"),
        &["runtime"]
    )
    .expect("metric can be created");

    static ref SUBMITTED: IntGaugeVec = IntGaugeVec::new(
        Opts::new("gauntlet_jobs_submitted", "Jobs accepted for execution per priority"),
        &["priority"]
    )
    .expect("metric can be created");

    static ref SECURITY_REJECTIONS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("gauntlet_security_rejections", "Submissions rejected by the scanner per language"),
        &["language"]
    )
    .expect("metric can be created");

    static ref PROCESSED: IntGauge = gauge("gauntlet_jobs_processed", "Jobs that ran to completion");
    static ref QUEUED: IntGauge = gauge("gauntlet_jobs_queued", "Jobs that had to wait for a slot");
    static ref IMMEDIATE: IntGauge = gauge("gauntlet_jobs_immediate", "Jobs admitted without waiting");
    static ref TIMEOUTS: IntGauge = gauge("gauntlet_jobs_timed_out", "Jobs that timed out");
    static ref ERRORS: IntGauge = gauge("gauntlet_jobs_failed", "Jobs whose pipeline failed");
    static ref REJECTED: IntGauge = gauge("gauntlet_jobs_rejected", "Jobs rejected before admission");
    static ref SCANS: IntGauge = gauge("gauntlet_security_scans", "Submissions scanned");
    static ref MAX_WAIT: IntGauge = gauge("gauntlet_max_wait_ms", "Longest admission wait in milliseconds");
    static ref HEALTHY: IntGauge = gauge("gauntlet_healthy", "1 when the queue is healthy");

    static ref AVG_WAIT: Gauge = Gauge::with_opts(Opts::new(
        "gauntlet_avg_wait_ms",
        "Rolling average admission wait in milliseconds"
    ))
    .expect("metric can be created");

    static ref REGISTRY: Registry = {
        let registry = Registry::new();
        registry.register(Box::new(QUEUE_DEPTH.clone())).expect("collector can be registered");
        registry.register(Box::new(RUNNING.clone())).expect("collector can be registered");
        registry.register(Box::new(SUBMITTED.clone())).expect("collector can be registered");
        registry.register(Box::new(SECURITY_REJECTIONS.clone())).expect("collector can be registered");
        registry.register(Box::new(PROCESSED.clone())).expect("collector can be registered");
        registry.register(Box::new(QUEUED.clone())).expect("collector can be registered");
        registry.register(Box::new(IMMEDIATE.clone())).expect("collector can be registered");
        registry.register(Box::new(TIMEOUTS.clone())).expect("collector can be registered");
        registry.register(Box::new(ERRORS.clone())).expect("collector can be registered");
        registry.register(Box::new(REJECTED.clone())).expect("collector can be registered");
        registry.register(Box::new(SCANS.clone())).expect("collector can be registered");
        registry.register(Box::new(MAX_WAIT.clone())).expect("collector can be registered");
        registry.register(Box::new(HEALTHY.clone())).expect("collector can be registered");
        registry.register(Box::new(AVG_WAIT.clone())).expect("collector can be registered");
        registry
    };

    // Setting the gauges and gathering them must not interleave
    static ref RENDER_LOCK: Mutex<()> = Mutex::new(());
}

fn to_i64<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

/// Render a queue snapshot in Prometheus text format
pub fn render_prometheus(metrics: &QueueMetrics) -> Result<String> {
    let _guard = RENDER_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    QUEUE_DEPTH.with_label_values(&["high"]).set(to_i64(metrics.high_priority_depth));
    QUEUE_DEPTH.with_label_values(&["normal"]).set(to_i64(metrics.normal_priority_depth));
    SUBMITTED.with_label_values(&["high"]).set(to_i64(metrics.high_priority_submitted));
    SUBMITTED.with_label_values(&["normal"]).set(to_i64(metrics.normal_priority_submitted));

    RUNNING.reset();
    for (runtime, running) in &metrics.running_by_runtime {
        RUNNING
            .with_label_values(&[&runtime.to_string()])
            .set(to_i64(*running));
    }

    SECURITY_REJECTIONS.reset();
    for (language, rejections) in &metrics.security.rejections_by_language {
        SECURITY_REJECTIONS
            .with_label_values(&[&language.to_string()])
            .set(to_i64(*rejections));
    }

    PROCESSED.set(to_i64(metrics.total_processed));
    QUEUED.set(to_i64(metrics.total_queued));
    IMMEDIATE.set(to_i64(metrics.total_immediate));
    TIMEOUTS.set(to_i64(metrics.total_timeouts));
    ERRORS.set(to_i64(metrics.total_errors));
    REJECTED.set(to_i64(metrics.total_rejected));
    SCANS.set(to_i64(metrics.security.total_scans));
    MAX_WAIT.set(to_i64(metrics.max_wait_ms));
    HEALTHY.set(i64::from(metrics.healthy));
    AVG_WAIT.set(metrics.avg_wait_ms);

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics output is not valid UTF-8")
}
