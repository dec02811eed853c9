/// Execution Queue Controller - Admission Control
///
/// **Job Lifecycle:**
/// submitted → scanned → {rejected | admitted immediately | queued}
/// → (queued) waiting → admitted → running → completed | failed | timed out
///
/// **Admission Rule:**
/// A job runs iff `running_total < max_concurrent_total` and its runtime's
/// running count is below `max_concurrent_per_runtime`.
///
/// **Scheduling:**
/// Two FIFO queues (high, normal). Whenever a slot frees up the high queue
/// is scanned first for the first job whose runtime has a free slot, then
/// the normal queue. Jobs are taken from the middle of a queue when the
/// head targets a saturated runtime.
///
/// Every queued job carries a oneshot sender; admitting it spawns the
/// execution, which sends the result back through that channel. Queue
/// state and counters are only mutated here, under one lock that is never
/// held across an await.
use crate::error::ValidationError;
use crate::metrics::WaitTimeWindow;
use crate::orchestrator::GradingOrchestrator;
use crate::security::SecurityScanner;
use gauntlet_common::config::EngineConfig;
use gauntlet_common::types::{
    ExecutionRequest, ExecutionResponse, GradingResult, Priority, QueueMetrics, QueueStatus,
    Runtime,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

/// Sent to the waiting caller when an admitted job finishes
struct Completion {
    result: GradingResult,
    queue_time_ms: u64,
}

struct QueuedJob {
    request: ExecutionRequest,
    queued_at: Instant,
    respond_to: oneshot::Sender<Completion>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    total_processed: u64,
    total_queued: u64,
    total_immediate: u64,
    high_priority_submitted: u64,
    normal_priority_submitted: u64,
    total_timeouts: u64,
    total_errors: u64,
    total_rejected: u64,
}

struct QueueState {
    high: VecDeque<QueuedJob>,
    normal: VecDeque<QueuedJob>,
    running_total: usize,
    running_by_runtime: HashMap<Runtime, usize>,
    counters: Counters,
    waits: WaitTimeWindow,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.high.len() + self.normal.len()
    }

    fn running_for(&self, runtime: Runtime) -> usize {
        self.running_by_runtime.get(&runtime).copied().unwrap_or(0)
    }

    fn can_admit(&self, runtime: Runtime, config: &EngineConfig) -> bool {
        self.running_total < config.max_concurrent_total
            && self.running_for(runtime) < config.max_concurrent_per_runtime
    }

    fn occupy(&mut self, runtime: Runtime) {
        self.running_total += 1;
        *self.running_by_runtime.entry(runtime).or_insert(0) += 1;
    }

    fn vacate(&mut self, runtime: Runtime) {
        self.running_total = self.running_total.saturating_sub(1);
        if let Some(running) = self.running_by_runtime.get_mut(&runtime) {
            *running = running.saturating_sub(1);
        }
    }

    /// Remove the first admissible job, high priority first. Jobs whose
    /// caller has gone away are discarded on the way.
    fn take_next(&mut self, config: &EngineConfig) -> Option<QueuedJob> {
        for priority in [Priority::High, Priority::Normal] {
            let queue = match priority {
                Priority::High => &mut self.high,
                Priority::Normal => &mut self.normal,
            };

            let before = queue.len();
            queue.retain(|job| !job.respond_to.is_closed());
            if queue.len() < before {
                debug!(priority = %priority, dropped = before - queue.len(), "Discarded abandoned jobs");
            }

            let running_total = self.running_total;
            let running_by_runtime = &self.running_by_runtime;
            let position = queue.iter().position(|job| {
                running_total < config.max_concurrent_total
                    && running_by_runtime.get(&job.request.runtime).copied().unwrap_or(0)
                        < config.max_concurrent_per_runtime
            });

            if let Some(position) = position {
                return queue.remove(position);
            }
        }
        None
    }

    fn is_healthy(&self, config: &EngineConfig) -> bool {
        self.depth() < config.health_max_queue_depth
            && self.waits.average_ms() < config.health_max_avg_wait_ms
    }
}

struct Inner {
    state: Mutex<QueueState>,
    orchestrator: GradingOrchestrator,
    scanner: SecurityScanner,
    config: EngineConfig,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holds one concurrency slot; releasing it admits the next job
struct Slot {
    inner: Arc<Inner>,
    runtime: Runtime,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.vacate(self.runtime);

        while let Some(job) = state.take_next(&self.inner.config) {
            let wait_ms = job.queued_at.elapsed().as_millis() as u64;
            state.occupy(job.request.runtime);
            state.waits.record(wait_ms);

            info!(
                runtime = %job.request.runtime,
                priority = %job.request.priority,
                wait_ms,
                queue_depth = state.depth(),
                "Admitted queued job"
            );

            spawn_execution(self.inner.clone(), job.request, wait_ms, job.respond_to);
        }
    }
}

fn spawn_execution(
    inner: Arc<Inner>,
    request: ExecutionRequest,
    queue_time_ms: u64,
    respond_to: oneshot::Sender<Completion>,
) {
    tokio::spawn(async move {
        let slot = Slot {
            inner: inner.clone(),
            runtime: request.runtime,
        };

        let result = match inner.orchestrator.run_code_tests(&request).await {
            Ok(result) => result,
            Err(e) => GradingResult::execution_failure(e.to_string())
                .with_total_tests(request.test_cases.len()),
        };

        {
            let mut state = inner.lock();
            state.counters.total_processed += 1;
            if result.timed_out {
                state.counters.total_timeouts += 1;
            } else if !result.success {
                state.counters.total_errors += 1;
            }
        }
        drop(slot);

        if respond_to
            .send(Completion {
                result,
                queue_time_ms,
            })
            .is_err()
        {
            debug!("Caller went away before the result was delivered");
        }
    });
}

/// Admission-controlled front door of the engine
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<Inner>,
}

impl ExecutionQueue {
    pub fn new(orchestrator: GradingOrchestrator) -> Self {
        let config = orchestrator.config().clone();
        let state = QueueState {
            high: VecDeque::new(),
            normal: VecDeque::new(),
            running_total: 0,
            running_by_runtime: HashMap::new(),
            counters: Counters::default(),
            waits: WaitTimeWindow::new(config.wait_sample_capacity),
        };

        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                orchestrator,
                scanner: SecurityScanner::new(config.violation_log_capacity),
                config,
            }),
        }
    }

    pub fn orchestrator(&self) -> &GradingOrchestrator {
        &self.inner.orchestrator
    }

    /// Scan, validate, then run now or wait for a slot.
    ///
    /// Unsafe submissions and a full queue produce a failed result with
    /// zero queue time; only malformed requests return an error.
    #[instrument(
        skip_all,
        fields(language = %request.language, runtime = %request.runtime, priority = %request.priority)
    )]
    pub async fn execute_code(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResponse, ValidationError> {
        let scan = self.inner.scanner.scan(&request.code, request.language);
        if !scan.safe {
            self.inner.lock().counters.total_rejected += 1;
            return Ok(ExecutionResponse {
                result: GradingResult::execution_failure(format!(
                    "Security violation: {}",
                    scan.violations.join("; ")
                ))
                .with_total_tests(request.test_cases.len()),
                queue_time_ms: 0,
            });
        }

        self.inner.orchestrator.validate(&request)?;

        let total_tests = request.test_cases.len();
        let receiver = {
            let mut state = self.inner.lock();
            let config = &self.inner.config;

            if state.can_admit(request.runtime, config) {
                state.occupy(request.runtime);
                state.counters.total_immediate += 1;
                count_priority(&mut state.counters, request.priority);
                state.waits.record(0);

                debug!(running = state.running_total, "Admitted immediately");
                let (sender, receiver) = oneshot::channel();
                spawn_execution(self.inner.clone(), request, 0, sender);
                receiver
            } else if state.depth() >= config.max_queue_depth {
                state.counters.total_rejected += 1;
                warn!(queue_depth = state.depth(), "Execution queue is full, rejecting job");
                return Ok(ExecutionResponse {
                    result: GradingResult::execution_failure(format!(
                        "Execution queue is full ({} jobs waiting)",
                        state.depth()
                    ))
                    .with_total_tests(total_tests),
                    queue_time_ms: 0,
                });
            } else {
                state.counters.total_queued += 1;
                count_priority(&mut state.counters, request.priority);

                let (sender, receiver) = oneshot::channel();
                let priority = request.priority;
                let job = QueuedJob {
                    request,
                    queued_at: Instant::now(),
                    respond_to: sender,
                };
                match priority {
                    Priority::High => state.high.push_back(job),
                    Priority::Normal => state.normal.push_back(job),
                }

                info!(queue_depth = state.depth(), running = state.running_total, "Job queued");
                receiver
            }
        };

        match receiver.await {
            Ok(completion) => Ok(ExecutionResponse {
                result: completion.result,
                queue_time_ms: completion.queue_time_ms,
            }),
            Err(_) => {
                error!("Execution task ended without a result");
                Ok(ExecutionResponse {
                    result: GradingResult::execution_failure("Execution was aborted")
                        .with_total_tests(total_tests),
                    queue_time_ms: 0,
                })
            }
        }
    }

    /// Cheap view for frequent polling
    pub fn get_status(&self) -> QueueStatus {
        let state = self.inner.lock();
        QueueStatus {
            queue_depth: state.depth(),
            running: state.running_total,
            avg_wait_ms: state.waits.average_ms(),
            healthy: state.is_healthy(&self.inner.config),
        }
    }

    /// Full counters, including the scanner's
    pub fn get_metrics(&self) -> QueueMetrics {
        let security = self.inner.scanner.metrics();
        let state = self.inner.lock();
        let config = &self.inner.config;
        let counters = state.counters;

        let running_by_runtime: BTreeMap<Runtime, usize> = Runtime::all_variants()
            .iter()
            .map(|runtime| (*runtime, state.running_for(*runtime)))
            .collect();

        QueueMetrics {
            queue_depth: state.depth(),
            high_priority_depth: state.high.len(),
            normal_priority_depth: state.normal.len(),
            running_total: state.running_total,
            running_by_runtime,
            max_concurrent_total: config.max_concurrent_total,
            max_concurrent_per_runtime: config.max_concurrent_per_runtime,
            total_processed: counters.total_processed,
            total_queued: counters.total_queued,
            total_immediate: counters.total_immediate,
            high_priority_submitted: counters.high_priority_submitted,
            normal_priority_submitted: counters.normal_priority_submitted,
            total_timeouts: counters.total_timeouts,
            total_errors: counters.total_errors,
            total_rejected: counters.total_rejected,
            avg_wait_ms: state.waits.average_ms(),
            max_wait_ms: state.waits.max_ms(),
            healthy: state.is_healthy(config),
            security,
        }
    }

    /// Zero cumulative counters and the wait window. Running and queued
    /// jobs are unaffected.
    pub fn reset_metrics(&self) {
        {
            let mut state = self.inner.lock();
            state.counters = Counters::default();
            state.waits.reset();
        }
        self.inner.scanner.reset_metrics();
        info!("Queue metrics reset");
    }
}

fn count_priority(counters: &mut Counters, priority: Priority) {
    match priority {
        Priority::High => counters.high_priority_submitted += 1,
        Priority::Normal => counters.normal_priority_submitted += 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::LanguageRunner;
    use crate::testing::{FakeRunner, Recorder};
    use gauntlet_common::types::{Language, TestCase};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn config(total: usize, per_runtime: usize) -> EngineConfig {
        let mut config = EngineConfig::defaults();
        config.max_concurrent_total = total;
        config.max_concurrent_per_runtime = per_runtime;
        config
    }

    fn queue_with(config: EngineConfig, runners: Vec<Arc<dyn LanguageRunner>>) -> ExecutionQueue {
        ExecutionQueue::new(GradingOrchestrator::with_runners(config, runners))
    }

    fn request(language: Language, code: &str) -> ExecutionRequest {
        ExecutionRequest::new(language, code)
            .with_entry("solve")
            .with_test(TestCase::call(vec![json!(1)], json!(1)))
    }

    async fn wait_for_depth(queue: &ExecutionQueue, depth: usize) {
        for _ in 0..200 {
            if queue.get_status().queue_depth == depth {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached depth {}", depth);
    }

    async fn wait_for_started(recorder: &Recorder, count: usize) {
        for _ in 0..200 {
            if recorder.started().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} jobs never started", count);
    }

    #[tokio::test]
    async fn test_immediate_admission() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue_with(
            config(2, 2),
            vec![Arc::new(FakeRunner::new(Runtime::Python, recorder.clone()))],
        );

        let response = queue.execute_code(request(Language::Python, "ok")).await.unwrap();
        assert!(response.result.overall_passed);
        assert_eq!(response.queue_time_ms, 0);

        let metrics = queue.get_metrics();
        assert_eq!(metrics.total_immediate, 1);
        assert_eq!(metrics.total_processed, 1);
        assert_eq!(metrics.normal_priority_submitted, 1);
        assert_eq!(metrics.running_total, 0);
        assert_eq!(metrics.security.total_scans, 1);
    }

    #[tokio::test]
    async fn test_security_rejection_skips_queue() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue_with(
            config(1, 1),
            vec![Arc::new(FakeRunner::new(Runtime::Python, recorder.clone()))],
        );

        let response = queue
            .execute_code(request(Language::Python, "import os\ndef solve(x):\n    return x\n"))
            .await
            .unwrap();

        assert_eq!(response.queue_time_ms, 0);
        assert!(!response.result.overall_passed);
        assert!(response
            .result
            .execution_error
            .unwrap()
            .starts_with("Security violation: Restricted module import"));
        assert!(recorder.started().is_empty());

        let metrics = queue.get_metrics();
        assert_eq!(metrics.total_rejected, 1);
        assert_eq!(metrics.total_processed, 0);
        assert_eq!(metrics.security.total_rejections, 1);
        assert_eq!(metrics.security.recent_violations.len(), 1);
    }

    #[tokio::test]
    async fn test_validation_error_is_returned() {
        let queue = queue_with(config(1, 1), Vec::new());
        let result = queue.execute_code(ExecutionRequest::new(Language::Python, "x = 1")).await;
        assert!(result.is_err());
        assert_eq!(queue.get_status().queue_depth, 0);
    }

    #[tokio::test]
    async fn test_concurrency_ceilings_hold() {
        let recorder = Arc::new(Recorder::default());
        let node = Arc::new(
            FakeRunner::new(Runtime::Node, recorder.clone()).with_delay(Duration::from_millis(20)),
        );
        let python = Arc::new(
            FakeRunner::new(Runtime::Python, recorder.clone()).with_delay(Duration::from_millis(20)),
        );
        let queue = queue_with(config(3, 2), vec![node.clone(), python.clone()]);

        let mut handles = Vec::new();
        for i in 0..12 {
            let language = if i % 2 == 0 { Language::Python } else { Language::JavaScript };
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.execute_code(request(language, &format!("job {}", i))).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().result.overall_passed);
        }

        assert!(recorder.peak() <= 3);
        assert!(node.peak() <= 2);
        assert!(python.peak() <= 2);

        let metrics = queue.get_metrics();
        assert_eq!(metrics.total_processed, 12);
        assert_eq!(metrics.total_immediate + metrics.total_queued, 12);
        assert!(metrics.total_queued > 0);
        assert_eq!(metrics.running_total, 0);
        assert_eq!(metrics.queue_depth, 0);
    }

    #[tokio::test]
    async fn test_high_priority_admitted_first() {
        let recorder = Arc::new(Recorder::default());
        let gate = Arc::new(Semaphore::new(0));
        let queue = queue_with(
            config(1, 1),
            vec![Arc::new(
                FakeRunner::new(Runtime::Python, recorder.clone()).with_gate(gate.clone()),
            )],
        );

        let first = tokio::spawn({
            let queue = queue.clone();
            async move { queue.execute_code(request(Language::Python, "first")).await }
        });
        wait_for_started(&recorder, 1).await;

        let normal = tokio::spawn({
            let queue = queue.clone();
            async move { queue.execute_code(request(Language::Python, "normal")).await }
        });
        wait_for_depth(&queue, 1).await;

        let high = tokio::spawn({
            let queue = queue.clone();
            async move {
                queue
                    .execute_code(request(Language::Python, "high").with_priority(Priority::High))
                    .await
            }
        });
        wait_for_depth(&queue, 2).await;

        let metrics = queue.get_metrics();
        assert_eq!(metrics.high_priority_depth, 1);
        assert_eq!(metrics.normal_priority_depth, 1);

        gate.add_permits(3);
        first.await.unwrap().unwrap();
        let high = high.await.unwrap().unwrap();
        normal.await.unwrap().unwrap();

        assert_eq!(recorder.started(), vec!["first", "high", "normal"]);
        assert!(high.queue_time_ms < 5_000);
        assert_eq!(queue.get_metrics().high_priority_submitted, 1);
    }

    #[tokio::test]
    async fn test_saturated_runtime_does_not_block_others() {
        let recorder = Arc::new(Recorder::default());
        let python_gate = Arc::new(Semaphore::new(0));
        let node_gate = Arc::new(Semaphore::new(0));
        let queue = queue_with(
            config(2, 1),
            vec![
                Arc::new(FakeRunner::new(Runtime::Python, recorder.clone()).with_gate(python_gate.clone())),
                Arc::new(FakeRunner::new(Runtime::Node, recorder.clone()).with_gate(node_gate.clone())),
            ],
        );

        let mut handles = Vec::new();
        for (language, code) in [
            (Language::Python, "python-1"),
            (Language::JavaScript, "node-1"),
        ] {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.execute_code(request(language, code)).await
            }));
        }
        wait_for_started(&recorder, 2).await;

        // python-2 sits at the head, node-2 behind it
        for (language, code, depth) in [
            (Language::Python, "python-2", 1),
            (Language::JavaScript, "node-2", 2),
        ] {
            let queue_clone = queue.clone();
            handles.push(tokio::spawn(async move {
                queue_clone.execute_code(request(language, code)).await
            }));
            wait_for_depth(&queue, depth).await;
        }

        node_gate.add_permits(1);
        wait_for_started(&recorder, 3).await;
        assert_eq!(recorder.started()[2], "node-2");
        assert_eq!(queue.get_status().queue_depth, 1);

        python_gate.add_permits(2);
        node_gate.add_permits(1);
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().result.success);
        }
        assert_eq!(recorder.started().len(), 4);
    }

    #[tokio::test]
    async fn test_queue_full_rejection() {
        let recorder = Arc::new(Recorder::default());
        let gate = Arc::new(Semaphore::new(0));
        let mut config = config(1, 1);
        config.max_queue_depth = 1;
        let queue = queue_with(
            config,
            vec![Arc::new(
                FakeRunner::new(Runtime::Python, recorder.clone()).with_gate(gate.clone()),
            )],
        );

        let running = tokio::spawn({
            let queue = queue.clone();
            async move { queue.execute_code(request(Language::Python, "running")).await }
        });
        wait_for_started(&recorder, 1).await;
        let waiting = tokio::spawn({
            let queue = queue.clone();
            async move { queue.execute_code(request(Language::Python, "waiting")).await }
        });
        wait_for_depth(&queue, 1).await;

        let rejected = queue.execute_code(request(Language::Python, "rejected")).await.unwrap();
        assert_eq!(rejected.queue_time_ms, 0);
        assert!(rejected.result.execution_error.unwrap().contains("queue is full"));
        assert_eq!(rejected.result.total_tests, 1);

        gate.add_permits(2);
        running.await.unwrap().unwrap();
        waiting.await.unwrap().unwrap();
        assert_eq!(queue.get_metrics().total_rejected, 1);
    }

    #[tokio::test]
    async fn test_abandoned_job_is_discarded() {
        let recorder = Arc::new(Recorder::default());
        let gate = Arc::new(Semaphore::new(0));
        let queue = queue_with(
            config(1, 1),
            vec![Arc::new(
                FakeRunner::new(Runtime::Python, recorder.clone()).with_gate(gate.clone()),
            )],
        );

        let running = tokio::spawn({
            let queue = queue.clone();
            async move { queue.execute_code(request(Language::Python, "running")).await }
        });
        wait_for_started(&recorder, 1).await;

        let abandoned = tokio::spawn({
            let queue = queue.clone();
            async move { queue.execute_code(request(Language::Python, "abandoned")).await }
        });
        wait_for_depth(&queue, 1).await;
        abandoned.abort();
        let _ = abandoned.await;

        gate.add_permits(1);
        running.await.unwrap().unwrap();

        assert_eq!(recorder.started(), vec!["running"]);
        assert_eq!(queue.get_status().queue_depth, 0);
        assert_eq!(queue.get_status().running, 0);
    }

    #[tokio::test]
    async fn test_outcome_counters_and_reset() {
        let recorder = Arc::new(Recorder::default());
        let queue = queue_with(
            config(4, 4),
            vec![Arc::new(FakeRunner::new(Runtime::Python, recorder.clone()))],
        );

        queue.execute_code(request(Language::Python, "ok")).await.unwrap();
        let failed = queue.execute_code(request(Language::Python, "fail")).await.unwrap();
        assert!(!failed.result.success);
        let timed_out = queue.execute_code(request(Language::Python, "timeout")).await.unwrap();
        assert!(timed_out.result.timed_out);

        let metrics = queue.get_metrics();
        assert_eq!(metrics.total_processed, 3);
        assert_eq!(metrics.total_errors, 1);
        assert_eq!(metrics.total_timeouts, 1);
        assert!(metrics.healthy);

        queue.reset_metrics();
        let metrics = queue.get_metrics();
        assert_eq!(metrics.total_processed, 0);
        assert_eq!(metrics.total_errors, 0);
        assert_eq!(metrics.max_wait_ms, 0);
        assert_eq!(metrics.avg_wait_ms, 0.0);
        assert_eq!(metrics.security.total_scans, 0);
    }

    #[tokio::test]
    async fn test_unhealthy_when_backlogged() {
        let recorder = Arc::new(Recorder::default());
        let gate = Arc::new(Semaphore::new(0));
        let mut config = config(1, 1);
        config.health_max_queue_depth = 1;
        let queue = queue_with(
            config,
            vec![Arc::new(
                FakeRunner::new(Runtime::Python, recorder.clone()).with_gate(gate.clone()),
            )],
        );
        assert!(queue.get_status().healthy);

        let mut handles = Vec::new();
        for code in ["a", "b"] {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue.execute_code(request(Language::Python, code)).await
            }));
        }
        wait_for_depth(&queue, 1).await;
        let status = queue.get_status();
        assert!(!status.healthy);
        assert_eq!(status.running, 1);

        gate.add_permits(2);
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(queue.get_status().queue_depth, 0);
    }
}
