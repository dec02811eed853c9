// In-process runners for orchestrator and queue tests
use crate::runners::{LanguageRunner, RunJob};
use async_trait::async_trait;
use gauntlet_common::types::{GradingResult, Runtime, TestResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Observations shared by every fake runner in a test
#[derive(Default)]
pub struct Recorder {
    started: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Recorder {
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Records each job's code when it starts, then either sleeps or waits
/// for a permit on the gate. Code containing "fail" or "timeout" produces
/// the corresponding failure result.
pub struct FakeRunner {
    runtime: Runtime,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    recorder: Arc<Recorder>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeRunner {
    pub fn new(runtime: Runtime, recorder: Arc<Recorder>) -> Self {
        Self {
            runtime,
            delay: Duration::from_millis(10),
            gate: None,
            recorder,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub fn passing_result() -> GradingResult {
    GradingResult::from_test_results(
        vec![TestResult {
            test_name: "Test 1".to_string(),
            test_case_index: 0,
            passed: true,
            actual_output: Some("5".to_string()),
            expected_output: Some("5".to_string()),
            execution_time_ms: 0.1,
            console_logs: Vec::new(),
            error: None,
            hidden: false,
        }],
        Vec::new(),
    )
}

#[async_trait]
impl LanguageRunner for FakeRunner {
    fn runtime(&self) -> Runtime {
        self.runtime
    }

    async fn run(&self, job: RunJob) -> GradingResult {
        self.recorder.started.lock().unwrap().push(job.code.clone());
        let total = self.recorder.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.peak.fetch_max(total, Ordering::SeqCst);
        let mine = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(mine, Ordering::SeqCst);

        match &self.gate {
            Some(gate) => {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            None => tokio::time::sleep(self.delay).await,
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.recorder.running.fetch_sub(1, Ordering::SeqCst);

        if job.code.contains("fail") {
            GradingResult::execution_failure("runner failed")
        } else if job.code.contains("timeout") {
            GradingResult::timeout("Execution timed out")
        } else {
            passing_result()
        }
    }
}

/// Never finishes; flips `dropped` when its future is dropped
pub struct HangingRunner {
    pub runtime: Runtime,
    pub dropped: Arc<std::sync::atomic::AtomicBool>,
}

struct DropFlag(Arc<std::sync::atomic::AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LanguageRunner for HangingRunner {
    fn runtime(&self) -> Runtime {
        self.runtime
    }

    async fn run(&self, _job: RunJob) -> GradingResult {
        let _flag = DropFlag(self.dropped.clone());
        std::future::pending::<()>().await;
        passing_result()
    }
}

pub struct PanickingRunner(pub Runtime);

#[async_trait]
impl LanguageRunner for PanickingRunner {
    fn runtime(&self) -> Runtime {
        self.0
    }

    async fn run(&self, _job: RunJob) -> GradingResult {
        panic!("runner exploded")
    }
}
