/// Grading Orchestrator - Validation, Routing and Backstop
///
/// **Responsibility:**
/// Validate a request, dispatch it to the runner registered for its
/// runtime, and convert every execution-time failure into a `GradingResult`.
///
/// **Architecture:**
/// 1. Validate (the only error this layer returns)
/// 2. Normalise the timeout (0 → default, clamped to the maximum)
/// 3. Run the runner in its own task so a panic cannot reach the caller
/// 4. Race it against a looser service timeout (2 × timeout + buffer);
///    on expiry the task is aborted, which kills its child process
///
/// This module knows nothing about how a runtime executes code or how
/// admission control works.
use crate::config::RuntimeConfigManager;
use crate::error::ValidationError;
use crate::runners::{
    JavaRunner, LanguageRunner, NodeRunner, PythonRunner, RunJob, RunnerSettings, SqlRunner,
};
use anyhow::Result;
use gauntlet_common::config::EngineConfig;
use gauntlet_common::types::{
    capability_matrix, ExecutionRequest, GradingResult, LanguageCapability, Runtime,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

lazy_static! {
    static ref IDENTIFIER: Regex =
        Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*$").expect("identifier pattern must compile");
}

pub struct GradingOrchestrator {
    runners: HashMap<Runtime, Arc<dyn LanguageRunner>>,
    config: EngineConfig,
}

impl GradingOrchestrator {
    /// Orchestrator with the production runner for every runtime
    pub fn new(config: EngineConfig, runtime_configs: &RuntimeConfigManager) -> Result<Self> {
        let settings = RunnerSettings::from_config(&config);
        let runners: Vec<Arc<dyn LanguageRunner>> = vec![
            Arc::new(NodeRunner::new(
                runtime_configs.get_config(&Runtime::Node)?.clone(),
                settings,
            )),
            Arc::new(PythonRunner::new(
                runtime_configs.get_config(&Runtime::Python)?.clone(),
                settings,
            )),
            Arc::new(JavaRunner::new(
                runtime_configs.get_config(&Runtime::Jvm)?.clone(),
                settings,
            )),
            Arc::new(SqlRunner::new(config.sql_max_rows)),
        ];

        Ok(Self::with_runners(config, runners))
    }

    /// Orchestrator with an explicit runner set
    pub fn with_runners(config: EngineConfig, runners: Vec<Arc<dyn LanguageRunner>>) -> Self {
        let mut orchestrator = Self {
            runners: HashMap::new(),
            config,
        };
        for runner in runners {
            orchestrator.register(runner);
        }
        orchestrator
    }

    /// Register (or replace) the runner for its runtime
    pub fn register(&mut self, runner: Arc<dyn LanguageRunner>) {
        self.runners.insert(runner.runtime(), runner);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn supported_runtimes(&self) -> Vec<Runtime> {
        let mut runtimes: Vec<Runtime> = self.runners.keys().copied().collect();
        runtimes.sort();
        runtimes
    }

    /// Language → runtime map callers must consult before submitting
    pub fn capability_matrix(&self) -> Vec<LanguageCapability> {
        capability_matrix()
            .into_iter()
            .map(|mut capability| {
                capability.executable = capability
                    .runtime
                    .map_or(false, |runtime| self.runners.contains_key(&runtime));
                capability
            })
            .collect()
    }

    pub fn validate(&self, request: &ExecutionRequest) -> Result<(), ValidationError> {
        if request.code.trim().is_empty() {
            return Err(ValidationError::EmptyCode);
        }

        let expected_runtime = request
            .language
            .runtime()
            .ok_or(ValidationError::UnsupportedLanguage(request.language))?;
        if expected_runtime != request.runtime {
            return Err(ValidationError::RuntimeMismatch {
                language: request.language,
                runtime: request.runtime,
            });
        }
        if !self.runners.contains_key(&request.runtime) {
            return Err(ValidationError::RuntimeUnavailable(request.runtime));
        }

        if request.test_cases.is_empty() {
            return Err(ValidationError::NoTestCases);
        }

        if request.runtime.requires_entry_function() {
            let entry = request
                .entry_function
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or(ValidationError::MissingEntryFunction(request.runtime))?;
            if !IDENTIFIER.is_match(entry) {
                return Err(ValidationError::InvalidEntryFunction(entry.to_string()));
            }
        }

        for (index, case) in request.test_cases.iter().enumerate() {
            if request.runtime.is_query() {
                if case.expected_rows.is_none() {
                    return Err(ValidationError::MissingExpectedRows { index });
                }
            } else if case.args.is_none() {
                return Err(ValidationError::MissingArgs { index });
            }
        }

        Ok(())
    }

    /// Direct path without admission control. Only malformed requests
    /// return an error; every execution failure is inside the result.
    #[instrument(
        skip_all,
        fields(language = %request.language, runtime = %request.runtime, tests = request.test_cases.len())
    )]
    pub async fn run_code_tests(
        &self,
        request: &ExecutionRequest,
    ) -> Result<GradingResult, ValidationError> {
        self.validate(request)?;

        let runner = self
            .runners
            .get(&request.runtime)
            .cloned()
            .ok_or(ValidationError::RuntimeUnavailable(request.runtime))?;

        let timeout_ms = self.config.effective_timeout_ms(request.timeout_ms);
        let service_timeout_ms = self.config.service_timeout_ms(timeout_ms);
        let total = request.test_cases.len();

        let job = RunJob {
            code: request.code.clone(),
            language: request.language,
            entry_function: request.entry_function.as_deref().map(|name| name.trim().to_string()),
            test_cases: request.test_cases.clone(),
            timeout_ms,
        };

        info!(timeout_ms, service_timeout_ms, "Dispatching to runner");
        let started = Instant::now();

        let mut handle = tokio::spawn(async move { runner.run(job).await });
        let result =
            match tokio::time::timeout(Duration::from_millis(service_timeout_ms), &mut handle).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => {
                    error!(error = %join_error, "Runner task failed");
                    GradingResult::execution_failure(format!("Runner failed: {}", join_error))
                        .with_total_tests(total)
                }
                Err(_) => {
                    handle.abort();
                    warn!(service_timeout_ms, "Service timeout tripped, runner aborted");
                    GradingResult::timeout(format!(
                        "Execution timed out after {}ms (service timeout)",
                        service_timeout_ms
                    ))
                    .with_total_tests(total)
                }
            };

        info!(
            execution_ms = started.elapsed().as_millis() as u64,
            passed = result.total_tests_passed,
            total = result.total_tests,
            success = result.success,
            timed_out = result.timed_out,
            "Grading complete"
        );

        Ok(result)
    }
}
