// Python runner: a generated harness loads the submission as its own module
use super::{
    interpret_outcome, HarnessPayload, LanguageRunner, ResultChannel, RunJob, RunnerSettings,
    Workspace,
};
use crate::config::RuntimeConfig;
use crate::sandbox::{self, SandboxCommand};
use anyhow::Result;
use async_trait::async_trait;
use gauntlet_common::types::{GradingResult, Runtime};
use std::time::Instant;
use tracing::{debug, error, instrument};

// Payload and result stream live only in `_main` locals, out of the
// submission module's reach.
const HARNESS: &str = r#"import asyncio
import base64
import importlib.util
import inspect
import io
import json
import sys
import time


class _Capture(io.TextIOBase):
    def __init__(self, max_lines, max_chars):
        super().__init__()
        self.max_lines = max_lines
        self.max_chars = max_chars
        self.lines = []
        self.partial = ""

    def writable(self):
        return True

    def write(self, text):
        text = str(text)
        self.partial += text
        while "\n" in self.partial:
            line, self.partial = self.partial.split("\n", 1)
            self.push(line)
        if len(self.partial) > self.max_chars:
            self.push(self.partial)
            self.partial = ""
        return len(text)

    def flush(self):
        pass

    def push(self, line):
        if len(self.lines) >= self.max_lines:
            return
        if len(line) > self.max_chars:
            line = line[: self.max_chars] + "..."
        self.lines.append(line)

    def drain(self):
        if self.partial:
            self.push(self.partial)
            self.partial = ""
        lines = self.lines
        self.lines = []
        return lines


def _limit_memory(limit):
    if limit <= 0:
        return None
    try:
        import resource

        resource.setrlimit(resource.RLIMIT_AS, (limit, limit))
    except Exception as exc:
        return "Memory limit of %d bytes not applied: %s: %s" % (limit, type(exc).__name__, exc)
    return None


def _normalize(value):
    if value is None or isinstance(value, bool):
        return value
    if isinstance(value, int):
        return int(value)
    if isinstance(value, str):
        return str(value)
    if isinstance(value, float):
        value = float(value)
        if value != value or value in (float("inf"), float("-inf")):
            return repr(value)
        return value
    if isinstance(value, (list, tuple)):
        return [_normalize(item) for item in value]
    if isinstance(value, (set, frozenset)):
        items = [_normalize(item) for item in value]
        try:
            return sorted(items)
        except TypeError:
            return items
    if isinstance(value, dict):
        return {str(key): _normalize(item) for key, item in value.items()}
    return repr(value)


def _equal(actual, expected):
    if isinstance(actual, bool) or isinstance(expected, bool):
        return type(actual) is type(expected) and actual == expected
    if isinstance(actual, (int, float)) and isinstance(expected, (int, float)):
        return actual == expected
    if isinstance(actual, list) and isinstance(expected, list):
        return len(actual) == len(expected) and all(
            _equal(a, e) for a, e in zip(actual, expected)
        )
    if isinstance(actual, dict) and isinstance(expected, dict):
        return actual.keys() == expected.keys() and all(
            _equal(actual[key], expected[key]) for key in expected
        )
    return type(actual) is type(expected) and actual == expected


def _resolve(module, name):
    namespace = vars(module)
    target = namespace.get(name)
    if callable(target):
        return target
    holder = namespace.get("Solution")
    if isinstance(holder, type) and callable(getattr(holder, name, None)):
        return getattr(holder(), name)
    return None


async def _await(value):
    return await value


def _run_test(target, test, capture, dumps):
    actual = None
    passed = False
    error = None
    started = time.perf_counter()
    try:
        value = target(*test["args"])
        if inspect.isawaitable(value):
            value = asyncio.run(_await(value))
        actual = _normalize(value)
        passed = _equal(actual, test["expected"])
    except BaseException as exc:
        error = "%s: %s" % (type(exc).__name__, exc)
    elapsed = (time.perf_counter() - started) * 1000.0
    return {
        "passed": passed and error is None,
        "actual": None if error is not None else dumps(actual, default=repr),
        "execution_time_ms": elapsed,
        "console_logs": capture.drain(),
        "error": error,
    }


def _main():
    payload = json.loads(base64.b64decode("__GAUNTLET_PAYLOAD__").decode("utf-8"))
    stream = sys.__stderr__
    dumps = json.dumps
    report = {"results": [], "console_logs": [], "fatal": None, "warnings": []}

    warning = _limit_memory(__GAUNTLET_MEMORY_BYTES__)
    if warning is not None:
        report["warnings"].append(warning)

    capture = _Capture(payload["max_log_lines"], payload["max_log_chars"])
    sys.stdout = capture

    # Import errors propagate so the traceback reaches stderr
    spec = importlib.util.spec_from_file_location("submission", sys.argv[1])
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)

    report["console_logs"] = capture.drain()
    target = _resolve(module, payload["entry"])
    if target is None:
        report["fatal"] = "Entry function '%s' is not defined" % payload["entry"]
    else:
        for test in payload["tests"]:
            report["results"].append(_run_test(target, test, capture, dumps))
    sys.stdout = sys.__stdout__
    block = payload["begin"] + dumps(report, default=repr) + payload["end"]
    stream.write("\n" + block + "\n")
    stream.flush()


if __name__ == "__main__":
    _main()
"#;

/// Harness script with the payload and memory limit filled in.
/// It expects the submission path as its first argument.
pub fn generate_harness(payload: &str, memory_limit_mb: u32) -> String {
    let memory_bytes = u64::from(memory_limit_mb) * 1024 * 1024;
    HARNESS
        .replace("__GAUNTLET_PAYLOAD__", payload)
        .replace("__GAUNTLET_MEMORY_BYTES__", &memory_bytes.to_string())
}

pub fn is_compile_error(stderr: &str) -> bool {
    ["SyntaxError", "IndentationError", "TabError"]
        .iter()
        .any(|marker| stderr.contains(marker))
}

pub struct PythonRunner {
    config: RuntimeConfig,
    settings: RunnerSettings,
}

impl PythonRunner {
    pub fn new(config: RuntimeConfig, settings: RunnerSettings) -> Self {
        Self { config, settings }
    }

    async fn execute(&self, workspace: &Workspace, job: &RunJob) -> Result<GradingResult> {
        let entry = job.entry_function.as_deref().unwrap_or_default();
        let channel = ResultChannel::new();
        let payload = HarnessPayload::new(entry, &job.test_cases, &channel).encode()?;

        let extension = &self.config.execution.file_extension;
        let submission_name = Workspace::unique_name(extension);
        let harness_name = Workspace::harness_name(extension);
        workspace.write(&submission_name, &job.code)?;
        workspace.write(
            &harness_name,
            &generate_harness(&payload, self.config.memory_limit_mb),
        )?;

        let command = SandboxCommand::new(&self.config.execution.command, workspace.path())
            .args(self.config.execution.args.iter().cloned())
            .arg(harness_name)
            .arg(submission_name);

        let outcome = sandbox::run(&command, &self.settings.limits(job.timeout_ms)).await?;
        debug!(
            exit_code = ?outcome.exit_code,
            timed_out = outcome.timed_out,
            duration_ms = outcome.duration.as_millis() as u64,
            "Python process finished"
        );

        Ok(interpret_outcome(
            &outcome,
            &channel,
            &job.test_cases,
            job.timeout_ms,
            is_compile_error,
        ))
    }
}

#[async_trait]
impl LanguageRunner for PythonRunner {
    fn runtime(&self) -> Runtime {
        Runtime::Python
    }

    #[instrument(skip_all, fields(runtime = "python", tests = job.test_cases.len()))]
    async fn run(&self, job: RunJob) -> GradingResult {
        let started = Instant::now();
        let workspace = match Workspace::create() {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(error = %e, "Failed to prepare Python workspace");
                return GradingResult::execution_failure(format!("Execution setup failed: {}", e))
                    .with_total_tests(job.test_cases.len());
            }
        };

        let result = match self.execute(&workspace, &job).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Python execution failed");
                GradingResult::execution_failure(format!("Execution failed: {:#}", e))
                    .with_total_tests(job.test_cases.len())
            }
        };
        workspace.cleanup();

        debug!(
            execution_ms = started.elapsed().as_millis() as u64,
            passed = result.total_tests_passed,
            "Python run complete"
        );
        result
    }
}
