/// Language Runners - Harness Generation and Result Parsing
///
/// **Core Responsibility:**
/// Turn (user code + test cases + entry point) into a result for one runtime.
///
/// **Dual-Channel Execution:**
/// Subprocess runners generate a script whose harness captures the
/// submission's incidental output per test. The final structured report is
/// written to stderr between begin/end markers carrying a per-run nonce, so
/// nothing the submission prints can be mistaken for (or forge) the report.
///
/// **Failure Mapping:**
/// Every failure (spawn error, timeout, output flood, crash, unparsable
/// report) becomes a `GradingResult` with zero passed tests. Runners never
/// return errors to their caller.
pub mod java;
pub mod node;
pub mod python;
pub mod sql;

use crate::sandbox::{ProcessOutcome, SandboxLimits};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use gauntlet_common::config::EngineConfig;
use gauntlet_common::types::{GradingResult, Language, Runtime, TestCase, TestResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::warn;
use uuid::Uuid;

pub use java::JavaRunner;
pub use node::NodeRunner;
pub use python::PythonRunner;
pub use sql::SqlRunner;

/// Per-test captured output ceiling inside harnesses
pub const MAX_LOG_LINES: usize = 200;
pub const MAX_LOG_LINE_CHARS: usize = 1000;

/// Diagnostics copied into error messages are truncated to this length
const MAX_DIAGNOSTIC_CHARS: usize = 4000;

/// Everything a runner needs for one execution
#[derive(Debug, Clone)]
pub struct RunJob {
    pub code: String,
    pub language: Language,
    pub entry_function: Option<String>,
    pub test_cases: Vec<TestCase>,
    pub timeout_ms: u64,
}

/// One runner exists per runtime
#[async_trait]
pub trait LanguageRunner: Send + Sync {
    fn runtime(&self) -> Runtime;

    async fn run(&self, job: RunJob) -> GradingResult;
}

/// Process ceilings shared by all subprocess runners
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub max_output_bytes: usize,
    pub kill_grace: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_output_bytes: config.max_output_bytes,
            kill_grace: Duration::from_millis(config.kill_grace_ms),
        }
    }

    pub fn limits(&self, timeout_ms: u64) -> SandboxLimits {
        SandboxLimits {
            timeout: Duration::from_millis(timeout_ms),
            max_output_bytes: self.max_output_bytes,
            kill_grace: self.kill_grace,
        }
    }
}

/// Markers framing the harness report on stderr
pub struct ResultChannel {
    begin: String,
    end: String,
}

impl ResultChannel {
    pub fn new() -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self {
            begin: format!("__GAUNTLET_RESULT_{}_BEGIN__", nonce),
            end: format!("__GAUNTLET_RESULT_{}_END__", nonce),
        }
    }

    pub fn begin_marker(&self) -> &str {
        &self.begin
    }

    pub fn end_marker(&self) -> &str {
        &self.end
    }

    /// The last framed block in `stream`
    pub fn extract<'a>(&self, stream: &'a str) -> Option<&'a str> {
        let start = stream.rfind(&self.begin)? + self.begin.len();
        let len = stream[start..].find(&self.end)?;
        Some(&stream[start..start + len])
    }

    /// `stream` with every framed block removed
    pub fn strip(&self, stream: &str) -> String {
        let mut rest = stream;
        let mut out = String::new();
        while let Some(start) = rest.find(&self.begin) {
            out.push_str(&rest[..start]);
            match rest[start..].find(&self.end) {
                Some(end) => rest = &rest[start + end + self.end.len()..],
                None => {
                    rest = "";
                    break;
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl Default for ResultChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct HarnessTest<'a> {
    args: &'a [Value],
    expected: &'a Value,
}

/// Input embedded into every generated harness (JSON, then base64)
#[derive(Serialize)]
pub struct HarnessPayload<'a> {
    entry: &'a str,
    tests: Vec<HarnessTest<'a>>,
    begin: &'a str,
    end: &'a str,
    max_log_lines: usize,
    max_log_chars: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    classes: Vec<String>,
}

impl<'a> HarnessPayload<'a> {
    pub fn new(entry: &'a str, test_cases: &'a [TestCase], channel: &'a ResultChannel) -> Self {
        Self {
            entry,
            tests: test_cases
                .iter()
                .map(|case| HarnessTest {
                    args: case.args.as_deref().unwrap_or(&[]),
                    expected: &case.expected,
                })
                .collect(),
            begin: channel.begin_marker(),
            end: channel.end_marker(),
            max_log_lines: MAX_LOG_LINES,
            max_log_chars: MAX_LOG_LINE_CHARS,
            classes: Vec::new(),
        }
    }

    /// Candidate classes holding the entry method (compiled runtimes)
    pub fn with_classes(mut self, classes: Vec<String>) -> Self {
        self.classes = classes;
        self
    }

    pub fn encode(&self) -> Result<String> {
        let json = serde_json::to_vec(self).context("Failed to serialize harness payload")?;
        Ok(general_purpose::STANDARD.encode(json))
    }
}

#[derive(Debug, Deserialize)]
struct HarnessTestReport {
    passed: bool,
    #[serde(default)]
    actual: Option<String>,
    #[serde(default)]
    execution_time_ms: f64,
    #[serde(default)]
    console_logs: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Report written by a harness on the result channel
#[derive(Debug, Deserialize)]
struct HarnessReport {
    #[serde(default)]
    results: Vec<HarnessTestReport>,
    #[serde(default)]
    console_logs: Vec<String>,
    #[serde(default)]
    fatal: Option<String>,
    /// Setup steps the harness could not apply, such as resource limits
    #[serde(default)]
    warnings: Vec<String>,
}

impl HarnessReport {
    fn into_result(self, test_cases: &[TestCase], mut stray_logs: Vec<String>) -> GradingResult {
        for warning in &self.warnings {
            warn!(warning = %warning, "Harness setup degraded");
        }

        let mut console_logs = self.console_logs;
        console_logs.append(&mut stray_logs);

        if let Some(fatal) = self.fatal {
            return GradingResult::execution_failure(fatal)
                .with_total_tests(test_cases.len())
                .with_console_logs(console_logs);
        }

        let mut reports = self.results.into_iter();
        let test_results = test_cases
            .iter()
            .enumerate()
            .map(|(index, case)| {
                let mut result = TestResult {
                    test_name: case.display_name(index),
                    test_case_index: index,
                    passed: false,
                    actual_output: None,
                    expected_output: Some(case.expected.to_string()),
                    execution_time_ms: 0.0,
                    console_logs: Vec::new(),
                    error: Some("No result reported for this test".to_string()),
                    hidden: case.hidden,
                };
                if let Some(report) = reports.next() {
                    result.passed = report.passed && report.error.is_none();
                    result.actual_output = report.actual;
                    result.execution_time_ms = report.execution_time_ms;
                    result.console_logs = report.console_logs;
                    result.error = report.error;
                }
                result
            })
            .collect();

        GradingResult::from_test_results(test_results, console_logs)
    }
}

/// Map a finished subprocess onto a grading result
pub fn interpret_outcome(
    outcome: &ProcessOutcome,
    channel: &ResultChannel,
    test_cases: &[TestCase],
    timeout_ms: u64,
    is_compile_error: fn(&str) -> bool,
) -> GradingResult {
    let total = test_cases.len();
    let stray_logs = stray_output(&outcome.stdout);

    if outcome.timed_out {
        return GradingResult::timeout(format!("Execution timed out after {}ms", timeout_ms))
            .with_total_tests(total)
            .with_console_logs(stray_logs);
    }

    if outcome.output_exceeded {
        return GradingResult::execution_failure(
            "Output limit exceeded: the process was killed for writing too much output",
        )
        .with_total_tests(total);
    }

    if let Some(block) = channel.extract(&outcome.stderr) {
        return match serde_json::from_str::<HarnessReport>(block.trim()) {
            Ok(report) => report.into_result(test_cases, stray_logs),
            Err(e) => GradingResult::execution_failure(format!(
                "Failed to parse execution results: {}",
                e
            ))
            .with_total_tests(total)
            .with_console_logs(stray_logs),
        };
    }

    let diagnostics = truncate_diagnostic(channel.strip(&outcome.stderr).trim());
    if is_compile_error(&diagnostics) {
        return GradingResult::compilation_failure(diagnostics)
            .with_total_tests(total)
            .with_console_logs(stray_logs);
    }

    let message = match (outcome.exit_code, diagnostics.is_empty()) {
        (Some(code), true) => format!("Process exited with code {} without reporting results", code),
        (Some(code), false) => format!("Process exited with code {}: {}", code, diagnostics),
        (None, true) => "Process was terminated by a signal".to_string(),
        (None, false) => format!("Process was terminated by a signal: {}", diagnostics),
    };
    GradingResult::execution_failure(message)
        .with_total_tests(total)
        .with_console_logs(stray_logs)
}

/// Output that bypassed the harness shims
fn stray_output(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(MAX_LOG_LINES)
        .map(|line| truncate_chars(line, MAX_LOG_LINE_CHARS))
        .collect()
}

pub(crate) fn truncate_diagnostic(text: &str) -> String {
    truncate_chars(text, MAX_DIAGNOSTIC_CHARS)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Isolated temporary directory for one execution
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("gauntlet-")
            .tempdir()
            .context("Failed to create temporary workspace")?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Unique file name for the submission source
    pub fn unique_name(extension: &str) -> String {
        format!("submission_{}.{}", Uuid::new_v4().simple(), extension)
    }

    /// Unique file name for a generated harness
    pub fn harness_name(extension: &str) -> String {
        format!("harness_{}.{}", Uuid::new_v4().simple(), extension)
    }

    pub fn write(&self, file_name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(file_name);
        std::fs::write(&path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Best-effort removal; failures are logged, never fatal
    pub fn cleanup(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "Failed to clean up workspace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cases() -> Vec<TestCase> {
        vec![
            TestCase::call(vec![json!(2), json!(3)], json!(5)),
            TestCase::call(vec![json!(1), json!(1)], json!(2)).named("ones"),
        ]
    }

    fn outcome_with_stderr(stderr: String) -> ProcessOutcome {
        ProcessOutcome {
            stderr,
            exit_code: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_channel_extracts_last_block() {
        let channel = ResultChannel::new();
        let stream = format!(
            "noise\n{b}{{\"a\":1}}{e}\nmore\n{b}{{\"a\":2}}{e}\n",
            b = channel.begin_marker(),
            e = channel.end_marker()
        );
        assert_eq!(channel.extract(&stream), Some("{\"a\":2}"));
        assert_eq!(channel.strip(&stream), "noise\n\nmore\n\n");
    }

    #[test]
    fn test_forged_markers_are_ignored() {
        let channel = ResultChannel::new();
        let forged = "__GAUNTLET_RESULT_deadbeef_BEGIN__{\"results\":[]}__GAUNTLET_RESULT_deadbeef_END__";
        assert_eq!(channel.extract(forged), None);
    }

    #[test]
    fn test_interpret_report() {
        let channel = ResultChannel::new();
        let report = json!({
            "results": [
                {"passed": true, "actual": "5", "execution_time_ms": 0.2, "console_logs": ["hi"], "error": null},
                {"passed": false, "actual": null, "execution_time_ms": 0.1, "console_logs": [], "error": "ValueError: boom"}
            ],
            "console_logs": ["top-level"],
            "fatal": null
        });
        let stderr = format!("{}{}{}", channel.begin_marker(), report, channel.end_marker());
        let mut outcome = outcome_with_stderr(stderr);
        outcome.stdout = "bypass\n".to_string();

        let result = interpret_outcome(&outcome, &channel, &cases(), 1000, |_| false);
        assert!(result.success);
        assert!(!result.overall_passed);
        assert_eq!(result.total_tests, 2);
        assert_eq!(result.total_tests_passed, 1);
        assert_eq!(result.console_logs, vec!["top-level", "bypass"]);

        let first = &result.test_results[0];
        assert_eq!(first.test_name, "Test 1");
        assert_eq!(first.actual_output.as_deref(), Some("5"));
        assert_eq!(first.expected_output.as_deref(), Some("5"));
        assert_eq!(first.console_logs, vec!["hi"]);

        let second = &result.test_results[1];
        assert_eq!(second.test_name, "ones");
        assert_eq!(second.error.as_deref(), Some("ValueError: boom"));
    }

    #[test]
    fn test_interpret_report_with_warnings() {
        let channel = ResultChannel::new();
        let stderr = format!(
            "{}{}{}",
            channel.begin_marker(),
            json!({
                "results": [
                    {"passed": true, "actual": "5"},
                    {"passed": true, "actual": "2"}
                ],
                "warnings": ["Memory limit not applied: ValueError: not allowed"]
            }),
            channel.end_marker()
        );
        let result = interpret_outcome(&outcome_with_stderr(stderr), &channel, &cases(), 1000, |_| false);
        assert!(result.success);
        assert!(result.overall_passed);
        assert_eq!(result.total_tests_passed, 2);
        assert!(result.console_logs.is_empty());
    }

    #[test]
    fn test_interpret_missing_results_are_failures() {
        let channel = ResultChannel::new();
        let stderr = format!(
            "{}{}{}",
            channel.begin_marker(),
            json!({"results": [{"passed": true, "actual": "5"}]}),
            channel.end_marker()
        );
        let result = interpret_outcome(&outcome_with_stderr(stderr), &channel, &cases(), 1000, |_| false);
        assert_eq!(result.total_tests_passed, 1);
        assert!(!result.test_results[1].passed);
        assert!(result.test_results[1].error.is_some());
    }

    #[test]
    fn test_interpret_fatal() {
        let channel = ResultChannel::new();
        let stderr = format!(
            "{}{}{}",
            channel.begin_marker(),
            json!({"results": [], "fatal": "Entry function 'add' is not defined"}),
            channel.end_marker()
        );
        let result = interpret_outcome(&outcome_with_stderr(stderr), &channel, &cases(), 1000, |_| false);
        assert!(!result.success);
        assert_eq!(result.total_tests, 2);
        assert_eq!(result.total_tests_passed, 0);
        assert!(result.execution_error.unwrap().contains("add"));
    }

    #[test]
    fn test_interpret_timeout_and_flood() {
        let channel = ResultChannel::new();
        let timed_out = ProcessOutcome {
            timed_out: true,
            ..Default::default()
        };
        let result = interpret_outcome(&timed_out, &channel, &cases(), 750, |_| false);
        assert!(result.timed_out);
        assert!(result.execution_error.unwrap().contains("timed out after 750ms"));

        let flooded = ProcessOutcome {
            output_exceeded: true,
            ..Default::default()
        };
        let result = interpret_outcome(&flooded, &channel, &cases(), 750, |_| false);
        assert!(result.execution_error.unwrap().contains("Output limit exceeded"));
        assert_eq!(result.total_tests_passed, 0);
    }

    #[test]
    fn test_interpret_compile_vs_execution_error() {
        let channel = ResultChannel::new();
        let outcome = ProcessOutcome {
            stderr: "  File \"x.py\", line 1\n    def (:\nSyntaxError: invalid syntax".to_string(),
            exit_code: Some(1),
            ..Default::default()
        };
        let result = interpret_outcome(&outcome, &channel, &cases(), 1000, |s| s.contains("SyntaxError"));
        assert!(result.compilation_error.unwrap().contains("SyntaxError"));
        assert!(result.execution_error.is_none());

        let outcome = ProcessOutcome {
            stderr: "NameError: name 'x' is not defined".to_string(),
            exit_code: Some(1),
            ..Default::default()
        };
        let result = interpret_outcome(&outcome, &channel, &cases(), 1000, |s| s.contains("SyntaxError"));
        assert!(result.compilation_error.is_none());
        let message = result.execution_error.unwrap();
        assert!(message.contains("exited with code 1"));
        assert!(message.contains("NameError"));
    }

    #[test]
    fn test_payload_round_trips_through_base64() {
        let channel = ResultChannel::new();
        let test_cases = cases();
        let encoded = HarnessPayload::new("add", &test_cases, &channel).encode().unwrap();
        let decoded: Value =
            serde_json::from_slice(&general_purpose::STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded["entry"], "add");
        assert_eq!(decoded["tests"][0]["args"], json!([2, 3]));
        assert_eq!(decoded["begin"], channel.begin_marker());
        assert!(decoded.get("classes").is_none());
    }

    #[test]
    fn test_workspace_cleanup_removes_directory() {
        let workspace = Workspace::create().unwrap();
        let path = workspace.path().to_path_buf();
        workspace.write(&Workspace::unique_name("py"), "print(1)").unwrap();
        assert!(path.exists());
        workspace.cleanup();
        assert!(!path.exists());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abc", 5), "abc");
        assert_eq!(truncate_chars("abcdef", 3), "abc...");
    }
}
