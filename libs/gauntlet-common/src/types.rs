use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Submission language as declared by the caller.
/// Several languages may share one runtime; UI-only languages have none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    TypeScript,
    Python,
    Sql,
    Java,
    Html,
    Css,
    Markdown,
}

impl Language {
    /// Returns all language variants
    /// This is the single source of truth for the language/runtime matrix
    pub fn all_variants() -> &'static [Language] {
        &[
            Language::JavaScript,
            Language::TypeScript,
            Language::Python,
            Language::Sql,
            Language::Java,
            Language::Html,
            Language::Css,
            Language::Markdown,
        ]
    }

    /// Parse a language from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Language> {
        match s.to_lowercase().as_str() {
            "javascript" | "js" => Some(Language::JavaScript),
            "typescript" | "ts" => Some(Language::TypeScript),
            "python" | "py" => Some(Language::Python),
            "sql" => Some(Language::Sql),
            "java" => Some(Language::Java),
            "html" => Some(Language::Html),
            "css" => Some(Language::Css),
            "markdown" | "md" => Some(Language::Markdown),
            _ => None,
        }
    }

    /// The runtime able to execute this language, if any
    pub fn runtime(&self) -> Option<Runtime> {
        match self {
            Language::JavaScript | Language::TypeScript => Some(Runtime::Node),
            Language::Python => Some(Runtime::Python),
            Language::Sql => Some(Runtime::Sqlite),
            Language::Java => Some(Runtime::Jvm),
            Language::Html | Language::Css | Language::Markdown => None,
        }
    }

    pub fn is_executable(&self) -> bool {
        self.runtime().is_some()
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Python => "python",
            Language::Sql => "sql",
            Language::Java => "java",
            Language::Html => "html",
            Language::Css => "css",
            Language::Markdown => "markdown",
        };
        write!(f, "{}", name)
    }
}

/// Execution backend. One runner exists per runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Node,
    Python,
    Sqlite,
    Jvm,
}

impl Runtime {
    pub fn all_variants() -> &'static [Runtime] {
        &[Runtime::Node, Runtime::Python, Runtime::Sqlite, Runtime::Jvm]
    }

    pub fn from_str(s: &str) -> Option<Runtime> {
        match s.to_lowercase().as_str() {
            "node" => Some(Runtime::Node),
            "python" => Some(Runtime::Python),
            "sqlite" => Some(Runtime::Sqlite),
            "jvm" => Some(Runtime::Jvm),
            _ => None,
        }
    }

    /// The query runtime grades result sets instead of calling a function
    pub fn is_query(&self) -> bool {
        matches!(self, Runtime::Sqlite)
    }

    pub fn requires_entry_function(&self) -> bool {
        !self.is_query()
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Runtime::Node => "node",
            Runtime::Python => "python",
            Runtime::Sqlite => "sqlite",
            Runtime::Jvm => "jvm",
        };
        write!(f, "{}", name)
    }
}

/// One row of the language → runtime capability matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageCapability {
    pub language: Language,
    pub runtime: Option<Runtime>,
    pub executable: bool,
}

/// Callers must consult this before submitting: languages without a runtime
/// are never executable.
pub fn capability_matrix() -> Vec<LanguageCapability> {
    Language::all_variants()
        .iter()
        .map(|language| LanguageCapability {
            language: *language,
            runtime: language.runtime(),
            executable: language.is_executable(),
        })
        .collect()
}

/// Two-tier admission priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
        }
    }
}

/// Test Case Definition (Immutable Input)
///
/// Function runtimes use `args` + `expected`; the query runtime uses
/// `schema_sql`, `seed_sql`, `expected_rows` and `order_matters`.
/// `expected` may legitimately be null, so a missing value deserializes as null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default)]
    pub expected: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_sql: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_rows: Option<Vec<Value>>,
    #[serde(default)]
    pub order_matters: bool,
    #[serde(default)]
    pub hidden: bool,
}

impl TestCase {
    /// Function-call test case
    pub fn call(args: Vec<Value>, expected: Value) -> Self {
        Self {
            args: Some(args),
            expected,
            ..Default::default()
        }
    }

    /// Query test case
    pub fn query(schema_sql: &str, seed_sql: &str, expected_rows: Vec<Value>) -> Self {
        Self {
            schema_sql: Some(schema_sql.to_string()),
            seed_sql: Some(seed_sql.to_string()),
            expected_rows: Some(expected_rows),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Label used in results: the explicit name or "Test N" (1-based)
    pub fn display_name(&self, index: usize) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("Test {}", index + 1),
        }
    }
}

/// Job Input (Immutable)
///
/// `runtime` is declared separately from `language` because several
/// languages share one runtime. `entry_function` is required for every
/// runtime except the query runtime. `timeout_ms == 0` selects the
/// configured default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Language,
    pub runtime: Runtime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_function: Option<String>,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub priority: Priority,
}

impl ExecutionRequest {
    /// Request for `language` routed to its natural runtime.
    /// Languages without a runtime are routed to node and rejected by validation.
    pub fn new(language: Language, code: &str) -> Self {
        Self {
            code: code.to_string(),
            language,
            runtime: language.runtime().unwrap_or(Runtime::Node),
            entry_function: None,
            test_cases: Vec::new(),
            timeout_ms: 0,
            priority: Priority::Normal,
        }
    }

    pub fn with_entry(mut self, entry_function: &str) -> Self {
        self.entry_function = Some(entry_function.to_string());
        self
    }

    pub fn with_test(mut self, test_case: TestCase) -> Self {
        self.test_cases.push(test_case);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Per-Test Result
///
/// Actual and expected values are stringified JSON so every runtime
/// reports them the same way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub test_case_index: usize,
    pub passed: bool,
    pub actual_output: Option<String>,
    pub expected_output: Option<String>,
    pub execution_time_ms: f64,
    #[serde(default)]
    pub console_logs: Vec<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

/// Aggregate grading outcome
///
/// `success` reports whether the pipeline ran to completion and is
/// independent of test outcomes. `overall_passed` is false whenever
/// `total_tests == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingResult {
    pub success: bool,
    pub overall_passed: bool,
    pub total_tests: usize,
    pub total_tests_passed: usize,
    pub test_results: Vec<TestResult>,
    #[serde(default)]
    pub console_logs: Vec<String>,
    pub execution_error: Option<String>,
    pub compilation_error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
}

impl GradingResult {
    /// Completed pipeline: totals are derived from the test results
    pub fn from_test_results(test_results: Vec<TestResult>, console_logs: Vec<String>) -> Self {
        let total_tests = test_results.len();
        let total_tests_passed = test_results.iter().filter(|t| t.passed).count();

        Self {
            success: true,
            overall_passed: total_tests > 0 && total_tests_passed == total_tests,
            total_tests,
            total_tests_passed,
            test_results,
            console_logs,
            execution_error: None,
            compilation_error: None,
            timed_out: false,
        }
    }

    /// Runtime or process failure: nothing ran to completion
    pub fn execution_failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            overall_passed: false,
            total_tests: 0,
            total_tests_passed: 0,
            test_results: Vec::new(),
            console_logs: Vec::new(),
            execution_error: Some(message.into()),
            compilation_error: None,
            timed_out: false,
        }
    }

    /// Syntax or parse failure of the submission
    pub fn compilation_failure(message: impl Into<String>) -> Self {
        Self {
            execution_error: None,
            compilation_error: Some(message.into()),
            ..Self::execution_failure(String::new())
        }
    }

    /// Timed out at runner or service level
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            timed_out: true,
            ..Self::execution_failure(message)
        }
    }

    pub fn with_total_tests(mut self, total_tests: usize) -> Self {
        self.total_tests = total_tests;
        self.overall_passed = false;
        self
    }

    pub fn with_console_logs(mut self, console_logs: Vec<String>) -> Self {
        self.console_logs = console_logs;
        self
    }
}

/// Result of the admission-controlled path: grading result plus the time
/// spent waiting for a concurrency slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    #[serde(flatten)]
    pub result: GradingResult,
    pub queue_time_ms: u64,
}

/// Static scan verdict. Every matching pattern is reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub safe: bool,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub at: DateTime<Utc>,
    pub language: Language,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityMetrics {
    pub total_scans: u64,
    pub total_rejections: u64,
    pub rejections_by_language: BTreeMap<Language, u64>,
    pub recent_violations: Vec<ViolationRecord>,
}

/// Cheap, poll-friendly queue view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue_depth: usize,
    pub running: usize,
    pub avg_wait_ms: f64,
    pub healthy: bool,
}

/// Full queue counters, intended for low-frequency polling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub queue_depth: usize,
    pub high_priority_depth: usize,
    pub normal_priority_depth: usize,
    pub running_total: usize,
    pub running_by_runtime: BTreeMap<Runtime, usize>,
    pub max_concurrent_total: usize,
    pub max_concurrent_per_runtime: usize,
    pub total_processed: u64,
    pub total_queued: u64,
    pub total_immediate: u64,
    pub high_priority_submitted: u64,
    pub normal_priority_submitted: u64,
    pub total_timeouts: u64,
    pub total_errors: u64,
    pub total_rejected: u64,
    pub avg_wait_ms: f64,
    pub max_wait_ms: u64,
    pub healthy: bool,
    pub security: SecurityMetrics,
}

/// Fill-in-blank configuration for one blank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlankConfig {
    pub id: String,
    pub correct_answers: Vec<String>,
    #[serde(default = "default_points")]
    pub points: u32,
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
}

fn default_points() -> u32 {
    1
}

fn default_case_sensitive() -> bool {
    true
}

impl BlankConfig {
    pub fn new(id: &str, correct_answers: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            correct_answers: correct_answers.iter().map(|a| a.to_string()).collect(),
            points: default_points(),
            case_sensitive: default_case_sensitive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlankResult {
    pub id: String,
    pub user_answer: Option<String>,
    pub is_correct: bool,
    pub points_earned: u32,
    pub possible_points: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillInBlankResult {
    pub results: Vec<BlankResult>,
    pub total_points: u32,
    pub total_possible_points: u32,
    pub all_correct: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_language_serialization() {
        let json = serde_json::to_string(&Language::JavaScript).unwrap();
        assert_eq!(json, "\"javascript\"");

        let deserialized: Language = serde_json::from_str("\"typescript\"").unwrap();
        assert_eq!(deserialized, Language::TypeScript);
    }

    #[test]
    fn test_language_runtime_matrix() {
        assert_eq!(Language::JavaScript.runtime(), Some(Runtime::Node));
        assert_eq!(Language::TypeScript.runtime(), Some(Runtime::Node));
        assert_eq!(Language::Python.runtime(), Some(Runtime::Python));
        assert_eq!(Language::Sql.runtime(), Some(Runtime::Sqlite));
        assert_eq!(Language::Java.runtime(), Some(Runtime::Jvm));
        assert_eq!(Language::Html.runtime(), None);
        assert!(!Language::Markdown.is_executable());

        let matrix = capability_matrix();
        assert_eq!(matrix.len(), Language::all_variants().len());
        assert!(matrix
            .iter()
            .any(|c| c.language == Language::Css && !c.executable && c.runtime.is_none()));
    }

    #[test]
    fn test_language_from_str() {
        assert_eq!(Language::from_str("Python"), Some(Language::Python));
        assert_eq!(Language::from_str("JS"), Some(Language::JavaScript));
        assert_eq!(Language::from_str("cobol"), None);
        assert_eq!(Runtime::from_str("JVM"), Some(Runtime::Jvm));
        assert_eq!(Runtime::from_str(""), None);
    }

    #[test]
    fn test_only_query_runtime_skips_entry_function() {
        for runtime in Runtime::all_variants() {
            assert_eq!(runtime.requires_entry_function(), *runtime != Runtime::Sqlite);
        }
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: ExecutionRequest = serde_json::from_value(json!({
            "code": "def add(a, b): return a + b",
            "language": "python",
            "runtime": "python",
            "entry_function": "add",
            "test_cases": [{ "args": [2, 3], "expected": 5 }, { "args": [] }]
        }))
        .unwrap();

        assert_eq!(request.priority, Priority::Normal);
        assert_eq!(request.timeout_ms, 0);
        assert_eq!(request.test_cases[0].expected, json!(5));
        assert_eq!(request.test_cases[1].expected, Value::Null);
        assert!(!request.test_cases[0].hidden);
    }

    #[test]
    fn test_overall_passed_requires_tests() {
        let empty = GradingResult::from_test_results(Vec::new(), Vec::new());
        assert!(empty.success);
        assert!(!empty.overall_passed);

        let one = TestResult {
            test_name: "Test 1".to_string(),
            test_case_index: 0,
            passed: true,
            actual_output: Some("5".to_string()),
            expected_output: Some("5".to_string()),
            execution_time_ms: 0.2,
            console_logs: Vec::new(),
            error: None,
            hidden: false,
        };
        let mut failing = one.clone();
        failing.passed = false;

        let all = GradingResult::from_test_results(vec![one.clone()], Vec::new());
        assert!(all.overall_passed);
        assert_eq!(all.total_tests_passed, 1);

        let partial = GradingResult::from_test_results(vec![one, failing], Vec::new());
        assert!(partial.success);
        assert!(!partial.overall_passed);
        assert_eq!(partial.total_tests, 2);
        assert_eq!(partial.total_tests_passed, 1);
    }

    #[test]
    fn test_failure_constructors() {
        let compile = GradingResult::compilation_failure("SyntaxError: invalid syntax");
        assert!(!compile.success);
        assert!(compile.execution_error.is_none());
        assert_eq!(compile.compilation_error.as_deref(), Some("SyntaxError: invalid syntax"));

        let timeout = GradingResult::timeout("Execution timed out after 100ms").with_total_tests(3);
        assert!(timeout.timed_out);
        assert_eq!(timeout.total_tests, 3);
        assert!(!timeout.overall_passed);
    }

    #[test]
    fn test_execution_response_flattens_result() {
        let response = ExecutionResponse {
            result: GradingResult::execution_failure("boom"),
            queue_time_ms: 12,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["queue_time_ms"], json!(12));
        assert_eq!(value["execution_error"], json!("boom"));
        assert_eq!(value["overall_passed"], json!(false));
    }

    #[test]
    fn test_blank_config_defaults() {
        let blank: BlankConfig =
            serde_json::from_value(json!({ "id": "b1", "correct_answers": ["x"] })).unwrap();
        assert_eq!(blank.points, 1);
        assert!(blank.case_sensitive);
    }

    #[test]
    fn test_test_case_display_name() {
        assert_eq!(TestCase::default().display_name(2), "Test 3");
        assert_eq!(TestCase::default().named("edge").display_name(0), "edge");
    }
}
