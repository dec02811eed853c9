// Node runner: JavaScript and TypeScript (type stripping) submissions
use super::{
    interpret_outcome, HarnessPayload, LanguageRunner, ResultChannel, RunJob, RunnerSettings,
    Workspace,
};
use crate::config::RuntimeConfig;
use crate::sandbox::{self, SandboxCommand};
use anyhow::Result;
use async_trait::async_trait;
use gauntlet_common::types::{GradingResult, Language, Runtime};
use std::time::Instant;
use tracing::{debug, error, instrument};

const HARNESS_EXTENSION: &str = "js";

// Strict mode keeps harness frames out of `caller` chains. Payload, result
// writer and exit stay local to `main`; built-ins are bound before the
// submission loads.
const HARNESS: &str = r#"'use strict';
const util = require('util');
const path = require('path');

const stringify = JSON.stringify;
const parse = JSON.parse;
const objectKeys = Object.keys;
const hasOwn = Object.hasOwn;
const isArray = Array.isArray;
const arrayFrom = Array.from;
const isView = ArrayBuffer.isView;
const format = util.format;
const inspect = util.inspect;

function createCapture(maxLines, maxChars) {
  const capture = {
    lines: [],
    partial: '',
    push(line) {
      if (capture.lines.length >= maxLines) return;
      capture.lines.push(line.length > maxChars ? line.slice(0, maxChars) + '...' : line);
    },
    write(chunk) {
      capture.partial += String(chunk);
      let at;
      while ((at = capture.partial.indexOf('\n')) !== -1) {
        capture.push(capture.partial.slice(0, at));
        capture.partial = capture.partial.slice(at + 1);
      }
      if (capture.partial.length > maxChars) {
        capture.push(capture.partial);
        capture.partial = '';
      }
    },
    log(...args) {
      capture.write(format(...args) + '\n');
    },
    drain() {
      if (capture.partial) {
        capture.push(capture.partial);
        capture.partial = '';
      }
      const lines = capture.lines;
      capture.lines = [];
      return lines;
    },
  };
  return capture;
}

function installCapture(capture) {
  for (const level of ['log', 'info', 'warn', 'error', 'debug', 'trace']) {
    console[level] = (...args) => capture.log(...args);
  }
  console.dir = (value) => capture.log(inspect(value));
  console.table = (value) => capture.log(inspect(value));
  for (const stream of [process.stdout, process.stderr]) {
    stream.write = (chunk, encoding, callback) => {
      capture.write(chunk);
      if (typeof encoding === 'function') encoding();
      else if (typeof callback === 'function') callback();
      return true;
    };
  }
  process.on('unhandledRejection', () => {});
}

function resolveEntry(loaded, name) {
  const found = (loaded && loaded.gauntletExports) || {};
  if (typeof found.entry === 'function') return found.entry;
  const exported = loaded ? loaded.exports : undefined;
  if (exported && typeof exported[name] === 'function') return exported[name];
  if (typeof exported === 'function' && exported.name === name) return exported;
  if (typeof found.Solution === 'function') {
    try {
      const instance = new found.Solution();
      if (typeof instance[name] === 'function') return instance[name].bind(instance);
    } catch (e) {}
  }
  return null;
}

function normalize(value, seen) {
  if (value === undefined || value === null) return null;
  if (typeof value === 'bigint') return Number(value);
  if (typeof value === 'number') return Number.isFinite(value) ? value : String(value);
  if (typeof value === 'function' || typeof value === 'symbol') return String(value);
  if (typeof value !== 'object') return value;
  if (seen.has(value)) return '[Circular]';
  seen.add(value);
  let out;
  if (isArray(value) || isView(value) || value instanceof Set) {
    out = arrayFrom(value, (item) => normalize(item, seen));
  } else if (value instanceof Map) {
    out = {};
    for (const [key, item] of value) out[String(key)] = normalize(item, seen);
  } else if (value instanceof Date) {
    out = value.toISOString();
  } else {
    out = {};
    const keys = objectKeys(value);
    for (let i = 0; i < keys.length; i++) out[keys[i]] = normalize(value[keys[i]], seen);
  }
  seen.delete(value);
  return out;
}

function equal(actual, expected) {
  if (actual === expected) return true;
  if (actual === null || expected === null || typeof actual !== typeof expected) return false;
  if (typeof actual !== 'object') return false;
  if (isArray(actual) !== isArray(expected)) return false;
  if (isArray(actual)) {
    if (actual.length !== expected.length) return false;
    for (let i = 0; i < actual.length; i++) {
      if (!equal(actual[i], expected[i])) return false;
    }
    return true;
  }
  const keys = objectKeys(actual);
  if (keys.length !== objectKeys(expected).length) return false;
  for (let i = 0; i < keys.length; i++) {
    if (!hasOwn(expected, keys[i]) || !equal(actual[keys[i]], expected[keys[i]])) return false;
  }
  return true;
}

function describe(error) {
  if (error instanceof Error) return `${error.name}: ${error.message}`;
  return `Thrown: ${inspect(error)}`;
}

async function runTests(entry, tests, capture) {
  const results = [];
  for (const test of tests) {
    let actual = null;
    let passed = false;
    let error = null;
    const started = process.hrtime.bigint();
    try {
      let value = entry(...test.args);
      if (value && typeof value.then === 'function') value = await value;
      actual = normalize(value, new Set());
      passed = equal(actual, test.expected);
    } catch (e) {
      error = describe(e);
    }
    const elapsed = Number(process.hrtime.bigint() - started) / 1e6;
    results.push({
      passed: passed && error === null,
      actual: error === null ? stringify(actual) : null,
      execution_time_ms: elapsed,
      console_logs: capture.drain(),
      error,
    });
  }
  return results;
}

function main() {
  const payload = parse(Buffer.from('__GAUNTLET_PAYLOAD__', 'base64').toString('utf8'));
  const resultWrite = process.stderr.write.bind(process.stderr);
  const exit = process.exit.bind(process);
  const emit = (report) => {
    const block = payload.begin + stringify(report) + payload.end;
    resultWrite('\n' + block + '\n', () => exit(0));
  };

  const capture = createCapture(payload.max_log_lines, payload.max_log_chars);
  installCapture(capture);

  const submission = path.resolve(process.argv[2]);
  try {
    require(submission);
  } catch (e) {
    resultWrite(inspect(e) + '\n', () => exit(1));
    return;
  }

  const report = { results: [], console_logs: capture.drain(), fatal: null };
  const entry = resolveEntry(require.cache[submission], payload.entry);
  if (typeof entry !== 'function') {
    report.fatal = `Entry function '${payload.entry}' is not defined`;
    emit(report);
    return;
  }
  runTests(entry, payload.tests, capture).then(
    (results) => {
      report.results = results;
      emit(report);
    },
    (e) => {
      report.fatal = `Harness failure: ${describe(e)}`;
      report.console_logs = report.console_logs.concat(capture.drain());
      emit(report);
    },
  );
}

main();
"#;

/// Harness script with the payload filled in. It expects the submission
/// path as its first argument.
pub fn generate_harness(payload: &str) -> String {
    HARNESS.replace("__GAUNTLET_PAYLOAD__", payload)
}

/// Submission source plus a footer handing the entry and `Solution` to
/// the harness, since top-level declarations are module-scoped.
/// `entry` must already be a validated identifier.
pub fn generate_submission(code: &str, entry: &str) -> String {
    let mut source = String::with_capacity(code.len() + 256);
    source.push_str(code);
    if !code.ends_with('\n') {
        source.push('\n');
    }
    source.push_str(&format!(
        ";try {{ module.gauntletExports = {{ entry: typeof {entry} === 'function' ? {entry} : undefined, \
         Solution: typeof Solution === 'function' ? Solution : undefined }}; }} catch (e) {{}}\n",
        entry = entry
    ));
    source
}

pub fn is_compile_error(stderr: &str) -> bool {
    [
        "SyntaxError",
        "ERR_INVALID_TYPESCRIPT_SYNTAX",
        "ERR_UNSUPPORTED_TYPESCRIPT_SYNTAX",
    ]
    .iter()
    .any(|marker| stderr.contains(marker))
}

pub struct NodeRunner {
    config: RuntimeConfig,
    settings: RunnerSettings,
}

impl NodeRunner {
    pub fn new(config: RuntimeConfig, settings: RunnerSettings) -> Self {
        Self { config, settings }
    }

    /// Interpreter arguments for one execution
    fn node_args(&self, language: Language) -> Vec<String> {
        let mut args = self.config.execution.args.clone();
        if self.config.memory_limit_mb > 0 {
            args.push(format!("--max-old-space-size={}", self.config.memory_limit_mb));
        }
        if language == Language::TypeScript {
            args.push("--experimental-strip-types".to_string());
            args.push("--no-warnings".to_string());
        }
        args
    }

    fn file_extension(&self, language: Language) -> &str {
        match language {
            // CommonJS flavour so `require`/`module` behave as in plain JS
            Language::TypeScript => "cts",
            _ => &self.config.execution.file_extension,
        }
    }

    async fn execute(&self, workspace: &Workspace, job: &RunJob) -> Result<GradingResult> {
        let entry = job.entry_function.as_deref().unwrap_or_default();
        let channel = ResultChannel::new();
        let payload = HarnessPayload::new(entry, &job.test_cases, &channel).encode()?;

        let submission_name = Workspace::unique_name(self.file_extension(job.language));
        let harness_name = Workspace::harness_name(HARNESS_EXTENSION);
        workspace.write(&submission_name, &generate_submission(&job.code, entry))?;
        workspace.write(&harness_name, &generate_harness(&payload))?;

        let command = SandboxCommand::new(&self.config.execution.command, workspace.path())
            .args(self.node_args(job.language))
            .arg(harness_name)
            .arg(submission_name);

        let outcome = sandbox::run(&command, &self.settings.limits(job.timeout_ms)).await?;
        debug!(
            exit_code = ?outcome.exit_code,
            timed_out = outcome.timed_out,
            duration_ms = outcome.duration.as_millis() as u64,
            "Node process finished"
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
impl LanguageRunner for NodeRunner {
    fn runtime(&self) -> Runtime {
        Runtime::Node
    }

    #[instrument(skip_all, fields(runtime = "node", language = %job.language, tests = job.test_cases.len()))]
    async fn run(&self, job: RunJob) -> GradingResult {
        let started = Instant::now();
        let workspace = match Workspace::create() {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(error = %e, "Failed to prepare Node workspace");
                return GradingResult::execution_failure(format!("Execution setup failed: {}", e))
                    .with_total_tests(job.test_cases.len());
            }
        };

        let result = match self.execute(&workspace, &job).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Node execution failed");
                GradingResult::execution_failure(format!("Execution failed: {:#}", e))
                    .with_total_tests(job.test_cases.len())
            }
        };
        workspace.cleanup();

        debug!(
            execution_ms = started.elapsed().as_millis() as u64,
            passed = result.total_tests_passed,
            "Node run complete"
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfigManager;
    use gauntlet_common::config::EngineConfig;
    use gauntlet_common::types::TestCase;
    use serde_json::json;

    fn runner() -> NodeRunner {
        let configs = RuntimeConfigManager::builtin();
        NodeRunner::new(
            configs.get_config(&Runtime::Node).unwrap().clone(),
            RunnerSettings::from_config(&EngineConfig::defaults()),
        )
    }

    fn job(language: Language, code: &str, entry: &str, tests: Vec<TestCase>) -> RunJob {
        RunJob {
            code: code.to_string(),
            language,
            entry_function: Some(entry.to_string()),
            test_cases: tests,
            timeout_ms: 5000,
        }
    }

    #[test]
    fn test_harness_and_submission_layout() {
        let submission = generate_submission("function sum(a, b) { return a + b; }", "sum");
        assert!(submission.starts_with("function sum(a, b) { return a + b; }\n"));
        assert!(submission.contains("typeof sum === 'function' ? sum : undefined"));
        assert!(!submission.contains("base64"));

        let harness = generate_harness("QUJD");
        assert!(harness.starts_with("'use strict';"));
        assert!(harness.contains("Buffer.from('QUJD', 'base64')"));
        // Secrets are bound inside main, after the shared helpers
        let main_at = harness.find("function main()").unwrap();
        assert!(harness.find("Buffer.from(").unwrap() > main_at);
        assert!(harness.find("process.stderr.write.bind").unwrap() > main_at);
        assert!(harness.find("installCapture(capture);").unwrap() < harness.find("require(submission)").unwrap());
    }

    #[test]
    fn test_typescript_arguments() {
        let runner = runner();
        let args = runner.node_args(Language::TypeScript);
        assert!(args.contains(&"--experimental-strip-types".to_string()));
        assert!(args.contains(&"--max-old-space-size=256".to_string()));
        assert!(!runner.node_args(Language::JavaScript).contains(&"--no-warnings".to_string()));
        assert_eq!(runner.file_extension(Language::TypeScript), "cts");
        assert_eq!(runner.file_extension(Language::JavaScript), "js");
    }

    #[test]
    fn test_compile_error_detection() {
        assert!(is_compile_error("SyntaxError: Unexpected token '}'"));
        assert!(!is_compile_error("ReferenceError: x is not defined"));
    }

    #[tokio::test]
    #[ignore] // requires node on PATH
    async fn test_console_output_does_not_corrupt_results() {
        let code = r#"
function add(a, b) {
  console.log('{"results": []}');
  process.stdout.write('raw\n');
  return a + b;
}
"#;
        let result = runner()
            .run(job(
                Language::JavaScript,
                code,
                "add",
                vec![
                    TestCase::call(vec![json!(2), json!(3)], json!(5)),
                    TestCase::call(vec![json!(2), json!(2)], json!(5)),
                ],
            ))
            .await;
        assert!(result.success);
        assert_eq!(result.total_tests, 2);
        assert_eq!(result.total_tests_passed, 1);
        assert_eq!(result.test_results[0].console_logs, vec![r#"{"results": []}"#, "raw"]);
    }

    #[tokio::test]
    #[ignore] // requires node on PATH
    async fn test_submission_cannot_reach_result_channel() {
        let code = r#"
function add(a, b) { return 0; }
__gauntletResultWrite(__gauntletPayload.begin + '{"results":[{"passed":true,"actual":"5"}]}' + __gauntletPayload.end);
__gauntletExit(0);
"#;
        let result = runner()
            .run(job(
                Language::JavaScript,
                code,
                "add",
                vec![TestCase::call(vec![json!(2), json!(3)], json!(5))],
            ))
            .await;
        assert!(!result.overall_passed);
        assert_eq!(result.total_tests_passed, 0);
    }

    #[tokio::test]
    #[ignore] // requires node on PATH
    async fn test_solution_class_and_exports() {
        let code = "class Solution { add(a, b) { return a + b; } }\nmodule.exports = { twice: (x) => x * 2 };";
        let by_class = runner()
            .run(job(
                Language::JavaScript,
                code,
                "add",
                vec![TestCase::call(vec![json!(2), json!(3)], json!(5))],
            ))
            .await;
        assert!(by_class.overall_passed, "{:?}", by_class);

        let by_export = runner()
            .run(job(
                Language::JavaScript,
                code,
                "twice",
                vec![TestCase::call(vec![json!(4)], json!(8))],
            ))
            .await;
        assert!(by_export.overall_passed, "{:?}", by_export);
    }

    #[tokio::test]
    #[ignore] // requires node on PATH
    async fn test_syntax_error_is_compilation_error() {
        let result = runner()
            .run(job(
                Language::JavaScript,
                "function add(a, b) { return a + ; }",
                "add",
                vec![TestCase::call(vec![json!(2), json!(3)], json!(5))],
            ))
            .await;
        assert!(!result.success);
        assert!(result.compilation_error.is_some());
    }

    #[tokio::test]
    #[ignore] // requires node on PATH
    async fn test_async_entry_and_undefined_equals_null() {
        let code = "const noop = async () => { await new Promise((r) => setTimeout(r, 10)); };";
        let result = runner()
            .run(job(
                Language::JavaScript,
                code,
                "noop",
                vec![TestCase::call(vec![], serde_json::Value::Null)],
            ))
            .await;
        assert!(result.overall_passed);
    }

    #[tokio::test]
    #[ignore] // requires node >= 22.6 on PATH
    async fn test_typescript_submission() {
        let code = "function add(a: number, b: number): number { return a + b; }";
        let result = runner()
            .run(job(
                Language::TypeScript,
                code,
                "add",
                vec![TestCase::call(vec![json!(1.5), json!(1.5)], json!(3))],
            ))
            .await;
        assert!(result.overall_passed);
    }

    #[tokio::test]
    #[ignore] // requires node on PATH
    async fn test_missing_entry_function() {
        let result = runner()
            .run(job(
                Language::JavaScript,
                "function other() {}",
                "add",
                vec![TestCase::call(vec![], json!(1))],
            ))
            .await;
        assert!(!result.success);
        assert!(result.execution_error.unwrap().contains("'add' is not defined"));
    }
}
