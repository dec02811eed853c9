/// Security Scanner - Static Rejection Before Execution
///
/// **Core Responsibility:**
/// Reject submissions that match known-dangerous patterns before they ever
/// reach a runner or consume a concurrency slot.
///
/// **Properties:**
/// - Every language composes its own `PatternSet` with the universal set,
///   so a new language cannot skip the universal checks
/// - All matches are reported, not just the first
/// - The only state is the rolling scan metrics
use chrono::Utc;
use gauntlet_common::types::{Language, ScanResult, SecurityMetrics, ViolationRecord};
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Mutex;
use tracing::{debug, warn};

/// A compiled pattern with the description reported on a match
pub struct SecurityPattern {
    pub description: &'static str,
    regex: Regex,
}

impl SecurityPattern {
    fn new(description: &'static str, pattern: &str) -> Self {
        Self {
            description,
            regex: Regex::new(pattern).expect("security pattern must compile"),
        }
    }

    pub fn is_match(&self, code: &str) -> bool {
        self.regex.is_match(code)
    }
}

/// Language-specific pattern registry
pub trait PatternSet: Send + Sync {
    fn language_name(&self) -> &'static str;
    fn patterns(&self) -> &'static [SecurityPattern];
}

lazy_static! {
    static ref UNIVERSAL_PATTERNS: Vec<SecurityPattern> = vec![
        SecurityPattern::new("Path traversal sequence ('../')", r"\.\.[/\\]"),
        SecurityPattern::new(
            "Access to sensitive system path",
            r"/(etc/(passwd|shadow|sudoers)|proc/self|proc/\d+)",
        ),
        SecurityPattern::new("Reserved harness identifier (__gauntlet...)", r"(?i)__gauntlet"),
    ];

    static ref JAVASCRIPT_PATTERNS: Vec<SecurityPattern> = vec![
        SecurityPattern::new("Infinite loop: while(true)", r"\bwhile\s*\(\s*(true|1)\s*\)"),
        SecurityPattern::new("Infinite loop: for(;;)", r"\bfor\s*\(\s*;\s*;\s*\)"),
        SecurityPattern::new(
            "Restricted module require (child_process, fs, net, os, vm, ...)",
            r#"\brequire\s*\(\s*['"`](node:)?(child_process|fs|fs/promises|net|http|https|http2|os|cluster|worker_threads|vm|dgram|dns|tls|process|v8|inspector|module|perf_hooks)['"`]\s*\)"#,
        ),
        SecurityPattern::new(
            "Restricted module import (child_process, fs, net, os, vm, ...)",
            r#"(\bfrom\s*|\bimport\s*\(\s*|\bimport\s+)['"`](node:)?(child_process|fs|fs/promises|net|http|https|http2|os|cluster|worker_threads|vm|dgram|dns|tls|process|v8|inspector|module|perf_hooks)['"`]"#,
        ),
        SecurityPattern::new(
            "Process access (process.exit, process.env, process.binding, ...)",
            r"\bprocess\s*\.\s*(exit|kill|abort|env|binding|_linkedBinding|dlopen|chdir|setuid|setgid|mainModule|reallyExit|stdout|stderr)\b",
        ),
        SecurityPattern::new("Dynamic code evaluation: eval()", r"\beval\s*\("),
        SecurityPattern::new(
            "Dynamic code evaluation: Function constructor",
            r"\bnew\s+Function\s*\(|\bFunction\s*\(\s*['`]",
        ),
        SecurityPattern::new(
            "Dynamic code evaluation: string timer callback",
            r#"\bset(Timeout|Interval|Immediate)\s*\(\s*['"`]"#,
        ),
        SecurityPattern::new("Prototype pollution: __proto__", r"__proto__"),
        SecurityPattern::new(
            "Prototype pollution: built-in prototype access",
            r"\b(Object|Array|Function|String|Number|Boolean|Promise)\s*\.\s*prototype\b",
        ),
        SecurityPattern::new(
            "Constructor chain escape",
            r"\bconstructor\s*(\.\s*constructor\b|\[)",
        ),
        SecurityPattern::new(
            "Global object access (globalThis, global, Reflect)",
            r"\b(globalThis|global\s*\.|Reflect\s*\.)",
        ),
        SecurityPattern::new(
            "Module system introspection (require.cache, module.parent, ...)",
            r"\brequire\s*\.\s*(main|cache|resolve)\b|\bmodule\s*\.\s*(parent|children|constructor|paths|require)\b",
        ),
        SecurityPattern::new(
            "Prototype reflection (getPrototypeOf, defineProperty, ...)",
            r"\b(getPrototypeOf|setPrototypeOf|defineProperty|defineProperties|__defineGetter__|__defineSetter__|__lookupGetter__)\b|\bconstructor\s*\.\s*prototype\b",
        ),
        SecurityPattern::new(
            "Stack introspection (prepareStackTrace, caller, callee)",
            r"\b(prepareStackTrace|captureStackTrace)\b|\.\s*(caller|callee)\b",
        ),
    ];

    static ref PYTHON_PATTERNS: Vec<SecurityPattern> = vec![
        SecurityPattern::new("Infinite loop: while True", r"\bwhile\s+(True|1)\s*:"),
        SecurityPattern::new(
            "Restricted module import (os, sys, subprocess, socket, ...)",
            r"(?m)^[ \t]*import[ \t]+[\w \t,.]*?\b(os|sys|subprocess|socket|shutil|ctypes|multiprocessing|threading|signal|pty|importlib|pathlib|urllib|http|requests|pickle|marshal|builtins|inspect|gc|resource|code|codeop|tempfile|glob|io|traceback|__main__)\b",
        ),
        SecurityPattern::new(
            "Restricted module import (from os/sys/subprocess/... import)",
            r"(?m)^[ \t]*from[ \t]+(os|sys|subprocess|socket|shutil|ctypes|multiprocessing|threading|signal|pty|importlib|pathlib|urllib|http|requests|pickle|marshal|builtins|inspect|gc|resource|code|codeop|tempfile|glob|io|traceback|__main__)(\.\w+)*[ \t]+import\b",
        ),
        SecurityPattern::new("Dynamic import: __import__()", r"__import__\s*\("),
        SecurityPattern::new(
            "Dynamic code evaluation: eval/exec/compile",
            r"(^|[^.\w])(eval|exec|compile)\s*\(",
        ),
        SecurityPattern::new("File access: open()", r"(^|[^.\w])open\s*\("),
        SecurityPattern::new(
            "Introspection abuse: dunder attribute access",
            r"__(subclasses|globals|builtins|code|bases|mro|class|dict|getattribute|loader|spec)__",
        ),
        SecurityPattern::new(
            "Frame introspection (tracebacks, frame locals)",
            r"\b(tb_frame|tb_next|f_back|f_locals|f_globals|gi_frame|cr_frame|ag_frame)\b|__traceback__",
        ),
        SecurityPattern::new(
            "Namespace access: globals()/locals()/vars()",
            r"(^|[^.\w])(globals|locals|vars)\s*\(",
        ),
        SecurityPattern::new(
            "Reflection abuse: setattr/delattr or dunder getattr",
            r#"(^|[^.\w])(setattr|delattr)\s*\(|\bgetattr\s*\([^)]*['"]__"#,
        ),
    ];

    static ref JAVA_PATTERNS: Vec<SecurityPattern> = vec![
        SecurityPattern::new("Infinite loop: while(true)", r"\bwhile\s*\(\s*true\s*\)"),
        SecurityPattern::new("Infinite loop: for(;;)", r"\bfor\s*\(\s*;\s*;\s*\)"),
        SecurityPattern::new(
            "Process execution (Runtime.getRuntime, ProcessBuilder)",
            r"\bRuntime\s*\.\s*getRuntime\b|\bProcess(Builder|Handle)\b",
        ),
        SecurityPattern::new(
            "System access (System.exit, getenv, setProperty, ...)",
            r"\bSystem\s*\.\s*(exit|getenv|setProperty|getProperties|setOut|setErr|setIn|load|loadLibrary|setSecurityManager)\b",
        ),
        SecurityPattern::new(
            "File or network access (java.io.File, java.nio.file, java.net)",
            r"\bjava\s*\.\s*(io\s*\.\s*File|nio\s*\.\s*file|net)\b|\b(FileInputStream|FileOutputStream|FileReader|FileWriter|RandomAccessFile|Files|Paths|Socket|ServerSocket|URLConnection|DatagramSocket)\b",
        ),
        SecurityPattern::new(
            "Reflection abuse (java.lang.reflect, Class.forName, setAccessible)",
            r"\bjava\s*\.\s*lang\s*\.\s*reflect\b|\bClass\s*\.\s*forName\b|\.\s*getDeclared(Method|Field|Constructor)s?\b|\.\s*setAccessible\s*\(|\bMethodHandles\b",
        ),
        SecurityPattern::new(
            "Class loading or unsafe memory access",
            r"\bClassLoader\b|\bsun\s*\.\s*misc\b|\bUnsafe\b",
        ),
        SecurityPattern::new(
            "Dynamic code evaluation (ScriptEngine)",
            r"\bScriptEngine(Manager)?\b",
        ),
    ];

    static ref SQL_PATTERNS: Vec<SecurityPattern> = vec![
        SecurityPattern::new(
            "Time-delay function (sleep, pg_sleep, benchmark, waitfor)",
            r"(?i)\b(sleep|pg_sleep|benchmark)\s*\(|\bwaitfor\s+delay\b",
        ),
        SecurityPattern::new(
            "Locking statement (lock tables, get_lock, begin exclusive)",
            r"(?i)\block\s+tables?\b|\bget_lock\s*\(|\bpg_advisory_lock|\bbegin\s+(exclusive|immediate)\b",
        ),
        SecurityPattern::new(
            "Database attachment or extension loading",
            r"(?i)\b(attach|detach)\b|\bload_extension\s*\(",
        ),
        SecurityPattern::new("Engine configuration (pragma, vacuum)", r"(?i)\b(pragma|vacuum)\b"),
        SecurityPattern::new(
            "File access (readfile, writefile, into outfile, load_file)",
            r"(?i)\b(readfile|writefile|load_file)\s*\(|\binto\s+(outfile|dumpfile)\b",
        ),
        SecurityPattern::new(
            "Oversized blob allocation",
            r"(?i)\b(randomblob|zeroblob)\s*\(\s*\d{7,}",
        ),
    ];
}

pub struct JavaScriptPatterns;
pub struct PythonPatterns;
pub struct JavaPatterns;
pub struct SqlPatterns;

impl PatternSet for JavaScriptPatterns {
    fn language_name(&self) -> &'static str {
        "JavaScript"
    }

    fn patterns(&self) -> &'static [SecurityPattern] {
        &JAVASCRIPT_PATTERNS
    }
}

impl PatternSet for PythonPatterns {
    fn language_name(&self) -> &'static str {
        "Python"
    }

    fn patterns(&self) -> &'static [SecurityPattern] {
        &PYTHON_PATTERNS
    }
}

impl PatternSet for JavaPatterns {
    fn language_name(&self) -> &'static str {
        "Java"
    }

    fn patterns(&self) -> &'static [SecurityPattern] {
        &JAVA_PATTERNS
    }
}

impl PatternSet for SqlPatterns {
    fn language_name(&self) -> &'static str {
        "SQL"
    }

    fn patterns(&self) -> &'static [SecurityPattern] {
        &SQL_PATTERNS
    }
}

/// Language-specific pattern set. UI-only languages have none and only get
/// the universal checks.
pub fn pattern_set_for(language: Language) -> Option<&'static dyn PatternSet> {
    match language {
        Language::JavaScript | Language::TypeScript => Some(&JavaScriptPatterns),
        Language::Python => Some(&PythonPatterns),
        Language::Java => Some(&JavaPatterns),
        Language::Sql => Some(&SqlPatterns),
        Language::Html | Language::Css | Language::Markdown => None,
    }
}

/// Pure scan: universal patterns followed by the language's own set
pub fn evaluate(code: &str, language: Language) -> ScanResult {
    let language_patterns: &[SecurityPattern] = match pattern_set_for(language) {
        Some(set) => set.patterns(),
        None => &[],
    };

    let violations: Vec<String> = UNIVERSAL_PATTERNS
        .iter()
        .chain(language_patterns.iter())
        .filter(|pattern| pattern.is_match(code))
        .map(|pattern| pattern.description.to_string())
        .collect();

    ScanResult {
        safe: violations.is_empty(),
        violations,
    }
}

/// Scanner with rolling metrics
pub struct SecurityScanner {
    metrics: Mutex<SecurityMetrics>,
    violation_log_capacity: usize,
}

impl SecurityScanner {
    pub fn new(violation_log_capacity: usize) -> Self {
        Self {
            metrics: Mutex::new(SecurityMetrics::default()),
            violation_log_capacity: violation_log_capacity.max(1),
        }
    }

    pub fn scan(&self, code: &str, language: Language) -> ScanResult {
        let result = evaluate(code, language);

        let mut metrics = self.metrics.lock().unwrap_or_else(|e| e.into_inner());
        metrics.total_scans += 1;

        if result.safe {
            debug!(language = %language, "Security scan passed");
        } else {
            metrics.total_rejections += 1;
            *metrics.rejections_by_language.entry(language).or_insert(0) += 1;

            if metrics.recent_violations.len() >= self.violation_log_capacity {
                let overflow = metrics.recent_violations.len() + 1 - self.violation_log_capacity;
                metrics.recent_violations.drain(..overflow);
            }
            metrics.recent_violations.push(ViolationRecord {
                at: Utc::now(),
                language,
                violations: result.violations.clone(),
            });

            warn!(
                language = %language,
                violations = ?result.violations,
                "Security scan rejected submission"
            );
        }

        result
    }

    pub fn metrics(&self) -> SecurityMetrics {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock().unwrap_or_else(|e| e.into_inner()) = SecurityMetrics::default();
    }
}

impl Default for SecurityScanner {
    fn default() -> Self {
        Self::new(50)
    }
}
