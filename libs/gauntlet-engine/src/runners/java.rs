/// Java Runner - Compile Then Run
///
/// The submission is written to `<PublicClass>.java` (or `Solution.java`
/// when no public class exists) next to a generated `GauntletMain.java`.
/// Both are compiled with javac in one step; a failed compile is reported
/// as a compilation error without running anything.
///
/// The harness finds the entry method by name and arity through
/// reflection (static or instance), converts JSON arguments to the
/// declared parameter types, and captures `System.out`/`System.err`
/// per test.
use super::{
    interpret_outcome, truncate_diagnostic, HarnessPayload, LanguageRunner, ResultChannel, RunJob,
    RunnerSettings, Workspace,
};
use crate::config::RuntimeConfig;
use crate::sandbox::{self, SandboxCommand};
use anyhow::Result;
use async_trait::async_trait;
use gauntlet_common::types::{GradingResult, Runtime};
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Instant;
use tracing::{debug, error, instrument};

const HARNESS_CLASS: &str = "GauntletMain";
const DEFAULT_CLASS: &str = "Solution";

/// javac is slow to start; never give it less than this
const MIN_COMPILE_TIMEOUT_MS: u64 = 3000;

/// String literals in class files are limited to 65535 bytes
const PAYLOAD_CHUNK: usize = 60_000;

lazy_static! {
    static ref PUBLIC_CLASS: Regex = Regex::new(
        r"\bpublic\s+(?:(?:final|abstract|strictfp)\s+)*class\s+([A-Za-z_$][A-Za-z0-9_$]*)"
    )
    .expect("public class pattern must compile");
    static ref ANY_CLASS: Regex = Regex::new(r"\bclass\s+([A-Za-z_$][A-Za-z0-9_$]*)")
        .expect("class pattern must compile");
    static ref TYPE_DECLARATION: Regex =
        Regex::new(r"\b(?:class|interface|enum|record)\s+([A-Za-z_$][A-Za-z0-9_$]*)")
            .expect("type declaration pattern must compile");
}

const HARNESS: &str = r##"import java.io.ByteArrayOutputStream;
import java.io.OutputStream;
import java.io.PrintStream;
import java.lang.reflect.Array;
import java.lang.reflect.Constructor;
import java.lang.reflect.InvocationTargetException;
import java.lang.reflect.Method;
import java.lang.reflect.Modifier;
import java.lang.reflect.ParameterizedType;
import java.lang.reflect.Type;
import java.nio.charset.StandardCharsets;
import java.util.ArrayList;
import java.util.Base64;
import java.util.LinkedHashMap;
import java.util.LinkedHashSet;
import java.util.List;
import java.util.Map;
import java.util.Set;

public class GauntletMain {
    private static final String PAYLOAD = new StringBuilder()
__GAUNTLET_PAYLOAD_CHUNKS__
        .toString();

    static final class Capture extends OutputStream {
        private final int maxLines;
        private final int maxChars;
        private final List<Object> lines = new ArrayList<>();
        private final ByteArrayOutputStream partial = new ByteArrayOutputStream();

        Capture(int maxLines, int maxChars) {
            this.maxLines = maxLines;
            this.maxChars = maxChars;
        }

        @Override
        public synchronized void write(int b) {
            if (b == '\n') {
                push();
                return;
            }
            partial.write(b);
            if (partial.size() > maxChars * 4) {
                push();
            }
        }

        private void push() {
            String line = new String(partial.toByteArray(), StandardCharsets.UTF_8);
            partial.reset();
            if (line.endsWith("\r")) {
                line = line.substring(0, line.length() - 1);
            }
            if (lines.size() >= maxLines) {
                return;
            }
            if (line.length() > maxChars) {
                line = line.substring(0, maxChars) + "...";
            }
            lines.add(line);
        }

        synchronized List<Object> drain() {
            if (partial.size() > 0) {
                push();
            }
            List<Object> out = new ArrayList<>(lines);
            lines.clear();
            return out;
        }
    }

    static final class Json {
        private final String s;
        private int i;

        private Json(String s) {
            this.s = s;
        }

        static Object parse(String text) {
            Json parser = new Json(text);
            return parser.value();
        }

        private void ws() {
            while (i < s.length() && Character.isWhitespace(s.charAt(i))) {
                i++;
            }
        }

        private Object value() {
            ws();
            char c = s.charAt(i);
            switch (c) {
                case '{':
                    return object();
                case '[':
                    return array();
                case '"':
                    return string();
                case 't':
                    i += 4;
                    return Boolean.TRUE;
                case 'f':
                    i += 5;
                    return Boolean.FALSE;
                case 'n':
                    i += 4;
                    return null;
                default:
                    return number();
            }
        }

        private Map<String, Object> object() {
            Map<String, Object> map = new LinkedHashMap<>();
            i++;
            ws();
            if (s.charAt(i) == '}') {
                i++;
                return map;
            }
            while (true) {
                ws();
                String key = string();
                ws();
                i++;
                map.put(key, value());
                ws();
                if (s.charAt(i++) == '}') {
                    return map;
                }
            }
        }

        private List<Object> array() {
            List<Object> list = new ArrayList<>();
            i++;
            ws();
            if (s.charAt(i) == ']') {
                i++;
                return list;
            }
            while (true) {
                list.add(value());
                ws();
                if (s.charAt(i++) == ']') {
                    return list;
                }
            }
        }

        private String string() {
            StringBuilder b = new StringBuilder();
            i++;
            while (true) {
                char c = s.charAt(i++);
                if (c == '"') {
                    return b.toString();
                }
                if (c != '\\') {
                    b.append(c);
                    continue;
                }
                char e = s.charAt(i++);
                switch (e) {
                    case 'n': b.append('\n'); break;
                    case 't': b.append('\t'); break;
                    case 'r': b.append('\r'); break;
                    case 'b': b.append('\b'); break;
                    case 'f': b.append('\f'); break;
                    case 'u':
                        b.append((char) Integer.parseInt(s.substring(i, i + 4), 16));
                        i += 4;
                        break;
                    default: b.append(e);
                }
            }
        }

        private Number number() {
            int start = i;
            while (i < s.length() && "+-0123456789.eE".indexOf(s.charAt(i)) >= 0) {
                i++;
            }
            String text = s.substring(start, i);
            if (text.contains(".") || text.contains("e") || text.contains("E")) {
                return Double.parseDouble(text);
            }
            try {
                return Long.parseLong(text);
            } catch (NumberFormatException ex) {
                return Double.parseDouble(text);
            }
        }
    }

    static String toJson(Object value) {
        StringBuilder b = new StringBuilder();
        write(b, value, 0);
        return b.toString();
    }

    static void write(StringBuilder b, Object v, int depth) {
        if (depth > 64) {
            quote(b, "...");
        } else if (v == null) {
            b.append("null");
        } else if (v instanceof Boolean) {
            b.append(v.toString());
        } else if (v instanceof Double || v instanceof Float) {
            double d = ((Number) v).doubleValue();
            if (Double.isNaN(d) || Double.isInfinite(d)) {
                quote(b, String.valueOf(d));
            } else {
                b.append(Double.toString(d));
            }
        } else if (v instanceof Number) {
            b.append(v.toString());
        } else if (v instanceof Character || v instanceof CharSequence) {
            quote(b, v.toString());
        } else if (v.getClass().isArray()) {
            b.append('[');
            int n = Array.getLength(v);
            for (int k = 0; k < n; k++) {
                if (k > 0) b.append(',');
                write(b, Array.get(v, k), depth + 1);
            }
            b.append(']');
        } else if (v instanceof Iterable) {
            b.append('[');
            boolean first = true;
            for (Object item : (Iterable<?>) v) {
                if (!first) b.append(',');
                first = false;
                write(b, item, depth + 1);
            }
            b.append(']');
        } else if (v instanceof Map) {
            b.append('{');
            boolean first = true;
            for (Map.Entry<?, ?> entry : ((Map<?, ?>) v).entrySet()) {
                if (!first) b.append(',');
                first = false;
                quote(b, String.valueOf(entry.getKey()));
                b.append(':');
                write(b, entry.getValue(), depth + 1);
            }
            b.append('}');
        } else if (v instanceof Enum) {
            quote(b, ((Enum<?>) v).name());
        } else {
            quote(b, v.toString());
        }
    }

    static void quote(StringBuilder b, String s) {
        b.append('"');
        for (int k = 0; k < s.length(); k++) {
            char c = s.charAt(k);
            switch (c) {
                case '"': b.append("\\\""); break;
                case '\\': b.append("\\\\"); break;
                case '\n': b.append("\\n"); break;
                case '\r': b.append("\\r"); break;
                case '\t': b.append("\\t"); break;
                default:
                    if (c < 0x20) {
                        b.append(String.format("\\u%04x", (int) c));
                    } else {
                        b.append(c);
                    }
            }
        }
        b.append('"');
    }

    static boolean equal(Object a, Object e) {
        if (a == null || e == null) {
            return a == e;
        }
        if (a instanceof Boolean || e instanceof Boolean) {
            return a.equals(e);
        }
        if (a instanceof Long && e instanceof Long) {
            return a.equals(e);
        }
        if (a instanceof Number && e instanceof Number) {
            return ((Number) a).doubleValue() == ((Number) e).doubleValue();
        }
        if (a instanceof List && e instanceof List) {
            List<?> x = (List<?>) a;
            List<?> y = (List<?>) e;
            if (x.size() != y.size()) return false;
            for (int k = 0; k < x.size(); k++) {
                if (!equal(x.get(k), y.get(k))) return false;
            }
            return true;
        }
        if (a instanceof Map && e instanceof Map) {
            Map<?, ?> x = (Map<?, ?>) a;
            Map<?, ?> y = (Map<?, ?>) e;
            if (x.size() != y.size()) return false;
            for (Map.Entry<?, ?> entry : x.entrySet()) {
                if (!y.containsKey(entry.getKey())) return false;
                if (!equal(entry.getValue(), y.get(entry.getKey()))) return false;
            }
            return true;
        }
        return a.equals(e);
    }

    static Class<?> rawClass(Type type) {
        if (type instanceof Class) return (Class<?>) type;
        if (type instanceof ParameterizedType) return (Class<?>) ((ParameterizedType) type).getRawType();
        return Object.class;
    }

    static Type typeArg(Type type, int index) {
        if (type instanceof ParameterizedType) {
            Type[] args = ((ParameterizedType) type).getActualTypeArguments();
            if (index < args.length) return args[index];
        }
        return Object.class;
    }

    static Object coerce(Object value, Type type) {
        Class<?> raw = rawClass(type);
        if (value == null) {
            if (raw.isPrimitive()) throw new IllegalArgumentException("null cannot be passed as " + raw.getName());
            return null;
        }
        if (raw == int.class || raw == Integer.class) return ((Number) value).intValue();
        if (raw == long.class || raw == Long.class) return ((Number) value).longValue();
        if (raw == double.class || raw == Double.class) return ((Number) value).doubleValue();
        if (raw == float.class || raw == Float.class) return ((Number) value).floatValue();
        if (raw == short.class || raw == Short.class) return ((Number) value).shortValue();
        if (raw == byte.class || raw == Byte.class) return ((Number) value).byteValue();
        if (raw == boolean.class || raw == Boolean.class) return (Boolean) value;
        if (raw == char.class || raw == Character.class) {
            String text = (String) value;
            if (text.length() != 1) throw new IllegalArgumentException("expected a single character, got \"" + text + "\"");
            return text.charAt(0);
        }
        if (raw == String.class) return (String) value;
        if (raw.isArray()) {
            List<?> list = (List<?>) value;
            Class<?> component = raw.getComponentType();
            Object array = Array.newInstance(component, list.size());
            for (int k = 0; k < list.size(); k++) {
                Array.set(array, k, coerce(list.get(k), component));
            }
            return array;
        }
        if (value instanceof List && Set.class.isAssignableFrom(raw)) {
            Set<Object> out = new LinkedHashSet<>();
            for (Object item : (List<?>) value) out.add(coerce(item, typeArg(type, 0)));
            return out;
        }
        if (value instanceof List && raw.isAssignableFrom(ArrayList.class)) {
            List<Object> out = new ArrayList<>();
            for (Object item : (List<?>) value) out.add(coerce(item, typeArg(type, 0)));
            return out;
        }
        if (value instanceof Map && raw.isAssignableFrom(LinkedHashMap.class)) {
            Type keyType = typeArg(type, 0);
            Class<?> keyClass = rawClass(keyType);
            Map<Object, Object> out = new LinkedHashMap<>();
            for (Map.Entry<?, ?> entry : ((Map<?, ?>) value).entrySet()) {
                Object key = entry.getKey();
                if (keyClass != String.class && keyClass != Object.class) {
                    key = coerce(Json.parse((String) key), keyType);
                }
                out.put(key, coerce(entry.getValue(), typeArg(type, 1)));
            }
            return out;
        }
        if (raw.isInstance(value)) return value;
        throw new IllegalArgumentException("cannot convert " + toJson(value) + " to " + raw.getSimpleName());
    }

    static List<Method> findMethods(List<?> classNames, String entry) {
        List<Method> found = new ArrayList<>();
        for (Object name : classNames) {
            Class<?> cls;
            try {
                cls = Class.forName((String) name);
            } catch (Throwable ex) {
                continue;
            }
            for (Method method : cls.getDeclaredMethods()) {
                if (method.getName().equals(entry) && !method.isSynthetic()) {
                    method.setAccessible(true);
                    found.add(method);
                }
            }
        }
        return found;
    }

    static Object invoke(List<Method> candidates, List<?> args, String entry) throws Exception {
        IllegalArgumentException mismatch = null;
        for (Method method : candidates) {
            if (method.getParameterCount() != args.size()) continue;
            Type[] types = method.getGenericParameterTypes();
            Object[] converted = new Object[args.size()];
            try {
                for (int k = 0; k < converted.length; k++) {
                    converted[k] = coerce(args.get(k), types[k]);
                }
            } catch (RuntimeException ex) {
                mismatch = new IllegalArgumentException("Argument mismatch for '" + entry + "': " + ex.getMessage());
                continue;
            }
            Object target = null;
            if (!Modifier.isStatic(method.getModifiers())) {
                Constructor<?> constructor = method.getDeclaringClass().getDeclaredConstructor();
                constructor.setAccessible(true);
                target = constructor.newInstance();
            }
            return method.invoke(target, converted);
        }
        if (mismatch != null) throw mismatch;
        throw new IllegalArgumentException("No overload of '" + entry + "' takes " + args.size() + " argument(s)");
    }

    static String describe(Throwable t) {
        String message = t.getMessage();
        return t.getClass().getSimpleName() + (message != null ? ": " + message : "");
    }

    static Map<String, Object> runTest(List<Method> candidates, Map<?, ?> test, String entry, Capture capture) {
        boolean passed = false;
        String actual = null;
        String error = null;
        long started = System.nanoTime();
        try {
            Object value = invoke(candidates, (List<?>) test.get("args"), entry);
            actual = toJson(value);
            passed = equal(Json.parse(actual), test.get("expected"));
        } catch (InvocationTargetException ex) {
            error = describe(ex.getCause() != null ? ex.getCause() : ex);
        } catch (Throwable ex) {
            error = describe(ex);
        }
        double elapsed = (System.nanoTime() - started) / 1e6;

        Map<String, Object> result = new LinkedHashMap<>();
        result.put("passed", passed && error == null);
        result.put("actual", error == null ? actual : null);
        result.put("execution_time_ms", elapsed);
        result.put("console_logs", capture.drain());
        result.put("error", error);
        return result;
    }

    public static void main(String[] argv) throws Exception {
        PrintStream resultStream = System.err;
        Map<?, ?> payload = (Map<?, ?>) Json.parse(new String(Base64.getDecoder().decode(PAYLOAD), StandardCharsets.UTF_8));
        String entry = (String) payload.get("entry");
        Capture capture = new Capture(
            ((Number) payload.get("max_log_lines")).intValue(),
            ((Number) payload.get("max_log_chars")).intValue());
        PrintStream captured = new PrintStream(capture, true, "UTF-8");
        System.setOut(captured);
        System.setErr(captured);

        List<Object> results = new ArrayList<>();
        Map<String, Object> report = new LinkedHashMap<>();
        report.put("results", results);
        report.put("fatal", null);

        Object classes = payload.get("classes");
        List<Method> candidates = findMethods(classes instanceof List ? (List<?>) classes : new ArrayList<>(), entry);
        if (candidates.isEmpty()) {
            report.put("fatal", "Entry function '" + entry + "' is not defined");
        } else {
            for (Object test : (List<?>) payload.get("tests")) {
                results.add(runTest(candidates, (Map<?, ?>) test, entry, capture));
            }
        }
        report.put("console_logs", capture.drain());

        resultStream.print("\n" + payload.get("begin") + toJson(report) + payload.get("end") + "\n");
        resultStream.flush();
        System.exit(0);
    }
}
"##;

/// Where the submission is written and which classes may hold the entry method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLayout {
    pub file_name: String,
    pub classes: Vec<String>,
}

/// Public class first, then every other top-level name in order of appearance
pub fn source_layout(code: &str) -> SourceLayout {
    let public_class = PUBLIC_CLASS
        .captures(code)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    let mut classes: Vec<String> = public_class.iter().cloned().collect();
    for caps in ANY_CLASS.captures_iter(code) {
        if let Some(name) = caps.get(1) {
            let name = name.as_str();
            if name != HARNESS_CLASS && !classes.iter().any(|c| c == name) {
                classes.push(name.to_string());
            }
        }
    }
    if classes.is_empty() {
        classes.push(DEFAULT_CLASS.to_string());
    }

    let file_stem = public_class.unwrap_or_else(|| DEFAULT_CLASS.to_string());
    SourceLayout {
        file_name: format!("{}.java", file_stem),
        classes,
    }
}

/// Name of a declared type that would shadow the generated harness class
pub fn reserved_declaration(code: &str) -> Option<&'static str> {
    TYPE_DECLARATION
        .captures_iter(code)
        .filter_map(|caps| caps.get(1))
        .any(|name| name.as_str() == HARNESS_CLASS)
        .then_some(HARNESS_CLASS)
}

/// Harness source with the payload split into literal-sized chunks
pub fn generate_harness(payload: &str) -> String {
    let chunks: Vec<String> = payload
        .as_bytes()
        .chunks(PAYLOAD_CHUNK)
        .map(|chunk| format!("        .append(\"{}\")", String::from_utf8_lossy(chunk)))
        .collect();
    HARNESS.replace("__GAUNTLET_PAYLOAD_CHUNKS__", &chunks.join("\n"))
}

pub struct JavaRunner {
    config: RuntimeConfig,
    settings: RunnerSettings,
}

impl JavaRunner {
    pub fn new(config: RuntimeConfig, settings: RunnerSettings) -> Self {
        Self { config, settings }
    }

    fn compile_command(&self, workspace: &Workspace, layout: &SourceLayout) -> SandboxCommand {
        let (program, args) = match &self.config.compile {
            Some(compile) => (compile.command.as_str(), compile.args.clone()),
            None => ("javac", Vec::new()),
        };
        SandboxCommand::new(program, workspace.path())
            .args(args)
            .args(["-d", "."])
            .arg(layout.file_name.clone())
            .arg(format!("{}.java", HARNESS_CLASS))
    }

    fn run_command(&self, workspace: &Workspace) -> SandboxCommand {
        let mut command = SandboxCommand::new(&self.config.execution.command, workspace.path())
            .args(self.config.execution.args.iter().cloned());
        if self.config.memory_limit_mb > 0 {
            command = command.arg(format!("-Xmx{}m", self.config.memory_limit_mb));
        }
        command.args(["-cp", ".", HARNESS_CLASS])
    }

    async fn execute(&self, workspace: &Workspace, job: &RunJob) -> Result<GradingResult> {
        if let Some(name) = reserved_declaration(&job.code) {
            return Ok(GradingResult::compilation_failure(format!(
                "Class name '{}' is reserved",
                name
            ))
            .with_total_tests(job.test_cases.len()));
        }

        let entry = job.entry_function.as_deref().unwrap_or_default();
        let layout = source_layout(&job.code);
        let channel = ResultChannel::new();
        let payload = HarnessPayload::new(entry, &job.test_cases, &channel)
            .with_classes(layout.classes.clone())
            .encode()?;

        workspace.write(&layout.file_name, &job.code)?;
        workspace.write(&format!("{}.java", HARNESS_CLASS), &generate_harness(&payload))?;

        let compile_timeout_ms = job.timeout_ms.max(MIN_COMPILE_TIMEOUT_MS);
        let compiled = sandbox::run(
            &self.compile_command(workspace, &layout),
            &self.settings.limits(compile_timeout_ms),
        )
        .await?;
        debug!(
            exit_code = ?compiled.exit_code,
            duration_ms = compiled.duration.as_millis() as u64,
            "javac finished"
        );

        let total = job.test_cases.len();
        if compiled.timed_out {
            return Ok(GradingResult::timeout(format!(
                "Compilation timed out after {}ms",
                compile_timeout_ms
            ))
            .with_total_tests(total));
        }
        if !compiled.succeeded() {
            let diagnostics = if compiled.stderr.trim().is_empty() {
                compiled.stdout.trim()
            } else {
                compiled.stderr.trim()
            };
            return Ok(GradingResult::compilation_failure(truncate_diagnostic(diagnostics))
                .with_total_tests(total));
        }

        let outcome = sandbox::run(
            &self.run_command(workspace),
            &self.settings.limits(job.timeout_ms),
        )
        .await?;
        debug!(
            exit_code = ?outcome.exit_code,
            timed_out = outcome.timed_out,
            duration_ms = outcome.duration.as_millis() as u64,
            "JVM process finished"
        );

        Ok(interpret_outcome(
            &outcome,
            &channel,
            &job.test_cases,
            job.timeout_ms,
            |_| false,
        ))
    }
}

#[async_trait]
impl LanguageRunner for JavaRunner {
    fn runtime(&self) -> Runtime {
        Runtime::Jvm
    }

    #[instrument(skip_all, fields(runtime = "jvm", tests = job.test_cases.len()))]
    async fn run(&self, job: RunJob) -> GradingResult {
        let started = Instant::now();
        let workspace = match Workspace::create() {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(error = %e, "Failed to prepare Java workspace");
                return GradingResult::execution_failure(format!("Execution setup failed: {}", e))
                    .with_total_tests(job.test_cases.len());
            }
        };

        let result = match self.execute(&workspace, &job).await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Java execution failed");
                GradingResult::execution_failure(format!("Execution failed: {:#}", e))
                    .with_total_tests(job.test_cases.len())
            }
        };
        workspace.cleanup();

        debug!(
            execution_ms = started.elapsed().as_millis() as u64,
            passed = result.total_tests_passed,
            "Java run complete"
        );
        result
    }
}
