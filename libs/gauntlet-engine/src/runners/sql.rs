/// SQL Runner - Embedded Query Grading
///
/// **Core Responsibility:**
/// Grade a single query against per-test fixtures without a subprocess.
///
/// **Per Test Case:**
/// 1. Fresh private in-memory SQLite database
/// 2. Apply schema then seed statements
/// 3. Run the submitted query, fetching rows one at a time with a row
///    ceiling and a deadline check between rows
/// 4. Compare against expected rows, optionally ignoring order
///
/// Multi-statement submissions are rejected before any database exists.
/// A single trailing semicolon is the only exception.
use super::{LanguageRunner, RunJob};
use crate::compare::rows_equal;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use futures_util::TryStreamExt;
use gauntlet_common::types::{GradingResult, Runtime, TestCase, TestResult};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column, ConnectOptions, Connection, Executor, Row, TypeInfo, ValueRef};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// SQLite VM instructions between deadline checks inside a single step
const PROGRESS_OPS: i32 = 10_000;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementShape {
    Empty,
    Single,
    Multiple,
}

/// Count statements while skipping string literals, quoted identifiers
/// and comments.
pub fn statement_shape(sql: &str) -> StatementShape {
    let mut chars = sql.chars().peekable();
    let mut saw_token = false;
    let mut terminated = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                if terminated {
                    return StatementShape::Multiple;
                }
                saw_token = true;
                // Doubled quotes are escapes and keep the literal open
                while let Some(next) = chars.next() {
                    if next == c {
                        if chars.peek() == Some(&c) {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            '[' => {
                if terminated {
                    return StatementShape::Multiple;
                }
                saw_token = true;
                for next in chars.by_ref() {
                    if next == ']' {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
            }
            ';' => {
                if terminated || !saw_token {
                    return StatementShape::Multiple;
                }
                terminated = true;
            }
            c if c.is_whitespace() => {}
            _ => {
                if terminated {
                    return StatementShape::Multiple;
                }
                saw_token = true;
            }
        }
    }

    if saw_token {
        StatementShape::Single
    } else {
        StatementShape::Empty
    }
}

/// Row representation, chosen from the shape of the expected rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowShape {
    Objects,
    Arrays,
}

impl RowShape {
    fn of(case: &TestCase) -> Self {
        match case.expected_rows.as_deref().and_then(|rows| rows.first()) {
            Some(Value::Array(_)) => RowShape::Arrays,
            _ => RowShape::Objects,
        }
    }
}

enum CaseOutcome {
    Rows(Vec<Value>),
    Error(String),
}

/// Conditions that end the whole run, not just one test
enum Abort {
    Syntax(String),
    Timeout,
}

fn is_syntax_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("syntax error")
        || message.contains("incomplete input")
        || message.contains("unrecognized token")
}

fn classify(error: sqlx::Error, deadline: Instant) -> Result<CaseOutcome, Abort> {
    let message = match &error {
        sqlx::Error::Database(db) => db.message().to_string(),
        other => other.to_string(),
    };
    if Instant::now() >= deadline || message.contains("interrupted") {
        return Err(Abort::Timeout);
    }
    if is_syntax_error(&message) {
        return Err(Abort::Syntax(message));
    }
    Ok(CaseOutcome::Error(message))
}

fn decode_value(row: &SqliteRow, index: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let value = match type_name.as_str() {
        "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" => Value::from(row.try_get_unchecked::<f64, _>(index)?),
        "BLOB" => Value::String(
            general_purpose::STANDARD.encode(row.try_get_unchecked::<Vec<u8>, _>(index)?),
        ),
        _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}

fn decode_row(row: &SqliteRow, shape: RowShape) -> Result<Value, sqlx::Error> {
    match shape {
        RowShape::Objects => {
            let mut object = Map::new();
            for (index, column) in row.columns().iter().enumerate() {
                object.insert(column.name().to_string(), decode_value(row, index)?);
            }
            Ok(Value::Object(object))
        }
        RowShape::Arrays => {
            let values = (0..row.columns().len())
                .map(|index| decode_value(row, index))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }
    }
}

pub struct SqlRunner {
    max_rows: usize,
}

impl SqlRunner {
    pub fn new(max_rows: usize) -> Self {
        Self { max_rows }
    }

    async fn open(deadline: Instant) -> Result<SqliteConnection, sqlx::Error> {
        let mut conn = SqliteConnectOptions::from_str("sqlite::memory:")?
            .connect()
            .await?;

        // Interrupt any single step that runs past the deadline
        let mut handle = conn.lock_handle().await?;
        handle.set_progress_handler(PROGRESS_OPS, move || Instant::now() < deadline);
        drop(handle);

        Ok(conn)
    }

    async fn run_case(
        &self,
        query: &str,
        case: &TestCase,
        deadline: Instant,
    ) -> Result<CaseOutcome, Abort> {
        let mut conn = match Self::open(deadline).await {
            Ok(conn) => conn,
            Err(e) => return Ok(CaseOutcome::Error(format!("Failed to open database: {}", e))),
        };

        let fixtures = [("schema", &case.schema_sql), ("seed", &case.seed_sql)];
        for (stage, statements) in fixtures {
            let Some(statements) = statements.as_deref().filter(|s| !s.trim().is_empty()) else {
                continue;
            };
            if let Err(e) = conn.execute(sqlx::raw_sql(statements)).await {
                if Instant::now() >= deadline {
                    return Err(Abort::Timeout);
                }
                return Ok(CaseOutcome::Error(format!("Test {} setup failed: {}", stage, e)));
            }
        }

        let outcome = self.fetch_rows(&mut conn, query, deadline, RowShape::of(case)).await;

        match tokio::time::timeout(CLOSE_TIMEOUT, conn.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Failed to close in-memory database"),
            Err(_) => warn!("Timed out closing in-memory database"),
        }
        outcome
    }

    async fn fetch_rows(
        &self,
        conn: &mut SqliteConnection,
        query: &str,
        deadline: Instant,
        shape: RowShape,
    ) -> Result<CaseOutcome, Abort> {
        let mut rows = Vec::new();
        let mut stream = conn.fetch(sqlx::query(query));

        loop {
            let next = tokio::time::timeout_at(
                tokio::time::Instant::from_std(deadline),
                stream.try_next(),
            )
            .await
            .map_err(|_| Abort::Timeout)?;

            match next {
                Ok(Some(row)) => {
                    if rows.len() >= self.max_rows {
                        return Ok(CaseOutcome::Error(format!(
                            "Query returned more than {} rows",
                            self.max_rows
                        )));
                    }
                    match decode_row(&row, shape) {
                        Ok(value) => rows.push(value),
                        Err(e) => {
                            return Ok(CaseOutcome::Error(format!("Failed to read row: {}", e)))
                        }
                    }
                    if Instant::now() >= deadline {
                        return Err(Abort::Timeout);
                    }
                }
                Ok(None) => break,
                Err(e) => return classify(e, deadline),
            }
        }

        Ok(CaseOutcome::Rows(rows))
    }
}

#[async_trait]
impl LanguageRunner for SqlRunner {
    fn runtime(&self) -> Runtime {
        Runtime::Sqlite
    }

    #[instrument(skip_all, fields(runtime = "sqlite", tests = job.test_cases.len()))]
    async fn run(&self, job: RunJob) -> GradingResult {
        let total = job.test_cases.len();

        match statement_shape(&job.code) {
            StatementShape::Multiple => {
                warn!("Rejected multi-statement query");
                return GradingResult::execution_failure(
                    "Query rejected: multiple statements are not allowed (only a single trailing semicolon is permitted)",
                )
                .with_total_tests(total);
            }
            StatementShape::Empty => {
                return GradingResult::execution_failure("Query is empty").with_total_tests(total)
            }
            StatementShape::Single => {}
        }

        let deadline = Instant::now() + Duration::from_millis(job.timeout_ms);
        let mut test_results = Vec::with_capacity(total);

        for (index, case) in job.test_cases.iter().enumerate() {
            let started = Instant::now();
            let outcome = match self.run_case(&job.code, case, deadline).await {
                Ok(outcome) => outcome,
                Err(Abort::Timeout) => {
                    return GradingResult::timeout(format!(
                        "Query timed out after {}ms",
                        job.timeout_ms
                    ))
                    .with_total_tests(total)
                }
                Err(Abort::Syntax(message)) => {
                    return GradingResult::compilation_failure(message).with_total_tests(total)
                }
            };

            let expected_rows = case.expected_rows.clone().unwrap_or_default();
            let mut result = TestResult {
                test_name: case.display_name(index),
                test_case_index: index,
                passed: false,
                actual_output: None,
                expected_output: Some(Value::Array(expected_rows.clone()).to_string()),
                execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
                console_logs: Vec::new(),
                error: None,
                hidden: case.hidden,
            };
            match outcome {
                CaseOutcome::Rows(rows) => {
                    result.passed = rows_equal(&rows, &expected_rows, case.order_matters);
                    result.actual_output = Some(Value::Array(rows).to_string());
                }
                CaseOutcome::Error(message) => result.error = Some(message),
            }
            test_results.push(result);
        }

        GradingResult::from_test_results(test_results, Vec::new())
    }
}
