// CLI commands driving the grading engine in-process
use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use gauntlet_common::config::EngineConfig;
use gauntlet_common::types::{
    BlankConfig, ExecutionRequest, ExecutionResponse, GradingResult, Language,
};
use gauntlet_engine::{blanks, security, ExecutionQueue, GradingOrchestrator, RuntimeConfigManager};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn build_orchestrator() -> Result<GradingOrchestrator> {
    let config = EngineConfig::from_env();
    let runtime_configs =
        RuntimeConfigManager::load_or_builtin(Path::new(&config.runtime_config_path))?;
    GradingOrchestrator::new(config, &runtime_configs)
}

fn parse_language(language: &str) -> Result<Language> {
    match Language::from_str(language) {
        Some(language) => Ok(language),
        None => bail!(
            "Unknown language '{}'. Valid options: {}",
            language,
            Language::all_variants()
                .iter()
                .map(|l| l.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn print_summary(label: &str, result: &GradingResult) {
    let verdict = if result.overall_passed { "✅ PASSED" } else { "❌ FAILED" };
    println!(
        "{} {}: {}/{} tests passed",
        verdict, label, result.total_tests_passed, result.total_tests
    );
    if let Some(error) = &result.compilation_error {
        println!("   compilation error: {}", error);
    }
    if let Some(error) = &result.execution_error {
        println!("   execution error: {}", error);
    }
}

/// Grade one request and print the full result as JSON
pub async fn run_request(path: &Path, direct: bool) -> Result<()> {
    let request: ExecutionRequest = read_json(path)?;
    let orchestrator = build_orchestrator()?;

    let output = if direct {
        info!("Running without admission control");
        let result = orchestrator.run_code_tests(&request).await?;
        print_summary(&path.display().to_string(), &result);
        serde_json::to_string_pretty(&result)?
    } else {
        let queue = ExecutionQueue::new(orchestrator);
        let response = queue.execute_code(request).await?;
        print_summary(&path.display().to_string(), &response.result);
        serde_json::to_string_pretty(&response)?
    };

    println!("{}", output);
    Ok(())
}

/// Submit every request at once so admission control decides the order
pub async fn run_batch(path: &Path) -> Result<()> {
    let requests: Vec<ExecutionRequest> = read_json(path)?;
    if requests.is_empty() {
        bail!("{} contains no requests", path.display());
    }

    let queue = ExecutionQueue::new(build_orchestrator()?);
    println!("🚀 Submitting {} requests...", requests.len());

    let submissions = requests.into_iter().enumerate().map(|(index, request)| {
        let queue = queue.clone();
        async move { (index, queue.execute_code(request).await) }
    });

    let mut passed = 0;
    for (index, outcome) in join_all(submissions).await {
        let label = format!("request #{}", index + 1);
        match outcome {
            Ok(ExecutionResponse {
                result,
                queue_time_ms,
            }) => {
                print_summary(&label, &result);
                println!("   queued for {}ms", queue_time_ms);
                if result.overall_passed {
                    passed += 1;
                }
            }
            Err(e) => println!("⚠️  {} rejected: {}", label, e),
        }
    }

    let metrics = queue.get_metrics();
    println!(
        "\n📊 {} passed | processed {} | queued {} | rejected {} | max wait {}ms",
        passed,
        metrics.total_processed,
        metrics.total_queued,
        metrics.total_rejected,
        metrics.max_wait_ms
    );
    Ok(())
}

/// Scan a file without executing it
pub fn scan_file(path: &Path, language: &str) -> Result<()> {
    let language = parse_language(language)?;
    let code = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let result = security::evaluate(&code, language);
    if result.safe {
        println!("✅ No violations found");
    } else {
        println!("❌ {} violation(s):", result.violations.len());
        for violation in &result.violations {
            println!("  - {}", violation);
        }
    }
    Ok(())
}

pub fn grade_blanks(config_path: &Path, answers_path: &Path) -> Result<()> {
    let config: Vec<BlankConfig> = read_json(config_path)?;
    let answers: HashMap<String, String> = read_json(answers_path)?;

    blanks::validate_config(&config).context("Invalid blank configuration")?;
    let result = blanks::grade(&answers, &config);

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

pub fn list_languages() -> Result<()> {
    let orchestrator = build_orchestrator()?;
    println!("{:<12} {:<8} EXECUTABLE", "LANGUAGE", "RUNTIME");
    for capability in orchestrator.capability_matrix() {
        let runtime = capability
            .runtime
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<8} {}",
            capability.language.to_string(),
            runtime,
            if capability.executable { "yes" } else { "no" }
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_language() {
        assert_eq!(parse_language("py").unwrap(), Language::Python);
        let err = parse_language("cobol").unwrap_err().to_string();
        assert!(err.contains("Unknown language 'cobol'"));
        assert!(err.contains("typescript"));
    }

    #[test]
    fn test_read_json_reports_path() {
        let dir = std::env::temp_dir().join(format!("gauntlet-cli-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.json");
        fs::write(&path, "{ not json").unwrap();

        let err = read_json::<ExecutionRequest>(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.json"));

        fs::remove_dir_all(&dir).unwrap();
    }
}
