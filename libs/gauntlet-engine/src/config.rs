// Runtime configuration management for the grading engine
use anyhow::{bail, Context, Result};
use gauntlet_common::types::Runtime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeExecution {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub file_extension: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub name: String,
    pub execution: RuntimeExecution,
    /// Separate compile step for compiled runtimes
    #[serde(default)]
    pub compile: Option<RuntimeExecution>,
    pub memory_limit_mb: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct RuntimesJson {
    runtimes: Vec<RuntimeConfig>,
}

/// Runtime configuration manager
#[derive(Debug, Clone)]
pub struct RuntimeConfigManager {
    configs: HashMap<Runtime, RuntimeConfig>,
}

impl RuntimeConfigManager {
    /// Load runtime configurations from runtimes.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Runtime config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read runtimes.json")?;

        let runtimes_json: RuntimesJson =
            serde_json::from_str(&content).context("Failed to parse runtimes.json")?;

        let mut configs = Self::builtin().configs;
        for runtime_config in runtimes_json.runtimes {
            let runtime = Runtime::from_str(&runtime_config.name).ok_or_else(|| {
                anyhow::anyhow!("Unknown runtime '{}' in runtimes.json", runtime_config.name)
            })?;
            configs.insert(runtime, runtime_config);
        }

        Ok(Self { configs })
    }

    /// Load from `config_path` when it exists, otherwise use the built-in table
    pub fn load_or_builtin(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            Ok(Self::builtin())
        }
    }

    /// Built-in defaults, matching config/runtimes.json
    pub fn builtin() -> Self {
        let mut configs = HashMap::new();

        configs.insert(
            Runtime::Node,
            RuntimeConfig {
                name: "node".to_string(),
                execution: RuntimeExecution {
                    command: "node".to_string(),
                    args: Vec::new(),
                    file_extension: "js".to_string(),
                },
                compile: None,
                memory_limit_mb: 256,
            },
        );
        configs.insert(
            Runtime::Python,
            RuntimeConfig {
                name: "python".to_string(),
                execution: RuntimeExecution {
                    command: "python3".to_string(),
                    args: vec!["-I".to_string(), "-B".to_string(), "-u".to_string()],
                    file_extension: "py".to_string(),
                },
                compile: None,
                memory_limit_mb: 256,
            },
        );
        configs.insert(
            Runtime::Jvm,
            RuntimeConfig {
                name: "jvm".to_string(),
                execution: RuntimeExecution {
                    command: "java".to_string(),
                    args: vec!["-XX:+UseSerialGC".to_string(), "-Xss16m".to_string()],
                    file_extension: "java".to_string(),
                },
                compile: Some(RuntimeExecution {
                    command: "javac".to_string(),
                    args: vec![
                        "-encoding".to_string(),
                        "UTF-8".to_string(),
                        "-nowarn".to_string(),
                    ],
                    file_extension: "java".to_string(),
                }),
                memory_limit_mb: 256,
            },
        );
        configs.insert(
            Runtime::Sqlite,
            RuntimeConfig {
                name: "sqlite".to_string(),
                execution: RuntimeExecution {
                    command: String::new(),
                    args: Vec::new(),
                    file_extension: "sql".to_string(),
                },
                compile: None,
                memory_limit_mb: 64,
            },
        );

        Self { configs }
    }

    /// Get configuration for a specific runtime
    pub fn get_config(&self, runtime: &Runtime) -> Result<&RuntimeConfig> {
        self.configs
            .get(runtime)
            .ok_or_else(|| anyhow::anyhow!("No configuration found for runtime: {}", runtime))
    }

    /// Get memory limit for a runtime
    pub fn get_memory_limit_mb(&self, runtime: &Runtime) -> Result<u32> {
        Ok(self.get_config(runtime)?.memory_limit_mb)
    }

    /// List all configured runtimes
    pub fn list_runtimes(&self) -> Vec<Runtime> {
        let mut runtimes: Vec<Runtime> = self.configs.keys().copied().collect();
        runtimes.sort();
        runtimes
    }
}

impl Default for RuntimeConfigManager {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_builtin_covers_every_runtime() {
        let manager = RuntimeConfigManager::builtin();
        assert_eq!(manager.list_runtimes(), Runtime::all_variants().to_vec());
        assert!(manager.get_config(&Runtime::Jvm).unwrap().compile.is_some());
        assert_eq!(manager.get_memory_limit_mb(&Runtime::Python).unwrap(), 256);
    }

    #[test]
    fn test_load_overrides_builtin() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "runtimes": [ {{ "name": "python", "execution": {{ "command": "python3.12", "file_extension": "py" }}, "memory_limit_mb": 128 }} ] }}"#
        )
        .unwrap();

        let manager = RuntimeConfigManager::load(file.path()).unwrap();
        let python = manager.get_config(&Runtime::Python).unwrap();
        assert_eq!(python.execution.command, "python3.12");
        assert!(python.execution.args.is_empty());
        assert_eq!(python.memory_limit_mb, 128);
        // Untouched runtimes keep their defaults
        assert_eq!(manager.get_config(&Runtime::Node).unwrap().execution.command, "node");
    }

    #[test]
    fn test_load_rejects_unknown_runtime() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "runtimes": [ {{ "name": "cobol", "execution": {{ "command": "cobc", "file_extension": "cob" }}, "memory_limit_mb": 64 }} ] }}"#
        )
        .unwrap();

        let err = RuntimeConfigManager::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("cobol"));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let manager =
            RuntimeConfigManager::load_or_builtin(Path::new("/nonexistent/runtimes.json")).unwrap();
        assert_eq!(manager.list_runtimes().len(), 4);
        assert!(RuntimeConfigManager::load(Path::new("/nonexistent/runtimes.json")).is_err());
    }
}
