use std::env;

/// Engine configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_total: usize,
    pub max_concurrent_per_runtime: usize,
    pub max_queue_depth: usize,
    pub health_max_queue_depth: usize,
    pub health_max_avg_wait_ms: f64,
    pub wait_sample_capacity: usize,
    pub violation_log_capacity: usize,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_output_bytes: usize,
    pub kill_grace_ms: u64,
    pub service_timeout_buffer_ms: u64,
    pub sql_max_rows: usize,
    pub runtime_config_path: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::defaults();
        Self {
            max_concurrent_total: env_or("GAUNTLET_MAX_CONCURRENT_TOTAL", defaults.max_concurrent_total),
            max_concurrent_per_runtime: env_or(
                "GAUNTLET_MAX_CONCURRENT_PER_RUNTIME",
                defaults.max_concurrent_per_runtime,
            ),
            max_queue_depth: env_or("GAUNTLET_MAX_QUEUE_DEPTH", defaults.max_queue_depth),
            health_max_queue_depth: env_or(
                "GAUNTLET_HEALTH_MAX_QUEUE_DEPTH",
                defaults.health_max_queue_depth,
            ),
            health_max_avg_wait_ms: env_or(
                "GAUNTLET_HEALTH_MAX_AVG_WAIT_MS",
                defaults.health_max_avg_wait_ms,
            ),
            wait_sample_capacity: env_or("GAUNTLET_WAIT_SAMPLE_CAPACITY", defaults.wait_sample_capacity),
            violation_log_capacity: env_or(
                "GAUNTLET_VIOLATION_LOG_CAPACITY",
                defaults.violation_log_capacity,
            ),
            default_timeout_ms: env_or("GAUNTLET_DEFAULT_TIMEOUT_MS", defaults.default_timeout_ms),
            max_timeout_ms: env_or("GAUNTLET_MAX_TIMEOUT_MS", defaults.max_timeout_ms),
            max_output_bytes: env_or("GAUNTLET_MAX_OUTPUT_BYTES", defaults.max_output_bytes),
            kill_grace_ms: env_or("GAUNTLET_KILL_GRACE_MS", defaults.kill_grace_ms),
            service_timeout_buffer_ms: env_or(
                "GAUNTLET_SERVICE_TIMEOUT_BUFFER_MS",
                defaults.service_timeout_buffer_ms,
            ),
            sql_max_rows: env_or("GAUNTLET_SQL_MAX_ROWS", defaults.sql_max_rows),
            runtime_config_path: env::var("GAUNTLET_RUNTIME_CONFIG")
                .unwrap_or(defaults.runtime_config_path),
        }
    }

    /// Built-in values, no environment lookup
    pub fn defaults() -> Self {
        Self {
            max_concurrent_total: 8,
            max_concurrent_per_runtime: 4,
            max_queue_depth: 200,
            health_max_queue_depth: 50,
            health_max_avg_wait_ms: 10_000.0,
            wait_sample_capacity: 100,
            violation_log_capacity: 50,
            default_timeout_ms: 5000,
            max_timeout_ms: 30_000,
            max_output_bytes: 1024 * 1024,
            kill_grace_ms: 500,
            service_timeout_buffer_ms: 5000,
            sql_max_rows: 1000,
            runtime_config_path: "config/runtimes.json".to_string(),
        }
    }

    /// Zero selects the default; anything above the maximum is clamped
    pub fn effective_timeout_ms(&self, requested_ms: u64) -> u64 {
        if requested_ms == 0 {
            self.default_timeout_ms.min(self.max_timeout_ms)
        } else {
            requested_ms.min(self.max_timeout_ms)
        }
    }

    /// Orchestrator backstop, looser than the runner timeout
    pub fn service_timeout_ms(&self, timeout_ms: u64) -> u64 {
        timeout_ms.saturating_mul(2).saturating_add(self.service_timeout_buffer_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::defaults();
        assert_eq!(config.max_concurrent_total, 8);
        assert_eq!(config.max_concurrent_per_runtime, 4);
        assert_eq!(config.max_output_bytes, 1024 * 1024);
        assert_eq!(config.sql_max_rows, 1000);
        assert_eq!(config.wait_sample_capacity, 100);
    }

    #[test]
    fn test_effective_timeout() {
        let config = EngineConfig::defaults();
        assert_eq!(config.effective_timeout_ms(0), 5000);
        assert_eq!(config.effective_timeout_ms(250), 250);
        assert_eq!(config.effective_timeout_ms(120_000), 30_000);
    }

    #[test]
    fn test_service_timeout_is_looser() {
        let config = EngineConfig::defaults();
        assert_eq!(config.service_timeout_ms(1000), 7000);
        assert!(config.service_timeout_ms(u64::MAX) == u64::MAX);
    }
}
