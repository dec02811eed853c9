pub mod config;
pub mod types;

// Re-export commonly used types for convenience
pub use config::EngineConfig;
pub use types::{
    ExecutionRequest, ExecutionResponse, GradingResult, Language, Priority, Runtime, TestCase,
    TestResult,
};
