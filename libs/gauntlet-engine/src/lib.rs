pub mod blanks;
pub mod compare;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod queue;
pub mod runners;
pub mod sandbox;
pub mod security;

#[cfg(test)]
mod testing;

pub use config::RuntimeConfigManager;
pub use error::{BlankConfigError, ValidationError};
pub use orchestrator::GradingOrchestrator;
pub use queue::ExecutionQueue;
pub use runners::LanguageRunner;
pub use security::SecurityScanner;
