use gauntlet_common::types::{Language, Runtime};
use thiserror::Error;

/// Malformed execution request. This is a caller contract violation and the
/// only error that crosses the orchestrator boundary; execution-time failures
/// are always reported inside a `GradingResult`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Code is required")]
    EmptyCode,

    #[error("At least one test case is required")]
    NoTestCases,

    #[error("Language '{0}' has no execution runtime")]
    UnsupportedLanguage(Language),

    #[error("Language '{language}' cannot run on runtime '{runtime}'")]
    RuntimeMismatch { language: Language, runtime: Runtime },

    #[error("No runner is registered for runtime '{0}'")]
    RuntimeUnavailable(Runtime),

    #[error("entry_function is required for runtime '{0}'")]
    MissingEntryFunction(Runtime),

    #[error("entry_function '{0}' is not a valid identifier")]
    InvalidEntryFunction(String),

    #[error("Test case {index} is missing args")]
    MissingArgs { index: usize },

    #[error("Test case {index} is missing expected_rows")]
    MissingExpectedRows { index: usize },
}

/// Malformed fill-in-blank configuration. User answers never produce this.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlankConfigError {
    #[error("Blank at position {0} has an empty id")]
    EmptyId(usize),

    #[error("Duplicate blank id '{0}'")]
    DuplicateId(String),

    #[error("Blank '{0}' has no correct answers")]
    NoCorrectAnswers(String),

    #[error("Blank '{0}' has an empty correct answer")]
    EmptyCorrectAnswer(String),
}
