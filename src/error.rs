//! Error taxonomy for the inference engine.
//!
//! Retryable failures (bad formatting, execution failures, failing tests) never leave the
//! generation loop on their own; callers only ever observe the terminal variants below.

use crate::execute::RaisedException;
use crate::testing::ExitStatus;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CodespeakError>;

#[derive(Debug, Error)]
pub enum CodespeakError {
    #[error("Too many bad formatting versions")]
    FormattingExhausted,

    #[error("Unable to generate code that executes with the given arguments for {qualname}. Make sure your arguments are of the correct type, clarify your types, or modify your docstring.")]
    ExecutionExhausted { qualname: String },

    #[error("Unable to generate code that executes with the given arguments for {qualname}. Make sure your arguments are of the correct type, clarify your types, or modify your docstring.")]
    TestsExhausted { qualname: String },

    /// The generated logic raised the sentinel exception. Carries the unwrapped inner exception.
    #[error("{0}")]
    Intentional(RaisedException),

    /// Already-validated logic raised an exception outside the sentinel convention.
    #[error("{0}")]
    Raised(RaisedException),

    #[error("test run failed but produced no crash report")]
    MissingCrashReport,

    #[error("expected at most one crash report from a single targeted test, got {0}")]
    TooManyCrashReports(usize),

    #[error("abnormal test exit: {}", .0.description())]
    AbnormalTestExit(ExitStatus),

    #[error("cannot classify type: {0}")]
    Classification(String),

    #[error("cannot extract declaration: {0}")]
    Extraction(String),

    #[error("failed to load generated module: {0}")]
    Load(String),

    #[error("generated module does not define {0}")]
    Lookup(String),

    #[error("python gateway failure: {0}")]
    Gateway(String),

    #[error("model request failed: {0}")]
    Model(String),

    #[error("artifact store failure: {0}")]
    Store(String),

    #[error("no generated artifact at {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CodespeakError {
    /// Failures of the generated module itself (as opposed to the harness around it).
    pub fn is_artifact_defect(&self) -> bool {
        matches!(self, CodespeakError::Load(_) | CodespeakError::Lookup(_))
    }
}
