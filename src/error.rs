use std::sync::Arc;

use crate::repository::RepositoryError;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of [`FeatureManager`](crate::FeatureManager).
///
/// Evaluation itself never fails: whenever one of these is returned from an evaluation, it comes
/// with a fail-closed evaluation attached (see [`Fallback`]).
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The requested flag does not exist.
    #[error("flag not found: {0}")]
    FlagNotFound(String),

    /// The requested experiment does not exist.
    #[error("experiment not found: {0}")]
    ExperimentNotFound(String),

    /// The environment named in the evaluation context does not exist.
    #[error("environment not found: {0}")]
    EnvironmentNotFound(String),

    /// The backing store failed while serving a primary lookup.
    #[error(transparent)]
    Repository(RepositoryError),

    /// The background writer queue is full and the task was dropped.
    #[error("background queue is full")]
    QueueFull,

    /// The background writer is shut down and does not accept new tasks.
    #[error("background writer is shut down")]
    WriterStopped,

    /// Some background workers were still busy when the shutdown timeout expired.
    #[error("shutdown timed out with {busy_workers} worker(s) still running")]
    ShutdownTimedOut {
        /// Number of workers that had not exited yet.
        busy_workers: usize,
    },

    /// A background worker thread panicked. This should normally never happen.
    #[error("background worker thread panicked")]
    WorkerPanicked,

    /// An I/O error (e.g., failure to spawn a worker thread).
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

/// Errors raised while evaluating flag or segment rules.
///
/// These indicate misconfigured data and are never returned to the caller directly: the manager
/// logs them and serves a fail-closed evaluation instead.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// A segment condition uses an operator the evaluator does not know.
    #[error("unknown condition operator: {0}")]
    UnknownOperator(String),

    /// A `regex` condition holds a pattern that does not compile.
    #[error("invalid regex pattern {pattern:?}: {message}")]
    InvalidRegex {
        /// The offending pattern.
        pattern: String,
        /// Compiler message.
        message: String,
    },

    /// Targeting rules stored for the flag could not be parsed.
    #[error("malformed targeting rules")]
    MalformedTargetingRules,
}

/// A failed evaluation together with the fail-closed evaluation that should be served instead.
///
/// ```
/// # use flagwise::{FeatureEvaluation, Fallback};
/// # fn example(result: Result<FeatureEvaluation, Fallback<FeatureEvaluation>>) -> bool {
/// let evaluation = result.unwrap_or_else(Fallback::into_evaluation);
/// evaluation.enabled
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Fallback<T> {
    /// What went wrong.
    pub error: Error,
    /// Safe default to serve in place of the real decision.
    pub evaluation: T,
}

impl<T> Fallback<T> {
    pub(crate) fn new(error: Error, evaluation: T) -> Self {
        Fallback { error, evaluation }
    }

    /// Discard the error and keep the fallback evaluation.
    pub fn into_evaluation(self) -> T {
        self.evaluation
    }
}

impl<T> std::fmt::Display for Fallback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "evaluation fell back to default: {}", self.error)
    }
}

impl<T: std::fmt::Debug> std::error::Error for Fallback<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
