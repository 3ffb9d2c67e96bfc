use std::{error::Error as StdError, time::Duration};

/// What an [`LMClient`](crate::lm::LMClient) can report back to the core.
///
/// Clients own retries, rate limiting and circuit breaking, so an error
/// arriving here is final for that call: the core folds it into a failed
/// trajectory or evaluation and moves on. The variants only distinguish
/// what the core can say *about* the failure, not how the transport failed;
/// HTTP status codes, circuit state and the like stay inside the client.
#[derive(Debug, thiserror::Error)]
pub enum LmError {
    /// The client gave up on the call, its own deadline or the
    /// `RequestOptions` one having elapsed.
    #[error("LM call exceeded its {after:?} deadline")]
    DeadlineExceeded { after: Duration },

    /// The client answered, but with nothing usable as generated text.
    #[error("LM returned an unusable response: {detail}")]
    EmptyResponse { detail: String },

    /// Terminal client-side failure, already past the client's own retry
    /// policy. `client` names the implementation for telemetry.
    #[error("LM client `{client}` failed: {message}")]
    Client {
        client: String,
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
}

/// Failures of a single program execution.
#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("LM call failed: {source}")]
    Lm {
        #[source]
        source: LmError,
    },

    #[error("failed to parse LM response: {reason}")]
    Parse { reason: String, raw_response: String },

    #[error("program rejected inputs: {reason}")]
    InvalidInput { reason: String },
}

/// Input-validation and run-level failures of the evaluator.
///
/// Per-example failures never surface here; they are folded into the run's
/// statistics. The dynamic original also validated "is this a program" and
/// "is the metric a 2-arity callable" at this point; both checks are
/// discharged by the type system in this port.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("examples list is empty or contains items without both inputs and outputs")]
    InvalidExamples,

    #[error("evaluation cancelled")]
    Cancelled,
}

/// Top-level optimizer errors. The compile entry points return these and
/// never panic past the API boundary.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum OptimizeError {
    #[error("trainset is empty or not a list of examples")]
    InvalidOrEmptyTrainset,

    #[error("training example {index} is missing inputs or outputs")]
    InvalidTrainingData { index: usize },

    #[error("optimization failed: {reason}")]
    OptimizationFailed { reason: String },

    #[error("every trial configuration failed")]
    NoValidConfigurations,

    #[error("optimization cancelled")]
    Cancelled,
}

impl From<EvalError> for OptimizeError {
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::Cancelled => OptimizeError::Cancelled,
            EvalError::InvalidExamples => OptimizeError::InvalidOrEmptyTrainset,
        }
    }
}
