use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::errors::ProgramError;
use crate::data::{Example, Fields, Prediction};

/// Which prompt-tuning fields a program exposes for structural replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramCapability {
    /// Both `instruction` and `demos` can be replaced natively.
    NativeFull,
    /// Only `demos` can be replaced natively.
    NativeDemos,
    /// Neither field exists; the program must be wrapped.
    WrapRequired,
}

/// Per-call options threaded into [`Program::forward`].
///
/// `instruction` and `demos` are the injection channel used by
/// [`OptimizedProgram`](crate::core::OptimizedProgram) when the wrapped
/// program cannot hold them natively.
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout: Option<Duration>,
    pub correlation_id: Option<String>,
    pub instruction: Option<String>,
    pub demos: Vec<Example>,
}

/// An executable LM program.
///
/// Programs are opaque values shared as `Arc<dyn Program>`; optimizers never
/// mutate one in place. "Mutation" happens by structural replacement through
/// [`Program::with_instruction`] / [`Program::with_demos`], which return a new
/// program (or `None` when [`Program::capability`] does not expose the field).
#[async_trait]
pub trait Program: Send + Sync {
    async fn forward(
        &self,
        inputs: Fields,
        opts: &ForwardOptions,
    ) -> Result<Prediction, ProgramError>;

    fn capability(&self) -> ProgramCapability {
        ProgramCapability::WrapRequired
    }

    fn name(&self) -> String {
        "program".to_string()
    }

    fn instruction(&self) -> Option<String> {
        None
    }

    fn demos(&self) -> Vec<Example> {
        Vec::new()
    }

    /// Optimizer-facing metadata attached by a previous compile pass.
    fn metadata(&self) -> Fields {
        Fields::new()
    }

    fn with_instruction(&self, _instruction: String) -> Option<Arc<dyn Program>> {
        None
    }

    fn with_demos(&self, _demos: Vec<Example>) -> Option<Arc<dyn Program>> {
        None
    }
}

/// Scores one prediction against its source example. Values outside [0, 1]
/// are clamped by the caller; panics and non-finite results degrade to failed
/// evaluations instead of aborting a run.
pub type MetricFn = Arc<dyn Fn(&Example, &Prediction) -> f64 + Send + Sync>;
