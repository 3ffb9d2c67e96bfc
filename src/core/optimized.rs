use std::sync::Arc;

use async_trait::async_trait;

use crate::core::errors::ProgramError;
use crate::core::program::{ForwardOptions, Program, ProgramCapability};
use crate::data::{Example, Fields, Prediction};

/// How an optimizer writes its results onto a program, chosen by capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnhancementStrategy {
    NativeFull,
    NativeDemos,
    WrapOptimized,
}

pub fn enhancement_strategy(program: &dyn Program) -> EnhancementStrategy {
    match program.capability() {
        ProgramCapability::NativeFull => EnhancementStrategy::NativeFull,
        ProgramCapability::NativeDemos => EnhancementStrategy::NativeDemos,
        ProgramCapability::WrapRequired => EnhancementStrategy::WrapOptimized,
    }
}

/// A base program plus the demos, instruction and metadata an optimizer
/// attached to it.
///
/// When the base holds the fields natively they are written there by
/// structural replacement and `forward` delegates untouched; otherwise the
/// wrapper injects them through [`ForwardOptions`] at call time. Either way
/// callers read `demos()`, `instruction()` and `metadata()` off the wrapper
/// uniformly. Immutable; `with_demos`/`with_instruction` replace, never
/// accumulate.
#[derive(Clone)]
pub struct OptimizedProgram {
    base: Arc<dyn Program>,
    demos: Vec<Example>,
    instruction: Option<String>,
    metadata: Fields,
    strategy: EnhancementStrategy,
}

impl std::fmt::Debug for OptimizedProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimizedProgram")
            .field("base", &self.base.name())
            .field("demos", &self.demos.len())
            .field("instruction", &self.instruction)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl OptimizedProgram {
    pub fn new(base: Arc<dyn Program>, demos: Vec<Example>, metadata: Fields) -> Self {
        enhance(base, demos, None, metadata)
    }

    pub fn base(&self) -> &Arc<dyn Program> {
        &self.base
    }

    pub fn strategy(&self) -> EnhancementStrategy {
        self.strategy
    }

    pub fn into_program(self) -> Arc<dyn Program> {
        Arc::new(self)
    }
}

/// Applies `demos`/`instruction` to `base` along whichever path its
/// capability permits and returns the wrapper carrying `metadata`.
pub fn enhance(
    base: Arc<dyn Program>,
    demos: Vec<Example>,
    instruction: Option<String>,
    metadata: Fields,
) -> OptimizedProgram {
    let strategy = enhancement_strategy(base.as_ref());

    let base = match strategy {
        EnhancementStrategy::NativeFull => {
            let with_demos = base.with_demos(demos.clone()).unwrap_or(base);
            match &instruction {
                Some(text) => with_demos
                    .with_instruction(text.clone())
                    .unwrap_or(with_demos),
                None => with_demos,
            }
        }
        EnhancementStrategy::NativeDemos => base.with_demos(demos.clone()).unwrap_or(base),
        EnhancementStrategy::WrapOptimized => base,
    };

    OptimizedProgram {
        base,
        demos,
        instruction,
        metadata,
        strategy,
    }
}

#[async_trait]
impl Program for OptimizedProgram {
    async fn forward(
        &self,
        inputs: Fields,
        opts: &ForwardOptions,
    ) -> Result<Prediction, ProgramError> {
        let inject_instruction = !matches!(self.strategy, EnhancementStrategy::NativeFull);
        let inject_demos = matches!(self.strategy, EnhancementStrategy::WrapOptimized);

        if !inject_instruction && !inject_demos {
            return self.base.forward(inputs, opts).await;
        }

        let mut opts = opts.clone();
        if inject_instruction && opts.instruction.is_none() {
            opts.instruction = self.instruction.clone();
        }
        if inject_demos && opts.demos.is_empty() {
            opts.demos = self.demos.clone();
        }
        self.base.forward(inputs, &opts).await
    }

    fn capability(&self) -> ProgramCapability {
        ProgramCapability::NativeFull
    }

    fn name(&self) -> String {
        format!("optimized({})", self.base.name())
    }

    fn instruction(&self) -> Option<String> {
        self.instruction.clone()
    }

    fn demos(&self) -> Vec<Example> {
        self.demos.clone()
    }

    fn metadata(&self) -> Fields {
        self.metadata.clone()
    }

    fn with_instruction(&self, instruction: String) -> Option<Arc<dyn Program>> {
        Some(Arc::new(enhance(
            self.base.clone(),
            self.demos.clone(),
            Some(instruction),
            self.metadata.clone(),
        )))
    }

    fn with_demos(&self, demos: Vec<Example>) -> Option<Arc<dyn Program>> {
        Some(Arc::new(enhance(
            self.base.clone(),
            demos,
            self.instruction.clone(),
            self.metadata.clone(),
        )))
    }
}
