//! Teleprompter optimization core for composed LM programs.
//!
//! Given a *student* program, a *teacher* program, a labeled trainset, and a
//! scalar metric, the optimizers in this crate produce a new student whose
//! expected metric score is higher. The LM transport, prompt formatting and
//! schema validation all live outside; the core consumes them through the
//! [`Program`] and [`LMClient`] traits.
//!
//! # The mental model
//!
//! Three layers:
//!
//! | Layer | Concept | Key types |
//! |-------|---------|-----------|
//! | **Data** | Labeled items, outputs, execution records | [`Example`], [`Prediction`], [`Trajectory`], [`Bucket`] |
//! | **Evaluation** | Bounded-concurrency scoring with fault isolation | [`Evaluator`], [`MetricFn`] |
//! | **Optimization** | Demo bootstrapping and search | [`BootstrapFewShot`], [`SIMBA`], [`BEACON`] |
//!
//! A [`Program`] is an opaque async value; optimizers inspect its
//! [`ProgramCapability`] to decide whether new instructions and demos are
//! written natively or injected through an [`OptimizedProgram`] wrapper.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use teleprompt::*;
//!
//! # async fn example(student: Arc<dyn Program>, teacher: Arc<dyn Program>,
//! #                  trainset: Vec<Example>) -> Result<(), OptimizeError> {
//! let metric: MetricFn = Arc::new(|example, prediction| {
//!     if prediction.get_str("answer", "") == example.get_str("answer", "!") { 1.0 } else { 0.0 }
//! });
//!
//! let bootstrap = BootstrapFewShot::builder().max_bootstrapped_demos(4).build();
//! let optimized = bootstrap.compile(&student, &teacher, &trainset, &metric).await?;
//! println!("{} demos", optimized.demos().len());
//! # Ok(())
//! # }
//! ```
//!
//! # Failure policy
//!
//! Input validation aborts before any LM call; everything after degrades:
//! per-example LM errors, timeouts and metric panics become score-0
//! trajectories or failed evaluations, and an empty bootstrap demo set is a
//! success whose metadata says why. The public APIs return
//! [`OptimizeError`]/[`EvalError`] and never panic past the boundary.
//!
//! # Crate organization
//!
//! - [`core`] — [`Program`] trait, capabilities, [`OptimizedProgram`], errors
//! - [`data`] — [`Example`], [`Prediction`], [`Trajectory`], [`Bucket`]
//! - [`lm`] — [`LMClient`] trait, [`Chat`]/[`Message`], [`ModelConfig`]
//! - [`providers`] — [`DummyLM`] scripted client for tests
//! - [`evaluate`] — [`Evaluator`], progress reporting
//! - [`optimizer`] — [`BootstrapFewShot`], [`SIMBA`], [`BEACON`],
//!   [`BayesianOptimizer`], [`InstructionProposer`], strategies
//! - [`utils`] — tracing setup, correlation ids, seeded RNG helpers

pub mod core;
pub mod data;
pub mod evaluate;
pub mod lm;
pub mod optimizer;
pub mod providers;
pub mod utils;

pub use crate::core::*;
pub use data::*;
pub use evaluate::*;
pub use lm::*;
pub use optimizer::*;
pub use providers::*;
pub use utils::*;
