//! Automatic program optimization.
//!
//! An optimizer takes a student program, a training set, and a metric, then
//! searches for instructions and few-shot demonstrations that raise the
//! student's expected score. Programs are never mutated: every optimizer
//! returns a new [`OptimizedProgram`](crate::core::OptimizedProgram) and the
//! caller decides what to do with it.
//!
//! # Choosing an optimizer
//!
//! | Optimizer | Strategy | Needs an LM of its own? | Cost |
//! |-----------|----------|-------------------------|------|
//! | [`BootstrapFewShot`] | Teacher-generated demos above a quality bar | No | Low (one teacher pass) |
//! | [`SIMBA`] | Mini-batch trajectory sampling + bucket strategies | Only for [`AppendRule`] | Medium (steps × batch × candidates) |
//! | [`BEACON`] | Bayesian search over (instruction × demo subset) | **Yes** (instruction proposals) | Medium (trials × validation slice) |
//!
//! All three share the same substrate: the
//! [`Evaluator`](crate::evaluate::Evaluator) for bounded-concurrency scoring
//! and the [`Trajectory`](crate::data::Trajectory)/[`Bucket`](crate::data::Bucket)
//! data model.

pub mod bayesian;
pub mod beacon;
pub mod bootstrap;
pub mod proposer;
pub mod simba;
pub mod strategy;

pub use bayesian::*;
pub use beacon::*;
pub use bootstrap::*;
pub use proposer::*;
pub use simba::*;
pub use strategy::*;
