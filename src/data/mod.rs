//! Value types shared across the optimizers.
//!
//! [`Example`] and [`Prediction`] are the wire format for training items and
//! model outputs: string-keyed field maps with an explicit input-key set.
//! [`Trajectory`] records one program execution and [`Bucket`] groups the
//! trajectories sampled for one mini-batch example.

pub mod bucket;
pub mod example;
pub mod prediction;
pub mod trajectory;

pub use bucket::*;
pub use example::*;
pub use prediction::*;
pub use trajectory::*;
