//! Pluggable improvement rules.
//!
//! A [`Strategy`] inspects a [`Bucket`] of trajectories for one example and
//! either produces a new candidate program or skips with a reason.
//! [`apply_first_applicable`] dispatches an ordered strategy list, halting on
//! the first success.

pub mod append_demo;
pub mod append_rule;

pub use append_demo::*;
pub use append_rule::*;

use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;

use crate::core::Program;
use crate::data::Bucket;
use crate::lm::LMClient;

#[derive(Clone)]
pub enum StrategyOutcome {
    Applied(Arc<dyn Program>),
    Skipped(String),
}

impl StrategyOutcome {
    pub fn program(self) -> Option<Arc<dyn Program>> {
        match self {
            StrategyOutcome::Applied(program) => Some(program),
            StrategyOutcome::Skipped(_) => None,
        }
    }
}

/// Shared knobs for strategy dispatch.
#[derive(Builder, Clone)]
pub struct StrategyOptions {
    #[builder(default = 4)]
    pub max_demos: usize,
    /// Input field values longer than this are truncated before a trajectory
    /// becomes a demo.
    #[builder(default = 100_000)]
    pub demo_input_field_maxlen: usize,
    /// Minimum best-to-worst score gap before AppendRule asks for feedback.
    #[builder(default = 0.1)]
    pub min_score_gap: f64,
    pub lm: Option<Arc<dyn LMClient>>,
    pub correlation_id: Option<String>,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        StrategyOptions::builder().build()
    }
}

/// A named rule that turns a bucket into a new program candidate.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn applicable(&self, _bucket: &Bucket, _opts: &StrategyOptions) -> bool {
        true
    }

    async fn apply(
        &self,
        bucket: &Bucket,
        source: Arc<dyn Program>,
        opts: &StrategyOptions,
    ) -> StrategyOutcome;
}

/// Sanity-checks a bucket and options before strategy dispatch.
///
/// Schema drift degrades to a skip rather than a hard failure so that a
/// malformed bucket can never abort an optimization step.
pub(crate) fn validate_bucket(bucket: &Bucket, opts: &StrategyOptions) -> Result<(), String> {
    if bucket.trajectory_count != bucket.trajectories.len() {
        return Err(format!(
            "trajectory_count {} does not match trajectories {}",
            bucket.trajectory_count,
            bucket.trajectories.len()
        ));
    }
    for trajectory in &bucket.trajectories {
        if !(0.0..=1.0).contains(&trajectory.score) {
            return Err(format!("trajectory score {} out of range", trajectory.score));
        }
        if trajectory.success == trajectory.error.is_some() {
            return Err("trajectory success flag disagrees with error presence".to_string());
        }
    }
    if bucket.trajectory_count > 0
        && !(bucket.min_score <= bucket.avg_score && bucket.avg_score <= bucket.max_score)
    {
        return Err("bucket stats are not ordered".to_string());
    }
    if opts.demo_input_field_maxlen == 0 {
        return Err("demo_input_field_maxlen must be positive".to_string());
    }
    Ok(())
}

/// Dispatches strategies in order: for each, check `applicable`, then
/// `apply`; halt on the first `Applied`. Returns the last skip reason (or a
/// generic one) when nothing applies.
pub async fn apply_first_applicable(
    strategies: &[Arc<dyn Strategy>],
    bucket: &Bucket,
    source: Arc<dyn Program>,
    opts: &StrategyOptions,
) -> StrategyOutcome {
    if let Err(reason) = validate_bucket(bucket, opts) {
        return StrategyOutcome::Skipped(format!("Validation failed: {reason}"));
    }

    let mut last_skip = "no strategies configured".to_string();
    for strategy in strategies {
        if strategy.name().is_empty() {
            return StrategyOutcome::Skipped("Validation failed: strategy has no name".to_string());
        }
        if !strategy.applicable(bucket, opts) {
            last_skip = format!("{} not applicable", strategy.name());
            continue;
        }
        match strategy.apply(bucket, source.clone(), opts).await {
            StrategyOutcome::Applied(program) => return StrategyOutcome::Applied(program),
            StrategyOutcome::Skipped(reason) => {
                last_skip = format!("{}: {}", strategy.name(), reason);
            }
        }
    }
    StrategyOutcome::Skipped(last_skip)
}
