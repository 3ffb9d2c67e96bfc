//! Program evaluation over datasets.
//!
//! [`Evaluator`] runs a program over a list of examples under bounded
//! concurrency with per-example fault isolation: LM failures, timeouts and
//! metric panics become failed evaluations, never aborted runs.

pub mod evaluator;

pub use evaluator::*;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::core::MetricFn;
use crate::data::{Example, Prediction};

/// Snapshot handed to a progress callback.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    pub phase: &'static str,
    pub completed: usize,
    pub total: usize,
    pub percentage: f64,
}

/// Optional observer for long-running phases. Callback panics are isolated
/// and never affect the run.
pub type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

pub(crate) fn report_progress(
    callback: &Option<ProgressCallback>,
    phase: &'static str,
    completed: usize,
    total: usize,
) {
    let Some(callback) = callback else {
        return;
    };
    let progress = Progress {
        phase,
        completed,
        total,
        percentage: if total == 0 {
            100.0
        } else {
            completed as f64 * 100.0 / total as f64
        },
    };
    let _ = catch_unwind(AssertUnwindSafe(|| callback(&progress)));
}

/// Calls the metric inside a crash guard. Panics and non-finite results
/// become error reasons; valid scores are clamped to [0, 1].
pub(crate) fn guarded_metric(
    metric: &MetricFn,
    example: &Example,
    prediction: &Prediction,
) -> Result<f64, String> {
    match catch_unwind(AssertUnwindSafe(|| metric(example, prediction))) {
        Ok(score) if score.is_finite() => Ok(score.clamp(0.0, 1.0)),
        Ok(score) => Err(format!("invalid metric result: {score}")),
        Err(panic) => Err(format!("metric exception: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Fields;

    fn example() -> Example {
        let mut data = Fields::new();
        data.insert("q".into(), serde_json::json!("x"));
        data.insert("a".into(), serde_json::json!("y"));
        Example::new(data, vec!["q".into()])
    }

    #[test]
    fn panicking_metric_is_reported_not_propagated() {
        let metric: MetricFn = Arc::new(|_, _| panic!("boom"));
        let err = guarded_metric(&metric, &example(), &Prediction::default()).unwrap_err();
        assert!(err.contains("metric exception"));
        assert!(err.contains("boom"));
    }

    #[test]
    fn non_finite_scores_are_invalid() {
        let metric: MetricFn = Arc::new(|_, _| f64::NAN);
        let err = guarded_metric(&metric, &example(), &Prediction::default()).unwrap_err();
        assert!(err.contains("invalid metric result"));
    }

    #[test]
    fn valid_scores_are_clamped() {
        let metric: MetricFn = Arc::new(|_, _| 1.7);
        let score = guarded_metric(&metric, &example(), &Prediction::default()).unwrap();
        assert_eq!(score, 1.0);
    }

    #[test]
    fn progress_callback_panics_are_isolated() {
        let callback: ProgressCallback = Arc::new(|_| panic!("observer bug"));
        report_progress(&Some(callback), "evaluation", 1, 10);
    }
}
