use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bon::Builder;
use futures::StreamExt;
use futures::stream;
use tokio_util::sync::CancellationToken;

use crate::core::{EvalError, ForwardOptions, MetricFn, Program};
use crate::data::Example;
use crate::utils::{correlation_id, default_concurrency};

use super::{ProgressCallback, guarded_metric, report_progress};

const PROGRESS_EVERY: usize = 10;

/// Aggregate statistics for one evaluation run. Aggregates are
/// order-independent; the order in which examples complete is unspecified.
#[derive(Debug, Clone, Default)]
pub struct EvaluationStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration: Duration,
    pub success_rate: f64,
    /// Examples per second over the whole run.
    pub throughput: f64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    /// Mean score over successful evaluations, 0.0 when none succeeded.
    pub score: f64,
    pub stats: EvaluationStats,
}

enum ExampleOutcome {
    Scored(f64),
    Failed(String),
    Cancelled,
}

/// Runs a program over a list of examples under bounded concurrency.
///
/// Individual example failures never abort the run; only input validation
/// does. Cancellation terminates in-flight work and discards partial stats.
///
/// ```ignore
/// let evaluator = Evaluator::builder().max_concurrency(8).build();
/// let evaluation = evaluator.run(&program, &examples, &metric).await?;
/// println!("score: {:.3}", evaluation.score);
/// ```
#[derive(Builder, Clone)]
pub struct Evaluator {
    #[builder(default = default_concurrency())]
    pub max_concurrency: usize,
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
    pub progress: Option<ProgressCallback>,
    pub correlation_id: Option<String>,
    pub cancel: Option<CancellationToken>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Evaluator::builder().build()
    }
}

impl Evaluator {
    pub async fn run(
        &self,
        program: &Arc<dyn Program>,
        examples: &[Example],
        metric: &MetricFn,
    ) -> Result<Evaluation, EvalError> {
        let cid = self
            .correlation_id
            .clone()
            .unwrap_or_else(correlation_id);

        if let Err(err) = validate_examples(examples) {
            tracing::debug!(
                event = "evaluate/run/exception",
                correlation_id = %cid,
                error = %err,
            );
            return Err(err);
        }

        tracing::debug!(
            event = "evaluate/run/start",
            correlation_id = %cid,
            total = examples.len(),
        );

        let started = Instant::now();
        let total = examples.len();
        let completed = AtomicUsize::new(0);
        let progress = self.progress.clone();

        let outcomes: Vec<ExampleOutcome> = stream::iter(examples.iter().cloned().enumerate())
            .map(|(idx, example)| {
                let program = Arc::clone(program);
                let metric = Arc::clone(metric);
                let cancel = self.cancel.clone();
                let timeout = self.timeout;
                let cid = cid.clone();
                async move {
                    evaluate_example(idx, example, program, metric, timeout, cancel, cid).await
                }
            })
            .buffer_unordered(self.max_concurrency.max(1))
            .inspect(|_| {
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if done % PROGRESS_EVERY == 0 || done == total {
                    report_progress(&progress, "evaluation", done, total);
                }
            })
            .collect()
            .await;

        if outcomes
            .iter()
            .any(|outcome| matches!(outcome, ExampleOutcome::Cancelled))
        {
            tracing::debug!(event = "evaluate/run/exception", correlation_id = %cid, error = "cancelled");
            return Err(EvalError::Cancelled);
        }

        let duration = started.elapsed();
        let mut scores = Vec::new();
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                ExampleOutcome::Scored(score) => scores.push(score),
                ExampleOutcome::Failed(reason) => errors.push(reason),
                ExampleOutcome::Cancelled => unreachable!("cancelled runs return early"),
            }
        }

        let successful = scores.len();
        let failed = errors.len();
        let score = if successful == 0 {
            0.0
        } else {
            scores.iter().sum::<f64>() / successful as f64
        };

        let stats = EvaluationStats {
            total,
            successful,
            failed,
            duration,
            success_rate: successful as f64 / total as f64,
            throughput: if duration.as_secs_f64() > 0.0 {
                total as f64 / duration.as_secs_f64()
            } else {
                0.0
            },
            errors,
        };

        tracing::debug!(
            event = "evaluate/run/stop",
            correlation_id = %cid,
            score,
            successful,
            failed,
            duration_ms = duration.as_millis() as u64,
        );

        Ok(Evaluation { score, stats })
    }
}

fn validate_examples(examples: &[Example]) -> Result<(), EvalError> {
    if examples.is_empty() {
        return Err(EvalError::InvalidExamples);
    }
    if examples.iter().any(|ex| !ex.has_inputs_and_outputs()) {
        return Err(EvalError::InvalidExamples);
    }
    Ok(())
}

async fn evaluate_example(
    idx: usize,
    example: Example,
    program: Arc<dyn Program>,
    metric: MetricFn,
    timeout: Duration,
    cancel: Option<CancellationToken>,
    cid: String,
) -> ExampleOutcome {
    tracing::trace!(event = "evaluate/example/start", correlation_id = %cid, example = idx);
    let started = Instant::now();

    let opts = ForwardOptions {
        timeout: Some(timeout),
        correlation_id: Some(cid.clone()),
        ..Default::default()
    };

    let forward = tokio::time::timeout(timeout, program.forward(example.inputs(), &opts));
    let result = match &cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => return ExampleOutcome::Cancelled,
            result = forward => result,
        },
        None => forward.await,
    };

    let outcome = match result {
        Err(_) => ExampleOutcome::Failed(format!("timeout after {timeout:?}")),
        Ok(Err(err)) => ExampleOutcome::Failed(err.to_string()),
        Ok(Ok(prediction)) => match guarded_metric(&metric, &example, &prediction) {
            Ok(score) => ExampleOutcome::Scored(score),
            Err(reason) => ExampleOutcome::Failed(reason),
        },
    };

    tracing::trace!(
        event = "evaluate/example/stop",
        correlation_id = %cid,
        example = idx,
        duration_ms = started.elapsed().as_millis() as u64,
        success = matches!(outcome, ExampleOutcome::Scored(_)),
    );
    outcome
}
