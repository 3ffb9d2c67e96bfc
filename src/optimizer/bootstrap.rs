use std::sync::Arc;
use std::time::{Duration, Instant};

use bon::Builder;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use serde_json::json;

use crate::core::{ForwardOptions, MetricFn, OptimizeError, OptimizedProgram, Program, enhance};
use crate::data::{Example, Fields, Prediction};
use crate::evaluate::{ProgressCallback, guarded_metric, report_progress};
use crate::utils::{correlation_id, default_concurrency};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Generates few-shot demonstrations by running a teacher program over the
/// trainset and keeping the predictions the metric rates above a quality
/// threshold.
///
/// Finding zero qualifying demos is a success, not an error: the returned
/// program carries an empty demo list and metadata explaining why, so callers
/// can detect the condition without special-casing failures.
///
/// ```ignore
/// let bootstrap = BootstrapFewShot::builder().max_bootstrapped_demos(4).build();
/// let optimized = bootstrap.compile(&student, &teacher, &trainset, &metric).await?;
/// ```
#[derive(Builder, Clone)]
pub struct BootstrapFewShot {
    #[builder(default = 4)]
    pub max_bootstrapped_demos: usize,
    /// Extra raw labeled examples appended after the bootstrapped demos.
    #[builder(default = 0)]
    pub max_labeled_demos: usize,
    #[builder(default = 0.7)]
    pub quality_threshold: f64,
    #[builder(default = default_concurrency())]
    pub max_concurrency: usize,
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
    /// Retries per training example when the teacher fails.
    #[builder(default = 2)]
    pub teacher_retries: usize,
    pub progress: Option<ProgressCallback>,
    pub correlation_id: Option<String>,
}

impl Default for BootstrapFewShot {
    fn default() -> Self {
        BootstrapFewShot::builder().build()
    }
}

impl BootstrapFewShot {
    pub async fn compile(
        &self,
        student: &Arc<dyn Program>,
        teacher: &Arc<dyn Program>,
        trainset: &[Example],
        metric: &MetricFn,
    ) -> Result<OptimizedProgram, OptimizeError> {
        let cid = self
            .correlation_id
            .clone()
            .unwrap_or_else(correlation_id);

        if let Err(err) = validate_trainset(trainset) {
            tracing::debug!(
                event = "teleprompter/bootstrap/exception",
                correlation_id = %cid,
                error = %err,
            );
            return Err(err);
        }

        tracing::debug!(
            event = "teleprompter/bootstrap/start",
            correlation_id = %cid,
            trainset = trainset.len(),
            quality_threshold = self.quality_threshold,
        );
        let started = Instant::now();

        let predictions = self.run_teacher(teacher, trainset, &cid).await;

        let mut scored: Vec<(usize, Example, f64)> = Vec::new();
        for (idx, prediction) in &predictions {
            let example = &trainset[*idx];
            let score = match guarded_metric(metric, example, prediction) {
                Ok(score) => score,
                // Metric crashes poison the candidate, not the run.
                Err(_) => -1.0,
            };
            if score >= self.quality_threshold {
                let demo = self.candidate_demo(example, prediction, *idx, teacher.as_ref());
                scored.push((*idx, demo, score));
            }
        }

        scored.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.max_bootstrapped_demos);

        let bootstrapped_from: Vec<usize> = scored.iter().map(|(idx, _, _)| *idx).collect();
        let mut demos: Vec<Example> = scored
            .into_iter()
            .map(|(_, demo, score)| demo.with_value("__quality_score", json!(score)))
            .collect();

        if self.max_labeled_demos > 0 {
            demos.extend(self.labeled_demos(trainset, &bootstrapped_from));
        }

        let mut metadata = Fields::new();
        metadata.insert("optimizer".into(), json!("BootstrapFewShot"));
        metadata.insert("teacher".into(), json!(teacher.name()));
        metadata.insert("quality_threshold".into(), json!(self.quality_threshold));
        metadata.insert("demo_count".into(), json!(demos.len()));
        metadata.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        if demos.is_empty() {
            metadata.insert(
                "demo_generation_result".into(),
                json!("no_quality_demonstrations"),
            );
            metadata.insert(
                "fallback_reason".into(),
                json!(format!(
                    "no teacher prediction scored at or above {}",
                    self.quality_threshold
                )),
            );
        }

        tracing::debug!(
            event = "teleprompter/bootstrap/stop",
            correlation_id = %cid,
            demos = demos.len(),
            duration_ms = started.elapsed().as_millis() as u64,
        );

        Ok(enhance(student.clone(), demos, None, metadata))
    }

    /// Runs the teacher over every example under bounded concurrency,
    /// retrying failures with a short backoff. Unrecoverable examples are
    /// dropped; bootstrap never fails because the teacher stumbled.
    async fn run_teacher(
        &self,
        teacher: &Arc<dyn Program>,
        trainset: &[Example],
        cid: &str,
    ) -> Vec<(usize, Prediction)> {
        let total = trainset.len();
        let progress = self.progress.clone();
        let completed = std::sync::atomic::AtomicUsize::new(0);

        let results: Vec<Option<(usize, Prediction)>> =
            stream::iter(trainset.iter().cloned().enumerate())
                .map(|(idx, example)| {
                    let teacher = Arc::clone(teacher);
                    let retries = self.teacher_retries;
                    let timeout = self.timeout;
                    let cid = cid.to_string();
                    async move {
                        let opts = ForwardOptions {
                            timeout: Some(timeout),
                            correlation_id: Some(cid),
                            ..Default::default()
                        };
                        for attempt in 0..=retries {
                            let forward =
                                tokio::time::timeout(timeout, teacher.forward(example.inputs(), &opts));
                            if let Ok(Ok(prediction)) = forward.await {
                                return Some((idx, prediction));
                            }
                            if attempt < retries {
                                tokio::time::sleep(RETRY_BACKOFF).await;
                            }
                        }
                        None
                    }
                })
                .buffer_unordered(self.max_concurrency.max(1))
                .inspect(|_| {
                    let done = completed.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                    if done % 10 == 0 || done == total {
                        report_progress(&progress, "bootstrap", done, total);
                    }
                })
                .collect()
                .await;

        results.into_iter().flatten().collect()
    }

    fn candidate_demo(
        &self,
        example: &Example,
        prediction: &Prediction,
        idx: usize,
        teacher: &dyn Program,
    ) -> Example {
        let mut data = example.inputs();
        for (key, value) in &prediction.data {
            data.insert(key.clone(), value.clone());
        }
        data.insert("__generated_by".into(), json!("BootstrapFewShot"));
        data.insert("__teacher".into(), json!(teacher.name()));
        data.insert("__original_example_id".into(), json!(idx));
        data.insert("__timestamp".into(), json!(Utc::now().to_rfc3339()));
        Example::new(data, example.input_keys.clone())
    }

    /// Raw labeled examples from training items that produced no bootstrapped
    /// demo, used to top up the demo list.
    fn labeled_demos(&self, trainset: &[Example], bootstrapped_from: &[usize]) -> Vec<Example> {
        trainset
            .iter()
            .enumerate()
            .filter(|(idx, _)| !bootstrapped_from.contains(idx))
            .take(self.max_labeled_demos)
            .map(|(_, example)| example.with_value("__generated_by", json!("labeled")))
            .collect()
    }
}

pub(crate) fn validate_trainset(trainset: &[Example]) -> Result<(), OptimizeError> {
    if trainset.is_empty() {
        return Err(OptimizeError::InvalidOrEmptyTrainset);
    }
    for (index, example) in trainset.iter().enumerate() {
        if !example.has_inputs_and_outputs() {
            return Err(OptimizeError::InvalidTrainingData { index });
        }
    }
    Ok(())
}
