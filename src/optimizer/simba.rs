use std::sync::Arc;
use std::time::{Duration, Instant};

use bon::Builder;
use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::{
    ForwardOptions, MetricFn, OptimizeError, OptimizedProgram, Program, enhance,
};
use crate::data::{Bucket, Example, Fields, Trajectory};
use crate::evaluate::{ProgressCallback, guarded_metric, report_progress};
use crate::lm::{LMClient, ModelConfig};
use crate::optimizer::bootstrap::validate_trainset;
use crate::optimizer::strategy::{
    AppendDemo, Strategy, StrategyOptions, StrategyOutcome, apply_first_applicable,
};
use crate::utils::{correlation_id, default_concurrency, seeded_rng};

/// Per-call deadline for trajectory sampling and candidate evaluation.
const LM_TIMEOUT: Duration = Duration::from_secs(30);
/// Nested evaluation fan-out, kept below the sampler's to avoid saturating
/// the pool under recursion.
const NESTED_CONCURRENCY: usize = 4;
/// Softmax prior for the baseline program before it has observed scores.
const BASELINE_PRIOR: f64 = 0.1;
/// Final selection evaluates winners on at most this many training examples.
const FINAL_SAMPLE: usize = 50;
/// Base sampling temperature for trajectory model configs.
const BASE_TEMPERATURE: f32 = 0.7;

fn default_strategies() -> Vec<Arc<dyn Strategy>> {
    vec![Arc::new(AppendDemo)]
}

/// Stochastic Introspective Mini-Batch Ascent.
///
/// Each step samples trajectories for a circular mini-batch under a spread of
/// temperatures, groups them into per-example [`Bucket`]s, applies the first
/// applicable [`Strategy`] to the most improvable buckets, and folds the
/// surviving candidates back into a softmax-sampled program pool. The final
/// program is the best of the per-step winners on a held sample, never worse
/// than the baseline student on that sample.
///
/// ```ignore
/// let simba = SIMBA::builder().bsize(16).max_steps(4).seed(7).build();
/// let optimized = simba.compile(&student, None, &trainset, &metric).await?;
/// ```
#[derive(Builder)]
pub struct SIMBA {
    /// Mini-batch size; batches wrap around the shuffled trainset.
    #[builder(default = 32)]
    pub bsize: usize,
    /// Trajectories sampled per example, and candidates produced per step.
    #[builder(default = 6)]
    pub num_candidates: usize,
    #[builder(default = 8)]
    pub max_steps: usize,
    #[builder(default = 4)]
    pub max_demos: usize,
    /// Softmax temperature when picking the program to sample with.
    #[builder(default = 0.2)]
    pub temperature_for_sampling: f64,
    /// Softmax temperature when picking a strategy's source program.
    #[builder(default = 0.2)]
    pub temperature_for_candidates: f64,
    #[builder(default = default_strategies())]
    pub strategies: Vec<Arc<dyn Strategy>>,
    #[builder(default = default_concurrency())]
    pub num_threads: usize,
    /// Program pool cap; pruning always retains the baseline.
    #[builder(default = 12)]
    pub max_pool_size: usize,
    #[builder(default = 5)]
    pub max_winning_programs: usize,
    /// A step's best candidate joins the winners only above this average.
    #[builder(default = 0.0)]
    pub winning_score_threshold: f64,
    /// LM used by instruction-editing strategies such as AppendRule.
    pub lm: Option<Arc<dyn LMClient>>,
    pub seed: Option<u64>,
    pub progress: Option<ProgressCallback>,
    pub correlation_id: Option<String>,
    pub cancel: Option<CancellationToken>,
}

/// Candidate programs with their observed scores. Index 0 is always the
/// baseline student; indices are compacted after pruning, so they are only
/// stable within a step.
struct ProgramPool {
    programs: Vec<Arc<dyn Program>>,
    program_scores: Vec<Vec<f64>>,
}

impl ProgramPool {
    fn new(baseline: Arc<dyn Program>) -> Self {
        Self {
            programs: vec![baseline],
            program_scores: vec![Vec::new()],
        }
    }

    fn len(&self) -> usize {
        self.programs.len()
    }

    /// Average observed score. The baseline gets a small prior before any
    /// observation so early softmax sampling does not starve it.
    fn average(&self, idx: usize) -> f64 {
        let scores = &self.program_scores[idx];
        if scores.is_empty() {
            if idx == 0 { BASELINE_PRIOR } else { 0.0 }
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        }
    }

    fn averages(&self) -> Vec<f64> {
        (0..self.len()).map(|idx| self.average(idx)).collect()
    }

    fn record(&mut self, idx: usize, score: f64) {
        self.program_scores[idx].push(score);
    }

    fn push(&mut self, program: Arc<dyn Program>, scores: Vec<f64>) {
        self.programs.push(program);
        self.program_scores.push(scores);
    }

    /// Retains the baseline plus the top scorers, then compacts indices.
    fn prune(&mut self, cap: usize) {
        let cap = cap.max(1);
        if self.programs.len() <= cap {
            return;
        }

        let mut ranked: Vec<usize> = (1..self.programs.len()).collect();
        ranked.sort_by(|&a, &b| {
            self.average(b)
                .partial_cmp(&self.average(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut keep: Vec<usize> = std::iter::once(0)
            .chain(ranked.into_iter().take(cap - 1))
            .collect();
        keep.sort_unstable();

        self.programs = keep.iter().map(|&idx| self.programs[idx].clone()).collect();
        self.program_scores = keep
            .iter()
            .map(|&idx| self.program_scores[idx].clone())
            .collect();
    }
}

/// One unit of trajectory sampling: (example × model config × chosen program).
struct SampleTask {
    exec_id: usize,
    example: Example,
    program: Arc<dyn Program>,
    program_idx: usize,
    config: ModelConfig,
}

impl SIMBA {
    pub async fn compile(
        &self,
        student: &Arc<dyn Program>,
        _teacher: Option<&Arc<dyn Program>>,
        trainset: &[Example],
        metric: &MetricFn,
    ) -> Result<OptimizedProgram, OptimizeError> {
        let cid = self
            .correlation_id
            .clone()
            .unwrap_or_else(correlation_id);

        if let Err(err) = validate_trainset(trainset) {
            tracing::debug!(event = "teleprompter/simba/error", correlation_id = %cid, error = %err);
            return Err(err);
        }

        tracing::debug!(
            event = "teleprompter/simba/start",
            correlation_id = %cid,
            trainset = trainset.len(),
            bsize = self.bsize,
            num_candidates = self.num_candidates,
            max_steps = self.max_steps,
        );
        let started = Instant::now();

        let mut rng = seeded_rng(self.seed);
        let result = self
            .run_loop(student, trainset, metric, &mut rng, &cid)
            .await;

        match result {
            Ok((program, score, steps)) => {
                tracing::debug!(
                    event = "teleprompter/simba/stop",
                    correlation_id = %cid,
                    score,
                    steps,
                    duration_ms = started.elapsed().as_millis() as u64,
                );

                let mut metadata = Fields::new();
                metadata.insert("optimizer".into(), json!("SIMBA"));
                metadata.insert("steps".into(), json!(steps));
                metadata.insert("final_score".into(), json!(score));
                metadata.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
                metadata.insert("correlation_id".into(), json!(cid));

                Ok(enhance(
                    program.clone(),
                    program.demos(),
                    program.instruction(),
                    metadata,
                ))
            }
            Err(OptimizeError::Cancelled) => {
                tracing::debug!(event = "teleprompter/simba/error", correlation_id = %cid, error = "cancelled");
                Err(OptimizeError::Cancelled)
            }
            // Anything else escaping the loop is an optimization failure.
            Err(err) => {
                tracing::debug!(event = "teleprompter/simba/error", correlation_id = %cid, error = %err);
                Err(OptimizeError::OptimizationFailed {
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn run_loop(
        &self,
        student: &Arc<dyn Program>,
        trainset: &[Example],
        metric: &MetricFn,
        rng: &mut StdRng,
        cid: &str,
    ) -> Result<(Arc<dyn Program>, f64, usize), OptimizeError> {
        let num_candidates = self.num_candidates.max(1);
        let mut data_indices: Vec<usize> = (0..trainset.len()).collect();
        data_indices.shuffle(rng);

        let mut pool = ProgramPool::new(student.clone());
        let mut winning: Vec<Arc<dyn Program>> = vec![student.clone()];

        for step in 0..self.max_steps {
            self.check_cancelled()?;
            tracing::debug!(event = "teleprompter/simba/iteration/start", correlation_id = %cid, step);
            let step_started = Instant::now();

            let batch = self.mini_batch(step, trainset, &data_indices);
            let configs = self.model_configs(num_candidates);

            // One trajectory per (example, model config); exec_id encodes the
            // example index so grouping survives unordered completion.
            let mut tasks = Vec::with_capacity(batch.len() * configs.len());
            let averages = pool.averages();
            for (example_idx, example) in batch.iter().enumerate() {
                for (model_idx, config) in configs.iter().enumerate() {
                    let program_idx =
                        softmax_sample(rng, &averages, self.temperature_for_sampling);
                    tasks.push(SampleTask {
                        exec_id: example_idx * num_candidates + model_idx,
                        example: example.clone(),
                        program: pool.programs[program_idx].clone(),
                        program_idx,
                        config: config.clone(),
                    });
                }
            }

            let sampled = self.sample_trajectories(tasks, metric, cid).await?;
            for (program_idx, trajectory) in &sampled {
                pool.record(*program_idx, trajectory.score);
            }

            tracing::debug!(event = "teleprompter/simba/bucket/start", correlation_id = %cid, step);
            let buckets = form_buckets(
                sampled.into_iter().map(|(_, t)| t).collect(),
                num_candidates,
            );
            for bucket in &buckets {
                tracing::trace!(
                    event = "teleprompter/simba/bucket/created",
                    correlation_id = %cid,
                    trajectories = bucket.trajectory_count,
                    max_score = bucket.max_score,
                    max_to_min_gap = bucket.max_to_min_gap,
                );
            }

            let candidates = self
                .build_candidates(&buckets, &pool, rng, num_candidates, cid)
                .await?;

            let mut evaluated: Vec<(Arc<dyn Program>, Vec<f64>, f64)> = Vec::new();
            for candidate in candidates {
                self.check_cancelled()?;
                let scores = self.evaluate_on_batch(&candidate, &batch, metric, cid).await?;
                let average = mean(&scores);
                evaluated.push((candidate, scores, average));
            }

            if let Some((best, _, best_score)) = evaluated
                .iter()
                .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(p, s, a)| (p.clone(), s.clone(), *a))
            {
                if best_score > self.winning_score_threshold {
                    winning.insert(0, best);
                    winning.truncate(self.max_winning_programs.max(1));
                }
            }

            for (program, scores, _) in evaluated {
                pool.push(program, scores);
            }
            pool.prune(self.max_pool_size);

            report_progress(&self.progress, "simba", step + 1, self.max_steps);
            tracing::debug!(
                event = "teleprompter/simba/iteration/stop",
                correlation_id = %cid,
                step,
                pool = pool.len(),
                winners = winning.len(),
                duration_ms = step_started.elapsed().as_millis() as u64,
            );
        }

        let (best, score) = self
            .select_final(student, &winning, trainset, metric, rng, cid)
            .await?;
        Ok((best, score, self.max_steps))
    }

    /// Circular mini-batch: `bsize` examples starting at `step * bsize`
    /// modulo the shuffled index list.
    fn mini_batch(&self, step: usize, trainset: &[Example], data_indices: &[usize]) -> Vec<Example> {
        let bsize = self.bsize.max(1);
        (0..bsize)
            .map(|offset| {
                let position = (step * bsize + offset) % data_indices.len();
                trainset[data_indices[position]].clone()
            })
            .collect()
    }

    /// Temperature spread for trajectory sampling, deduplicated.
    fn model_configs(&self, num_candidates: usize) -> Vec<ModelConfig> {
        let mut temperatures = vec![BASE_TEMPERATURE];
        for i in 1..num_candidates {
            temperatures.push(BASE_TEMPERATURE + i as f32 * (0.5 / num_candidates as f32));
        }
        temperatures.dedup_by(|a, b| (*a - *b).abs() < f32::EPSILON);

        temperatures
            .into_iter()
            .map(|temperature| ModelConfig::builder().temperature(temperature).build())
            .collect()
    }

    async fn sample_trajectories(
        &self,
        tasks: Vec<SampleTask>,
        metric: &MetricFn,
        cid: &str,
    ) -> Result<Vec<(usize, Trajectory)>, OptimizeError> {
        let results: Vec<Option<(usize, Trajectory)>> = stream::iter(tasks)
            .map(|task| {
                let metric = Arc::clone(metric);
                let cancel = self.cancel.clone();
                let cid = cid.to_string();
                async move {
                    tracing::trace!(event = "teleprompter/simba/trajectory/start", correlation_id = %cid, exec_id = task.exec_id);
                    let opts = ForwardOptions {
                        temperature: Some(task.config.temperature),
                        timeout: Some(LM_TIMEOUT),
                        correlation_id: Some(cid.clone()),
                        ..Default::default()
                    };
                    let inputs = task.example.inputs();
                    let started = Instant::now();

                    let forward = tokio::time::timeout(LM_TIMEOUT, task.program.forward(inputs.clone(), &opts));
                    let outcome = match &cancel {
                        Some(token) => tokio::select! {
                            _ = token.cancelled() => return None,
                            result = forward => result,
                        },
                        None => forward.await,
                    };

                    let duration = started.elapsed();
                    let trajectory = match outcome {
                        Err(_) => failed_trajectory(&task, inputs, None, format!("timeout after {LM_TIMEOUT:?}"), duration),
                        Ok(Err(err)) => failed_trajectory(&task, inputs, None, err.to_string(), duration),
                        Ok(Ok(prediction)) => {
                            match guarded_metric(&metric, &task.example, &prediction) {
                                Ok(score) => Trajectory {
                                    program: task.program.clone(),
                                    example: task.example.clone(),
                                    inputs,
                                    outputs: Some(prediction),
                                    score,
                                    duration,
                                    model_config: task.config.clone(),
                                    success: true,
                                    error: None,
                                    exec_id: task.exec_id,
                                },
                                Err(reason) => {
                                    failed_trajectory(&task, inputs, Some(prediction), reason, duration)
                                }
                            }
                        }
                    };

                    tracing::trace!(
                        event = "teleprompter/simba/trajectory/sampled",
                        correlation_id = %cid,
                        exec_id = trajectory.exec_id,
                        score = trajectory.score,
                        success = trajectory.success,
                    );
                    Some((task.program_idx, trajectory))
                }
            })
            .buffer_unordered(self.num_threads.max(1))
            .collect()
            .await;

        if results.iter().any(Option::is_none) {
            return Err(OptimizeError::Cancelled);
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Applies the first applicable strategy to each of the most improvable
    /// buckets, sampling a source program from the pool for each.
    async fn build_candidates(
        &self,
        buckets: &[Bucket],
        pool: &ProgramPool,
        rng: &mut StdRng,
        num_candidates: usize,
        cid: &str,
    ) -> Result<Vec<Arc<dyn Program>>, OptimizeError> {
        let strategy_opts = StrategyOptions::builder()
            .max_demos(self.max_demos)
            .maybe_lm(self.lm.clone())
            .correlation_id(cid.to_string())
            .build();

        let averages = pool.averages();
        let mut candidates = Vec::new();

        for bucket in buckets
            .iter()
            .filter(|b| b.has_improvement_potential())
            .take(num_candidates)
        {
            self.check_cancelled()?;
            let source_idx = softmax_sample(rng, &averages, self.temperature_for_candidates);
            let source = pool.programs[source_idx].clone();

            tracing::trace!(event = "teleprompter/simba/strategy/start", correlation_id = %cid, source = source_idx);
            match apply_first_applicable(&self.strategies, bucket, source, &strategy_opts).await {
                StrategyOutcome::Applied(program) => {
                    tracing::trace!(event = "teleprompter/simba/strategy/applied", correlation_id = %cid);
                    candidates.push(program);
                }
                StrategyOutcome::Skipped(reason) => {
                    tracing::trace!(correlation_id = %cid, reason = %reason, "strategy skipped");
                }
            }
        }
        Ok(candidates)
    }

    /// Scores a candidate on the mini-batch. Failures count as 0.0 so the
    /// average stays comparable across candidates.
    async fn evaluate_on_batch(
        &self,
        program: &Arc<dyn Program>,
        batch: &[Example],
        metric: &MetricFn,
        cid: &str,
    ) -> Result<Vec<f64>, OptimizeError> {
        let nested = self.num_threads.clamp(1, NESTED_CONCURRENCY);

        let results: Vec<Option<f64>> = stream::iter(batch.iter().cloned())
            .map(|example| {
                let program = Arc::clone(program);
                let metric = Arc::clone(metric);
                let cancel = self.cancel.clone();
                let cid = cid.to_string();
                async move {
                    let opts = ForwardOptions {
                        timeout: Some(LM_TIMEOUT),
                        correlation_id: Some(cid),
                        ..Default::default()
                    };
                    let forward = tokio::time::timeout(LM_TIMEOUT, program.forward(example.inputs(), &opts));
                    let outcome = match &cancel {
                        Some(token) => tokio::select! {
                            _ = token.cancelled() => return None,
                            result = forward => result,
                        },
                        None => forward.await,
                    };
                    let score = match outcome {
                        Ok(Ok(prediction)) => {
                            guarded_metric(&metric, &example, &prediction).unwrap_or(0.0)
                        }
                        _ => 0.0,
                    };
                    Some(score)
                }
            })
            .buffer_unordered(nested)
            .collect()
            .await;

        if results.iter().any(Option::is_none) {
            return Err(OptimizeError::Cancelled);
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Evaluates the winners (baseline always included) on a random sample
    /// of the trainset and returns the argmax.
    async fn select_final(
        &self,
        baseline: &Arc<dyn Program>,
        winning: &[Arc<dyn Program>],
        trainset: &[Example],
        metric: &MetricFn,
        rng: &mut StdRng,
        cid: &str,
    ) -> Result<(Arc<dyn Program>, f64), OptimizeError> {
        let mut indices: Vec<usize> = (0..trainset.len()).collect();
        indices.shuffle(rng);
        let sample: Vec<Example> = indices
            .into_iter()
            .take(FINAL_SAMPLE)
            .map(|idx| trainset[idx].clone())
            .collect();

        let mut candidates: Vec<Arc<dyn Program>> = vec![baseline.clone()];
        candidates.extend(
            winning
                .iter()
                .filter(|program| !Arc::ptr_eq(program, baseline))
                .cloned(),
        );

        let mut best: (Arc<dyn Program>, f64) = (baseline.clone(), f64::MIN);
        for candidate in candidates {
            let scores = self.evaluate_on_batch(&candidate, &sample, metric, cid).await?;
            let average = mean(&scores);
            if average > best.1 {
                best = (candidate, average);
            }
        }
        Ok(best)
    }

    fn check_cancelled(&self) -> Result<(), OptimizeError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(OptimizeError::Cancelled),
            _ => Ok(()),
        }
    }
}

fn failed_trajectory(
    task: &SampleTask,
    inputs: Fields,
    outputs: Option<crate::data::Prediction>,
    error: String,
    duration: Duration,
) -> Trajectory {
    Trajectory {
        program: task.program.clone(),
        example: task.example.clone(),
        inputs,
        outputs,
        score: 0.0,
        duration,
        model_config: task.config.clone(),
        success: false,
        error: Some(error),
        exec_id: task.exec_id,
    }
}

/// Groups trajectories by `exec_id / num_candidates` and sorts the resulting
/// buckets most-improvable first.
fn form_buckets(trajectories: Vec<Trajectory>, num_candidates: usize) -> Vec<Bucket> {
    let mut groups: std::collections::BTreeMap<usize, Vec<Trajectory>> =
        std::collections::BTreeMap::new();
    for trajectory in trajectories {
        groups
            .entry(trajectory.exec_id / num_candidates.max(1))
            .or_default()
            .push(trajectory);
    }

    let mut buckets: Vec<Bucket> = groups
        .into_values()
        .map(Bucket::from_trajectories)
        .collect();

    buckets.sort_by(|a, b| {
        b.max_to_min_gap
            .partial_cmp(&a.max_to_min_gap)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                b.max_score
                    .partial_cmp(&a.max_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(
                b.max_to_avg_gap
                    .partial_cmp(&a.max_to_avg_gap)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
    buckets
}

/// Temperature-scaled softmax draw over average scores; argmax at zero
/// temperature.
fn softmax_sample(rng: &mut StdRng, averages: &[f64], temperature: f64) -> usize {
    if averages.len() <= 1 {
        return 0;
    }

    if temperature <= f64::EPSILON {
        let mut best = 0;
        for (idx, score) in averages.iter().enumerate() {
            if *score > averages[best] {
                best = idx;
            }
        }
        return best;
    }

    let max = averages.iter().cloned().fold(f64::MIN, f64::max);
    let weights: Vec<f64> = averages
        .iter()
        .map(|score| ((score - max) / temperature).exp())
        .collect();
    let total: f64 = weights.iter().sum();

    let mut draw = rng.gen_range(0.0..total);
    for (idx, weight) in weights.iter().enumerate() {
        draw -= weight;
        if draw <= 0.0 {
            return idx;
        }
    }
    weights.len() - 1
}

fn mean(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64
}
