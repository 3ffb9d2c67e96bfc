use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bon::Builder;
use chrono::Utc;
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::core::{
    MetricFn, OptimizeError, OptimizedProgram, Program, SignatureInfo, enhance,
};
use crate::data::{Example, Fields};
use crate::evaluate::{Evaluator, ProgressCallback, report_progress};
use crate::lm::LMClient;
use crate::optimizer::bayesian::{
    AcquisitionFunction, BayesianOptimizer, DemoCandidate, InstructionCandidate, Objective,
    SearchSpace, TrialConfiguration,
};
use crate::optimizer::bootstrap::{BootstrapFewShot, validate_trainset};
use crate::optimizer::proposer::InstructionProposer;
use crate::utils::{correlation_id, default_concurrency, seeded_rng};

/// Fan-out for the nested validation evaluations inside the objective.
const OBJECTIVE_CONCURRENCY: usize = 4;
/// Validation subsets never exceed this many examples.
const MAX_VALIDATION_SUBSET: usize = 10;

/// Bayesian-search teleprompter: bootstraps demo candidates, proposes
/// instruction candidates, then lets [`BayesianOptimizer`] pick the best
/// (instruction, demo subset) pair on random validation slices.
///
/// ```ignore
/// let beacon = BEACON::builder().lm(lm).num_trials(20).build();
/// let optimized = beacon.compile(&student, &teacher, &trainset, &metric).await?;
/// ```
#[derive(Builder)]
pub struct BEACON {
    /// Instruction candidates requested from the proposer.
    #[builder(default = 6)]
    pub num_candidates: usize,
    /// Total trial budget for the surrogate search.
    #[builder(default = 20)]
    pub num_trials: usize,
    #[builder(default = 4)]
    pub max_bootstrapped_demos: usize,
    #[builder(default = 4)]
    pub max_demos_per_trial: usize,
    #[builder(default = default_concurrency())]
    pub max_concurrency: usize,
    #[builder(default = Duration::from_secs(30))]
    pub timeout: Duration,
    /// LM used to generate instruction candidates.
    pub lm: Arc<dyn LMClient>,
    pub seed: Option<u64>,
    pub progress: Option<ProgressCallback>,
    pub correlation_id: Option<String>,
    pub cancel: Option<CancellationToken>,
}

impl BEACON {
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

        validate_trainset(trainset)?;

        tracing::debug!(
            event = "teleprompter/beacon/start",
            correlation_id = %cid,
            trainset = trainset.len(),
            num_trials = self.num_trials,
        );
        let started = Instant::now();

        // Bootstrap filters by teacher quality already, so demo candidacy
        // is decided with a constant metric.
        let constant_metric: MetricFn = Arc::new(|_, _| 1.0);
        let bootstrap = BootstrapFewShot::builder()
            .max_bootstrapped_demos(self.max_bootstrapped_demos)
            .max_concurrency(self.max_concurrency)
            .timeout(self.timeout)
            .maybe_progress(self.progress.clone())
            .correlation_id(cid.clone())
            .build();
        let bootstrapped = bootstrap
            .compile(student, teacher, trainset, &constant_metric)
            .await?;
        self.check_cancelled()?;

        let demo_candidates: Vec<DemoCandidate> = bootstrapped
            .demos()
            .into_iter()
            .enumerate()
            .map(|(idx, demo)| DemoCandidate {
                id: format!("bootstrap_{idx}"),
                demo,
                quality: 1.0,
            })
            .collect();
        report_progress(&self.progress, "beacon", 1, 3);

        tracing::debug!(event = "teleprompter/beacon/instruction/start", correlation_id = %cid);
        let signature = SignatureInfo::from_examples(trainset);
        let proposer = InstructionProposer::builder()
            .num_candidates(self.num_candidates)
            .max_concurrency(self.max_concurrency.clamp(1, OBJECTIVE_CONCURRENCY))
            .timeout(self.timeout)
            .correlation_id(cid.clone())
            .build();
        let samples = &trainset[..trainset.len().min(3)];
        let instructions = proposer.propose(&self.lm, &signature, samples).await;
        tracing::debug!(
            event = "teleprompter/beacon/instruction/stop",
            correlation_id = %cid,
            candidates = instructions.len(),
        );
        self.check_cancelled()?;

        let instruction_candidates: Vec<InstructionCandidate> = instructions
            .into_iter()
            .enumerate()
            .map(|(idx, instruction)| InstructionCandidate {
                id: format!("inst_{idx}"),
                instruction,
            })
            .collect();
        report_progress(&self.progress, "beacon", 2, 3);

        let space = SearchSpace {
            instructions: instruction_candidates,
            demos: demo_candidates,
        };
        let objective = ValidationObjective::new(self, student.clone(), &space, trainset, metric);

        tracing::debug!(event = "teleprompter/beacon/optimization/start", correlation_id = %cid);
        let num_trials = self.num_trials.max(1);
        let optimizer = BayesianOptimizer::builder()
            .max_iterations(num_trials)
            .num_initial_samples((num_trials / 3).clamp(1, 10))
            .convergence_patience(5)
            .acquisition(AcquisitionFunction::ExpectedImprovement)
            .max_demos_per_trial(self.max_demos_per_trial)
            .maybe_seed(self.seed)
            .correlation_id(cid.clone())
            .build();

        let result = match optimizer.optimize(&space, &objective).await {
            Ok(result) => result,
            Err(err) => {
                tracing::debug!(
                    event = "teleprompter/beacon/optimization/exception",
                    correlation_id = %cid,
                    error = %err,
                );
                return Err(if self.is_cancelled() {
                    OptimizeError::Cancelled
                } else {
                    err
                });
            }
        };
        tracing::debug!(
            event = "teleprompter/beacon/optimization/stop",
            correlation_id = %cid,
            best_score = result.best_score,
            trials = result.stats.total_trials,
        );
        self.check_cancelled()?;
        report_progress(&self.progress, "beacon", 3, 3);

        let (best_instruction, best_demos) = objective.resolve(&result.best_configuration);

        let mut metadata = Fields::new();
        metadata.insert("optimizer".into(), json!("BEACON"));
        metadata.insert("best_instruction".into(), json!(best_instruction));
        metadata.insert("best_score".into(), json!(result.best_score));
        metadata.insert("trials".into(), json!(result.stats.total_trials));
        metadata.insert(
            "convergence_iteration".into(),
            json!(result.convergence_iteration),
        );
        metadata.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        metadata.insert("correlation_id".into(), json!(cid));

        tracing::debug!(
            event = "teleprompter/beacon/stop",
            correlation_id = %cid,
            duration_ms = started.elapsed().as_millis() as u64,
        );

        Ok(enhance(
            student.clone(),
            best_demos,
            Some(best_instruction),
            metadata,
        ))
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    fn check_cancelled(&self) -> Result<(), OptimizeError> {
        if self.is_cancelled() {
            Err(OptimizeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Objective for the surrogate search: enhance the student with the trial's
/// instruction and demos, then evaluate on a random validation slice.
struct ValidationObjective {
    student: Arc<dyn Program>,
    instructions: IndexMap<String, String>,
    demos: IndexMap<String, Example>,
    trainset: Vec<Example>,
    metric: MetricFn,
    subset_size: usize,
    evaluator: Evaluator,
    rng: Mutex<rand::rngs::StdRng>,
}

impl ValidationObjective {
    fn new(
        beacon: &BEACON,
        student: Arc<dyn Program>,
        space: &SearchSpace,
        trainset: &[Example],
        metric: &MetricFn,
    ) -> Self {
        let evaluator = Evaluator::builder()
            .max_concurrency(beacon.max_concurrency.clamp(1, OBJECTIVE_CONCURRENCY))
            .timeout(beacon.timeout)
            .maybe_correlation_id(beacon.correlation_id.clone())
            .maybe_cancel(beacon.cancel.clone())
            .build();

        Self {
            student,
            instructions: space
                .instructions
                .iter()
                .map(|c| (c.id.clone(), c.instruction.clone()))
                .collect(),
            demos: space
                .demos
                .iter()
                .map(|c| (c.id.clone(), c.demo.clone()))
                .collect(),
            trainset: trainset.to_vec(),
            metric: Arc::clone(metric),
            subset_size: trainset.len().min(MAX_VALIDATION_SUBSET),
            evaluator,
            rng: Mutex::new(seeded_rng(beacon.seed.map(|seed| seed.wrapping_add(1)))),
        }
    }

    /// Maps a winning configuration back to its instruction text and demos.
    fn resolve(&self, configuration: &TrialConfiguration) -> (String, Vec<Example>) {
        let instruction = self
            .instructions
            .get(&configuration.instruction_id)
            .cloned()
            .unwrap_or_default();
        let demos = configuration
            .demo_ids
            .iter()
            .filter_map(|id| self.demos.get(id).cloned())
            .collect();
        (instruction, demos)
    }

    fn validation_subset(&self) -> Vec<Example> {
        let mut indices: Vec<usize> = (0..self.trainset.len()).collect();
        {
            let mut rng = self.rng.lock().expect("validation rng lock");
            indices.shuffle(&mut *rng);
        }
        indices
            .into_iter()
            .take(self.subset_size)
            .map(|idx| self.trainset[idx].clone())
            .collect()
    }
}

#[async_trait]
impl Objective for ValidationObjective {
    async fn measure(&self, configuration: &TrialConfiguration) -> Result<f64> {
        let instruction = self
            .instructions
            .get(&configuration.instruction_id)
            .ok_or_else(|| anyhow!("unknown instruction id {}", configuration.instruction_id))?;
        let demos: Vec<Example> = configuration
            .demo_ids
            .iter()
            .map(|id| {
                self.demos
                    .get(id)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown demo id {id}"))
            })
            .collect::<Result<_>>()?;

        let program: Arc<dyn Program> = Arc::new(enhance(
            self.student.clone(),
            demos,
            Some(instruction.clone()),
            Fields::new(),
        ));

        let subset = self.validation_subset();
        match self.evaluator.run(&program, &subset, &self.metric).await {
            Ok(evaluation) => Ok(evaluation.score),
            // Evaluator trouble scores the trial, it does not kill the search.
            Err(_) => Ok(0.0),
        }
    }
}
