use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use bon::Builder;
use chrono::{DateTime, Utc};
use rand::Rng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::core::OptimizeError;
use crate::data::Example;
use crate::utils::{correlation_id, seeded_rng};

/// Exploration margin for improvement-based acquisition functions.
const XI: f64 = 0.01;
/// Trees per randomized-ensemble surrogate.
const ENSEMBLE_TREES: usize = 8;

#[derive(Debug, Clone)]
pub struct InstructionCandidate {
    pub id: String,
    pub instruction: String,
}

#[derive(Debug, Clone)]
pub struct DemoCandidate {
    pub id: String,
    pub demo: Example,
    pub quality: f64,
}

/// The joint space the optimizer searches: one instruction paired with a
/// subset of demos.
#[derive(Debug, Clone, Default)]
pub struct SearchSpace {
    pub instructions: Vec<InstructionCandidate>,
    pub demos: Vec<DemoCandidate>,
}

/// One point in the search space. Demo ids are kept sorted so equal sets
/// compare and hash equal regardless of construction order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialConfiguration {
    pub instruction_id: String,
    pub demo_ids: Vec<String>,
}

impl TrialConfiguration {
    pub fn new(instruction_id: impl Into<String>, mut demo_ids: Vec<String>) -> Self {
        demo_ids.sort();
        Self {
            instruction_id: instruction_id.into(),
            demo_ids,
        }
    }
}

/// Append-only record of one evaluated trial.
#[derive(Debug, Clone)]
pub struct Observation {
    pub configuration: TrialConfiguration,
    pub score: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionFunction {
    ExpectedImprovement,
    UpperConfidenceBound,
    ProbabilityOfImprovement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurrogateModel {
    GaussianProcess,
    RandomForest,
    ExtraTrees,
}

/// Scores one configuration. Implementations handle noise themselves (e.g.
/// by averaging); an `Err` marks the trial failed and is excluded from the
/// observation set.
#[async_trait]
pub trait Objective: Send + Sync {
    async fn measure(&self, configuration: &TrialConfiguration) -> Result<f64>;
}

#[derive(Debug, Clone)]
pub struct OptimizationStats {
    pub total_trials: usize,
    pub failed_trials: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub best_configuration: TrialConfiguration,
    pub best_score: f64,
    pub observations: Vec<Observation>,
    pub convergence_iteration: Option<usize>,
    pub stats: OptimizationStats,
}

struct SurrogateEstimate {
    mean: f64,
    std: f64,
}

/// Surrogate-model-guided search over (instruction × demo subset)
/// configurations.
///
/// Random initial sampling seeds the observation set, then each iteration
/// scores the unobserved configurations with the acquisition function under
/// the fitted surrogate and evaluates the argmax, until the iteration budget
/// or the convergence patience runs out.
///
/// ```ignore
/// let optimizer = BayesianOptimizer::builder().max_iterations(40).seed(3).build();
/// let result = optimizer.optimize(&space, &objective).await?;
/// ```
#[derive(Builder)]
pub struct BayesianOptimizer {
    #[builder(default = 40)]
    pub max_iterations: usize,
    /// Defaults to `min(10, max_iterations / 3)` when unset.
    pub num_initial_samples: Option<usize>,
    #[builder(default = 5)]
    pub convergence_patience: usize,
    #[builder(default = AcquisitionFunction::ExpectedImprovement)]
    pub acquisition: AcquisitionFunction,
    #[builder(default = SurrogateModel::GaussianProcess)]
    pub surrogate: SurrogateModel,
    /// Largest demo subset a single trial may carry.
    #[builder(default = 4)]
    pub max_demos_per_trial: usize,
    /// Above this many configurations the acquisition phase scores a sampled
    /// candidate pool instead of the full product space.
    #[builder(default = 128)]
    pub candidate_pool_size: usize,
    pub seed: Option<u64>,
    pub correlation_id: Option<String>,
}

impl BayesianOptimizer {
    pub async fn optimize(
        &self,
        space: &SearchSpace,
        objective: &dyn Objective,
    ) -> Result<OptimizationResult, OptimizeError> {
        if space.instructions.is_empty() {
            return Err(OptimizeError::OptimizationFailed {
                reason: "search space has no instruction candidates".to_string(),
            });
        }

        let cid = self
            .correlation_id
            .clone()
            .unwrap_or_else(correlation_id);
        let started = Instant::now();
        let mut rng = seeded_rng(self.seed);

        let num_initial = self
            .num_initial_samples
            .unwrap_or_else(|| (self.max_iterations / 3).clamp(1, 10))
            .min(self.max_iterations.max(1));

        let mut observations: Vec<Observation> = Vec::new();
        let mut seen: HashSet<TrialConfiguration> = HashSet::new();
        let mut best: Option<(TrialConfiguration, f64)> = None;
        let mut failed_trials = 0usize;

        for _ in 0..num_initial {
            let configuration = random_configuration(&mut rng, space, self.max_demos_per_trial);
            if seen.contains(&configuration) {
                continue;
            }
            self.observe(
                configuration,
                objective,
                &mut observations,
                &mut seen,
                &mut best,
                &mut failed_trials,
                &cid,
            )
            .await;
        }

        let mut stale = 0usize;
        let mut convergence_iteration = None;
        let mut iteration = observations.len() + failed_trials;

        while iteration < self.max_iterations {
            let candidates = self.candidate_pool(space, &seen, &mut rng);
            let Some(pick) = self.select_candidate(&candidates, &observations, &best, &mut rng)
            else {
                break;
            };

            let previous_best = best.as_ref().map(|(_, score)| *score);
            self.observe(
                pick,
                objective,
                &mut observations,
                &mut seen,
                &mut best,
                &mut failed_trials,
                &cid,
            )
            .await;
            iteration += 1;

            let improved = match (previous_best, &best) {
                (Some(before), Some((_, after))) => *after > before + f64::EPSILON,
                (None, Some(_)) => true,
                _ => false,
            };
            if improved {
                stale = 0;
            } else {
                stale += 1;
                if stale >= self.convergence_patience.max(1) {
                    convergence_iteration = Some(iteration);
                    break;
                }
            }
        }

        let Some((best_configuration, best_score)) = best else {
            return Err(OptimizeError::NoValidConfigurations);
        };

        tracing::debug!(
            correlation_id = %cid,
            best_score,
            trials = observations.len() + failed_trials,
            "surrogate search finished",
        );

        Ok(OptimizationResult {
            best_configuration,
            best_score,
            stats: OptimizationStats {
                total_trials: observations.len() + failed_trials,
                failed_trials,
                duration: started.elapsed(),
            },
            observations,
            convergence_iteration,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn observe(
        &self,
        configuration: TrialConfiguration,
        objective: &dyn Objective,
        observations: &mut Vec<Observation>,
        seen: &mut HashSet<TrialConfiguration>,
        best: &mut Option<(TrialConfiguration, f64)>,
        failed_trials: &mut usize,
        cid: &str,
    ) {
        seen.insert(configuration.clone());
        match objective.measure(&configuration).await {
            Ok(score) => {
                // Strict improvement only, so the earliest observation wins ties.
                if best.as_ref().is_none_or(|(_, current)| score > *current) {
                    *best = Some((configuration.clone(), score));
                }
                observations.push(Observation {
                    configuration,
                    score,
                    at: Utc::now(),
                });
            }
            Err(err) => {
                *failed_trials += 1;
                tracing::debug!(correlation_id = %cid, error = %err, "trial failed");
            }
        }
    }

    /// Unobserved configurations to score this iteration: the full product
    /// space when it is small, otherwise a random sample.
    fn candidate_pool(
        &self,
        space: &SearchSpace,
        seen: &HashSet<TrialConfiguration>,
        rng: &mut StdRng,
    ) -> Vec<TrialConfiguration> {
        let pool_size = self.candidate_pool_size.max(1);
        let demo_ids: Vec<String> = space.demos.iter().map(|d| d.id.clone()).collect();
        let max_size = self.max_demos_per_trial.max(1).min(demo_ids.len());

        let subsets_per_instruction = count_subsets(demo_ids.len(), max_size, pool_size);
        let full_space = space
            .instructions
            .len()
            .saturating_mul(subsets_per_instruction);

        if full_space <= pool_size {
            let mut out = Vec::new();
            for instruction in &space.instructions {
                for subset in enumerate_subsets(&demo_ids, max_size) {
                    let configuration = TrialConfiguration::new(instruction.id.clone(), subset);
                    if !seen.contains(&configuration) {
                        out.push(configuration);
                    }
                }
            }
            return out;
        }

        let mut out = Vec::new();
        let mut local_seen: HashSet<TrialConfiguration> = HashSet::new();
        let mut attempts = pool_size * 4;
        while out.len() < pool_size && attempts > 0 {
            attempts -= 1;
            let configuration = random_configuration(rng, space, self.max_demos_per_trial);
            if seen.contains(&configuration) || !local_seen.insert(configuration.clone()) {
                continue;
            }
            out.push(configuration);
        }
        out
    }

    /// Argmax of the acquisition function. Ties prefer fewer demos, then the
    /// earliest instruction id.
    fn select_candidate(
        &self,
        candidates: &[TrialConfiguration],
        observations: &[Observation],
        best: &Option<(TrialConfiguration, f64)>,
        rng: &mut StdRng,
    ) -> Option<TrialConfiguration> {
        if candidates.is_empty() {
            return None;
        }
        let best_score = best.as_ref().map(|(_, score)| *score).unwrap_or(0.0);

        let mut scored: Vec<(f64, &TrialConfiguration)> = candidates
            .iter()
            .map(|configuration| {
                let estimate = self.predict(configuration, observations, rng);
                (self.acquisition_score(&estimate, best_score), configuration)
            })
            .collect();

        scored.sort_by(|(score_a, config_a), (score_b, config_b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(config_a.demo_ids.len().cmp(&config_b.demo_ids.len()))
                .then(config_a.instruction_id.cmp(&config_b.instruction_id))
        });

        scored.first().map(|(_, configuration)| (*configuration).clone())
    }

    fn predict(
        &self,
        configuration: &TrialConfiguration,
        observations: &[Observation],
        rng: &mut StdRng,
    ) -> SurrogateEstimate {
        match self.surrogate {
            SurrogateModel::GaussianProcess => kernel_regression(configuration, observations, 2.0),
            SurrogateModel::RandomForest => ensemble(configuration, observations, rng, true),
            SurrogateModel::ExtraTrees => ensemble(configuration, observations, rng, false),
        }
    }

    fn acquisition_score(&self, estimate: &SurrogateEstimate, best_score: f64) -> f64 {
        let std = estimate.std.max(1e-6);
        match self.acquisition {
            AcquisitionFunction::ExpectedImprovement => {
                let improvement = estimate.mean - best_score - XI;
                let z = improvement / std;
                (improvement * normal_cdf(z) + std * normal_pdf(z)).max(0.0)
            }
            AcquisitionFunction::UpperConfidenceBound => estimate.mean + 2.0 * std,
            AcquisitionFunction::ProbabilityOfImprovement => {
                normal_cdf((estimate.mean - best_score - XI) / std)
            }
        }
    }
}

fn random_configuration(
    rng: &mut StdRng,
    space: &SearchSpace,
    max_demos_per_trial: usize,
) -> TrialConfiguration {
    let instruction = &space.instructions[rng.gen_range(0..space.instructions.len())];

    let demo_ids: Vec<String> = if space.demos.is_empty() {
        Vec::new()
    } else {
        let max_size = max_demos_per_trial.max(1).min(space.demos.len());
        let size = rng.gen_range(1..=max_size);
        space
            .demos
            .choose_multiple(rng, size)
            .map(|demo| demo.id.clone())
            .collect()
    };

    TrialConfiguration::new(instruction.id.clone(), demo_ids)
}

/// Number of non-empty subsets of size ≤ `max_size`, saturating at `cap + 1`
/// so callers can cheaply test tractability. Zero demos count as the single
/// empty subset.
fn count_subsets(n: usize, max_size: usize, cap: usize) -> usize {
    if n == 0 {
        return 1;
    }
    let mut total = 0usize;
    for k in 1..=max_size.min(n) {
        let mut binomial = 1f64;
        for i in 0..k {
            binomial = binomial * (n - i) as f64 / (i + 1) as f64;
        }
        total = total.saturating_add(binomial.round() as usize);
        if total > cap {
            return cap + 1;
        }
    }
    total
}

fn enumerate_subsets(ids: &[String], max_size: usize) -> Vec<Vec<String>> {
    if ids.is_empty() {
        return vec![Vec::new()];
    }
    let mut out = Vec::new();
    for k in 1..=max_size.min(ids.len()) {
        combinations(ids, k, 0, &mut Vec::new(), &mut out);
    }
    out
}

fn combinations(
    ids: &[String],
    k: usize,
    start: usize,
    current: &mut Vec<String>,
    out: &mut Vec<Vec<String>>,
) {
    if current.len() == k {
        out.push(current.clone());
        return;
    }
    for idx in start..ids.len() {
        current.push(ids[idx].clone());
        combinations(ids, k, idx + 1, current, out);
        current.pop();
    }
}

/// Similarity kernel over (instruction match, demo-set Jaccard), both
/// weighted equally.
fn similarity(a: &TrialConfiguration, b: &TrialConfiguration) -> f64 {
    let instruction = if a.instruction_id == b.instruction_id {
        1.0
    } else {
        0.0
    };
    0.5 * instruction + 0.5 * jaccard(&a.demo_ids, &b.demo_ids)
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let set_a: HashSet<&String> = a.iter().collect();
    let set_b: HashSet<&String> = b.iter().collect();
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

fn kernel_regression(
    configuration: &TrialConfiguration,
    observations: &[Observation],
    sharpness: f64,
) -> SurrogateEstimate {
    if observations.is_empty() {
        return SurrogateEstimate {
            mean: 0.5,
            std: 0.5,
        };
    }

    let global = observations.iter().map(|o| o.score).sum::<f64>() / observations.len() as f64;
    let mut weight_sum = 0.0;
    let mut weighted_mean = 0.0;
    let mut max_similarity = 0.0f64;

    for observation in observations {
        let sim = similarity(configuration, &observation.configuration);
        let weight = sim.powf(sharpness);
        weight_sum += weight;
        weighted_mean += weight * observation.score;
        max_similarity = max_similarity.max(sim);
    }

    let mean = if weight_sum > 1e-9 {
        weighted_mean / weight_sum
    } else {
        global
    };
    let std = 0.05 + 0.5 * (1.0 - max_similarity);
    SurrogateEstimate { mean, std }
}

/// Randomized ensemble over observation resamples: bootstrap draws for the
/// random-forest flavor, random halves with randomized kernel sharpness for
/// extra-trees.
fn ensemble(
    configuration: &TrialConfiguration,
    observations: &[Observation],
    rng: &mut StdRng,
    bootstrap: bool,
) -> SurrogateEstimate {
    if observations.is_empty() {
        return SurrogateEstimate {
            mean: 0.5,
            std: 0.5,
        };
    }

    let mut predictions = Vec::with_capacity(ENSEMBLE_TREES);
    for _ in 0..ENSEMBLE_TREES {
        let sample: Vec<Observation> = if bootstrap {
            (0..observations.len())
                .map(|_| observations[rng.gen_range(0..observations.len())].clone())
                .collect()
        } else {
            let take = (observations.len() / 2).max(1);
            observations
                .choose_multiple(rng, take)
                .cloned()
                .collect()
        };
        let sharpness = if bootstrap {
            2.0
        } else {
            rng.gen_range(1.0..3.0)
        };
        predictions.push(kernel_regression(configuration, &sample, sharpness).mean);
    }

    let mean = predictions.iter().sum::<f64>() / predictions.len() as f64;
    let variance = predictions
        .iter()
        .map(|p| (p - mean).powi(2))
        .sum::<f64>()
        / predictions.len() as f64;
    SurrogateEstimate {
        mean,
        std: variance.sqrt() + 0.02,
    }
}

fn normal_pdf(z: f64) -> f64 {
    (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

fn normal_cdf(z: f64) -> f64 {
    0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
}

/// Abramowitz–Stegun 7.1.26 polynomial approximation.
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(instruction: &str, demos: &[&str]) -> TrialConfiguration {
        TrialConfiguration::new(
            instruction,
            demos.iter().map(|d| d.to_string()).collect(),
        )
    }

    #[test]
    fn demo_ids_are_normalized_to_sorted_order() {
        let a = config("i1", &["d3", "d1"]);
        let b = config("i1", &["d1", "d3"]);
        assert_eq!(a, b);
    }

    #[test]
    fn jaccard_handles_empty_and_disjoint_sets() {
        assert_eq!(jaccard(&[], &[]), 1.0);
        let a = vec!["d1".to_string()];
        let b = vec!["d2".to_string()];
        assert_eq!(jaccard(&a, &b), 0.0);
        assert_eq!(jaccard(&a, &a), 1.0);
    }

    #[test]
    fn subset_enumeration_matches_count() {
        let ids: Vec<String> = (0..5).map(|i| format!("d{i}")).collect();
        let subsets = enumerate_subsets(&ids, 2);
        assert_eq!(subsets.len(), count_subsets(5, 2, 1000)); // 5 + 10
        assert!(subsets.iter().all(|s| !s.is_empty() && s.len() <= 2));
    }

    #[test]
    fn normal_cdf_is_monotone_and_bounded() {
        assert!(normal_cdf(-3.0) < 0.01);
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!(normal_cdf(3.0) > 0.99);
    }

    #[test]
    fn higher_similarity_drives_prediction_toward_observed_score() {
        let observations = vec![
            Observation {
                configuration: config("i1", &["d1", "d2"]),
                score: 0.9,
                at: Utc::now(),
            },
            Observation {
                configuration: config("i2", &["d7"]),
                score: 0.1,
                at: Utc::now(),
            },
        ];

        let near = kernel_regression(&config("i1", &["d1", "d2", "d3"]), &observations, 2.0);
        let far = kernel_regression(&config("i2", &["d8"]), &observations, 2.0);
        assert!(near.mean > far.mean);
    }

    #[test]
    fn tie_break_prefers_fewer_demos_then_earlier_instruction() {
        let optimizer = BayesianOptimizer::builder().build();
        // No observations: every estimate is identical, so acquisition ties.
        let candidates = vec![
            config("i2", &["d1", "d2"]),
            config("i1", &["d1"]),
            config("i0", &["d1", "d2"]),
        ];
        let pick = optimizer
            .select_candidate(&candidates, &[], &None, &mut seeded_rng(Some(1)))
            .unwrap();
        assert_eq!(pick, config("i1", &["d1"]));
    }
}
