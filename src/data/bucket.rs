use super::example::Example;
use super::trajectory::Trajectory;

/// Minimum score spread before a bucket is considered improvable.
const MIN_GAP: f64 = 0.01;
/// Minimum best score before a bucket is considered improvable.
const MIN_MAX_SCORE: f64 = 0.1;

/// The trajectories sampled for one mini-batch example, sorted by score
/// descending, with cached score statistics.
///
/// Stats are computed once at construction and never mutated. All
/// trajectories in a bucket share the same example.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub trajectories: Vec<Trajectory>,
    pub max_score: f64,
    pub min_score: f64,
    pub avg_score: f64,
    pub max_to_min_gap: f64,
    pub max_to_avg_gap: f64,
    pub trajectory_count: usize,
}

impl Bucket {
    pub fn from_trajectories(mut trajectories: Vec<Trajectory>) -> Self {
        trajectories.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let trajectory_count = trajectories.len();
        let (max_score, min_score, avg_score) = if trajectory_count == 0 {
            (0.0, 0.0, 0.0)
        } else {
            let max = trajectories.first().map(|t| t.score).unwrap_or(0.0);
            let min = trajectories.last().map(|t| t.score).unwrap_or(0.0);
            let avg =
                trajectories.iter().map(|t| t.score).sum::<f64>() / trajectory_count as f64;
            (max, min, avg)
        };

        Self {
            trajectories,
            max_score,
            min_score,
            avg_score,
            max_to_min_gap: max_score - min_score,
            max_to_avg_gap: max_score - avg_score,
            trajectory_count,
        }
    }

    /// True when the score spread suggests a strategy could improve the
    /// program on this example.
    pub fn has_improvement_potential(&self) -> bool {
        self.max_to_min_gap > MIN_GAP && self.max_score > MIN_MAX_SCORE
    }

    pub fn example(&self) -> Option<&Example> {
        self.trajectories.first().map(|t| &t.example)
    }

    pub fn best(&self) -> Option<&Trajectory> {
        self.trajectories.first()
    }

    pub fn worst(&self) -> Option<&Trajectory> {
        self.trajectories.last()
    }
}
