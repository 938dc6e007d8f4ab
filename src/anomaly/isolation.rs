//! Isolation forest fitted at runtime over historical `(user_id, amount)`
//! pairs.
//!
//! Standard path-length scoring: anomaly score `s = 2^(-E[h(x)]/c(n))`,
//! in (0, 1], higher means more isolated. The outlier cutoff is the
//! `(1 - contamination)` quantile of the training scores.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Euler-Mascheroni constant, used in the average unsuccessful-search
/// path length of a binary search tree.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

/// A training or query point: `[user_id, amount]`.
pub type Point = [f64; 2];

/// Inlier/outlier classification of a point against the fitted forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLabel {
    Inlier,
    Outlier,
}

/// Forest fitting parameters.
#[derive(Debug, Clone)]
pub struct ForestParams {
    /// Number of isolation trees
    pub trees: usize,
    /// Subsample size per tree (capped at the data size)
    pub subsample: usize,
    /// Expected outlier fraction, sets the score cutoff
    pub contamination: f64,
    /// Seed for deterministic fitting; entropy-seeded when `None`
    pub seed: Option<u64>,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            trees: 100,
            subsample: 256,
            contamination: 0.02,
            seed: None,
        }
    }
}

enum Node {
    Split {
        dim: usize,
        value: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
    Leaf {
        size: usize,
    },
}

/// A fitted isolation forest with its contamination-derived cutoff.
pub struct IsolationForest {
    trees: Vec<Node>,
    subsample: usize,
    threshold: f64,
}

impl IsolationForest {
    /// Fit a forest over the given points and derive the outlier cutoff
    /// from the training-score distribution.
    pub fn fit(data: &[Point], params: &ForestParams) -> Self {
        // Nothing can be isolated from fewer than two points; the
        // degenerate forest classifies everything as an inlier
        if data.len() < 2 {
            return Self {
                trees: Vec::new(),
                subsample: data.len(),
                threshold: 1.0,
            };
        }

        let mut rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let subsample = params.subsample.min(data.len()).max(2);
        let depth_limit = (subsample as f64).log2().ceil() as usize;

        let mut trees = Vec::with_capacity(params.trees);
        for _ in 0..params.trees {
            let indices = rand::seq::index::sample(&mut rng, data.len(), subsample);
            let points: Vec<Point> = indices.iter().map(|i| data[i]).collect();
            trees.push(grow(&mut rng, &points, 0, depth_limit));
        }

        let mut forest = Self {
            trees,
            subsample,
            threshold: 0.0,
        };

        let mut scores: Vec<f64> = data.iter().map(|p| forest.score(*p)).collect();
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        forest.threshold = quantile(&scores, 1.0 - params.contamination);

        forest
    }

    /// Anomaly score of a point, in (0, 1]; higher means more isolated.
    pub fn score(&self, point: Point) -> f64 {
        if self.trees.is_empty() {
            return 0.5;
        }

        let mean_depth: f64 = self
            .trees
            .iter()
            .map(|tree| path_length(tree, point, 0.0))
            .sum::<f64>()
            / self.trees.len() as f64;

        let normalizer = avg_path_length(self.subsample);
        if normalizer == 0.0 {
            return 0.5;
        }
        2f64.powf(-mean_depth / normalizer)
    }

    /// Classify a point against the fitted cutoff.
    pub fn classify(&self, point: Point) -> IsolationLabel {
        if self.score(point) > self.threshold {
            IsolationLabel::Outlier
        } else {
            IsolationLabel::Inlier
        }
    }

    /// The contamination-derived score cutoff.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

fn grow(rng: &mut StdRng, points: &[Point], depth: usize, limit: usize) -> Node {
    if depth >= limit || points.len() <= 1 {
        return Node::Leaf {
            size: points.len(),
        };
    }

    // Only dimensions with spread are splittable
    let splittable: Vec<(usize, f64, f64)> = (0..2)
        .filter_map(|dim| {
            let min = points.iter().map(|p| p[dim]).fold(f64::INFINITY, f64::min);
            let max = points
                .iter()
                .map(|p| p[dim])
                .fold(f64::NEG_INFINITY, f64::max);
            (min < max).then_some((dim, min, max))
        })
        .collect();

    if splittable.is_empty() {
        return Node::Leaf {
            size: points.len(),
        };
    }

    let (dim, min, max) = splittable[rng.gen_range(0..splittable.len())];
    let value = rng.gen_range(min..max);

    let (left, right): (Vec<Point>, Vec<Point>) =
        points.iter().copied().partition(|p| p[dim] < value);

    Node::Split {
        dim,
        value,
        left: Box::new(grow(rng, &left, depth + 1, limit)),
        right: Box::new(grow(rng, &right, depth + 1, limit)),
    }
}

fn path_length(node: &Node, point: Point, depth: f64) -> f64 {
    match node {
        Node::Leaf { size } => depth + avg_path_length(*size),
        Node::Split {
            dim,
            value,
            left,
            right,
        } => {
            if point[*dim] < *value {
                path_length(left, point, depth + 1.0)
            } else {
                path_length(right, point, depth + 1.0)
            }
        }
    }
}

/// Average unsuccessful-search path length of a binary search tree with
/// `n` nodes; the standard isolation-forest normalizer `c(n)`.
fn avg_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

/// Linear-interpolation quantile over a sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let position = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}
