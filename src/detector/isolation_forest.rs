//! Tree-ensemble isolation detector: `n_trees` trees over random feature
//! subsamples, deterministic given a seed.

use super::Detector;
use crate::types::TrafficPoint;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DEFAULT_SUBSAMPLE_SIZE: usize = 256;

enum Node {
    Leaf { size: usize },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

struct IsolationTree {
    root: Node,
    height_limit: usize,
}

impl IsolationTree {
    fn build(samples: &[Vec<f64>], height_limit: usize, rng: &mut StdRng) -> Self {
        Self {
            root: Self::build_node(samples, 0, height_limit, rng),
            height_limit,
        }
    }

    fn build_node(samples: &[Vec<f64>], depth: usize, height_limit: usize, rng: &mut StdRng) -> Node {
        if samples.len() <= 1 || depth >= height_limit {
            return Node::Leaf {
                size: samples.len(),
            };
        }

        let num_features = samples[0].len();
        if num_features == 0 {
            return Node::Leaf {
                size: samples.len(),
            };
        }

        let feature = rng.gen_range(0..num_features);
        let (min, max) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(s[feature]), hi.max(s[feature]))
        });

        if !(min < max) {
            return Node::Leaf {
                size: samples.len(),
            };
        }

        let threshold = rng.gen_range(min..max);
        let (left, right): (Vec<_>, Vec<_>) =
            samples.iter().cloned().partition(|s| s[feature] < threshold);

        if left.is_empty() || right.is_empty() {
            return Node::Leaf {
                size: samples.len(),
            };
        }

        Node::Split {
            feature,
            threshold,
            left: Box::new(Self::build_node(&left, depth + 1, height_limit, rng)),
            right: Box::new(Self::build_node(&right, depth + 1, height_limit, rng)),
        }
    }

    fn path_length(&self, point: &[f64]) -> f64 {
        Self::walk(&self.root, point, 0, self.height_limit)
    }

    fn walk(node: &Node, point: &[f64], depth: usize, height_limit: usize) -> f64 {
        match node {
            Node::Leaf { size } => depth as f64 + average_path_length(*size),
            Node::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if depth >= height_limit {
                    return depth as f64;
                }
                if point[*feature] < *threshold {
                    Self::walk(left, point, depth + 1, height_limit)
                } else {
                    Self::walk(right, point, depth + 1, height_limit)
                }
            }
        }
    }
}

/// Average unsuccessful-search path length in a binary search tree of `n`
/// nodes; the standard isolation-forest normalization constant `c(n)`.
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * (((n - 1.0).ln()) + 0.5772156649) - (2.0 * (n - 1.0) / n)
}

/// Deterministic tree-ensemble isolation detector.
pub struct IsolationForest {
    n_trees: usize,
    subsample_size: usize,
    seed: u64,
    trees: Vec<IsolationTree>,
}

impl IsolationForest {
    pub fn new(n_trees: usize, subsample_size: usize, seed: u64) -> Self {
        Self {
            n_trees,
            subsample_size: subsample_size.max(2),
            seed,
            trees: Vec::new(),
        }
    }

    fn feature_matrix(samples: &[TrafficPoint]) -> Vec<Vec<f64>> {
        samples.iter().map(|p| p.channels()).collect()
    }
}

impl Detector for IsolationForest {
    fn fit(&mut self, samples: &[TrafficPoint]) {
        self.trees.clear();
        if samples.is_empty() {
            return;
        }

        let matrix = Self::feature_matrix(samples);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let subsample_size = self
            .subsample_size
            .min(matrix.len())
            .min(DEFAULT_SUBSAMPLE_SIZE.max(2));
        let height_limit = (subsample_size as f64).log2().ceil().max(1.0) as usize;

        for _ in 0..self.n_trees {
            let mut subsample = Vec::with_capacity(subsample_size);
            for _ in 0..subsample_size {
                let idx = rng.gen_range(0..matrix.len());
                subsample.push(matrix[idx].clone());
            }
            self.trees
                .push(IsolationTree::build(&subsample, height_limit, &mut rng));
        }
    }

    fn score(&self, samples: &[TrafficPoint]) -> Vec<f64> {
        if self.trees.is_empty() {
            return vec![0.0; samples.len()];
        }

        let matrix = Self::feature_matrix(samples);
        let c = average_path_length(self.subsample_size.min(DEFAULT_SUBSAMPLE_SIZE));

        matrix
            .iter()
            .map(|point| {
                let avg_path = self
                    .trees
                    .iter()
                    .map(|t| t.path_length(point))
                    .sum::<f64>()
                    / self.trees.len() as f64;

                if c <= 0.0 {
                    return 0.0;
                }
                2f64.powf(-avg_path / c)
            })
            .collect()
    }
}
