use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};

use super::{PointScore, ScoreInput, residual};

const MIN_HISTORY: usize = 8;
const MAX_SAMPLE: usize = 256;

/// Isolation forest over one-dimensional residuals.
///
/// Points that isolate in few random splits relative to the history get a
/// score near 1; typical points sit around 0.5 or below.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsolationForest {
    trees: usize,
    cutoff: f64,
    seed: u64,
}

impl Default for IsolationForest {
    fn default() -> Self {
        Self {
            trees: 64,
            cutoff: 0.6,
            seed: 0x0A0A_5EED,
        }
    }
}

#[derive(Debug)]
enum Node {
    Leaf { size: usize },
    Split {
        min: f64,
        max: f64,
        at: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl IsolationForest {
    pub fn score_window(&self, points: &[ScoreInput], history: &[f64]) -> Vec<PointScore> {
        if history.len() < MIN_HISTORY {
            return vec![PointScore::insufficient(); points.len()];
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let subsample = history.len().min(MAX_SAMPLE);
        let max_depth = (subsample as f64).log2().ceil() as usize;
        let forest: Vec<Node> = (0..self.trees)
            .map(|_| {
                let picked: Vec<f64> = sample(&mut rng, history.len(), subsample)
                    .into_iter()
                    .map(|i| history[i])
                    .collect();
                build(&picked, 0, max_depth, &mut rng)
            })
            .collect();
        let norm = average_path(subsample);

        points
            .iter()
            .map(|p| {
                let r = residual(p.predicted, p.actual);
                let mean_depth =
                    forest.iter().map(|t| path_length(t, r, 0)).sum::<f64>() / forest.len() as f64;
                let score = 2f64.powf(-mean_depth / norm);
                if score > self.cutoff {
                    PointScore::flagged(score)
                } else {
                    PointScore::normal(score)
                }
            })
            .collect()
    }
}

fn build(values: &[f64], depth: usize, max_depth: usize, rng: &mut StdRng) -> Node {
    let (min, max) = values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    if depth >= max_depth || values.len() <= 1 || max - min <= f64::EPSILON {
        return Node::Leaf { size: values.len() };
    }
    let at = rng.gen_range(min..max);
    let (left, right): (Vec<f64>, Vec<f64>) = values.iter().partition(|v| **v < at);
    Node::Split {
        min,
        max,
        at,
        left: Box::new(build(&left, depth + 1, max_depth, rng)),
        right: Box::new(build(&right, depth + 1, max_depth, rng)),
    }
}

fn path_length(node: &Node, value: f64, depth: usize) -> f64 {
    match node {
        Node::Leaf { size } => depth as f64 + average_path(*size),
        // Outside the node's range the value is separated right here.
        Node::Split { min, max, .. } if value < *min || value > *max => depth as f64,
        Node::Split { at, left, right, .. } => {
            let next = if value < *at { left } else { right };
            path_length(next, value, depth + 1)
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points.
fn average_path(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + 0.577_215_664_9) - 2.0 * (n - 1.0) / n
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(actual: f64) -> ScoreInput {
        ScoreInput {
            actual,
            predicted: 0.0,
            quantiles: Vec::new(),
        }
    }

    fn history() -> Vec<f64> {
        (0..120).map(|i| ((i * 37) % 101) as f64 / 100.0 - 0.5).collect()
    }

    #[test]
    fn test_outlier_scores_higher_than_typical() {
        let forest = IsolationForest::default();
        let scores = forest.score_window(&[point(0.0), point(-40.0)], &history());
        assert!(scores[1].score > scores[0].score);
        assert!(scores[1].is_anomaly);
        assert!(!scores[0].is_anomaly);
    }

    #[test]
    fn test_scores_are_reproducible() {
        let forest = IsolationForest::default();
        let a = forest.score_window(&[point(3.0)], &history());
        let b = forest.score_window(&[point(3.0)], &history());
        assert_eq!(a, b);
    }

    #[test]
    fn test_short_history_is_insufficient() {
        let scores = IsolationForest::default().score_window(&[point(1.0)], &[0.1; 5]);
        assert!(scores[0].insufficient_history);
    }
}
