//! Anomaly scoring
//!
//! A closed set of techniques behind one entry point. Each scores a window of
//! points (actual vs. forecast) against either the forecast's quantile bands
//! or a history of past residuals.

mod confidence;
mod iqr;
mod isolation;
mod zscore;

use crate::domain::pipeline::{AnomalyConfig, AnomalyTechnique};

pub use confidence::ConfidenceInterval;
pub use iqr::Iqr;
pub use isolation::IsolationForest;
pub use zscore::ZScore;

/// One timestamp to score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreInput {
    pub actual: f64,
    pub predicted: f64,
    /// `(level, value)` quantile pairs predicted for this timestamp.
    pub quantiles: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointScore {
    pub score: f64,
    pub is_anomaly: bool,
    /// The technique had too little history to judge; score is 0.
    pub insufficient_history: bool,
}

impl PointScore {
    pub fn normal(score: f64) -> Self {
        Self {
            score,
            is_anomaly: false,
            insufficient_history: false,
        }
    }

    pub fn flagged(score: f64) -> Self {
        Self {
            score,
            is_anomaly: true,
            insufficient_history: false,
        }
    }

    pub fn insufficient() -> Self {
        Self {
            score: 0.0,
            is_anomaly: false,
            insufficient_history: true,
        }
    }
}

/// Residual between forecast and actual, as used for history.
pub fn residual(predicted: f64, actual: f64) -> f64 {
    predicted - actual
}

#[derive(Debug, Clone)]
pub enum AnomalyScorer {
    ConfidenceInterval(ConfidenceInterval),
    ZScore(ZScore),
    Iqr(Iqr),
    IsolationForest(IsolationForest),
}

impl AnomalyScorer {
    pub fn from_config(config: &AnomalyConfig) -> Self {
        match config.technique {
            AnomalyTechnique::ConfidenceInterval => {
                AnomalyScorer::ConfidenceInterval(ConfidenceInterval::new(config.confidence_level))
            }
            AnomalyTechnique::ZScore => AnomalyScorer::ZScore(ZScore::new(config.threshold)),
            AnomalyTechnique::Iqr => AnomalyScorer::Iqr(Iqr),
            AnomalyTechnique::IsolationForest => {
                AnomalyScorer::IsolationForest(IsolationForest::default())
            }
        }
    }

    /// Whether the technique scores against past residuals.
    pub fn uses_history(&self) -> bool {
        !matches!(self, AnomalyScorer::ConfidenceInterval(_))
    }

    /// Quantile levels the technique needs from the model.
    pub fn required_quantiles(&self) -> Vec<f64> {
        match self {
            AnomalyScorer::ConfidenceInterval(ci) => {
                let (lower, upper) = ci.bounds();
                vec![lower, upper]
            }
            _ => Vec::new(),
        }
    }

    /// Scores every point of a window against the same residual history.
    pub fn score_window(&self, points: &[ScoreInput], history: &[f64]) -> Vec<PointScore> {
        match self {
            AnomalyScorer::ConfidenceInterval(ci) => points.iter().map(|p| ci.score(p)).collect(),
            AnomalyScorer::ZScore(z) => z.score_window(points, history),
            AnomalyScorer::Iqr(iqr) => iqr.score_window(points, history),
            AnomalyScorer::IsolationForest(forest) => forest.score_window(points, history),
        }
    }
}

/// Aggregate of a scored window: the maximum score, anomalous if any point is.
pub fn aggregate(scores: &[PointScore]) -> Option<PointScore> {
    if scores.is_empty() {
        return None;
    }
    let score = scores.iter().map(|s| s.score).fold(0.0_f64, f64::max);
    Some(PointScore {
        score,
        is_anomaly: scores.iter().any(|s| s.is_anomaly),
        insufficient_history: scores.iter().all(|s| s.insufficient_history),
    })
}

/// Linear-interpolated quantile of a sorted slice.
pub(crate) fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_takes_max() {
        let scores = [
            PointScore::normal(0.0),
            PointScore::flagged(3.2),
            PointScore::normal(0.4),
        ];
        let agg = aggregate(&scores).unwrap();
        assert_eq!(agg.score, 3.2);
        assert!(agg.is_anomaly);
        assert!(!agg.insufficient_history);
        assert!(aggregate(&[]).is_none());
    }

    #[test]
    fn test_percentile() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 0.5), 3.0);
        assert_eq!(percentile(&sorted, 0.25), 2.0);
        assert_eq!(percentile(&sorted, 1.0), 5.0);
    }

    #[test]
    fn test_confidence_interval_needs_bound_quantiles() {
        let scorer = AnomalyScorer::from_config(&AnomalyConfig {
            confidence_level: 0.8,
            ..AnomalyConfig::default()
        });
        let levels = scorer.required_quantiles();
        assert_eq!(levels.len(), 2);
        assert!((levels[0] - 0.1).abs() < 1e-9);
        assert!((levels[1] - 0.9).abs() < 1e-9);
        assert!(!scorer.uses_history());
    }
}
