use super::{PointScore, ScoreInput, residual};

const MIN_HISTORY: usize = 3;

/// Residual size in units of the residual history's standard deviation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZScore {
    threshold: f64,
}

impl ZScore {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn score_window(&self, points: &[ScoreInput], history: &[f64]) -> Vec<PointScore> {
        let Some(stddev) = stddev(history) else {
            return vec![PointScore::insufficient(); points.len()];
        };

        points
            .iter()
            .map(|p| {
                let z = residual(p.predicted, p.actual).abs() / stddev;
                if z > self.threshold {
                    PointScore::flagged(z)
                } else {
                    PointScore::normal(z)
                }
            })
            .collect()
    }
}

/// Sample standard deviation; `None` when too short or flat.
fn stddev(values: &[f64]) -> Option<f64> {
    if values.len() < MIN_HISTORY {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let stddev = variance.sqrt();
    (stddev > f64::EPSILON).then_some(stddev)
}
