use super::{PointScore, ScoreInput, percentile, residual};

const MIN_HISTORY: usize = 4;

/// Tukey fences over the residual history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Iqr;

impl Iqr {
    pub fn score_window(&self, points: &[ScoreInput], history: &[f64]) -> Vec<PointScore> {
        if history.len() < MIN_HISTORY {
            return vec![PointScore::insufficient(); points.len()];
        }
        let mut sorted = history.to_vec();
        sorted.sort_by(f64::total_cmp);
        let q1 = percentile(&sorted, 0.25);
        let q3 = percentile(&sorted, 0.75);
        let spread = q3 - q1;
        let (low, high) = (q1 - 1.5 * spread, q3 + 1.5 * spread);

        points
            .iter()
            .map(|p| {
                let r = residual(p.predicted, p.actual);
                if r > high {
                    PointScore::flagged(r - high)
                } else if r < low {
                    PointScore::flagged(low - r)
                } else {
                    PointScore::normal(0.0)
                }
            })
            .collect()
    }
}
