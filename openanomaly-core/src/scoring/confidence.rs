use super::{PointScore, ScoreInput};

/// Flags actuals outside the forecast's central band for a confidence level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceInterval {
    confidence_level: f64,
}

impl ConfidenceInterval {
    pub fn new(confidence_level: f64) -> Self {
        Self { confidence_level }
    }

    /// Lower and upper quantile levels of the band.
    pub fn bounds(&self) -> (f64, f64) {
        let tail = (1.0 - self.confidence_level) / 2.0;
        (tail, 1.0 - tail)
    }

    pub fn score(&self, point: &ScoreInput) -> PointScore {
        let (lower_level, upper_level) = self.bounds();
        let (Some(lower), Some(upper)) = (
            nearest(&point.quantiles, lower_level),
            nearest(&point.quantiles, upper_level),
        ) else {
            return PointScore::insufficient();
        };

        let width = upper - lower;
        let width = if width.is_finite() && width > f64::EPSILON {
            width
        } else {
            1.0
        };

        // On the bound is inside the band.
        if point.actual > upper {
            PointScore::flagged((point.actual - upper) / width)
        } else if point.actual < lower {
            PointScore::flagged((lower - point.actual) / width)
        } else {
            PointScore::normal(0.0)
        }
    }
}

fn nearest(quantiles: &[(f64, f64)], level: f64) -> Option<f64> {
    quantiles
        .iter()
        .min_by(|a, b| (a.0 - level).abs().total_cmp(&(b.0 - level).abs()))
        .map(|(_, value)| *value)
}
