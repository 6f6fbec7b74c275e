//! Task results: forecasts, anomaly scores and training artifacts

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Predicted values for one quantile level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileSeries {
    pub level: f64,
    pub values: Vec<f64>,
}

/// Model output for one forecast origin.
///
/// `mean` and every quantile series hold one value per step after the origin.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Forecast {
    pub mean: Vec<f64>,
    #[serde(default)]
    pub quantiles: Vec<QuantileSeries>,
}

impl Forecast {
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    /// Quantile series whose level is closest to `level`.
    pub fn nearest_quantile(&self, level: f64) -> Option<&QuantileSeries> {
        self.quantiles.iter().min_by(|a, b| {
            (a.level - level)
                .abs()
                .total_cmp(&(b.level - level).abs())
        })
    }

    /// Quantile values at a single step, as `(level, value)` pairs.
    pub fn quantiles_at(&self, index: usize) -> Vec<(f64, f64)> {
        self.quantiles
            .iter()
            .filter_map(|q| q.values.get(index).map(|v| (q.level, *v)))
            .collect()
    }

    /// Check every series has the expected length and finite values.
    pub fn check_shape(&self, expected: usize) -> Result<(), String> {
        if self.mean.len() != expected {
            return Err(format!(
                "expected {expected} predicted points, got {}",
                self.mean.len()
            ));
        }
        for q in &self.quantiles {
            if q.values.len() != expected {
                return Err(format!(
                    "quantile {} has {} points, expected {expected}",
                    q.level,
                    q.values.len()
                ));
            }
        }
        if self
            .mean
            .iter()
            .chain(self.quantiles.iter().flat_map(|q| q.values.iter()))
            .any(|v| !v.is_finite())
        {
            return Err("forecast contains non-finite values".to_string());
        }
        Ok(())
    }
}

/// Format a quantile level the way it appears in the `quantile` label.
pub fn quantile_label(level: f64) -> String {
    let mut s = format!("{level}");
    if !s.contains('.') {
        s.push_str(".0");
    }
    s
}

/// Reference to a trained model, owned by the pipeline registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub pipeline: String,
    pub model_id: String,
    pub trained_at: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forecast() -> Forecast {
        Forecast {
            mean: vec![10.0, 11.0],
            quantiles: vec![
                QuantileSeries { level: 0.1, values: vec![8.0, 9.0] },
                QuantileSeries { level: 0.9, values: vec![12.0, 13.0] },
            ],
        }
    }

    #[test]
    fn test_nearest_quantile() {
        let f = forecast();
        assert_eq!(f.nearest_quantile(0.05).unwrap().level, 0.1);
        assert_eq!(f.nearest_quantile(0.975).unwrap().level, 0.9);
        assert!(Forecast::default().nearest_quantile(0.5).is_none());
    }

    #[test]
    fn test_check_shape() {
        let f = forecast();
        assert!(f.check_shape(2).is_ok());
        assert!(f.check_shape(3).is_err());

        let mut bad = forecast();
        bad.mean[1] = f64::NAN;
        assert!(bad.check_shape(2).is_err());
    }

    #[test]
    fn test_quantile_label() {
        assert_eq!(quantile_label(0.1), "0.1");
        assert_eq!(quantile_label(0.95), "0.95");
        assert_eq!(quantile_label(1.0), "1.0");
    }
}
