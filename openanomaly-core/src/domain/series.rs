//! Time series values exchanged with the TSDB

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// One labelled series as returned by a range query.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<Sample>,
}

impl Series {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    pub fn value_at(&self, timestamp: DateTime<Utc>) -> Option<f64> {
        self.samples
            .iter()
            .find(|s| s.timestamp == timestamp)
            .map(|s| s.value)
    }
}

/// A single point to be written back to the TSDB.
#[derive(Debug, Clone, PartialEq)]
pub struct WritePoint {
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl WritePoint {
    pub fn new(metric: impl Into<String>, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            metric: metric.into(),
            labels: BTreeMap::new(),
            timestamp,
            value,
        }
    }

    pub fn label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }
}
