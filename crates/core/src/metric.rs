use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MetricError;

/// Maximum number of dimensions a single data point may carry.
pub const LIMIT_DIMENSIONS_COUNT: usize = 50;

/// Maximum length of an encoded line, in bytes.
pub const LIMIT_LINE_LENGTH: usize = 2000;

/// How the receiver interprets the numeric payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Absolute instantaneous value.
    Gauge,
    /// Absolute counter value; the receiver derives deltas itself.
    Count,
    /// Monotonic delta since the previous report, summed by the receiver.
    Delta,
}

impl MetricKind {
    /// Whether values of this kind are additive within one interval.
    pub fn is_delta(self) -> bool {
        matches!(self, MetricKind::Delta)
    }
}

/// Pre-aggregated gauge statistics for one interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SummaryStat {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: f64,
}

impl SummaryStat {
    pub fn new(min: f64, max: f64, sum: f64, count: f64) -> Self {
        Self { min, max, sum, count }
    }

    /// Build a summary from a set of observations. Returns `None` when empty.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let first = *values.first()?;
        let mut stat = Self::new(first, first, 0.0, 0.0);
        for &v in values {
            stat.min = stat.min.min(v);
            stat.max = stat.max.max(v);
            stat.sum += v;
            stat.count += 1.0;
        }
        Some(stat)
    }

    fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.sum.is_finite() && self.count.is_finite()
    }
}

/// Payload of a data point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    Number(f64),
    Summary(SummaryStat),
}

impl MetricValue {
    /// Scalar value, if this is not a summary.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Number(v) => Some(*v),
            MetricValue::Summary(_) => None,
        }
    }

    fn is_finite(&self) -> bool {
        match self {
            MetricValue::Number(v) => v.is_finite(),
            MetricValue::Summary(s) => s.is_finite(),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::Number(v as f64)
    }
}

impl From<SummaryStat> for MetricValue {
    fn from(v: SummaryStat) -> Self {
        MetricValue::Summary(v)
    }
}

/// A single data point as reported by a callback or the runtime itself.
///
/// Dimensions are kept in a `BTreeMap` so that encoding is deterministic
/// and keys are unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub key: String,
    pub value: MetricValue,
    pub kind: MetricKind,
    pub dimensions: BTreeMap<String, String>,
    /// Capture time. `None` lets the receiver assign "now".
    pub timestamp: Option<DateTime<Utc>>,
}

impl Metric {
    pub fn new(key: impl Into<String>, value: impl Into<MetricValue>, kind: MetricKind) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind,
            dimensions: BTreeMap::new(),
            timestamp: None,
        }
    }

    pub fn gauge(key: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        Self::new(key, value, MetricKind::Gauge)
    }

    pub fn count(key: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        Self::new(key, value, MetricKind::Count)
    }

    pub fn delta(key: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        Self::new(key, value, MetricKind::Delta)
    }

    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }

    pub fn with_dimensions<K, V>(mut self, dims: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.dimensions
            .extend(dims.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Check structural invariants. Line length is checked by the encoder.
    pub fn validate(&self) -> Result<(), MetricError> {
        if self.key.is_empty() {
            return Err(MetricError::EmptyKey);
        }
        if let Some(ch) = self.key.chars().find(|c| is_reserved(*c)) {
            return Err(MetricError::InvalidKey { key: self.key.clone(), ch });
        }
        if self.dimensions.len() > LIMIT_DIMENSIONS_COUNT {
            return Err(MetricError::TooManyDimensions {
                key: self.key.clone(),
                count: self.dimensions.len(),
                limit: LIMIT_DIMENSIONS_COUNT,
            });
        }
        for (dim, value) in &self.dimensions {
            if dim.is_empty() {
                return Err(MetricError::EmptyDimensionKey(self.key.clone()));
            }
            if let Some(ch) = dim.chars().find(|c| is_reserved(*c)) {
                return Err(MetricError::InvalidDimensionKey {
                    key: self.key.clone(),
                    dimension: dim.clone(),
                    ch,
                });
            }
            if value.contains(['\n', '\r']) {
                return Err(MetricError::InvalidDimensionValue {
                    key: self.key.clone(),
                    dimension: dim.clone(),
                });
            }
        }
        if !self.value.is_finite() {
            return Err(MetricError::NonFiniteValue(self.key.clone()));
        }
        if matches!(self.value, MetricValue::Summary(_)) && self.kind != MetricKind::Gauge {
            return Err(MetricError::SummaryNotGauge(self.key.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match crate::line::encode(self) {
            Ok(line) => f.write_str(&line),
            Err(e) => write!(f, "<invalid metric {}: {}>", self.key, e),
        }
    }
}

/// Characters that collide with the line-format delimiters.
pub(crate) fn is_reserved(c: char) -> bool {
    c.is_whitespace() || matches!(c, ',' | '=' | '"' | '\\')
}
