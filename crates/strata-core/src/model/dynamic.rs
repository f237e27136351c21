//! # Time-Versioned Values
//!
//! `Dynamic<T>` is an ordered set of `(timestamp, value)` points. The engine
//! only ever moves the untyped form, [`TimeSeries`], between entities and
//! backends; typed entities convert at their boundary.
//!
//! Points keep insertion order. Extending a series appends, it never merges
//! or re-sorts existing points.
//!
//! `Tensor` values carry a flat data vector plus one label vector per index
//! level and are checked against a [`TensorSchema`].

use crate::StoreError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One point of a time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePoint<T> {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub value: T,
}

impl<T> TimePoint<T> {
    pub fn new(timestamp: f64, value: T) -> Self {
        Self { timestamp, value }
    }
}

/// A time-versioned attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dynamic<T> {
    pub points: Vec<TimePoint<T>>,
}

/// Untyped series as stored by backends.
pub type TimeSeries = Dynamic<Value>;

impl<T> Default for Dynamic<T> {
    fn default() -> Self {
        Self { points: Vec::new() }
    }
}

impl<T> Dynamic<T> {
    #[must_use]
    pub fn new(points: Vec<TimePoint<T>>) -> Self {
        Self { points }
    }

    /// Append a single point.
    pub fn push(&mut self, timestamp: f64, value: T) {
        self.points.push(TimePoint::new(timestamp, value));
    }

    /// Append every point of `other`, preserving order.
    pub fn extend(&mut self, other: Self) {
        self.points.extend(other.points);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

impl<T: Serialize> Dynamic<T> {
    /// Convert to the untyped form.
    pub fn to_series(&self) -> Result<TimeSeries, StoreError> {
        let points = self
            .points
            .iter()
            .map(|p| {
                serde_json::to_value(&p.value).map(|value| TimePoint::new(p.timestamp, value))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Dynamic { points })
    }
}

impl<T: DeserializeOwned> Dynamic<T> {
    /// Convert from the untyped form, failing on the first point whose value
    /// does not deserialize into `T`.
    pub fn from_series(series: TimeSeries) -> Result<Self, StoreError> {
        let points = series
            .points
            .into_iter()
            .map(|p| serde_json::from_value(p.value).map(|value| TimePoint::new(p.timestamp, value)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { points })
    }
}

// =============================================================================
// TENSORS
// =============================================================================

/// Tensor-shaped point value: flat data with a multi-level index.
///
/// `index[level][i]` labels `data[i]` on that level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub data: Vec<f64>,
    pub index: Vec<Vec<i64>>,
}

impl Tensor {
    #[must_use]
    pub fn new(data: Vec<f64>, index: Vec<Vec<i64>>) -> Self {
        Self { data, index }
    }
}

/// One level of a tensor index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexLevel {
    pub name: String,
    /// Labels must be strictly greater than this bound, when set.
    #[serde(default)]
    pub min_exclusive: Option<i64>,
}

impl IndexLevel {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_exclusive: None,
        }
    }

    #[must_use]
    pub fn greater_than(mut self, bound: i64) -> Self {
        self.min_exclusive = Some(bound);
        self
    }
}

/// Index schema a tensor-valued series must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSchema {
    /// Name of the measured quantity.
    pub name: String,
    pub levels: Vec<IndexLevel>,
}

impl TensorSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, levels: Vec<IndexLevel>) -> Self {
        Self {
            name: name.into(),
            levels,
        }
    }

    /// Check a tensor's shape and labels against this schema.
    pub fn validate(&self, tensor: &Tensor) -> Result<(), StoreError> {
        if tensor.index.len() != self.levels.len() {
            return Err(StoreError::schema(format!(
                "tensor '{}' expects {} index levels, got {}",
                self.name,
                self.levels.len(),
                tensor.index.len()
            )));
        }
        for (level, labels) in self.levels.iter().zip(&tensor.index) {
            if labels.len() != tensor.data.len() {
                return Err(StoreError::schema(format!(
                    "tensor '{}' index level '{}' has {} labels for {} values",
                    self.name,
                    level.name,
                    labels.len(),
                    tensor.data.len()
                )));
            }
            if let Some(bound) = level.min_exclusive {
                if let Some(bad) = labels.iter().find(|&&label| label <= bound) {
                    return Err(StoreError::schema(format!(
                        "tensor '{}' index level '{}' label {} must be > {}",
                        self.name, level.name, bad, bound
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate every point of an untyped series.
    pub fn validate_series(&self, series: &TimeSeries) -> Result<(), StoreError> {
        for point in &series.points {
            let tensor: Tensor = serde_json::from_value(point.value.clone()).map_err(|e| {
                StoreError::schema(format!("tensor '{}' point is malformed: {e}", self.name))
            })?;
            self.validate(&tensor)?;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
