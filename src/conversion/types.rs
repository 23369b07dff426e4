//! Core data types for the conversion pipeline
//!
//! This module defines the values that flow between the planner, the
//! resamplers and the reconciler:
//! - `Point`: a single (timestamp, value) sample
//! - `ArchiveInfo`: one fixed-resolution ring inside a legacy file
//! - `Retention`: one destination storage level
//! - `Method`: how a window of samples is reduced to one value

use crate::conversion::error::{ConversionError, ConversionResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single sample: seconds since epoch and its value
///
/// `(0, 0)` marks an unset slot in a legacy archive and is never treated as a
/// real measurement.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Unix timestamp in seconds
    pub timestamp: u32,
    /// The measured value
    pub value: f64,
}

impl Point {
    pub fn new(timestamp: u32, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// Whether this point is the "no data" sentinel
    pub fn is_gap(&self) -> bool {
        self.timestamp == 0 && self.value == 0.0
    }
}

/// Descriptor of one archive inside a legacy multi-resolution file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    /// Byte offset of the archive's data inside the file
    pub offset: u32,
    /// Resolution of the archive
    pub seconds_per_point: u32,
    /// Capacity of the ring, in points
    pub points: u32,
}

impl ArchiveInfo {
    pub fn new(offset: u32, seconds_per_point: u32, points: u32) -> Self {
        Self {
            offset,
            seconds_per_point,
            points,
        }
    }

    /// Longest span of history the archive can hold, in seconds
    pub fn native_range(&self) -> u64 {
        u64::from(self.seconds_per_point) * u64::from(self.points)
    }
}

/// A destination storage level: resolution plus history length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    pub seconds_per_point: u32,
    pub number_of_points: u32,
}

impl Retention {
    pub fn new(seconds_per_point: u32, number_of_points: u32) -> Self {
        Self {
            seconds_per_point,
            number_of_points,
        }
    }

    /// Requested span of history, in seconds
    pub fn total_range(&self) -> u64 {
        u64::from(self.seconds_per_point) * u64::from(self.number_of_points)
    }
}

/// How to reduce the samples of one window to a single value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Value of the newest sample (current state gauges)
    Last,
    /// Sum of the samples (counters, totals)
    Sum,
    /// Number of samples
    Count,
    /// Arithmetic mean
    Average,
    /// Smallest sample
    Min,
    /// Largest sample
    Max,
}

impl Method {
    /// Get all methods for iteration
    pub fn all() -> &'static [Method] {
        &[
            Method::Last,
            Method::Sum,
            Method::Count,
            Method::Average,
            Method::Min,
            Method::Max,
        ]
    }

    /// Short name used in row keys
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Last => "lst",
            Method::Sum => "sum",
            Method::Count => "cnt",
            Method::Average => "avg",
            Method::Min => "min",
            Method::Max => "max",
        }
    }

    /// Aggregate a slice of values according to this method
    pub fn aggregate(&self, values: &[f64]) -> Option<f64> {
        let last = *values.last()?;

        Some(match self {
            Method::Sum => values.iter().sum(),
            Method::Average => values.iter().sum::<f64>() / values.len() as f64,
            Method::Last => last,
            Method::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Method::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            Method::Count => values.len() as f64,
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ConversionError;

    fn from_str(s: &str) -> ConversionResult<Self> {
        match s.trim().to_lowercase().as_str() {
            "lst" | "last" => Ok(Method::Last),
            "sum" => Ok(Method::Sum),
            "cnt" | "count" => Ok(Method::Count),
            "avg" | "average" => Ok(Method::Average),
            "min" => Ok(Method::Min),
            "max" => Ok(Method::Max),
            other => Err(ConversionError::invalid(format!(
                "unknown aggregation method: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gap_sentinel() {
        assert!(Point::new(0, 0.0).is_gap());
        assert!(!Point::new(0, 1.0).is_gap());
        assert!(!Point::new(10, 0.0).is_gap());
    }

    #[test]
    fn test_ranges() {
        assert_eq!(ArchiveInfo::new(0, 60, 2880).native_range(), 172_800);
        assert_eq!(Retention::new(3600, 17520).total_range(), 63_072_000);
    }

    #[test]
    fn test_aggregation_methods() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];

        assert_eq!(Method::Sum.aggregate(&values), Some(15.0));
        assert_eq!(Method::Average.aggregate(&values), Some(3.0));
        assert_eq!(Method::Last.aggregate(&values), Some(5.0));
        assert_eq!(Method::Max.aggregate(&values), Some(5.0));
        assert_eq!(Method::Min.aggregate(&values), Some(1.0));
        assert_eq!(Method::Count.aggregate(&values), Some(5.0));

        let empty: Vec<f64> = vec![];
        assert_eq!(Method::Sum.aggregate(&empty), None);
    }

    #[test]
    fn test_method_names() {
        for method in Method::all() {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), *method);
        }
        assert_eq!("average".parse::<Method>().unwrap(), Method::Average);
        assert_eq!("LAST".parse::<Method>().unwrap(), Method::Last);
        assert!(matches!(
            "median".parse::<Method>(),
            Err(ConversionError::InvalidInput(_))
        ));
    }
}
