//! Fixed-width age bins.

use crate::error::{BiopoolError, Result};
use serde::{Deserialize, Serialize};

/// Age-binning configuration.
///
/// Bins are left-closed, right-open. With `open_upper` the terminal bin is
/// open-ended (`85+` style) and catches every age at or above `max_age`;
/// otherwise the last regular bin is closed on both ends so `max_age` itself
/// still lands in a bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgeBins {
    pub min_age: f64,
    pub max_age: f64,
    pub width: f64,
    pub open_upper: bool,
}

impl Default for AgeBins {
    fn default() -> Self {
        Self {
            min_age: 20.0,
            max_age: 85.0,
            width: 5.0,
            open_upper: true,
        }
    }
}

/// One realized age bin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgeBin {
    /// Display label (e.g. "20-24" or "85+").
    pub label: String,
    /// Inclusive lower bound.
    pub lower: f64,
    /// Exclusive upper bound; `None` for the open-ended terminal bin.
    pub upper: Option<f64>,
    /// Bin midpoint used as the trend x-coordinate.
    pub midpoint: f64,
}

fn integral(v: f64) -> bool {
    v.fract() == 0.0
}

fn range_label(lower: f64, width: f64) -> String {
    if integral(lower) && integral(width) {
        format!("{}-{}", lower as i64, (lower + width - 1.0) as i64)
    } else {
        format!("{}-{}", lower, lower + width)
    }
}

impl AgeBins {
    /// Check bounds and width.
    pub fn validate(&self) -> Result<()> {
        if !(self.width > 0.0) {
            return Err(BiopoolError::InvalidParameter(
                "age bin width must be positive".to_string(),
            ));
        }
        if self.max_age <= self.min_age {
            return Err(BiopoolError::InvalidParameter(
                "max_age must exceed min_age".to_string(),
            ));
        }
        Ok(())
    }

    fn n_regular(&self) -> usize {
        ((self.max_age - self.min_age) / self.width).ceil() as usize
    }

    /// Materialize the bin sequence.
    pub fn bins(&self) -> Vec<AgeBin> {
        let n = self.n_regular();
        let mut bins = Vec::with_capacity(n + 1);
        for k in 0..n {
            let lower = self.min_age + k as f64 * self.width;
            let upper = (lower + self.width).min(self.max_age);
            bins.push(AgeBin {
                label: range_label(lower, upper - lower),
                lower,
                upper: Some(upper),
                midpoint: lower + (upper - lower) / 2.0,
            });
        }
        if self.open_upper {
            let label = if integral(self.max_age) {
                format!("{}+", self.max_age as i64)
            } else {
                format!("{}+", self.max_age)
            };
            bins.push(AgeBin {
                label,
                lower: self.max_age,
                upper: None,
                midpoint: self.max_age + self.width / 2.0,
            });
        }
        bins
    }

    /// Index of the bin an age falls into, or `None` when out of range.
    pub fn assign(&self, age: f64) -> Option<usize> {
        if !age.is_finite() || age < self.min_age {
            return None;
        }
        let n = self.n_regular();
        if age >= self.max_age {
            if self.open_upper {
                return Some(n);
            }
            // Last regular bin is closed on both ends.
            if age == self.max_age {
                return Some(n - 1);
            }
            return None;
        }
        let idx = ((age - self.min_age) / self.width) as usize;
        Some(idx.min(n - 1))
    }
}
