//! Simulation time.
//!
//! `Time` wraps an `f64` that is never NaN, which makes it totally ordered.
//! Positive infinity is a legal value and serves as the "no event" horizon.

use crate::error::{QssError, QssResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Time(f64);

impl Time {
    pub const ZERO: Time = Time(0.0);
    pub const POSITIVE_INFINITY: Time = Time(f64::INFINITY);

    pub fn new(value: f64) -> QssResult<Self> {
        if value.is_nan() {
            return Err(QssError::InvalidTime {
                what: "time cannot be NaN".to_string(),
            });
        }
        // Collapse -0.0 so that equality and ordering agree.
        Ok(Time(if value == 0.0 { 0.0 } else { value }))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn is_finite(self) -> bool {
        self.0.is_finite()
    }

    /// Returns `self - earlier` as a plain number.
    pub fn subtract_to_f64(self, earlier: Time) -> f64 {
        self.0 - earlier.0
    }

    /// Adds `dt`, rejecting results that are NaN or negative infinity.
    pub fn add(self, dt: f64) -> QssResult<Time> {
        let sum = self.0 + dt;
        if sum.is_nan() || sum == f64::NEG_INFINITY {
            return Err(QssError::InvalidTime {
                what: format!("{} + {} is not a valid time", self.0, dt),
            });
        }
        Time::new(sum)
    }

    /// Adds `dt` without validation. Callers guarantee `dt` is not NaN.
    pub fn add_unchecked(self, dt: f64) -> Time {
        Time(self.0 + dt)
    }

    /// Distance from this time to the next representable time above it.
    pub fn ulp(self) -> f64 {
        ulp(self.0)
    }

    pub fn min(self, other: Time) -> Time {
        if other < self {
            other
        } else {
            self
        }
    }
}

/// Unit in the last place of `value`, matching `Math.ulp` semantics:
/// the smallest subnormal for zero and infinity for infinite inputs.
pub fn ulp(value: f64) -> f64 {
    let magnitude = value.abs();
    if !magnitude.is_finite() {
        return f64::INFINITY;
    }
    if magnitude == f64::MAX {
        return magnitude - f64::from_bits(magnitude.to_bits() - 1);
    }
    f64::from_bits(magnitude.to_bits() + 1) - magnitude
}

impl Eq for Time {}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

impl TryFrom<f64> for Time {
    type Error = QssError;

    fn try_from(value: f64) -> QssResult<Self> {
        Time::new(value)
    }
}

impl From<Time> for f64 {
    fn from(time: Time) -> f64 {
        time.0
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
