//! Engine configuration.

use crate::error::{QssError, QssResult};
use serde::{Deserialize, Serialize};

/// Numerical settings shared by the engine and its method strategies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QssSettings {
    /// Absolute quantum tolerance applied to every state when the
    /// derivative function is bound.
    pub absolute_tolerance: f64,
    /// Relative quantum tolerance applied alongside `absolute_tolerance`.
    pub relative_tolerance: f64,
    /// Relative time step for finite-difference derivative sampling,
    /// scaled by `max(1, |t|)`.
    pub finite_difference_step: f64,
    pub root_absolute_tolerance: f64,
    pub root_relative_tolerance: f64,
}

impl Default for QssSettings {
    fn default() -> Self {
        Self {
            absolute_tolerance: 1e-20,
            relative_tolerance: 1e-16,
            finite_difference_step: 1e-6,
            root_absolute_tolerance: 1e-15,
            root_relative_tolerance: 1e-9,
        }
    }
}

impl QssSettings {
    pub fn with_tolerances(absolute_tolerance: f64, relative_tolerance: f64) -> Self {
        Self {
            absolute_tolerance,
            relative_tolerance,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> QssResult<()> {
        if !(self.absolute_tolerance > 0.0) || !self.absolute_tolerance.is_finite() {
            return Err(QssError::InvalidTolerance {
                absolute: self.absolute_tolerance,
                relative: self.relative_tolerance,
            });
        }
        if !(self.relative_tolerance >= 0.0) || !self.relative_tolerance.is_finite() {
            return Err(QssError::InvalidTolerance {
                absolute: self.absolute_tolerance,
                relative: self.relative_tolerance,
            });
        }
        if !(self.finite_difference_step > 0.0) || !self.finite_difference_step.is_finite() {
            return Err(QssError::InvalidArg {
                what: format!(
                    "finite_difference_step must be positive; got {}",
                    self.finite_difference_step
                ),
            });
        }
        if !(self.root_absolute_tolerance > 0.0) || !(self.root_relative_tolerance > 0.0) {
            return Err(QssError::InvalidArg {
                what: "root-finder tolerances must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Finite-difference sample offset at simulation time `t`.
    pub(crate) fn sample_step(&self, t: f64) -> f64 {
        self.finite_difference_step * t.abs().max(1.0)
    }
}
