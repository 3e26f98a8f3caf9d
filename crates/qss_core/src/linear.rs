//! Linear time-invariant systems `dx/dt = A x + B u`.

use crate::error::{DerivativeError, QssError, QssResult};
use crate::time::Time;
use crate::traits::DerivativeFunction;
use nalgebra::{DMatrix, DVector, DVectorView};

/// A linear system with state matrix `a` (n x n) and input matrix `b`
/// (n x m). Provides pre-sampled derivatives, since the derivative along a
/// linear state extrapolation is exact.
#[derive(Debug, Clone)]
pub struct LinearSystem {
    a: DMatrix<f64>,
    b: DMatrix<f64>,
    sample_delta: f64,
    scratch: DVector<f64>,
    advanced: DVector<f64>,
}

impl LinearSystem {
    pub const DEFAULT_SAMPLE_DELTA: f64 = 1e-6;

    /// Autonomous system with no input variables.
    pub fn new(a: DMatrix<f64>) -> QssResult<Self> {
        let n = a.nrows();
        Self::with_inputs(a, DMatrix::zeros(n, 0))
    }

    pub fn with_inputs(a: DMatrix<f64>, b: DMatrix<f64>) -> QssResult<Self> {
        if a.nrows() == 0 || !a.is_square() {
            return Err(QssError::InvalidArg {
                what: format!("state matrix must be square and non-empty; got {}x{}", a.nrows(), a.ncols()),
            });
        }
        if b.nrows() != a.nrows() {
            return Err(QssError::InvalidArg {
                what: format!("input matrix needs {} rows; got {}", a.nrows(), b.nrows()),
            });
        }
        if a.iter().chain(b.iter()).any(|v| !v.is_finite()) {
            return Err(QssError::InvalidArg {
                what: "system matrices must be finite".to_string(),
            });
        }
        let n = a.nrows();
        Ok(Self {
            a,
            b,
            sample_delta: Self::DEFAULT_SAMPLE_DELTA,
            scratch: DVector::zeros(n),
            advanced: DVector::zeros(n),
        })
    }

    /// Sets the offset used by `evaluate_sampled`.
    pub fn with_sample_delta(mut self, delta: f64) -> QssResult<Self> {
        if !(delta > 0.0) || !delta.is_finite() {
            return Err(QssError::InvalidArg {
                what: format!("sample delta must be positive and finite; got {delta}"),
            });
        }
        self.sample_delta = delta;
        Ok(self)
    }

    pub fn a(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub fn b(&self) -> &DMatrix<f64> {
        &self.b
    }

    /// Unforced response `exp(A t) x0`.
    pub fn exact_solution(&self, x0: &[f64], t: f64) -> QssResult<DVector<f64>> {
        if x0.len() != self.a.nrows() {
            return Err(QssError::InvalidArg {
                what: format!("expected {} initial values; got {}", self.a.nrows(), x0.len()),
            });
        }
        let propagator = (&self.a * t).exp();
        Ok(propagator * DVector::from_column_slice(x0))
    }

    fn apply(&mut self, states: &[f64], inputs: &[f64], derivatives: &mut [f64]) -> Result<(), DerivativeError> {
        product(&self.a, &self.b, states, inputs, &mut self.scratch);
        copy_finite(&self.scratch, derivatives)
    }
}

/// `out = a x + b u` without allocating.
fn product(a: &DMatrix<f64>, b: &DMatrix<f64>, states: &[f64], inputs: &[f64], out: &mut DVector<f64>) {
    let x = DVectorView::from_slice(states, a.ncols());
    out.gemv(1.0, a, &x, 0.0);
    if b.ncols() > 0 {
        let u = DVectorView::from_slice(inputs, b.ncols());
        out.gemv(1.0, b, &u, 1.0);
    }
}

fn copy_finite(values: &DVector<f64>, derivatives: &mut [f64]) -> Result<(), DerivativeError> {
    for (index, (out, &value)) in derivatives.iter_mut().zip(values.iter()).enumerate() {
        if !value.is_finite() {
            return Err(DerivativeError::NonFinite { index, value });
        }
        *out = value;
    }
    Ok(())
}

impl DerivativeFunction for LinearSystem {
    fn state_count(&self) -> usize {
        self.a.nrows()
    }

    fn input_variable_count(&self) -> usize {
        self.b.ncols()
    }

    fn evaluate(
        &mut self,
        _time: Time,
        states: &[f64],
        inputs: &[f64],
        derivatives: &mut [f64],
    ) -> Result<(), DerivativeError> {
        self.apply(states, inputs, derivatives)
    }

    fn provides_sampled_derivatives(&self) -> bool {
        true
    }

    fn evaluate_sampled(
        &mut self,
        _time: Time,
        states: &[f64],
        inputs: &[f64],
        derivatives: &mut [f64],
        sampled_derivatives: &mut [f64],
    ) -> Result<f64, DerivativeError> {
        self.apply(states, inputs, derivatives)?;
        let delta = self.sample_delta;
        for ((advanced, &x), &dx) in self.advanced.iter_mut().zip(states).zip(derivatives.iter()) {
            *advanced = x + delta * dx;
        }
        product(&self.a, &self.b, self.advanced.as_slice(), inputs, &mut self.scratch);
        copy_finite(&self.scratch, sampled_derivatives)?;
        Ok(delta)
    }
}
