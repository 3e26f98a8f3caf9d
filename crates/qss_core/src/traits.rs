use crate::error::DerivativeError;
use crate::time::Time;

/// The right-hand side of `dx/dt = f(t, x, u)`, evaluated by the QSS engine
/// on quantized states `x` and input variables `u`.
pub trait DerivativeFunction {
    /// Returns the number of state variables.
    fn state_count(&self) -> usize;

    /// Returns the number of input variables.
    fn input_variable_count(&self) -> usize {
        0
    }

    /// Returns the number of event indicators the model declares. A nonzero
    /// count switches the higher-order methods to their extra sampling.
    fn event_indicator_count(&self) -> usize {
        0
    }

    /// Evaluates the derivatives.
    /// time: simulation time
    /// states: state values (length `state_count`)
    /// inputs: input-variable values (length `input_variable_count`)
    /// derivatives: buffer to write `dx/dt`
    fn evaluate(
        &mut self,
        time: Time,
        states: &[f64],
        inputs: &[f64],
        derivatives: &mut [f64],
    ) -> Result<(), DerivativeError>;

    /// Whether `evaluate_sampled` is implemented.
    fn provides_sampled_derivatives(&self) -> bool {
        false
    }

    /// Evaluates the derivatives at `time` and again at a sample point of the
    /// function's own choosing, `time + delta`, with the states advanced
    /// linearly along the derivatives just computed. Returns `delta`.
    fn evaluate_sampled(
        &mut self,
        _time: Time,
        _states: &[f64],
        _inputs: &[f64],
        _derivatives: &mut [f64],
        _sampled_derivatives: &mut [f64],
    ) -> Result<f64, DerivativeError> {
        Err(DerivativeError::SamplingUnsupported)
    }
}
