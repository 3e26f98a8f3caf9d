use super::predict::{finalize_event_time, order1_general, order1_q_from_c};
use super::QssMethod;
use crate::engine::EngineState;
use crate::error::QssResult;
use crate::time::Time;

/// First-order linearly implicit QSS.
///
/// Each state keeps a diagonal linearization `f ≈ a*q + u` of its own
/// derivative. When the naive quantized value would make the linearized
/// slope point against the continuous slope, the state is quantized at the
/// linearization's equilibrium instead, which suppresses the event chatter
/// explicit QSS1 shows on stiff states.
#[derive(Debug, Default)]
pub struct Liqss1 {
    derivatives: Vec<f64>,
    jacobian_diagonal: Vec<f64>,
    input_terms: Vec<f64>,
    /// Quantized value just before the most recent quantization event.
    previous_quantized: Vec<f64>,
    /// Continuous value at the most recent quantization event.
    continuous_at_quantization: Vec<Option<f64>>,
    quantized_since_rate: Vec<bool>,
    has_previous_derivative: Vec<bool>,
}

impl QssMethod for Liqss1 {
    fn name(&self) -> &'static str {
        "liqss1"
    }

    fn state_model_order(&self) -> usize {
        0
    }

    fn allocate(&mut self, state_count: usize) {
        self.derivatives = vec![0.0; state_count];
        self.jacobian_diagonal = vec![0.0; state_count];
        self.input_terms = vec![0.0; state_count];
        self.previous_quantized = vec![0.0; state_count];
        self.continuous_at_quantization = vec![None; state_count];
        self.quantized_since_rate = vec![false; state_count];
        self.has_previous_derivative = vec![false; state_count];
    }

    fn reset_state(&mut self, index: usize) {
        self.jacobian_diagonal[index] = 0.0;
        self.input_terms[index] = 0.0;
        self.continuous_at_quantization[index] = None;
        self.quantized_since_rate[index] = false;
        self.has_previous_derivative[index] = false;
    }

    fn trigger_quantization_event(&mut self, state: &mut EngineState, index: usize, now: Time) {
        let continuous = &state.continuous[index];
        let x = continuous.evaluate(now);
        let slope = continuous.evaluate_derivative(now);
        let dq = state.quanta[index];

        let mut value = if slope > 0.0 {
            x + dq
        } else if slope < 0.0 {
            x - dq
        } else {
            x
        };
        let a = self.jacobian_diagonal[index];
        let u = self.input_terms[index];
        if a != 0.0 && (a * value + u) * slope < 0.0 {
            value = (-u / a).clamp(x - dq, x + dq);
        }

        let quantized = &mut state.quantized[index];
        self.previous_quantized[index] = quantized.coeffs()[0];
        quantized.make_constant(value, now);
        self.continuous_at_quantization[index] = Some(x);
        self.quantized_since_rate[index] = true;
    }

    fn trigger_rate_event(&mut self, state: &mut EngineState, now: Time) -> QssResult<()> {
        state.evaluate_derivatives(now, &mut self.derivatives)?;

        for (index, continuous) in state.continuous.iter_mut().enumerate() {
            let f = self.derivatives[index];
            let q = state.quantized[index].coeffs()[0];

            // Reads the old slope, so it must run before the overwrite below.
            let change = q - self.previous_quantized[index];
            let mut a = 0.0;
            if self.quantized_since_rate[index] && self.has_previous_derivative[index] && change != 0.0 {
                a = (f - continuous.coeffs()[1]) / change;
                if !a.is_finite() {
                    a = 0.0;
                }
            }
            self.jacobian_diagonal[index] = a;
            self.input_terms[index] = f - a * q;
            self.quantized_since_rate[index] = false;
            self.has_previous_derivative[index] = true;

            let value = continuous.evaluate(now);
            let coeffs = continuous.coeffs_mut();
            coeffs[0] = value;
            coeffs[1] = f;
            continuous.set_time(now);
        }
        Ok(())
    }

    fn predict_quantization_event_time(&self, state: &EngineState, index: usize, max: Time) -> Time {
        let continuous = &state.continuous[index];
        let quantized = &state.quantized[index];
        let (Some(c_tag), Some(q_tag)) = (continuous.time(), quantized.time()) else {
            return max;
        };
        let dq = state.quanta[index];
        let slope = continuous.coeffs()[1];

        if q_tag > c_tag {
            return finalize_event_time(q_tag, order1_q_from_c(dq, slope), max);
        }
        let reference = self.continuous_at_quantization[index].unwrap_or(quantized.coeffs()[0]);
        let drift = continuous.coeffs()[0] - reference;
        finalize_event_time(c_tag, order1_general(dq, drift, slope), max)
    }
}
