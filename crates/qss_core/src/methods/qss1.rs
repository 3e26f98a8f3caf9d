use super::predict::{finalize_event_time, order1_general, order1_q_from_c};
use super::QssMethod;
use crate::engine::EngineState;
use crate::error::QssResult;
use crate::time::Time;

/// First-order explicit QSS: constant quantized models, linear continuous
/// models.
#[derive(Debug, Default)]
pub struct Qss1 {
    derivatives: Vec<f64>,
}

impl QssMethod for Qss1 {
    fn name(&self) -> &'static str {
        "qss1"
    }

    fn state_model_order(&self) -> usize {
        0
    }

    fn allocate(&mut self, state_count: usize) {
        self.derivatives = vec![0.0; state_count];
    }

    fn trigger_quantization_event(&mut self, state: &mut EngineState, index: usize, now: Time) {
        let value = state.continuous[index].evaluate(now);
        state.quantized[index].make_constant(value, now);
    }

    fn trigger_rate_event(&mut self, state: &mut EngineState, now: Time) -> QssResult<()> {
        state.evaluate_derivatives(now, &mut self.derivatives)?;
        for (continuous, &slope) in state.continuous.iter_mut().zip(&self.derivatives) {
            let value = continuous.evaluate(now);
            let coeffs = continuous.coeffs_mut();
            coeffs[0] = value;
            coeffs[1] = slope;
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
            finalize_event_time(q_tag, order1_q_from_c(dq, slope), max)
        } else {
            let drift = continuous.coeffs()[0] - quantized.coeffs()[0];
            finalize_event_time(c_tag, order1_general(dq, drift, slope), max)
        }
    }
}
