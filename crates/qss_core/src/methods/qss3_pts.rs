use super::predict::{drift_coefficients, finalize_event_time, order3_general, order3_q_from_c};
use super::sampling::{fit_quadratic, sample_time};
use super::QssMethod;
use crate::engine::EngineState;
use crate::error::QssResult;
use crate::time::Time;

/// Third-order explicit QSS. Quadratic quantized models; the cubic
/// continuous models get their higher coefficients from extra derivative
/// samples taken at perturbed times.
#[derive(Debug, Default)]
pub struct Qss3Pts {
    f0: Vec<f64>,
    f1: Vec<f64>,
    f2: Vec<f64>,
    values: Vec<f64>,
    half_curvatures: Vec<f64>,
}

impl Qss3Pts {
    /// Shared offset for the first sample: the smallest step over which any
    /// state's linear extrapolation moves by its quantum.
    fn first_sample_step(state: &EngineState, derivatives: &[f64], now: Time) -> f64 {
        let fallback = state.settings.sample_step(now.value());
        let steps = derivatives
            .iter()
            .zip(&state.quanta)
            .map(|(&f, &dq)| if f != 0.0 { dq / f.abs() } else { fallback });
        smallest_positive_step(steps).unwrap_or(fallback)
    }

    /// Offset for the second sample, scaled to the curvature just estimated.
    fn second_sample_step(&self, state: &EngineState, now: Time) -> f64 {
        let fallback = state.settings.finite_difference_step.sqrt() * now.value().abs().max(1.0);
        let steps = self
            .half_curvatures
            .iter()
            .zip(&state.quanta)
            .map(|(&c2, &dq)| if c2 != 0.0 { (dq / c2.abs()).sqrt() } else { fallback });
        smallest_positive_step(steps).unwrap_or(fallback)
    }
}

fn smallest_positive_step(steps: impl Iterator<Item = f64>) -> Option<f64> {
    steps
        .filter(|h| *h > 0.0 && h.is_finite())
        .fold(None, |best: Option<f64>, h| Some(best.map_or(h, |b| b.min(h))))
}

impl QssMethod for Qss3Pts {
    fn name(&self) -> &'static str {
        "qss3_pts"
    }

    fn state_model_order(&self) -> usize {
        2
    }

    fn allocate(&mut self, state_count: usize) {
        self.f0 = vec![0.0; state_count];
        self.f1 = vec![0.0; state_count];
        self.f2 = vec![0.0; state_count];
        self.values = vec![0.0; state_count];
        self.half_curvatures = vec![0.0; state_count];
    }

    fn trigger_quantization_event(&mut self, state: &mut EngineState, index: usize, now: Time) {
        let quantized = &mut state.quantized[index];
        state.continuous[index].coefficients_at(now, quantized.coeffs_mut());
        quantized.set_time(now);
    }

    fn trigger_rate_event(&mut self, state: &mut EngineState, now: Time) -> QssResult<()> {
        for (value, continuous) in self.values.iter_mut().zip(&state.continuous) {
            *value = continuous.evaluate(now);
        }
        state.evaluate_derivatives(now, &mut self.f0)?;

        let (t1, h1) = sample_time(now, Self::first_sample_step(state, &self.f0, now));
        state.evaluate_derivatives(t1, &mut self.f1)?;
        for ((c2, &f0), &f1) in self.half_curvatures.iter_mut().zip(&self.f0).zip(&self.f1) {
            *c2 = (f1 - f0) / (2.0 * h1);
        }

        let mut cubics = None;
        if state.uses_event_indicators() {
            let step = self.second_sample_step(state, now).max(2.0 * h1);
            let (t2, h2) = sample_time(now, step);
            if h2 > h1 {
                state.evaluate_derivatives(t2, &mut self.f2)?;
                cubics = Some((h1, h2));
            }
        }

        for (index, continuous) in state.continuous.iter_mut().enumerate() {
            let f0 = self.f0[index];
            let (c2, c3) = match cubics {
                Some((h1, h2)) => {
                    let (b, c) = fit_quadratic(f0, h1, self.f1[index], h2, self.f2[index]);
                    (b / 2.0, c / 3.0)
                }
                None => (self.half_curvatures[index], 0.0),
            };
            let coeffs = continuous.coeffs_mut();
            coeffs[0] = self.values[index];
            coeffs[1] = f0;
            coeffs[2] = c2;
            coeffs[3] = c3;
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

        if q_tag > c_tag {
            return finalize_event_time(q_tag, order3_q_from_c(dq, continuous.coeffs()), max);
        }
        let drift = drift_coefficients::<4>(continuous, quantized, c_tag);
        let settings = &state.settings;
        let dt = order3_general(
            dq,
            drift,
            settings.root_absolute_tolerance,
            settings.root_relative_tolerance,
        );
        finalize_event_time(c_tag, dt, max)
    }
}
