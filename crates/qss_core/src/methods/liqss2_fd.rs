use super::predict::{finalize_event_time, order2_general, order2_q_from_c};
use super::sampling::{fit_quadratic, sample_time};
use super::QssMethod;
use crate::engine::EngineState;
use crate::error::QssResult;
use crate::time::Time;

/// Second-order linearly implicit QSS with finite-difference curvature.
///
/// Quantized models are linear. The diagonal linearization is
/// `f ≈ a*q + u0 + u1*(t - t_rate)`, and the implicit correction compares
/// curvature signs rather than slope signs.
#[derive(Debug, Default)]
pub struct Liqss2Fd {
    f0: Vec<f64>,
    f1: Vec<f64>,
    f2: Vec<f64>,
    jacobian_diagonal: Vec<f64>,
    input_values: Vec<f64>,
    input_slopes: Vec<f64>,
    previous_quantized: Vec<f64>,
    continuous_at_quantization: Vec<Option<f64>>,
    quantized_since_rate: Vec<bool>,
    has_previous_derivative: Vec<bool>,
}

impl Liqss2Fd {
    /// Derivatives at `now` into `f0` and their time derivative into `f1`.
    fn sample_slopes(&mut self, state: &mut EngineState, now: Time) -> QssResult<()> {
        if state.provides_sampled_derivatives() {
            let delta = state.evaluate_sampled_derivatives(now, &mut self.f0, &mut self.f1)?;
            for (f1, &f0) in self.f1.iter_mut().zip(&self.f0) {
                *f1 = (*f1 - f0) / delta;
            }
            return Ok(());
        }

        state.evaluate_derivatives(now, &mut self.f0)?;
        let (t1, h1) = sample_time(now, state.settings.sample_step(now.value()));
        state.evaluate_derivatives(t1, &mut self.f1)?;

        if state.uses_event_indicators() {
            let (t2, h2) = sample_time(now, 2.0 * h1);
            if h2 > h1 {
                state.evaluate_derivatives(t2, &mut self.f2)?;
                for ((f1, &f0), &f2) in self.f1.iter_mut().zip(&self.f0).zip(&self.f2) {
                    *f1 = fit_quadratic(f0, h1, *f1, h2, f2).0;
                }
                return Ok(());
            }
        }
        for (f1, &f0) in self.f1.iter_mut().zip(&self.f0) {
            *f1 = (*f1 - f0) / h1;
        }
        Ok(())
    }
}

impl QssMethod for Liqss2Fd {
    fn name(&self) -> &'static str {
        "liqss2_fd"
    }

    fn state_model_order(&self) -> usize {
        1
    }

    fn allocate(&mut self, state_count: usize) {
        self.f0 = vec![0.0; state_count];
        self.f1 = vec![0.0; state_count];
        self.f2 = vec![0.0; state_count];
        self.jacobian_diagonal = vec![0.0; state_count];
        self.input_values = vec![0.0; state_count];
        self.input_slopes = vec![0.0; state_count];
        self.previous_quantized = vec![0.0; state_count];
        self.continuous_at_quantization = vec![None; state_count];
        self.quantized_since_rate = vec![false; state_count];
        self.has_previous_derivative = vec![false; state_count];
    }

    fn reset_state(&mut self, index: usize) {
        self.jacobian_diagonal[index] = 0.0;
        self.input_values[index] = 0.0;
        self.input_slopes[index] = 0.0;
        self.continuous_at_quantization[index] = None;
        self.quantized_since_rate[index] = false;
        self.has_previous_derivative[index] = false;
    }

    fn trigger_quantization_event(&mut self, state: &mut EngineState, index: usize, now: Time) {
        let continuous = &state.continuous[index];
        let dt = continuous.offset(now);
        let x = continuous.evaluate_at_offset(dt);
        let curvature = continuous.evaluate_derivative2_at_offset(dt);
        let dq = state.quanta[index];

        let a = self.jacobian_diagonal[index];
        let u1 = self.input_slopes[index];
        let u = self.input_values[index] + u1 * dt;

        let mut value = if curvature > 0.0 {
            x + dq
        } else if curvature < 0.0 {
            x - dq
        } else {
            x
        };
        let mut slope = if a != 0.0 {
            a * value + u
        } else {
            continuous.evaluate_derivative_at_offset(dt)
        };
        if a != 0.0 && (a * slope + u1) * curvature < 0.0 {
            slope = -u1 / a;
            let equilibrium = (slope - u) / a;
            value = equilibrium.clamp(x - dq, x + dq);
            if value != equilibrium {
                slope = a * value + u;
            }
        }

        let quantized = &mut state.quantized[index];
        self.previous_quantized[index] = quantized.evaluate(now);
        let coeffs = quantized.coeffs_mut();
        coeffs[0] = value;
        coeffs[1] = slope;
        quantized.set_time(now);
        self.continuous_at_quantization[index] = Some(x);
        self.quantized_since_rate[index] = true;
    }

    fn trigger_rate_event(&mut self, state: &mut EngineState, now: Time) -> QssResult<()> {
        self.sample_slopes(state, now)?;

        for (index, continuous) in state.continuous.iter_mut().enumerate() {
            let f = self.f0[index];
            let f_slope = self.f1[index];
            let quantized = &state.quantized[index];
            let q = quantized.evaluate(now);
            let q_slope = quantized.evaluate_derivative(now);

            // Compares against the old continuous slope, before the overwrite.
            let change = q - self.previous_quantized[index];
            let mut a = 0.0;
            if self.quantized_since_rate[index] && self.has_previous_derivative[index] && change != 0.0 {
                a = (f - continuous.evaluate_derivative(now)) / change;
                if !a.is_finite() {
                    a = 0.0;
                }
            }
            self.jacobian_diagonal[index] = a;
            self.input_values[index] = f - a * q;
            self.input_slopes[index] = f_slope - a * q_slope;
            self.quantized_since_rate[index] = false;
            self.has_previous_derivative[index] = true;

            let value = continuous.evaluate(now);
            let coeffs = continuous.coeffs_mut();
            coeffs[0] = value;
            coeffs[1] = f;
            coeffs[2] = 0.5 * f_slope;
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
        let c = continuous.coeffs();

        if q_tag > c_tag {
            return finalize_event_time(q_tag, order2_q_from_c(dq, c), max);
        }
        // The quantized line, with its value replaced by the continuous value
        // at the quantization event, re-centred at the continuous model's tag.
        let q = quantized.coeffs();
        let reference = self.continuous_at_quantization[index].unwrap_or(q[0]);
        let shift = c_tag.subtract_to_f64(q_tag);
        let drift = [c[0] - (reference + q[1] * shift), c[1] - q[1], c[2]];
        finalize_event_time(c_tag, order2_general(dq, drift), max)
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::QssEngine;
    use crate::error::DerivativeError;
    use crate::methods::QssMethodKind;
    use crate::testing::{drive, t, ClosureSystem};
    use crate::time::Time;
    use crate::traits::DerivativeFunction;

    #[test]
    fn constant_state_predicts_positive_infinity() {
        let mut engine = QssEngine::new(QssMethodKind::Liqss2Fd);
        engine
            .bind_derivative_function(ClosureSystem::new(1, |_, _, _, dx| dx[0] = 0.0))
            .expect("bind");
        engine.set_initial_time(t(0.0)).expect("initial time");
        engine.set_state_value(0, -3.0).expect("state value");
        engine.trigger_quantization_events(false).expect("quantize");
        engine.trigger_rate_event().expect("rate event");
        engine.trigger_quantization_events(true).expect("quantize");
        engine.trigger_rate_event().expect("rate event");
        assert_eq!(
            engine.predict_quantization_event_time(0).expect("predict"),
            Time::POSITIVE_INFINITY
        );
    }

    #[test]
    fn rate_event_estimates_curvature_by_finite_difference() {
        let mut engine = QssEngine::new(QssMethodKind::Liqss2Fd);
        engine
            .bind_derivative_function(ClosureSystem::new(1, |time, _, _, dx| dx[0] = 2.0 * time.value()))
            .expect("bind");
        engine.set_initial_time(t(1.0)).expect("initial time");
        engine.set_state_value(0, 1.0).expect("state value");
        engine.trigger_quantization_events(false).expect("quantize");
        engine.trigger_rate_event().expect("rate event");

        let coeffs = engine.continuous_state_model(0).expect("model").coeffs().to_vec();
        assert_eq!(coeffs[0], 1.0);
        assert_eq!(coeffs[1], 2.0);
        assert!((coeffs[2] - 1.0).abs() < 1e-6, "half curvature {}", coeffs[2]);
    }

    #[test]
    fn event_indicators_use_the_second_order_difference() {
        let mut engine = QssEngine::new(QssMethodKind::Liqss2Fd);
        // A quadratic derivative defeats the first-order difference.
        engine
            .bind_derivative_function(
                ClosureSystem::new(1, |time, _, _, dx| dx[0] = 1e6 * time.value() * time.value())
                    .with_event_indicators(2),
            )
            .expect("bind");
        engine.set_initial_time(t(0.0)).expect("initial time");
        engine.set_state_value(0, 0.0).expect("state value");
        engine.trigger_quantization_events(false).expect("quantize");
        engine.trigger_rate_event().expect("rate event");
        let coeffs = engine.continuous_state_model(0).expect("model").coeffs().to_vec();
        assert!(coeffs[2].abs() < 1e-9, "half curvature {}", coeffs[2]);
    }

    struct SampledDecay;

    impl DerivativeFunction for SampledDecay {
        fn state_count(&self) -> usize {
            1
        }

        fn evaluate(
            &mut self,
            _time: Time,
            states: &[f64],
            _inputs: &[f64],
            derivatives: &mut [f64],
        ) -> Result<(), DerivativeError> {
            derivatives[0] = -states[0];
            Ok(())
        }

        fn provides_sampled_derivatives(&self) -> bool {
            true
        }

        fn evaluate_sampled(
            &mut self,
            _time: Time,
            states: &[f64],
            _inputs: &[f64],
            derivatives: &mut [f64],
            sampled_derivatives: &mut [f64],
        ) -> Result<f64, DerivativeError> {
            let delta = 0.5;
            derivatives[0] = -states[0];
            sampled_derivatives[0] = -(states[0] + delta * derivatives[0]);
            Ok(delta)
        }
    }

    #[test]
    fn pre_sampled_derivatives_replace_engine_sampling() {
        let mut engine = QssEngine::new(QssMethodKind::Liqss2Fd);
        engine.bind_derivative_function(SampledDecay).expect("bind");
        engine.set_initial_time(t(0.0)).expect("initial time");
        engine.set_state_value(0, 2.0).expect("state value");
        engine.trigger_quantization_events(false).expect("quantize");
        engine.trigger_rate_event().expect("rate event");
        // x'' = x for x' = -x.
        let coeffs = engine.continuous_state_model(0).expect("model").coeffs().to_vec();
        assert_eq!(coeffs[1], -2.0);
        assert_eq!(coeffs[2], 1.0);
    }

    #[test]
    fn exponential_decay_tracks_the_exact_solution() {
        let mut engine = QssEngine::new(QssMethodKind::Liqss2Fd);
        engine
            .bind_derivative_function(ClosureSystem::new(1, |_, x, _, dx| dx[0] = -x[0]))
            .expect("bind");
        engine.set_initial_time(t(0.0)).expect("initial time");
        engine.set_quantum_tolerances(1e-4, 0.0).expect("tolerances");
        engine.set_state_value(0, 1.0).expect("state value");

        let events = drive(&mut engine, t(1.0));
        let x = engine.evaluate_continuous_state_model(0, t(1.0)).expect("eval");
        assert!((x - (-1.0_f64).exp()).abs() < 1e-2, "x(1) = {x}");
        assert!(events > 1 && events < 10_000, "{events} events");
    }

    #[test]
    fn stiff_decay_settles_with_few_events() {
        let mut engine = QssEngine::new(QssMethodKind::Liqss2Fd);
        engine
            .bind_derivative_function(ClosureSystem::new(1, |_, x, _, dx| dx[0] = -1000.0 * (x[0] - 1.0)))
            .expect("bind");
        engine.set_initial_time(t(0.0)).expect("initial time");
        engine.set_quantum_tolerances(1e-3, 0.0).expect("tolerances");
        engine.set_state_value(0, 0.0).expect("state value");

        let events = drive(&mut engine, t(10.0));
        let x = engine.evaluate_state_model(0, t(10.0)).expect("eval");
        assert!((x - 1.0).abs() < 1e-2, "x(10) = {x}");
        assert!(events < 10_000, "{events} events");
    }
}
