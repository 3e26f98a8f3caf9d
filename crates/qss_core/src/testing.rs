//! Shared fixtures for unit tests.

use crate::engine::QssEngine;
use crate::error::DerivativeError;
use crate::time::Time;
use crate::traits::DerivativeFunction;
use std::fmt::{Debug, Display};

pub(crate) fn t(value: f64) -> Time {
    Time::new(value).expect("valid time")
}

pub(crate) fn assert_err_contains<T: Debug, E: Display>(result: Result<T, E>, needle: &str) {
    let err = result.expect_err("expected error");
    let message = format!("{err}");
    assert!(
        message.contains(needle),
        "expected error to contain \"{needle}\", got \"{message}\""
    );
}

/// Runs the quantize, rate, predict, step cycle up to `stop` and returns
/// the number of quantization events.
pub(crate) fn drive(engine: &mut QssEngine, stop: Time) -> usize {
    let mut events = 0;
    loop {
        events += engine.trigger_quantization_events(false).expect("quantize").len();
        if engine.needs_rate_event() {
            engine.trigger_rate_event().expect("rate event");
        }
        if engine.current_time().expect("time") >= stop {
            return events;
        }
        let next = engine
            .predict_earliest_quantization_event_time()
            .expect("predict")
            .min(stop);
        engine.step_to_time(next).expect("step");
    }
}

/// Derivative function backed by a closure `f(t, x, u, dx)`.
pub(crate) struct ClosureSystem<F> {
    states: usize,
    inputs: usize,
    event_indicators: usize,
    fail: bool,
    f: F,
}

impl<F> ClosureSystem<F>
where
    F: FnMut(Time, &[f64], &[f64], &mut [f64]),
{
    pub(crate) fn new(states: usize, f: F) -> Self {
        Self {
            states,
            inputs: 0,
            event_indicators: 0,
            fail: false,
            f,
        }
    }

    pub(crate) fn with_inputs(mut self, inputs: usize) -> Self {
        self.inputs = inputs;
        self
    }

    pub(crate) fn with_event_indicators(mut self, count: usize) -> Self {
        self.event_indicators = count;
        self
    }
}

type NoopFn = fn(Time, &[f64], &[f64], &mut [f64]);

/// A system whose every evaluation reports status -1.
pub(crate) fn failing_system(states: usize) -> ClosureSystem<NoopFn> {
    fn noop(_: Time, _: &[f64], _: &[f64], _: &mut [f64]) {}
    ClosureSystem {
        states,
        inputs: 0,
        event_indicators: 0,
        fail: true,
        f: noop,
    }
}

impl<F> DerivativeFunction for ClosureSystem<F>
where
    F: FnMut(Time, &[f64], &[f64], &mut [f64]),
{
    fn state_count(&self) -> usize {
        self.states
    }

    fn input_variable_count(&self) -> usize {
        self.inputs
    }

    fn event_indicator_count(&self) -> usize {
        self.event_indicators
    }

    fn evaluate(
        &mut self,
        time: Time,
        states: &[f64],
        inputs: &[f64],
        derivatives: &mut [f64],
    ) -> Result<(), DerivativeError> {
        if self.fail {
            return Err(DerivativeError::Status { status: -1 });
        }
        (self.f)(time, states, inputs, derivatives);
        Ok(())
    }
}
