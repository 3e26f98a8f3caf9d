//! Models, buffers and the derivative function shared between the engine
//! and the active method strategy.

use crate::error::{QssError, QssResult};
use crate::model::{ModelPolynomial, SharedModel};
use crate::settings::QssSettings;
use crate::time::Time;
use crate::traits::DerivativeFunction;

pub(crate) struct EngineState {
    pub(crate) settings: QssSettings,
    derivative: Option<Box<dyn DerivativeFunction>>,
    pub(crate) state_count: usize,
    pub(crate) input_count: usize,
    pub(crate) event_indicator_count: usize,
    /// External, quantized state models.
    pub(crate) quantized: Vec<ModelPolynomial>,
    /// Internal, continuous state models, one order above `quantized`.
    pub(crate) continuous: Vec<ModelPolynomial>,
    pub(crate) inputs: Vec<Option<SharedModel>>,
    pub(crate) quanta: Vec<f64>,
    pub(crate) current_time: Option<Time>,
    // Arguments of the most recent derivative evaluation.
    state_values: Vec<f64>,
    input_values: Vec<f64>,
}

/// Remembers the last tag/offset pair so that models sharing a time tag
/// share one subtraction.
#[derive(Default)]
struct OffsetCache {
    last: Option<(Time, f64)>,
}

impl OffsetCache {
    fn offset(&mut self, tag: Time, time: Time) -> f64 {
        match self.last {
            Some((cached, dt)) if cached == tag => dt,
            _ => {
                let dt = time.subtract_to_f64(tag);
                self.last = Some((tag, dt));
                dt
            }
        }
    }
}

impl EngineState {
    pub(crate) fn new(settings: QssSettings) -> Self {
        Self {
            settings,
            derivative: None,
            state_count: 0,
            input_count: 0,
            event_indicator_count: 0,
            quantized: Vec::new(),
            continuous: Vec::new(),
            inputs: Vec::new(),
            quanta: Vec::new(),
            current_time: None,
            state_values: Vec::new(),
            input_values: Vec::new(),
        }
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.derivative.is_some()
    }

    /// Installs the derivative function and allocates every per-state array.
    pub(crate) fn bind(&mut self, derivative: Box<dyn DerivativeFunction>, quantized_order: usize) {
        let state_count = derivative.state_count();
        let input_count = derivative.input_variable_count();
        self.event_indicator_count = derivative.event_indicator_count();
        self.state_count = state_count;
        self.input_count = input_count;

        self.quantized = (0..state_count)
            .map(|_| {
                let mut model = ModelPolynomial::new(quantized_order);
                model.claim_write_access();
                model
            })
            .collect();
        self.continuous = (0..state_count)
            .map(|_| {
                let mut model = ModelPolynomial::new(quantized_order + 1);
                model.claim_write_access();
                model
            })
            .collect();
        self.inputs = vec![None; input_count];
        self.quanta = vec![0.0; state_count];
        self.state_values = vec![0.0; state_count];
        self.input_values = vec![0.0; input_count];
        self.derivative = Some(derivative);
    }

    pub(crate) fn now(&self) -> QssResult<Time> {
        self.current_time.ok_or(QssError::InitialTimeNotSet)
    }

    pub(crate) fn uses_event_indicators(&self) -> bool {
        self.event_indicator_count > 0
    }

    pub(crate) fn provides_sampled_derivatives(&self) -> bool {
        self.derivative
            .as_ref()
            .is_some_and(|derivative| derivative.provides_sampled_derivatives())
    }

    /// Evaluates the quantized state models and the input-variable models at
    /// `time`, then the derivative function into `derivatives`.
    pub(crate) fn evaluate_derivatives(&mut self, time: Time, derivatives: &mut [f64]) -> QssResult<()> {
        self.load_arguments(time)?;
        let derivative = self
            .derivative
            .as_mut()
            .ok_or(QssError::DerivativeFunctionNotBound)?;
        derivative
            .evaluate(time, &self.state_values, &self.input_values, derivatives)
            .map_err(|source| QssError::Derivative {
                time: time.value(),
                source,
            })
    }

    /// Asks the derivative function for derivatives at `time` and at a sample
    /// point of its own choosing. Returns the sample offset.
    pub(crate) fn evaluate_sampled_derivatives(
        &mut self,
        time: Time,
        derivatives: &mut [f64],
        sampled_derivatives: &mut [f64],
    ) -> QssResult<f64> {
        self.load_arguments(time)?;
        let derivative = self
            .derivative
            .as_mut()
            .ok_or(QssError::DerivativeFunctionNotBound)?;
        let delta = derivative
            .evaluate_sampled(
                time,
                &self.state_values,
                &self.input_values,
                derivatives,
                sampled_derivatives,
            )
            .map_err(|source| QssError::Derivative {
                time: time.value(),
                source,
            })?;
        if !(delta > 0.0) || !delta.is_finite() {
            return Err(QssError::Derivative {
                time: time.value(),
                source: crate::error::DerivativeError::Evaluation(format!(
                    "sample delta must be positive and finite; got {delta}"
                )),
            });
        }
        Ok(delta)
    }

    fn load_arguments(&mut self, time: Time) -> QssResult<()> {
        let mut offsets = OffsetCache::default();
        for (index, (slot, model)) in self
            .state_values
            .iter_mut()
            .zip(&self.quantized)
            .enumerate()
        {
            let tag = model.time().ok_or(QssError::MissingInitialValue { index })?;
            *slot = model.evaluate_at_offset(offsets.offset(tag, time));
        }
        for (index, (slot, handle)) in self
            .input_values
            .iter_mut()
            .zip(&self.inputs)
            .enumerate()
        {
            let handle = handle.as_ref().ok_or(QssError::MissingInputModel { index })?;
            let model = handle.try_borrow().map_err(|_| QssError::NotReady {
                message: format!("input variable {index} is being written"),
            })?;
            let tag = model.time().ok_or_else(|| QssError::NotReady {
                message: format!("Need initialization for input variable {index}"),
            })?;
            *slot = model.evaluate_at_offset(offsets.offset(tag, time));
        }
        Ok(())
    }
}
