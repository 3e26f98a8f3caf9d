//! The QSS integration engine.
//!
//! `QssEngine` owns one quantized and one continuous polynomial model per
//! state and drives the event protocol around them:
//!
//! 1. quantize every state flagged as needing it,
//! 2. trigger a rate event if one is pending,
//! 3. query predicted quantization-event times,
//! 4. step to the next time of interest.
//!
//! The numerics of each step are delegated to the method chosen at
//! construction (see [`QssMethodKind`]).

use crate::error::{QssError, QssResult};
use crate::methods::{QssMethod, QssMethodKind};
use crate::model::{ModelPolynomial, SharedModel};
use crate::settings::QssSettings;
use crate::time::Time;
use crate::traits::DerivativeFunction;
use tracing::{debug, trace};

mod state;
mod status;

pub(crate) use state::EngineState;
pub use status::{PredictionStatus, QuantizationStatus, RateStatus, StateStatus};

pub struct QssEngine {
    state: EngineState,
    method: Box<dyn QssMethod>,
    kind: QssMethodKind,
    absolute_tolerances: Vec<f64>,
    relative_tolerances: Vec<f64>,
    statuses: Vec<StateStatus>,
    rate_status: RateStatus,
    max_event_time: Time,
}

impl QssEngine {
    pub fn new(kind: QssMethodKind) -> Self {
        Self::build(kind, QssSettings::default())
    }

    pub fn with_settings(kind: QssMethodKind, settings: QssSettings) -> QssResult<Self> {
        settings.validate()?;
        Ok(Self::build(kind, settings))
    }

    fn build(kind: QssMethodKind, settings: QssSettings) -> Self {
        Self {
            state: EngineState::new(settings),
            method: kind.build(),
            kind,
            absolute_tolerances: Vec::new(),
            relative_tolerances: Vec::new(),
            statuses: Vec::new(),
            rate_status: RateStatus::NeedsEvent,
            max_event_time: Time::POSITIVE_INFINITY,
        }
    }

    pub fn method_kind(&self) -> QssMethodKind {
        self.kind
    }

    pub fn method_name(&self) -> &'static str {
        self.method.name()
    }

    pub fn settings(&self) -> &QssSettings {
        &self.state.settings
    }

    /// Order of the quantized state models. Continuous models carry one more.
    pub fn state_model_order(&self) -> usize {
        self.method.state_model_order()
    }

    pub fn state_count(&self) -> usize {
        self.state.state_count
    }

    pub fn input_variable_count(&self) -> usize {
        self.state.input_count
    }

    pub fn current_time(&self) -> Option<Time> {
        self.state.current_time
    }

    // ---------------------------------------------------------------------
    // Setup
    // ---------------------------------------------------------------------

    /// Binds the derivative function. Sizes every per-state array from its
    /// declared counts, so it can be called only once.
    pub fn bind_derivative_function<F>(&mut self, derivative: F) -> QssResult<()>
    where
        F: DerivativeFunction + 'static,
    {
        if self.state.is_bound() {
            return Err(QssError::DerivativeFunctionAlreadyBound);
        }
        let state_count = derivative.state_count();
        if state_count == 0 {
            return Err(QssError::InvalidArg {
                what: "derivative function must declare at least one state".to_string(),
            });
        }

        self.state
            .bind(Box::new(derivative), self.method.state_model_order());
        self.method.allocate(state_count);

        let settings = self.state.settings;
        self.absolute_tolerances = vec![settings.absolute_tolerance; state_count];
        self.relative_tolerances = vec![settings.relative_tolerance; state_count];
        self.statuses = vec![StateStatus::INITIAL; state_count];
        self.rate_status = RateStatus::NeedsEvent;
        for index in 0..state_count {
            self.state.quanta[index] = self.quantum_for(index);
        }

        debug!(
            method = self.method.name(),
            states = state_count,
            inputs = self.state.input_count,
            event_indicators = self.state.event_indicator_count,
            "bound derivative function"
        );
        Ok(())
    }

    pub fn set_initial_time(&mut self, time: Time) -> QssResult<()> {
        if self.state.current_time.is_some() {
            return Err(QssError::InitialTimeAlreadySet);
        }
        if !time.is_finite() {
            return Err(QssError::InvalidTime {
                what: format!("initial time must be finite; got {time}"),
            });
        }
        self.state.current_time = Some(time);
        Ok(())
    }

    /// One-call setup: binds `derivative`, sets the start time and the
    /// prediction horizon, zeroes every state and creates one constant input
    /// model of order `input_order` per input variable.
    ///
    /// Returns the input-model handles so the caller can drive them. Each
    /// handle already carries the caller's write claim.
    pub fn initialize<F>(
        &mut self,
        derivative: F,
        start_time: Time,
        max_event_time: Time,
        input_order: usize,
    ) -> QssResult<Vec<SharedModel>>
    where
        F: DerivativeFunction + 'static,
    {
        self.bind_derivative_function(derivative)?;
        self.set_initial_time(start_time)?;
        self.set_quantization_event_time_maximum(max_event_time)?;
        for index in 0..self.state.state_count {
            self.set_state_value(index, 0.0)?;
        }

        let mut handles = Vec::with_capacity(self.state.input_count);
        for index in 0..self.state.input_count {
            let handle = ModelPolynomial::constant(input_order, 0.0, start_time).into_shared();
            self.bind_input_variable_model(index, Some(handle.clone()))?;
            handles.push(handle);
        }

        match self.validate() {
            None => Ok(handles),
            Some(message) => Err(QssError::NotReady { message }),
        }
    }

    /// Sets the tolerances of one state and refreshes its quantum.
    pub fn set_quantum_tolerance(&mut self, index: usize, absolute: f64, relative: f64) -> QssResult<()> {
        self.check_state_index(index)?;
        check_tolerances(absolute, relative)?;
        self.absolute_tolerances[index] = absolute;
        self.relative_tolerances[index] = relative;
        self.state.quanta[index] = self.quantum_for(index);
        self.statuses[index].invalidate();
        Ok(())
    }

    /// Sets the tolerances of every state.
    pub fn set_quantum_tolerances(&mut self, absolute: f64, relative: f64) -> QssResult<()> {
        if !self.state.is_bound() {
            return Err(QssError::DerivativeFunctionNotBound);
        }
        check_tolerances(absolute, relative)?;
        for index in 0..self.state.state_count {
            self.absolute_tolerances[index] = absolute;
            self.relative_tolerances[index] = relative;
            self.state.quanta[index] = self.quantum_for(index);
            self.statuses[index].invalidate();
        }
        debug!(absolute, relative, "set quantum tolerances");
        Ok(())
    }

    /// Forces state `index` to the constant `value` at the current time. Any
    /// history the method kept for the state is discarded.
    pub fn set_state_value(&mut self, index: usize, value: f64) -> QssResult<()> {
        self.check_state_index(index)?;
        let now = self.state.now()?;
        if !value.is_finite() {
            return Err(QssError::InvalidArg {
                what: format!("state {index} value must be finite; got {value}"),
            });
        }
        self.state.quantized[index].make_constant(value, now);
        self.state.continuous[index].make_constant(value, now);
        self.state.quanta[index] = self.quantum_for(index);
        self.method.reset_state(index);
        self.statuses[index].invalidate();
        self.rate_status = RateStatus::NeedsEvent;
        Ok(())
    }

    /// Installs the model that supplies input variable `index`. Passing
    /// `None` unbinds any earlier model and fails, leaving the engine unable
    /// to run until a model is bound again.
    pub fn bind_input_variable_model(&mut self, index: usize, model: Option<SharedModel>) -> QssResult<()> {
        if !self.state.is_bound() {
            return Err(QssError::DerivativeFunctionNotBound);
        }
        if index >= self.state.input_count {
            return Err(QssError::InputIndex {
                index,
                count: self.state.input_count,
            });
        }
        match model {
            Some(model) => {
                self.state.inputs[index] = Some(model);
                self.rate_status = RateStatus::NeedsEvent;
                Ok(())
            }
            None => {
                self.state.inputs[index] = None;
                Err(QssError::MissingInputModel { index })
            }
        }
    }

    /// Declares how many event indicators are in use. Overrides the count
    /// reported by the derivative function.
    pub fn set_event_indicator_count(&mut self, count: usize) -> QssResult<()> {
        if !self.state.is_bound() {
            return Err(QssError::DerivativeFunctionNotBound);
        }
        self.state.event_indicator_count = count;
        self.rate_status = RateStatus::NeedsEvent;
        Ok(())
    }

    /// Resets the current time, which must lie before the quantization-event
    /// time maximum. Every state then needs a quantization event and the
    /// engine a rate event.
    pub fn set_current_simulation_time(&mut self, time: Time) -> QssResult<()> {
        if !time.is_finite() {
            return Err(QssError::InvalidTime {
                what: format!("simulation time must be finite; got {time}"),
            });
        }
        if time >= self.max_event_time {
            return Err(QssError::InvalidTime {
                what: format!(
                    "simulation time {time} must be before the quantization-event time maximum {}",
                    self.max_event_time
                ),
            });
        }
        for status in &mut self.statuses {
            status.invalidate();
        }
        self.rate_status = RateStatus::NeedsEvent;
        self.state.current_time = Some(time);
        Ok(())
    }

    /// Caps predicted quantization-event times. Defaults to positive
    /// infinity.
    pub fn set_quantization_event_time_maximum(&mut self, max_event_time: Time) -> QssResult<()> {
        if let Some(now) = self.state.current_time {
            if max_event_time <= now {
                return Err(QssError::InvalidArg {
                    what: format!(
                        "quantization-event time maximum {max_event_time} must be after the current time {now}"
                    ),
                });
            }
        }
        for status in &mut self.statuses {
            status.invalidate();
        }
        self.max_event_time = max_event_time;
        Ok(())
    }

    pub fn quantization_event_time_maximum(&self) -> Time {
        self.max_event_time
    }

    /// Checks that the engine is ready to run. Returns a diagnostic message,
    /// or `None` when every setup step has been completed.
    pub fn validate(&self) -> Option<String> {
        if !self.state.is_bound() {
            return Some("Must bind a derivative function first".to_string());
        }
        let state_count = self.state.state_count;
        debug_assert_eq!(self.state.quantized.len(), state_count);
        debug_assert_eq!(self.state.continuous.len(), state_count);
        debug_assert_eq!(self.state.quanta.len(), state_count);
        debug_assert_eq!(self.statuses.len(), state_count);
        debug_assert_eq!(self.state.inputs.len(), self.state.input_count);

        if self.state.current_time.is_none() {
            return Some("Must set the initial simulation time first".to_string());
        }
        for index in 0..state_count {
            if self.state.quantized[index].time().is_none() || self.state.continuous[index].time().is_none() {
                return Some(format!("Need initial value for state {index}"));
            }
        }
        for (index, handle) in self.state.inputs.iter().enumerate() {
            let Some(handle) = handle else {
                return Some(format!("Need model for input variable {index}"));
            };
            let Ok(model) = handle.try_borrow() else {
                return Some(format!("Input variable {index} is being written"));
            };
            if model.writer_count() != 1 {
                return Some(format!(
                    "Need 1 writer for input variable {index}; got {}",
                    model.writer_count()
                ));
            }
            if model.time().is_none() {
                return Some(format!("Need initialization for input variable {index}"));
            }
        }
        None
    }

    // ---------------------------------------------------------------------
    // Model access
    // ---------------------------------------------------------------------

    /// External, quantized model of state `index`.
    pub fn state_model(&self, index: usize) -> QssResult<&ModelPolynomial> {
        self.check_state_index(index)?;
        Ok(&self.state.quantized[index])
    }

    /// Internal, continuous model of state `index`.
    pub fn continuous_state_model(&self, index: usize) -> QssResult<&ModelPolynomial> {
        self.check_state_index(index)?;
        Ok(&self.state.continuous[index])
    }

    pub fn evaluate_state_model(&self, index: usize, time: Time) -> QssResult<f64> {
        Ok(self.state_model(index)?.evaluate(time))
    }

    pub fn evaluate_continuous_state_model(&self, index: usize, time: Time) -> QssResult<f64> {
        Ok(self.continuous_state_model(index)?.evaluate(time))
    }

    pub fn input_variable_model(&self, index: usize) -> QssResult<Option<SharedModel>> {
        if index >= self.state.input_count {
            return Err(QssError::InputIndex {
                index,
                count: self.state.input_count,
            });
        }
        Ok(self.state.inputs[index].clone())
    }

    /// First input variable that has no model bound.
    pub fn missing_input_variable_model(&self) -> Option<usize> {
        self.state.inputs.iter().position(Option::is_none)
    }

    /// `max(absolute, relative * |q0|)` for state `index`, with `q0` the
    /// constant coefficient of its quantized model.
    pub fn find_quantum(&self, index: usize) -> QssResult<f64> {
        self.check_state_index(index)?;
        Ok(self.quantum_for(index))
    }

    /// Quantum currently in effect for state `index`.
    pub fn quantum(&self, index: usize) -> QssResult<f64> {
        self.check_state_index(index)?;
        Ok(self.state.quanta[index])
    }

    pub fn state_status(&self, index: usize) -> QssResult<StateStatus> {
        self.check_state_index(index)?;
        Ok(self.statuses[index])
    }

    pub fn rate_status(&self) -> RateStatus {
        self.rate_status
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    pub fn needs_quantization_event(&self, index: usize) -> QssResult<bool> {
        Ok(self.state_status(index)?.needs_quantization())
    }

    pub fn any_needs_quantization_event(&self) -> Option<usize> {
        self.statuses.iter().position(StateStatus::needs_quantization)
    }

    pub fn quantization_event_flags(&self) -> Vec<bool> {
        self.statuses.iter().map(StateStatus::needs_quantization).collect()
    }

    /// Re-forms the quantized model of state `index` at the current time.
    pub fn trigger_quantization_event(&mut self, index: usize) -> QssResult<()> {
        self.check_state_index(index)?;
        let now = self.state.now()?;
        if self.state.continuous[index].time().is_none() {
            return Err(QssError::MissingInitialValue { index });
        }

        self.method
            .trigger_quantization_event(&mut self.state, index, now);
        self.state.quanta[index] = self.quantum_for(index);
        self.statuses[index] = StateStatus {
            quantization: QuantizationStatus::Clean,
            prediction: PredictionStatus::Stale,
        };
        self.rate_status = RateStatus::NeedsEvent;

        trace!(
            state = index,
            time = %now,
            value = self.state.quantized[index].coeffs()[0],
            quantum = self.state.quanta[index],
            "quantization event"
        );
        Ok(())
    }

    /// Quantizes every state that needs it, or every state if `force_all`.
    /// Returns the indices that were quantized.
    pub fn trigger_quantization_events(&mut self, force_all: bool) -> QssResult<Vec<usize>> {
        let mut triggered = Vec::new();
        for index in 0..self.state.state_count {
            if force_all || self.statuses[index].needs_quantization() {
                self.trigger_quantization_event(index)?;
                triggered.push(index);
            }
        }
        Ok(triggered)
    }

    pub fn needs_rate_event(&self) -> bool {
        self.rate_status == RateStatus::NeedsEvent
    }

    /// Re-evaluates the derivative function and re-forms every continuous
    /// model. The pending-rate flag is cleared only on success.
    pub fn trigger_rate_event(&mut self) -> QssResult<()> {
        if !self.state.is_bound() {
            return Err(QssError::DerivativeFunctionNotBound);
        }
        let now = self.state.now()?;
        for status in &mut self.statuses {
            status.prediction = PredictionStatus::Stale;
        }
        self.method.trigger_rate_event(&mut self.state, now)?;
        self.rate_status = RateStatus::Clean;
        trace!(time = %now, "rate event");
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Prediction and stepping
    // ---------------------------------------------------------------------

    /// Next time state `index` needs a quantization event, capped at the
    /// quantization-event time maximum. Cached until the next event.
    pub fn predict_quantization_event_time(&mut self, index: usize) -> QssResult<Time> {
        self.check_state_index(index)?;
        if let Some(cached) = self.statuses[index].cached_prediction() {
            return Ok(cached);
        }
        let tag = self.state.continuous[index]
            .time()
            .ok_or(QssError::MissingInitialValue { index })?;

        let predicted = self
            .method
            .predict_quantization_event_time(&self.state, index, self.max_event_time);
        debug_assert!(
            predicted > tag || predicted == self.max_event_time,
            "predicted time {predicted} must follow the continuous model time {tag}"
        );
        self.statuses[index].prediction = PredictionStatus::Cached(predicted);
        Ok(predicted)
    }

    pub fn predict_earliest_quantization_event_time(&mut self) -> QssResult<Time> {
        if !self.state.is_bound() {
            return Err(QssError::DerivativeFunctionNotBound);
        }
        let mut earliest = Time::POSITIVE_INFINITY;
        for index in 0..self.state.state_count {
            earliest = earliest.min(self.predict_quantization_event_time(index)?);
        }
        Ok(earliest)
    }

    /// Earliest predicted time together with every state predicted at
    /// exactly that time.
    pub fn predict_earliest_quantization_event_time_with_ties(&mut self) -> QssResult<(Time, Vec<usize>)> {
        let earliest = self.predict_earliest_quantization_event_time()?;
        let tied = self
            .statuses
            .iter()
            .enumerate()
            .filter(|(_, status)| status.cached_prediction() == Some(earliest))
            .map(|(index, _)| index)
            .collect();
        Ok((earliest, tied))
    }

    /// Advances the current time to `next`, flagging every state whose
    /// predicted quantization-event time falls at or before it.
    ///
    /// Triggers a pending rate event first. Continuous models are not
    /// refreshed for the elapsed interval.
    pub fn step_to_time(&mut self, next: Time) -> QssResult<()> {
        let now = self.state.now()?;
        if next <= now {
            return Err(QssError::TimeMustAdvance {
                current: now.value(),
                requested: next.value(),
            });
        }
        if let Some(index) = self.any_needs_quantization_event() {
            return Err(QssError::PendingQuantization { index });
        }
        if self.needs_rate_event() {
            self.trigger_rate_event()?;
        }

        for index in 0..self.state.state_count {
            if self.predict_quantization_event_time(index)? <= next {
                self.statuses[index].quantization = QuantizationStatus::NeedsEvent;
            }
        }
        self.state.current_time = Some(next);
        Ok(())
    }

    /// Steps to `next`, which must not pass the earliest predicted
    /// quantization event, then quantizes every state that came due.
    pub fn advance_to_time(&mut self, next: Time) -> QssResult<Vec<usize>> {
        if let Some(index) = self.any_needs_quantization_event() {
            return Err(QssError::PendingQuantization { index });
        }
        if self.needs_rate_event() {
            self.trigger_rate_event()?;
        }
        let predicted = self.predict_earliest_quantization_event_time()?;
        if next > predicted {
            return Err(QssError::PastPredictedEvent {
                requested: next.value(),
                predicted: predicted.value(),
            });
        }
        self.step_to_time(next)?;
        self.trigger_quantization_events(false)
    }

    fn check_state_index(&self, index: usize) -> QssResult<()> {
        if !self.state.is_bound() {
            return Err(QssError::DerivativeFunctionNotBound);
        }
        if index >= self.state.state_count {
            return Err(QssError::StateIndex {
                index,
                count: self.state.state_count,
            });
        }
        Ok(())
    }

    fn quantum_for(&self, index: usize) -> f64 {
        let value = self.state.quantized[index].coeffs()[0];
        let dq = (self.relative_tolerances[index] * value.abs()).max(self.absolute_tolerances[index]);
        debug_assert!(dq > 0.0);
        dq
    }
}

fn check_tolerances(absolute: f64, relative: f64) -> QssResult<()> {
    if !(absolute > 0.0) || !absolute.is_finite() || !(relative >= 0.0) || !relative.is_finite() {
        return Err(QssError::InvalidTolerance { absolute, relative });
    }
    Ok(())
}
